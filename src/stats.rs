use crate::model::{LatencySummary, ThroughputSummary};
use hdrhistogram::Histogram;
use std::time::Duration;

/// Floor applied to in-flight throughput so a live readout never shows zero.
pub const LIVE_MBPS_FLOOR: f64 = 0.1;

#[derive(Debug, Default, Clone)]
pub struct OnlineStats {
    n: u64,
    mean: f64,
    m2: f64,
}

impl OnlineStats {
    pub fn push(&mut self, x: f64) {
        self.n += 1;
        let delta = x - self.mean;
        self.mean += delta / (self.n as f64);
        let delta2 = x - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Standard deviation over the whole sample, centred on the mean.
    pub fn population_stddev(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            (self.m2 / (self.n as f64)).sqrt()
        }
    }
}

/// Mean latency and jitter of a probe sample, in ms.
///
/// An empty sample is scored as a single zero-valued probe.
pub fn ping_statistics(samples_ms: &[f64]) -> (f64, f64) {
    let mut online = OnlineStats::default();
    if samples_ms.is_empty() {
        online.push(0.0);
    }
    for &ms in samples_ms {
        online.push(ms);
    }
    (online.mean(), online.population_stddev())
}

pub fn latency_summary_from_samples(failed: u64, samples_ms: &[f64]) -> LatencySummary {
    let (mean_ms, jitter_ms) = ping_statistics(samples_ms);
    let mut summary = LatencySummary {
        sent: samples_ms.len() as u64,
        failed,
        min_ms: None,
        median_ms: None,
        max_ms: None,
        mean_ms,
        jitter_ms,
    };

    if samples_ms.is_empty() {
        return summary;
    }

    // HDRHistogram wants integer values; store microseconds to preserve precision.
    let Ok(mut h) = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3) else {
        return summary;
    };
    for &ms in samples_ms {
        let us = (ms * 1000.0).round().clamp(1.0, 60_000_000.0) as u64;
        let _ = h.record(us);
    }

    summary.min_ms = Some((h.min() as f64) / 1000.0);
    summary.median_ms = Some((h.value_at_quantile(0.50) as f64) / 1000.0);
    summary.max_ms = Some((h.max() as f64) / 1000.0);
    summary
}

/// Average throughput over a whole transfer. Zero when no time elapsed.
pub fn throughput_mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    (bytes as f64 * 8.0) / (secs * 1_000_000.0)
}

/// In-flight throughput estimate, floored at [`LIVE_MBPS_FLOOR`].
pub fn live_mbps(bytes: u64, elapsed: Duration) -> f64 {
    throughput_mbps(bytes, elapsed).max(LIVE_MBPS_FLOOR)
}

pub fn throughput_summary(bytes: u64, elapsed: Duration) -> ThroughputSummary {
    ThroughputSummary {
        bytes,
        duration_ms: elapsed.as_millis() as u64,
        mbps: throughput_mbps(bytes, elapsed),
    }
}
