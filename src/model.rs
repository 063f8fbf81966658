use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest payload the download endpoint will serve for a single request.
pub const MAX_PAYLOAD_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub base_url: String,
    pub user_agent: String,
    #[serde(default)]
    pub source_ip: Option<String>,
    #[serde(default)]
    pub certificate_path: Option<std::path::PathBuf>,
    pub ping_count: usize,
    /// Round-trip time recorded for a probe that failed outright.
    #[serde(with = "humantime_serde")]
    pub probe_penalty: Duration,
    pub download_streams: usize,
    pub download_bytes: u64,
    pub upload_bytes: u64,
    /// Live throughput is only published once a phase has run this long.
    #[serde(with = "humantime_serde")]
    pub emit_after: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".into(),
            user_agent: format!("kit-speedtest/{}", env!("CARGO_PKG_VERSION")),
            source_ip: None,
            certificate_path: None,
            ping_count: 5,
            probe_penalty: Duration::from_millis(100),
            download_streams: 4,
            download_bytes: 10 * 1024 * 1024,
            upload_bytes: 10 * 1024 * 1024,
            emit_after: Duration::from_millis(100),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.download_streams == 0 {
            anyhow::bail!("download_streams must be at least 1");
        }
        if self.download_bytes == 0 || self.upload_bytes == 0 {
            anyhow::bail!("payload sizes must be non-zero");
        }
        if self.download_bytes > MAX_PAYLOAD_BYTES || self.upload_bytes > MAX_PAYLOAD_BYTES {
            anyhow::bail!(
                "payload sizes are capped at {} bytes per request",
                MAX_PAYLOAD_BYTES
            );
        }
        Ok(())
    }

    /// Bytes the download phase expects across all of its streams.
    pub fn download_total_bytes(&self) -> u64 {
        self.download_bytes
            .saturating_mul(self.download_streams as u64)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Idle,
    Ping,
    Download,
    Upload,
    Complete,
}

impl Phase {
    /// True while a run is in flight.
    pub fn is_active(self) -> bool {
        matches!(self, Phase::Ping | Phase::Download | Phase::Upload)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Mean probe round-trip time, ms.
    pub latency: Option<f64>,
    /// Population standard deviation of probe round-trip times, ms.
    pub jitter: Option<f64>,
    /// Mbps
    pub download_speed: Option<f64>,
    /// Mbps
    pub upload_speed: Option<f64>,
    /// 0..=100
    pub progress: f64,
}

/// Everything a caller can observe about the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    pub phase: Phase,
    pub metrics: Metrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencySummary {
    pub sent: u64,
    pub failed: u64,
    pub min_ms: Option<f64>,
    pub median_ms: Option<f64>,
    pub max_ms: Option<f64>,
    pub mean_ms: f64,
    pub jitter_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThroughputSummary {
    pub bytes: u64,
    pub duration_ms: u64,
    pub mbps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub timestamp_utc: String,
    pub base_url: String,
    pub config: EngineConfig,
    pub latency: LatencySummary,
    pub download: ThroughputSummary,
    pub upload: ThroughputSummary,
    pub metrics: Metrics,
}

/// How a run that did not fail ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(RunReport),
    /// Stopped by `reset()` or superseded by a newer run.
    Cancelled,
}
