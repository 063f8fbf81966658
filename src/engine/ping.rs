use crate::engine::transport::Transport;
use crate::engine::RunContext;
use crate::model::LatencySummary;
use crate::stats::latency_summary_from_samples;
use tokio::time::Instant;

/// Progress reached once the ping phase is finished.
const PING_DONE_PROGRESS: f64 = 20.0;

/// Sends `ping_count` sequential probes and publishes latency and jitter.
///
/// Failed probes are scored as `probe_penalty`. Returns `None` once the run
/// has been cancelled.
pub(crate) async fn run_ping<T: Transport>(
    transport: &T,
    ctx: &RunContext,
) -> Option<LatencySummary> {
    let total = ctx.cfg.ping_count;
    let penalty_ms = ctx.cfg.probe_penalty.as_secs_f64() * 1000.0;
    let mut samples = Vec::<f64>::with_capacity(total);
    let mut failed = 0u64;

    for i in 0..total {
        if ctx.is_cancelled() {
            return None;
        }

        let start = Instant::now();
        let r = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return None,
            r = transport.probe() => r,
        };
        match r {
            Ok(()) => samples.push(start.elapsed().as_secs_f64() * 1000.0),
            Err(e) => {
                tracing::warn!(probe = i + 1, error = %e, "probe failed, scoring penalty");
                failed += 1;
                samples.push(penalty_ms);
            }
        }

        let progress = 5.0 + ((i + 1) as f64 / total as f64) * 15.0;
        ctx.publish(|s| s.metrics.progress = s.metrics.progress.max(progress));
    }

    let summary = latency_summary_from_samples(failed, &samples);
    ctx.publish(|s| {
        s.metrics.latency = Some(summary.mean_ms);
        s.metrics.jitter = Some(summary.jitter_ms);
        s.metrics.progress = PING_DONE_PROGRESS;
    });

    if ctx.is_cancelled() {
        return None;
    }
    Some(summary)
}
