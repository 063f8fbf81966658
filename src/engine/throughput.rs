use crate::engine::transport::{Transport, TransportError, UploadProgress};
use crate::engine::RunContext;
use crate::model::ThroughputSummary;
use crate::stats::{live_mbps, throughput_summary};
use bytes::Bytes;
use futures::StreamExt;
use rand::RngCore;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::time::Instant;

const DOWNLOAD_BASE_PROGRESS: f64 = 20.0;
const DOWNLOAD_SPAN: f64 = 40.0;
const UPLOAD_BASE_PROGRESS: f64 = 60.0;
const UPLOAD_SPAN: f64 = 40.0;
/// Live upload progress stays below 100 until the server acknowledges the body.
const UPLOAD_LIVE_PROGRESS_CAP: f64 = 99.0;

fn download_progress(bytes: u64, expected: u64) -> f64 {
    let fraction = if expected == 0 {
        1.0
    } else {
        bytes as f64 / expected as f64
    };
    DOWNLOAD_BASE_PROGRESS + (fraction * DOWNLOAD_SPAN).min(DOWNLOAD_SPAN)
}

fn upload_progress(p: UploadProgress) -> f64 {
    if p.total == 0 {
        return UPLOAD_BASE_PROGRESS;
    }
    let fraction = p.sent as f64 / p.total as f64;
    (UPLOAD_BASE_PROGRESS + fraction * UPLOAD_SPAN).min(UPLOAD_LIVE_PROGRESS_CAP)
}

/// Runs `download_streams` concurrent downloads that feed one shared byte
/// counter, then publishes the final download speed.
///
/// A failing stream only loses its own bytes. Returns `None` once the run
/// has been cancelled.
pub(crate) async fn run_download<T: Transport>(
    transport: &Arc<T>,
    ctx: &RunContext,
) -> Option<ThroughputSummary> {
    let total = Arc::new(AtomicU64::new(0));
    let start = Instant::now();

    let mut handles = Vec::with_capacity(ctx.cfg.download_streams);
    for stream_id in 0..ctx.cfg.download_streams {
        let transport = transport.clone();
        let ctx2 = ctx.clone();
        let total2 = total.clone();

        handles.push(tokio::spawn(async move {
            if let Err(e) = download_stream(transport.as_ref(), &ctx2, &total2, start).await {
                tracing::warn!(stream_id, error = %e, "download stream failed");
            }
        }));
    }

    for h in handles {
        if let Err(e) = h.await {
            tracing::warn!(error = %e, "download task ended abnormally");
        }
    }

    if ctx.is_cancelled() {
        return None;
    }

    let summary = throughput_summary(total.load(Ordering::SeqCst), start.elapsed());
    ctx.publish(|s| {
        s.metrics.download_speed = Some(summary.mbps);
        s.metrics.progress = DOWNLOAD_BASE_PROGRESS + DOWNLOAD_SPAN;
    });
    Some(summary)
}

async fn download_stream<T: Transport>(
    transport: &T,
    ctx: &RunContext,
    total: &AtomicU64,
    start: Instant,
) -> Result<(), TransportError> {
    let expected = ctx.cfg.download_total_bytes();
    let mut body = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return Ok(()),
        r = transport.download(ctx.cfg.download_bytes) => r?,
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Ok(()),
            next = body.next() => next,
        };
        let Some(chunk) = next else {
            return Ok(());
        };
        let chunk = chunk?;
        let len = chunk.len() as u64;
        let so_far = total.fetch_add(len, Ordering::SeqCst) + len;

        // Shared total over the phase's elapsed time; noisy while streams ramp up.
        let elapsed = start.elapsed();
        if elapsed > ctx.cfg.emit_after {
            let mbps = live_mbps(so_far, elapsed);
            let progress = download_progress(so_far, expected);
            ctx.publish(|s| {
                s.metrics.download_speed = Some(mbps);
                s.metrics.progress = s.metrics.progress.max(progress);
            });
        }
    }
}

fn random_payload(len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    Bytes::from(data)
}

/// Sends one `upload_bytes` payload and publishes the upload speed.
///
/// `Ok(None)` means the run was cancelled; any transport failure or non-2xx
/// status is returned as an error.
pub(crate) async fn run_upload<T: Transport>(
    transport: &T,
    ctx: &RunContext,
) -> Result<Option<ThroughputSummary>, TransportError> {
    let size = ctx.cfg.upload_bytes;
    let payload = random_payload(size as usize);
    let start = Instant::now();

    let emit_after = ctx.cfg.emit_after;
    let progress_ctx = ctx.clone();
    let on_progress = move |p: UploadProgress| {
        let elapsed = start.elapsed();
        if elapsed <= emit_after {
            return;
        }
        let mbps = live_mbps(p.sent, elapsed);
        let progress = upload_progress(p);
        progress_ctx.publish(|s| {
            s.metrics.upload_speed = Some(mbps);
            s.metrics.progress = s.metrics.progress.max(progress);
        });
    };

    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return Ok(None),
        r = transport.upload(payload, on_progress) => r?,
    }

    if ctx.is_cancelled() {
        return Ok(None);
    }

    let summary = throughput_summary(size, start.elapsed());
    ctx.publish(|s| {
        s.metrics.upload_speed = Some(summary.mbps);
        s.metrics.progress = 100.0;
    });
    Ok(Some(summary))
}
