mod http;
#[cfg(test)]
pub(crate) mod mock;
mod ping;
mod throughput;
pub mod transport;

pub use http::HttpTransport;
pub use transport::{Transport, TransportError};

use crate::model::{EngineConfig, EngineState, Metrics, Phase, RunOutcome, RunReport};
use rand::RngCore;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A run that ended without completing for a reason other than cancellation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("upload failed: {0}")]
    UploadFailed(#[source] TransportError),
}

/// State shared between the engine handle and its in-flight run.
struct Shared {
    state: watch::Sender<EngineState>,
    /// Bumped whenever a run is started or reset. A run may only publish
    /// while it still holds the current generation.
    generation: AtomicU64,
    active: Mutex<Option<CancellationToken>>,
}

impl Shared {
    fn active(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-run handle given to each phase.
#[derive(Clone)]
pub(crate) struct RunContext {
    generation: u64,
    shared: Arc<Shared>,
    pub(crate) cancel: CancellationToken,
    pub(crate) cfg: Arc<EngineConfig>,
}

impl RunContext {
    fn is_current(&self) -> bool {
        self.shared.generation.load(Ordering::SeqCst) == self.generation
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || !self.is_current()
    }

    /// Applies `f` to the observable state unless this run has been superseded.
    ///
    /// The generation is checked under the channel lock, and `reset`/`run_test`
    /// bump it before taking that lock, so a stale run can never write after
    /// a reset has landed.
    pub(crate) fn publish(&self, f: impl FnOnce(&mut EngineState)) -> bool {
        self.shared.state.send_if_modified(|state| {
            if !self.is_current() {
                return false;
            }
            f(state);
            true
        })
    }

    pub(crate) fn enter(&self, phase: Phase) {
        if self.publish(|s| s.phase = phase) {
            tracing::debug!(generation = self.generation, ?phase, "phase started");
        }
    }

    /// Drops the engine's reference to this run's token if it is still ours.
    fn release(&self) {
        let mut active = self.shared.active();
        if self.is_current() {
            active.take();
        }
    }
}

pub struct SpeedTestEngine<T: Transport> {
    transport: Arc<T>,
    cfg: Arc<EngineConfig>,
    shared: Arc<Shared>,
}

impl<T: Transport> SpeedTestEngine<T> {
    pub fn new(transport: T, cfg: EngineConfig) -> Self {
        let (state, _) = watch::channel(EngineState::default());
        Self {
            transport: Arc::new(transport),
            cfg: Arc::new(cfg),
            shared: Arc::new(Shared {
                state,
                generation: AtomicU64::new(0),
                active: Mutex::new(None),
            }),
        }
    }

    /// Receives the latest state after every update.
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.shared.state.subscribe()
    }

    pub fn state(&self) -> EngineState {
        self.shared.state.borrow().clone()
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.borrow().phase
    }

    pub fn metrics(&self) -> Metrics {
        self.shared.state.borrow().metrics.clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.active().is_some()
    }

    /// Starts a new run in the background, superseding any run in flight.
    ///
    /// Must be called from within a tokio runtime. The returned handle
    /// resolves once the run completes, is cancelled, or fails.
    pub fn run_test(&self) -> JoinHandle<Result<RunOutcome, EngineError>> {
        let mut active = self.shared.active();
        if let Some(old) = active.take() {
            old.cancel();
            tracing::debug!("superseding active run");
        }
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.state.send_replace(EngineState {
            phase: Phase::Ping,
            metrics: Metrics::default(),
        });
        let cancel = CancellationToken::new();
        *active = Some(cancel.clone());
        drop(active);

        tracing::debug!(generation, phase = ?Phase::Ping, "phase started");
        let ctx = RunContext {
            generation,
            shared: self.shared.clone(),
            cancel,
            cfg: self.cfg.clone(),
        };
        let transport = self.transport.clone();

        tokio::spawn(async move {
            let result = run_phases(&transport, &ctx).await;
            ctx.release();
            result
        })
    }

    /// Cancels any run in flight and restores the idle state.
    pub fn reset(&self) {
        let mut active = self.shared.active();
        if let Some(token) = active.take() {
            token.cancel();
        }
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.state.send_replace(EngineState::default());
    }
}

impl<T: Transport> Drop for SpeedTestEngine<T> {
    fn drop(&mut self) {
        if let Some(token) = self.shared.active().take() {
            token.cancel();
        }
    }
}

async fn run_phases<T: Transport>(
    transport: &Arc<T>,
    ctx: &RunContext,
) -> Result<RunOutcome, EngineError> {
    let Some(latency) = ping::run_ping(transport.as_ref(), ctx).await else {
        return Ok(cancelled(ctx));
    };

    ctx.enter(Phase::Download);
    let Some(download) = throughput::run_download(transport, ctx).await else {
        return Ok(cancelled(ctx));
    };

    ctx.enter(Phase::Upload);
    let upload = match throughput::run_upload(transport.as_ref(), ctx).await {
        Ok(Some(upload)) => upload,
        Ok(None) => return Ok(cancelled(ctx)),
        Err(_) if ctx.is_cancelled() => return Ok(cancelled(ctx)),
        Err(e) => {
            tracing::error!(generation = ctx.generation, error = %e, "upload phase failed");
            ctx.publish(|s| s.phase = Phase::Idle);
            return Err(EngineError::UploadFailed(e));
        }
    };

    let metrics = Metrics {
        latency: Some(latency.mean_ms),
        jitter: Some(latency.jitter_ms),
        download_speed: Some(download.mbps),
        upload_speed: Some(upload.mbps),
        progress: 100.0,
    };
    if !ctx.publish(|s| s.phase = Phase::Complete) {
        return Ok(cancelled(ctx));
    }

    tracing::info!(
        generation = ctx.generation,
        latency_ms = latency.mean_ms,
        jitter_ms = latency.jitter_ms,
        download_mbps = download.mbps,
        upload_mbps = upload.mbps,
        "speed test complete"
    );

    Ok(RunOutcome::Completed(RunReport {
        run_id: gen_run_id(),
        timestamp_utc: time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "now".into()),
        base_url: ctx.cfg.base_url.clone(),
        config: ctx.cfg.as_ref().clone(),
        latency,
        download,
        upload,
        metrics,
    }))
}

fn cancelled(ctx: &RunContext) -> RunOutcome {
    tracing::info!(generation = ctx.generation, "speed test cancelled");
    RunOutcome::Cancelled
}

/// Generate a random identifier for a run.
fn gen_run_id() -> String {
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    format!("{:016x}", u64::from_le_bytes(b))
}
