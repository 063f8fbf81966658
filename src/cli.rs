use crate::engine::{HttpTransport, SpeedTestEngine};
use crate::model::{EngineConfig, EngineState, Phase, RunOutcome, RunReport};
use anyhow::{Context, Result};
use clap::Parser;
use std::time::{Duration, Instant};

/// Minimum gap between live progress lines in text mode.
const PROGRESS_PRINT_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Parser, Clone)]
#[command(
    name = "kit-speedtest",
    version,
    about = "Measure latency, jitter and throughput of a terminal's link"
)]
pub struct Cli {
    /// Base URL of the dashboard API serving the measurement endpoints
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    pub base_url: String,

    /// Print the JSON report and exit (no live output)
    #[arg(long)]
    pub json: bool,

    /// Number of latency probes
    #[arg(long, default_value_t = 5)]
    pub ping_count: usize,

    /// Latency recorded for a probe that fails
    #[arg(long, default_value = "100ms")]
    pub probe_penalty: humantime::Duration,

    /// Concurrent download streams
    #[arg(long, default_value_t = 4)]
    pub streams: usize,

    /// Bytes requested by each download stream
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub download_bytes: u64,

    /// Bytes sent in the upload request
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub upload_bytes: u64,

    /// Abort the test if it has not finished within this time (e.g. 30s)
    #[arg(long)]
    pub timeout: Option<humantime::Duration>,

    /// Bind to a specific source IP address (e.g., 192.168.10.2)
    #[arg(long)]
    pub source: Option<String>,

    /// Path to a custom TLS certificate file (PEM or DER format)
    #[arg(long)]
    pub certificate: Option<std::path::PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

/// Build an `EngineConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> EngineConfig {
    EngineConfig {
        base_url: args.base_url.clone(),
        source_ip: args.source.clone(),
        certificate_path: args.certificate.clone(),
        ping_count: args.ping_count,
        probe_penalty: Duration::from(args.probe_penalty),
        download_streams: args.streams,
        download_bytes: args.download_bytes,
        upload_bytes: args.upload_bytes,
        ..EngineConfig::default()
    }
}

pub async fn run(args: Cli) -> Result<()> {
    let cfg = build_config(&args);
    cfg.validate().context("invalid test parameters")?;

    let transport = HttpTransport::new(&cfg)?;
    let engine = SpeedTestEngine::new(transport, cfg);
    let mut state_rx = engine.subscribe();
    let mut handle = engine.run_test();

    let deadline = args.timeout.map(Duration::from);
    let timer = async move {
        match deadline {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(timer);

    let mut printer = ProgressPrinter::default();
    if !args.json {
        printer.update(&engine.state());
    }
    let mut interrupted: Option<&'static str> = None;

    let outcome = loop {
        tokio::select! {
            res = &mut handle => break res.context("speed test task failed")?,
            Ok(()) = state_rx.changed() => {
                let state = state_rx.borrow_and_update().clone();
                if !args.json {
                    printer.update(&state);
                }
            }
            _ = &mut timer, if interrupted.is_none() => {
                tracing::warn!(
                    phase = ?engine.phase(),
                    progress = engine.metrics().progress,
                    "time budget exhausted, cancelling"
                );
                engine.reset();
                interrupted = Some("timed out");
            }
            _ = tokio::signal::ctrl_c(), if interrupted.is_none() => {
                tracing::debug!(running = engine.is_running(), "received Ctrl-C");
                engine.reset();
                interrupted = Some("interrupted");
            }
        }
    };

    match outcome.context("speed test failed")? {
        RunOutcome::Completed(report) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_summary(&report);
            }
            Ok(())
        }
        RunOutcome::Cancelled => Err(anyhow::anyhow!(
            "speed test {}",
            interrupted.unwrap_or("cancelled")
        )),
    }
}

/// Prints phase changes and throttled live metrics to stderr.
#[derive(Default)]
struct ProgressPrinter {
    phase: Phase,
    last_print: Option<Instant>,
}

impl ProgressPrinter {
    fn update(&mut self, state: &EngineState) {
        if state.phase != self.phase {
            self.phase = state.phase;
            if state.phase.is_active() {
                eprintln!("== {:?} ==", state.phase);
            }
            self.last_print = None;
        }
        if !state.phase.is_active() {
            return;
        }
        if self
            .last_print
            .is_some_and(|t| t.elapsed() < PROGRESS_PRINT_INTERVAL)
        {
            return;
        }
        self.last_print = Some(Instant::now());
        if let Some(line) = live_line(state) {
            eprintln!("{line}");
        }
    }
}

fn live_line(state: &EngineState) -> Option<String> {
    let m = &state.metrics;
    let detail = match state.phase {
        Phase::Ping => match (m.latency, m.jitter) {
            (Some(l), Some(j)) => format!("Latency: {:.1} ms (jitter {:.1} ms)", l, j),
            _ => "Probing latency".to_string(),
        },
        Phase::Download => format!("Download: {:.2} Mbps", m.download_speed?),
        Phase::Upload => format!("Upload: {:.2} Mbps", m.upload_speed?),
        Phase::Idle | Phase::Complete => return None,
    };
    Some(format!("[{:>5.1}%] {}", m.progress, detail))
}

fn print_summary(report: &RunReport) {
    let lat = &report.latency;
    println!(
        "Latency: {:.1} ms (jitter {:.1} ms, min/med/max {}/{}/{} ms, {}/{} probes failed)",
        lat.mean_ms,
        lat.jitter_ms,
        fmt_ms(lat.min_ms),
        fmt_ms(lat.median_ms),
        fmt_ms(lat.max_ms),
        lat.failed,
        lat.sent
    );
    println!(
        "Download: {:.2} Mbps ({} bytes in {:.2} s)",
        report.download.mbps,
        report.download.bytes,
        report.download.duration_ms as f64 / 1000.0
    );
    println!(
        "Upload:   {:.2} Mbps ({} bytes in {:.2} s)",
        report.upload.mbps,
        report.upload.bytes,
        report.upload.duration_ms as f64 / 1000.0
    );
}

fn fmt_ms(v: Option<f64>) -> String {
    v.map(|v| format!("{:.1}", v)).unwrap_or_else(|| "-".into())
}
