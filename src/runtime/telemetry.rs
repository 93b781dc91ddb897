use anyhow::{Context, Result};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(60);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs the tracing subscriber (if one is not already active).
///
/// `RUST_LOG` wins over `level` when present. With a `logfile`, output goes to a
/// daily rolling file next to it and the returned guard must be kept alive to
/// flush buffered lines. Calling this function multiple times is harmless.
pub fn init_tracing(level: &str, logfile: Option<&Path>) -> Result<Option<WorkerGuard>> {
    if TRACING_INIT.get().is_some() {
        return Ok(None);
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(normalize_level(level)))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let guard = match logfile {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .with_context(|| format!("log file {} has no file name", path.display()))?;
            std::fs::create_dir_all(directory)
                .with_context(|| format!("failed to create log directory {}", directory.display()))?;

            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_ansi(false)
                .with_writer(writer)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(true)
                .try_init();
            None
        }
    };

    let _ = TRACING_INIT.set(());
    Ok(guard)
}

fn normalize_level(level: &str) -> String {
    match level.trim().to_ascii_lowercase().as_str() {
        "warning" => "warn".to_string(),
        other => other.to_string(),
    }
}

/// Process-wide counters shared by dispatch passes, workers and the sink.
#[derive(Default, Debug)]
pub struct Telemetry {
    passes: AtomicU64,
    probes_issued: AtomicU64,
    completions: AtomicU64,
    poll_timeouts: AtomicU64,
    reclaim_iterations: AtomicU64,
    force_halts: AtomicU64,
    decode_mismatches: AtomicU64,
    points_written: AtomicU64,
    write_failures: AtomicU64,
}

impl Telemetry {
    pub fn record_pass(&self) {
        self.passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_probe_issued(&self) {
        self.probes_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completion(&self) {
        self.completions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_timeout(&self) {
        self.poll_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reclaim_iteration(&self) {
        self.reclaim_iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_force_halts(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.force_halts.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_decode_mismatch(&self) {
        self.decode_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_point_written(&self) {
        self.points_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            probes_issued: self.probes_issued.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            poll_timeouts: self.poll_timeouts.load(Ordering::Relaxed),
            reclaim_iterations: self.reclaim_iterations.load(Ordering::Relaxed),
            force_halts: self.force_halts.load(Ordering::Relaxed),
            decode_mismatches: self.decode_mismatches.load(Ordering::Relaxed),
            points_written: self.points_written.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub passes: u64,
    pub probes_issued: u64,
    pub completions: u64,
    pub poll_timeouts: u64,
    pub reclaim_iterations: u64,
    pub force_halts: u64,
    pub decode_mismatches: u64,
    pub points_written: u64,
    pub write_failures: u64,
}

/// Spawns a background task that periodically logs probe throughput and recovery counters.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately.
        ticker.tick().await;

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!(target: "probefleet::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current = telemetry.snapshot();
                    let completed_delta = current.completions.saturating_sub(last_snapshot.completions);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        completed_delta as f64 / elapsed
                    };

                    tracing::info!(
                        target: "probefleet::metrics",
                        throughput = format!("{throughput:.2}"),
                        passes = current.passes,
                        probes_issued = current.probes_issued,
                        completions = current.completions,
                        poll_timeouts = current.poll_timeouts,
                        reclaim_iterations = current.reclaim_iterations,
                        force_halts = current.force_halts,
                        decode_mismatches = current.decode_mismatches,
                        points_written = current.points_written,
                        write_failures = current.write_failures,
                        "runtime metrics snapshot"
                    );

                    last_snapshot = current;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
