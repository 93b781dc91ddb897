use crate::supervisor::worker::{MeasurementWorker, WorkerExit};
use futures::FutureExt;
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

/// Tasks of one epoch's measurement workers.
///
/// A worker that fails or panics is logged and left dead; its siblings keep running.
#[derive(Default)]
pub struct WorkerPool {
    workers: Vec<(String, JoinHandle<()>)>,
    live: Arc<AtomicUsize>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainSummary {
    pub finished: usize,
    pub aborted: usize,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn spawn(&mut self, worker: MeasurementWorker) {
        let series = worker.series();
        let live = self.live.clone();
        live.fetch_add(1, Ordering::SeqCst);

        let task_series = series.clone();
        let handle = tokio::spawn(async move {
            let result = std::panic::AssertUnwindSafe(worker.run())
                .catch_unwind()
                .await;

            match result {
                Ok(Ok(WorkerExit::Cancelled)) => {
                    tracing::debug!(series = %task_series, "measurement worker stopped");
                }
                Ok(Ok(exit)) => {
                    tracing::warn!(series = %task_series, exit = ?exit, "measurement worker exited");
                }
                Ok(Err(err)) => {
                    tracing::error!(
                        series = %task_series,
                        error = %format!("{err:#}"),
                        "measurement worker exited with error"
                    );
                }
                Err(panic_payload) => {
                    let panic_msg = panic_message(panic_payload.as_ref());
                    tracing::error!(
                        series = %task_series,
                        panic = %panic_msg,
                        "measurement worker panicked"
                    );
                }
            }

            live.fetch_sub(1, Ordering::SeqCst);
        });

        self.workers.push((series, handle));
    }

    /// Waits up to `grace` for every worker, aborting those still running afterwards.
    pub async fn drain(self, grace: Duration) -> DrainSummary {
        let deadline = Instant::now() + grace;
        let mut summary = DrainSummary::default();

        for (series, mut handle) in self.workers {
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => summary.finished += 1,
                Ok(Err(err)) => {
                    summary.finished += 1;
                    tracing::warn!(series = %series, error = %err, "measurement worker task failed");
                }
                Err(_) => {
                    tracing::warn!(
                        series = %series,
                        grace = ?grace,
                        "measurement worker did not stop in time; aborting"
                    );
                    handle.abort();
                    summary.aborted += 1;
                }
            }
        }

        summary
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
