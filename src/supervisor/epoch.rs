//! Run-scoped handles of one configuration epoch.

use crate::runtime::restart::RestartHandle;
use crate::runtime::telemetry::{self, Telemetry};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub(crate) struct EpochHandles {
    pub run_token: CancellationToken,
    restart: RestartHandle,
    metrics_handle: Option<JoinHandle<()>>,
}

impl EpochHandles {
    pub(crate) fn spawn(
        shutdown_root: &CancellationToken,
        telemetry: Arc<Telemetry>,
        metrics_interval: Duration,
    ) -> Self {
        let run_token = shutdown_root.child_token();
        let restart = RestartHandle::new(run_token.clone());
        let metrics_handle =
            telemetry::spawn_metrics_reporter(telemetry, run_token.clone(), metrics_interval);

        Self {
            run_token,
            restart,
            metrics_handle: Some(metrics_handle),
        }
    }

    pub(crate) fn restart(&self) -> RestartHandle {
        self.restart.clone()
    }

    pub(crate) async fn shutdown(mut self) {
        self.run_token.cancel();
        if let Some(handle) = self.metrics_handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "metrics reporter task panicked");
            }
        }
    }
}
