use crate::dispatch::engine::{DispatchEngine, PassReport};
use crate::dispatch::state::HaltReason;
use crate::measure::job::MeasurementJob;
use crate::probe::service::ProbeService;
use crate::runtime::backoff::sleep_or_cancel;
use crate::runtime::restart::{RestartHandle, RestartReason};
use crate::runtime::telemetry::Telemetry;
use crate::sink::{MetricPoint, MetricsSink};
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why a worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Cancelled,
    /// The metrics store could not be reached before a pass.
    SinkUnavailable,
    /// A pass could not reclaim its instances and asked for an epoch restart.
    RestartRequested,
}

pub struct WorkerParams {
    pub job: MeasurementJob,
    pub engine: DispatchEngine,
    pub service: Arc<dyn ProbeService>,
    pub sink: Arc<dyn MetricsSink>,
    pub telemetry: Arc<Telemetry>,
    pub restart: RestartHandle,
    pub pass_interval: Duration,
    pub cancel: CancellationToken,
}

/// Runs one job's dispatch pass over and over until cancelled.
pub struct MeasurementWorker {
    job: MeasurementJob,
    engine: DispatchEngine,
    service: Arc<dyn ProbeService>,
    sink: Arc<dyn MetricsSink>,
    telemetry: Arc<Telemetry>,
    restart: RestartHandle,
    pass_interval: Duration,
    cancel: CancellationToken,
}

impl MeasurementWorker {
    pub fn new(params: WorkerParams) -> Self {
        let WorkerParams {
            job,
            engine,
            service,
            sink,
            telemetry,
            restart,
            pass_interval,
            cancel,
        } = params;

        Self {
            job,
            engine,
            service,
            sink,
            telemetry,
            restart,
            pass_interval,
            cancel,
        }
    }

    pub fn series(&self) -> String {
        self.job.series()
    }

    pub async fn run(self) -> Result<WorkerExit> {
        let series = self.job.series();
        tracing::info!(
            series = %series,
            targets = self.job.targets().len(),
            nodes = self.job.nodes().len(),
            "measurement worker started"
        );

        loop {
            if self.cancel.is_cancelled() {
                return Ok(WorkerExit::Cancelled);
            }

            if !self.sink.connect().await {
                tracing::error!(series = %series, "metrics store unreachable; worker stops");
                return Ok(WorkerExit::SinkUnavailable);
            }

            let timestamp = Utc::now().timestamp();
            let report = match self
                .engine
                .run_once(&self.job, self.service.as_ref(), &self.cancel)
                .await
            {
                Ok(report) => report,
                Err(err) => {
                    tracing::warn!(
                        series = %series,
                        error = %format!("{err:#}"),
                        retry_in = ?self.pass_interval,
                        "pass skipped"
                    );
                    if self.pause().await {
                        return Ok(WorkerExit::Cancelled);
                    }
                    continue;
                }
            };
            self.write_report(&report, timestamp).await;

            if report.restart_required() {
                self.restart.request(RestartReason::ReclaimExceeded {
                    series: series.clone(),
                    iterations: report.reclaim_iterations,
                });
                return Ok(WorkerExit::RestartRequested);
            }

            if report.halt == HaltReason::Cancelled {
                return Ok(WorkerExit::Cancelled);
            }

            if self.pause().await {
                return Ok(WorkerExit::Cancelled);
            }
        }
    }

    /// Waits one pass interval. Returns `true` when the epoch was cancelled meanwhile.
    async fn pause(&self) -> bool {
        sleep_or_cancel(self.pass_interval, &self.cancel).await
    }

    /// Writes every node sample and the mean entry. The first failed write drops the rest.
    async fn write_report(&self, report: &PassReport, timestamp: i64) {
        let mut written = 0usize;
        for metric in report.metrics.values() {
            for sample in metric.samples() {
                let point = MetricPoint {
                    series: report.series.clone(),
                    timestamp,
                    destination: metric.destination.clone(),
                    party: metric.party.clone(),
                    node: sample.node,
                    count: sample.count,
                    value_ms: sample.value_ms,
                };

                if let Err(err) = self.sink.write(&point).await {
                    self.telemetry.record_write_failure();
                    tracing::warn!(
                        series = %report.series,
                        target = %point.destination,
                        node = %point.node,
                        written,
                        error = %err,
                        "metrics write failed; dropping the rest of this pass"
                    );
                    return;
                }
                self.telemetry.record_point_written();
                written += 1;
            }
        }

        tracing::debug!(series = %report.series, written, "pass results written");
    }
}
