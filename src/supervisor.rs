//! Measurement process supervision: job planning per configuration epoch,
//! the per-job worker loop, the worker pool and the epoch runner.

pub mod epoch;
pub mod plan;
pub mod pool;
pub mod runner;
pub mod worker;

use crate::probe::local::LocalProbeService;
use crate::probe::service::ProbeService;
use crate::runtime::fleet_config::FleetConfig;
use crate::sink::{InfluxSettings, InfluxSink, MetricsSink};
use anyhow::Result;
use std::sync::Arc;

pub use plan::plan_jobs;
pub use runner::{EpochOutcome, Supervisor};
pub use worker::{MeasurementWorker, WorkerExit};

/// Builds the probe service and metrics sink of one epoch from its configuration.
pub trait EpochBackends: Send + Sync {
    fn probe_service(&self, config: &FleetConfig) -> Result<Arc<dyn ProbeService>>;
    fn metrics_sink(&self, config: &FleetConfig) -> Result<Arc<dyn MetricsSink>>;
}

/// Local probe backend plus the InfluxDB writer.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBackends;

impl EpochBackends for DefaultBackends {
    fn probe_service(&self, config: &FleetConfig) -> Result<Arc<dyn ProbeService>> {
        Ok(Arc::new(LocalProbeService::from_section(&config.probe)))
    }

    fn metrics_sink(&self, config: &FleetConfig) -> Result<Arc<dyn MetricsSink>> {
        let settings = InfluxSettings::from_section(&config.database)?;
        Ok(Arc::new(InfluxSink::new(settings)?))
    }
}
