//! Metrics-store boundary used by measurement workers.

pub mod influx;

use futures::future::BoxFuture;
use thiserror::Error;

pub use influx::{InfluxSink, InfluxSettings};

/// One row written per node sample (including the `mean` entry) of a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricPoint {
    /// Measurement name, e.g. `ping4`.
    pub series: String,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    pub destination: String,
    pub party: String,
    pub node: String,
    pub count: u32,
    pub value_ms: u64,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("metrics store is not connected")]
    NotConnected,
    #[error("metrics store rejected write with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("metrics store request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

pub trait MetricsSink: Send + Sync {
    /// Checks the store is reachable. `false` ends the calling worker.
    fn connect(&self) -> BoxFuture<'_, bool>;

    fn write<'a>(&'a self, point: &'a MetricPoint) -> BoxFuture<'a, Result<(), SinkError>>;
}
