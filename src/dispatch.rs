//! Probe dispatch: the per-pass feed/poll loop, its timeout and reclaim state
//! machine, and per-destination aggregation of decoded results.

pub mod aggregate;
pub mod engine;
pub mod state;

pub use aggregate::{AggregatedMetric, MeanValue, NodeSample, ResultRecord};
pub use engine::{DispatchEngine, DispatchSettings, PassReport};
pub use state::{DispatchState, HaltReason, PassState, ReclaimPolicy, ReclaimStep};
