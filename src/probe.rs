//! Probe execution capability: the session interface the dispatch engine
//! drives, node enumeration helpers and a backend running probes from this host.

pub mod local;
pub mod nodes;
pub mod service;

pub use service::{
    Completion, Correlation, InstanceId, PollEvent, ProbeError, ProbeFuture, ProbeRequest,
    ProbeService, ProbeSession, RawBody, RawResult, RequestBody, TaskId,
};
