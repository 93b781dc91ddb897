//! Runtime glue shared by both binaries: timing settings, the YAML fleet
//! configuration, tracing and counters, retry helpers, restart coordination,
//! OS signal flags and PID file bookkeeping.

pub mod backoff;
pub mod config;
pub mod fleet_config;
pub mod pidfile;
pub mod restart;
pub mod signals;
pub mod telemetry;
