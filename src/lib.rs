pub mod controller;
pub mod dispatch;
pub mod measure;
pub mod probe;
pub mod runtime;
pub mod sink;
pub mod supervisor;

pub use dispatch::{AggregatedMetric, DispatchEngine, DispatchSettings, HaltReason, PassReport};
pub use measure::job::MeasurementJob;
pub use measure::kind::{IpVersion, MeasurementKind};
pub use measure::target::{ResolutionError, Target, TargetResolver};
pub use probe::{ProbeError, ProbeService, ProbeSession};
pub use runtime::config::{RuntimeSettings, RuntimeSettingsBuilder};
pub use runtime::fleet_config::FleetConfig;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use sink::{MetricPoint, MetricsSink, SinkError};
pub use supervisor::{EpochBackends, Supervisor};
