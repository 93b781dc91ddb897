//! Fleet reconciliation controller: keeps the configuration in sync with the
//! management API and drives the supervisor process through test windows.

pub mod api;
pub mod assemble;
pub mod process;
pub mod reconcile;

pub use api::{ApiError, HttpManagementClient, ManagementApi};
pub use process::{ProcessControl, ProcessSettings, SupervisorControl};
pub use reconcile::{ReconcileSettings, Reconciler, StepOutcome};

/// Environment variable holding the management API login.
pub const LOGIN_ENV: &str = "PROBEFLEET_API_LOGIN";
/// Environment variable holding the management API password.
pub const PASSWORD_ENV: &str = "PROBEFLEET_API_PASSWORD";
