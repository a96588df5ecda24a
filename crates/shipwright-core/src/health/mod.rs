//! Health monitor: a fixed battery of checks against a deployment,
//! aggregated into one status and kept in a bounded history.

pub mod checks;
pub mod entry;
pub mod error;
pub mod history;
pub mod monitor;
pub mod report;

pub use checks::{CommandSyntaxChecker, LogMarkers, SyntaxChecker, SyntaxVerdict};
pub use entry::{CheckLevel, CheckResult, HealthCheckEntry, HealthStatus};
pub use error::HealthCheckError;
pub use history::HealthHistory;
pub use monitor::{
    HealthMonitor, MonitorCanceller, MonitorHandle, MonitorSettings, RemediationHook,
};
pub use report::maintenance_report;
