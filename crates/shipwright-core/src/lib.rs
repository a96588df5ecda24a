//! Shipwright Core Library
//!
//! Generate code, verify it in a sandbox, deploy it as an immutable
//! version and keep checking its health.
//!
//! - [`sandbox`]: bounded execution of untrusted code
//! - [`deploy`]: versioned deployments with an atomic active pointer
//! - [`health`]: check batteries, bounded history, background monitors
//! - [`generator`]: the code generation boundary
//! - [`orchestrator`]: the pipeline state machine tying them together

#[cfg(not(unix))]
compile_error!("shipwright-core requires a unix host (process groups, rlimits)");

pub mod cas;
pub mod config;
pub mod deploy;
pub mod domain;
pub mod generator;
pub mod health;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod sandbox;
pub mod telemetry;

pub use cas::artifacts::ArtifactStore;
pub use cas::fs::BlobStore;
pub use cas::{CasError, CasStore, Digest};

pub use config::ShipwrightConfig;

pub use domain::{normalize_content, Language, Result, ShipwrightError, SourceArtifact};

pub use sandbox::{
    ExecutionPolicy, ExecutionResult, ExecutionStatus, IsolationMode, LocalSandbox,
    SandboxRunner, SandboxSettings,
};

pub use deploy::{DeployError, DeploymentManager, DeploymentRecord, DeploymentStatus};

pub use health::{
    maintenance_report, CheckResult, HealthCheckEntry, HealthCheckError, HealthHistory,
    HealthMonitor, HealthStatus, MonitorHandle, MonitorSettings, RemediationHook,
};

pub use generator::{
    FailureFeedback, GenerationError, GenerationRequest, Generator, HttpGenerator,
    HttpGeneratorConfig,
};

pub use orchestrator::{
    FailureReason, Orchestrator, PipelineConfig, PipelineJob, PipelineOutcome, PipelineRun,
    PipelineState,
};

pub use metrics::{MetricsSnapshot, METRICS};
pub use telemetry::init_tracing;

/// Shipwright version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
