//! Top-level configuration.
//!
//! Every section has working defaults; [`ShipwrightConfig::from_env`]
//! overrides them from `SHIPWRIGHT_*` variables.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::domain::{Result, ShipwrightError};
use crate::generator::HttpGeneratorConfig;
use crate::health::MonitorSettings;
use crate::orchestrator::PipelineConfig;
use crate::sandbox::{ExecutionPolicy, IsolationMode, SandboxSettings};

/// Default deployment root, relative to the working directory.
pub const DEFAULT_ROOT: &str = "deployments";

/// Directory under the deployment root holding health history. The leading
/// dot keeps it out of deployment name validation.
pub const HEALTH_DIR: &str = ".health";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub settings: SandboxSettings,
    /// Policy applied when a job does not bring its own.
    pub default_policy: ExecutionPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployConfig {
    pub root: PathBuf,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShipwrightConfig {
    pub sandbox: SandboxConfig,
    pub deploy: DeployConfig,
    pub monitor: MonitorSettings,
    pub pipeline: PipelineConfig,
    pub generator: HttpGeneratorConfig,
}

impl ShipwrightConfig {
    /// Defaults overridden from the process environment.
    ///
    /// Reads:
    /// - SHIPWRIGHT_ROOT: deployment root (default `deployments`)
    /// - SHIPWRIGHT_TIMEOUT_MS, SHIPWRIGHT_MEMORY_BYTES, SHIPWRIGHT_CPU_LIMIT
    /// - SHIPWRIGHT_NETWORK: `true` to allow network access
    /// - SHIPWRIGHT_ISOLATION: `container` or `subprocess`
    /// - SHIPWRIGHT_CONTAINER_RUNTIME: docker-compatible CLI
    /// - SHIPWRIGHT_MAX_ATTEMPTS, SHIPWRIGHT_MONITOR_INTERVAL_MS
    /// - SHIPWRIGHT_HISTORY_CAPACITY, SHIPWRIGHT_ALERT_THRESHOLD
    /// - SHIPWRIGHT_GENERATOR_ENDPOINT, SHIPWRIGHT_MODEL
    /// - SHIPWRIGHT_API_KEY, falling back to OPENAI_API_KEY
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(root) = lookup("SHIPWRIGHT_ROOT") {
            config.deploy.root = PathBuf::from(root);
        }

        let policy = &mut config.sandbox.default_policy;
        if let Some(v) = parsed::<u64, _>(&lookup, "SHIPWRIGHT_TIMEOUT_MS")? {
            policy.timeout_ms = v;
        }
        if let Some(v) = parsed::<u64, _>(&lookup, "SHIPWRIGHT_MEMORY_BYTES")? {
            policy.memory_limit_bytes = v;
        }
        if let Some(v) = parsed::<f64, _>(&lookup, "SHIPWRIGHT_CPU_LIMIT")? {
            policy.cpu_limit = v;
        }
        if let Some(v) = lookup("SHIPWRIGHT_NETWORK") {
            policy.network_allowed = v.eq_ignore_ascii_case("true") || v == "1";
        }
        if let Some(v) = lookup("SHIPWRIGHT_ISOLATION") {
            policy.isolation_mode = parse_isolation(&v)?;
        }
        if let Some(v) = lookup("SHIPWRIGHT_CONTAINER_RUNTIME") {
            config.sandbox.settings.container_runtime = v;
        }

        if let Some(v) = parsed::<u32, _>(&lookup, "SHIPWRIGHT_MAX_ATTEMPTS")? {
            config.pipeline.max_attempts = v;
        }
        if let Some(v) = parsed::<u64, _>(&lookup, "SHIPWRIGHT_MONITOR_INTERVAL_MS")? {
            config.pipeline.monitor_interval_ms = v;
        }
        if let Some(v) = parsed::<usize, _>(&lookup, "SHIPWRIGHT_HISTORY_CAPACITY")? {
            config.monitor.history_capacity = v;
        }
        if let Some(v) = parsed::<u32, _>(&lookup, "SHIPWRIGHT_ALERT_THRESHOLD")? {
            config.monitor.alert_threshold = v;
        }

        if let Some(v) = lookup("SHIPWRIGHT_GENERATOR_ENDPOINT") {
            config.generator.endpoint = v;
        }
        if let Some(v) = lookup("SHIPWRIGHT_MODEL") {
            config.generator.model = v;
        }
        config.generator.api_key = lookup("SHIPWRIGHT_API_KEY")
            .or_else(|| lookup("OPENAI_API_KEY"))
            .filter(|k| !k.is_empty());

        config.validate()?;
        Ok(config)
    }

    /// Where health history lives: the configured directory, or `.health`
    /// under the deployment root.
    pub fn history_dir(&self) -> PathBuf {
        self.monitor
            .history_dir
            .clone()
            .unwrap_or_else(|| self.deploy.root.join(HEALTH_DIR))
    }

    pub fn validate(&self) -> Result<()> {
        self.sandbox
            .default_policy
            .validate()
            .map_err(|e| ShipwrightError::InvalidConfig(e.to_string()))?;
        if self.pipeline.max_attempts == 0 {
            return Err(invalid("pipeline.max_attempts must be at least 1"));
        }
        if self.pipeline.monitor_interval_ms == 0 {
            return Err(invalid("pipeline.monitor_interval_ms must be positive"));
        }
        if self.monitor.history_capacity == 0 {
            return Err(invalid("monitor.history_capacity must be at least 1"));
        }
        if self.monitor.alert_threshold == 0 {
            return Err(invalid("monitor.alert_threshold must be at least 1"));
        }
        if self.sandbox.settings.output_cap_bytes == 0 {
            return Err(invalid("sandbox.output_cap_bytes must be positive"));
        }
        regex::Regex::new(&self.monitor.error_pattern)
            .map_err(|e| invalid(format!("monitor.error_pattern: {e}")))?;
        regex::Regex::new(&self.monitor.warning_pattern)
            .map_err(|e| invalid(format!("monitor.warning_pattern: {e}")))?;
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ShipwrightError {
    ShipwrightError::InvalidConfig(msg.into())
}

fn parsed<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(format!("{key}={raw}: {e}"))),
    }
}

fn parse_isolation(raw: &str) -> Result<IsolationMode> {
    match raw.to_ascii_lowercase().as_str() {
        "container" => Ok(IsolationMode::Container),
        "subprocess" => Ok(IsolationMode::Subprocess),
        other => Err(invalid(format!(
            "SHIPWRIGHT_ISOLATION must be container or subprocess, got {other}"
        ))),
    }
}
