//! Per-invocation execution policy.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{SandboxError, SandboxResult};

/// How strongly a run is isolated from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// A container via a docker-compatible CLI: memory/CPU caps enforced by
    /// cgroups, network namespace removed when network is denied.
    Container,
    /// A host child process in its own process group with rlimits applied.
    /// Reduced isolation: network denial and memory caps are best-effort.
    Subprocess,
}

impl IsolationMode {
    /// Check for a usable container runtime and pick the strongest mode.
    pub async fn detect(container_runtime: &str) -> Self {
        let version = tokio::process::Command::new(container_runtime)
            .args(["version", "--format", "{{.Server.Version}}"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match tokio::time::timeout(Duration::from_secs(5), version).await {
            Ok(Ok(status)) if status.success() => IsolationMode::Container,
            _ => {
                tracing::warn!(
                    runtime = %container_runtime,
                    "container runtime unavailable; falling back to subprocess isolation"
                );
                IsolationMode::Subprocess
            }
        }
    }
}

impl std::fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IsolationMode::Container => write!(f, "container"),
            IsolationMode::Subprocess => write!(f, "subprocess"),
        }
    }
}

/// Resource, time and network limits for a single sandbox run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionPolicy {
    /// Wall-clock budget in milliseconds. Zero means the deadline has
    /// already passed.
    pub timeout_ms: u64,
    /// Memory cap for the execution unit.
    pub memory_limit_bytes: u64,
    /// CPU share in cores (e.g. `0.5`, `2.0`).
    pub cpu_limit: f64,
    /// Whether the program may reach the network.
    pub network_allowed: bool,
    pub isolation_mode: IsolationMode,
    /// Extra argv passed to the program after its entry file.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the program. The host environment is never
    /// inherited.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            memory_limit_bytes: 512 * 1024 * 1024,
            cpu_limit: 1.0,
            network_allowed: false,
            isolation_mode: IsolationMode::Subprocess,
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

impl ExecutionPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Builder: set the wall-clock timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Builder: set the isolation mode.
    pub fn with_isolation(mut self, mode: IsolationMode) -> Self {
        self.isolation_mode = mode;
        self
    }

    /// Builder: set the memory cap.
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    /// Reject limits no backend can honor.
    pub fn validate(&self) -> SandboxResult<()> {
        if self.memory_limit_bytes < 4 * 1024 * 1024 {
            return Err(SandboxError::InvalidPolicy(format!(
                "memory_limit_bytes must be at least 4 MiB, got {}",
                self.memory_limit_bytes
            )));
        }
        if !self.cpu_limit.is_finite() || self.cpu_limit <= 0.0 {
            return Err(SandboxError::InvalidPolicy(format!(
                "cpu_limit must be a positive number, got {}",
                self.cpu_limit
            )));
        }
        if let Some(key) = self
            .env
            .keys()
            .find(|k| k.is_empty() || k.contains('=') || k.contains('\0'))
        {
            return Err(SandboxError::InvalidPolicy(format!(
                "invalid environment variable name: {key:?}"
            )));
        }
        Ok(())
    }

    /// CPU-seconds budget for rlimit-based enforcement: the wall-clock
    /// budget scaled by the CPU share, rounded up, plus one second of slack.
    pub fn cpu_seconds_budget(&self) -> u64 {
        let secs = (self.timeout_ms as f64 / 1000.0) * self.cpu_limit;
        secs.ceil() as u64 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_defaults() {
        let p = ExecutionPolicy::default();
        assert_eq!(p.timeout_ms, 30_000);
        assert_eq!(p.memory_limit_bytes, 512 * 1024 * 1024);
        assert!(!p.network_allowed);
        assert_eq!(p.isolation_mode, IsolationMode::Subprocess);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_policy_serde_fills_optional_fields() {
        let json = r#"{"timeout_ms":1000,"memory_limit_bytes":67108864,"cpu_limit":0.5,"network_allowed":false,"isolation_mode":"container"}"#;
        let p: ExecutionPolicy = serde_json::from_str(json).unwrap();
        assert_eq!(p.isolation_mode, IsolationMode::Container);
        assert!(p.args.is_empty());
        assert!(p.env.is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_limits() {
        let p = ExecutionPolicy {
            cpu_limit: 0.0,
            ..Default::default()
        };
        assert!(p.validate().is_err());

        let p = ExecutionPolicy::default().with_memory_limit(1024);
        assert!(p.validate().is_err());

        let mut p = ExecutionPolicy::default();
        p.env.insert("BAD=KEY".into(), "x".into());
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_cpu_budget_scales_with_share() {
        let p = ExecutionPolicy {
            timeout_ms: 10_000,
            cpu_limit: 0.5,
            ..Default::default()
        };
        assert_eq!(p.cpu_seconds_budget(), 6);
    }
}
