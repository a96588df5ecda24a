//! The [`SandboxRunner`] seam and its host implementation.

use std::path::Path;

use async_trait::async_trait;
use tokio::time::Instant;

use super::capture::Captured;
use super::error::{SandboxError, SandboxResult};
use super::limits;
use super::policy::{ExecutionPolicy, IsolationMode};
use super::result::{ExecutionResult, ExecutionStatus};
use super::runtime::SandboxSettings;
use super::{container, process};
use crate::cas::artifacts::materialize;
use crate::domain::SourceArtifact;
use crate::metrics::METRICS;
use crate::obs;

/// Executes an artifact under a policy.
///
/// Implementations never return an error for the ordinary ways a program
/// fails: every outcome, including a runner that could not start the
/// program, is an [`ExecutionResult`].
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn run(&self, artifact: &SourceArtifact, policy: &ExecutionPolicy) -> ExecutionResult;
}

/// How the execution unit ended, before classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnitExit {
    Exited(i32),
    Signaled(i32),
    OutOfMemory,
    TimedOut,
}

#[derive(Debug)]
pub(crate) struct UnitOutcome {
    pub exit: UnitExit,
    pub stdout: Captured,
    pub stderr: Captured,
}

/// Markers language runtimes print when they run out of memory without the
/// kernel killing them.
const OOM_MARKERS: [&str; 3] = [
    "MemoryError",
    "JavaScript heap out of memory",
    "Cannot allocate memory",
];

/// Runs artifacts on this host, in a container or a restricted subprocess.
#[derive(Debug, Clone, Default)]
pub struct LocalSandbox {
    settings: SandboxSettings,
}

impl LocalSandbox {
    pub fn new(settings: SandboxSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    async fn execute(
        &self,
        artifact: &SourceArtifact,
        policy: &ExecutionPolicy,
        deadline: Instant,
    ) -> SandboxResult<UnitOutcome> {
        policy.validate()?;
        let language = artifact.language();
        let runtime = self
            .settings
            .runtime(language)
            .ok_or_else(|| SandboxError::NoRuntime(language.to_string()))?;

        let scratch = self.scratch_dir()?;
        let entry = materialize(artifact, scratch.path()).map_err(SandboxError::Scratch)?;

        let outcome = match policy.isolation_mode {
            IsolationMode::Subprocess => {
                let netns = !policy.network_allowed && limits::network_isolation_available().await;
                if let Some(reason) = reduced_isolation(policy, netns) {
                    obs::emit_reduced_isolation(&artifact.content_hash().short(), reason);
                }
                process::run(
                    &self.settings,
                    runtime,
                    language,
                    &entry,
                    scratch.path(),
                    policy,
                    deadline,
                )
                .await
            }
            IsolationMode::Container => {
                container::run(
                    &self.settings,
                    runtime,
                    language,
                    scratch.path(),
                    policy,
                    deadline,
                )
                .await
            }
        };
        drop(scratch);
        outcome
    }

    fn scratch_dir(&self) -> SandboxResult<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("shipwright-run-");
        let dir = match &self.settings.scratch_root {
            Some(root) => {
                std::fs::create_dir_all(root).map_err(SandboxError::Scratch)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        };
        dir.map_err(SandboxError::Scratch)
    }
}

#[async_trait]
impl SandboxRunner for LocalSandbox {
    async fn run(&self, artifact: &SourceArtifact, policy: &ExecutionPolicy) -> ExecutionResult {
        let started = Instant::now();
        let deadline = started + policy.timeout();

        let result = if policy.timeout_ms == 0 {
            ExecutionResult::expired(0)
        } else {
            match self.execute(artifact, policy, deadline).await {
                Ok(outcome) => classify(outcome, elapsed_ms(started)),
                Err(e) => {
                    tracing::warn!(error = %e, "sandbox setup failed");
                    ExecutionResult::setup_failure(e.to_string(), elapsed_ms(started))
                }
            }
        };

        obs::emit_sandbox_finished(
            &artifact.content_hash().short(),
            &policy.isolation_mode.to_string(),
            &result.status.to_string(),
            result.exit_code,
            result.duration_ms,
            result.truncated,
        );
        METRICS.inc_sandbox_run(!result.is_success());
        result
    }
}

/// Why a subprocess run is weaker than `policy` asks, if it is. `netns` is
/// whether the unit will get a private network namespace.
fn reduced_isolation(policy: &ExecutionPolicy, netns: bool) -> Option<&'static str> {
    if !policy.network_allowed && !netns {
        return Some("network denial needs CAP_SYS_ADMIN; running with host networking");
    }
    None
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Map how a unit ended to an [`ExecutionStatus`].
pub(crate) fn classify(outcome: UnitOutcome, duration_ms: u64) -> ExecutionResult {
    let truncated = outcome.stdout.truncated || outcome.stderr.truncated;
    let (exit_code, status) = match outcome.exit {
        UnitExit::TimedOut => (-1, ExecutionStatus::Timeout),
        UnitExit::OutOfMemory => (137, ExecutionStatus::ResourceExceeded),
        UnitExit::Signaled(signal) => {
            let status = if limits::is_resource_signal(signal) {
                ExecutionStatus::ResourceExceeded
            } else {
                ExecutionStatus::RuntimeError
            };
            (128 + signal, status)
        }
        UnitExit::Exited(0) if truncated => (0, ExecutionStatus::ResourceExceeded),
        UnitExit::Exited(0) => (0, ExecutionStatus::Success),
        UnitExit::Exited(code) => {
            let status = if has_oom_marker(&outcome.stderr.bytes) {
                ExecutionStatus::ResourceExceeded
            } else {
                ExecutionStatus::RuntimeError
            };
            (code, status)
        }
    };

    ExecutionResult {
        exit_code,
        stdout: outcome.stdout.bytes,
        stderr: outcome.stderr.bytes,
        duration_ms,
        status,
        truncated,
    }
}

fn has_oom_marker(stderr: &[u8]) -> bool {
    let text = String::from_utf8_lossy(stderr);
    OOM_MARKERS.iter().any(|m| text.contains(m))
}

/// Whether `program` resolves to a file on `search_path`.
pub fn runtime_available(program: &str, search_path: &str) -> bool {
    if program.contains('/') {
        return Path::new(program).is_file();
    }
    search_path
        .split(':')
        .filter(|dir| !dir.is_empty())
        .any(|dir| Path::new(dir).join(program).is_file())
}
