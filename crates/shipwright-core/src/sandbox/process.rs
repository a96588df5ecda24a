//! Subprocess isolation: the unit runs as a host child in its own process
//! group, under rlimits, with a scrubbed environment.

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::Instant;

use super::capture;
use super::error::{SandboxError, SandboxResult};
use super::limits::{self, RunLimits};
use super::policy::ExecutionPolicy;
use super::runner::{UnitExit, UnitOutcome};
use super::runtime::{RuntimeSpec, SandboxSettings};
use crate::domain::Language;

pub(crate) fn run_limits(
    settings: &SandboxSettings,
    runtime: &RuntimeSpec,
    policy: &ExecutionPolicy,
) -> RunLimits {
    RunLimits {
        cpu_seconds: policy.cpu_seconds_budget(),
        address_space_bytes: runtime
            .limit_address_space
            .then_some(policy.memory_limit_bytes),
        max_processes: settings.max_processes,
        deny_network: !policy.network_allowed,
    }
}

pub(crate) async fn run(
    settings: &SandboxSettings,
    runtime: &RuntimeSpec,
    language: Language,
    entry: &Path,
    workdir: &Path,
    policy: &ExecutionPolicy,
    deadline: Instant,
) -> SandboxResult<UnitOutcome> {
    let argv = runtime.argv(language, policy.memory_limit_bytes);
    let (program, flags) = argv
        .split_first()
        .ok_or_else(|| SandboxError::NoRuntime(language.to_string()))?;

    let mut cmd = Command::new(program);
    cmd.args(flags)
        .arg(entry)
        .args(&policy.args)
        .current_dir(workdir)
        .env_clear()
        .env("PATH", &settings.path_env)
        .env("HOME", workdir)
        .env("TMPDIR", workdir)
        .env("LANG", "C.UTF-8")
        .envs(&policy.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);

    let limits = run_limits(settings, runtime, policy);
    // SAFETY: `limits::apply` only calls setrlimit/unshare on a copied value.
    unsafe {
        cmd.pre_exec(move || limits::apply(&limits));
    }

    let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
        program: program.clone(),
        source,
    })?;
    let pgid = child.id();

    let stdout_task = capture::spawn_capture(child.stdout.take(), settings.output_cap_bytes);
    let stderr_task = capture::spawn_capture(child.stderr.take(), settings.output_cap_bytes);

    let waited = tokio::select! {
        biased;
        status = child.wait() => Some(status),
        _ = tokio::time::sleep_until(deadline) => None,
    };

    let exit = match waited {
        Some(status) => {
            let status = status?;
            match (status.code(), status.signal()) {
                (Some(code), _) => UnitExit::Exited(code),
                (None, Some(signal)) => UnitExit::Signaled(signal),
                (None, None) => UnitExit::Exited(-1),
            }
        }
        None => {
            terminate(&mut child, pgid, Duration::from_millis(settings.kill_grace_ms)).await;
            UnitExit::TimedOut
        }
    };

    // Reap anything the unit left behind in its group.
    if let Some(pgid) = pgid {
        limits::signal_group(pgid, limits::SIGKILL);
    }

    let drain = Duration::from_millis(settings.kill_grace_ms.max(500));
    let stdout = capture::collect(stdout_task, drain).await;
    let stderr = capture::collect(stderr_task, drain).await;

    Ok(UnitOutcome {
        exit,
        stdout,
        stderr,
    })
}

/// SIGTERM the group, then SIGKILL whatever survives the grace period.
async fn terminate(child: &mut Child, pgid: Option<u32>, grace: Duration) {
    if let Some(pgid) = pgid {
        limits::signal_group(pgid, limits::SIGTERM);
    }
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        if let Some(pgid) = pgid {
            limits::signal_group(pgid, limits::SIGKILL);
        }
        if let Err(e) = child.kill().await {
            tracing::debug!(error = %e, "kill after grace period failed");
        }
    }
}
