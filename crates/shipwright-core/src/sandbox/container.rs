//! Container isolation through a docker-compatible CLI.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::Instant;

use super::capture;
use super::error::{SandboxError, SandboxResult};
use super::policy::ExecutionPolicy;
use super::runner::{UnitExit, UnitOutcome};
use super::runtime::{RuntimeSpec, SandboxSettings};
use crate::domain::Language;

/// Mount point of the scratch directory inside the container.
const WORKSPACE: &str = "/workspace";

/// Exit codes the docker CLI itself uses when the container never ran the
/// program (daemon error, not executable, not found).
const SETUP_EXIT_CODES: [i32; 3] = [125, 126, 127];

const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Build `docker run` arguments for one unit.
pub(crate) fn run_args(
    name: &str,
    settings: &SandboxSettings,
    runtime: &RuntimeSpec,
    language: Language,
    policy: &ExecutionPolicy,
    workdir: &Path,
) -> Vec<String> {
    let memory = format!("{}b", policy.memory_limit_bytes);
    let mut args = vec![
        "run".to_string(),
        "--name".to_string(),
        name.to_string(),
        "--memory".to_string(),
        memory.clone(),
        "--memory-swap".to_string(),
        memory,
        "--cpus".to_string(),
        format!("{}", policy.cpu_limit),
        "--pids-limit".to_string(),
        settings.container_pids_limit.to_string(),
        "--read-only".to_string(),
        "--tmpfs".to_string(),
        "/tmp:rw,size=64m".to_string(),
        "--security-opt".to_string(),
        "no-new-privileges".to_string(),
        "--cap-drop".to_string(),
        "ALL".to_string(),
        "--user".to_string(),
        "65534:65534".to_string(),
        "-v".to_string(),
        format!("{}:{WORKSPACE}:ro", workdir.display()),
        "-w".to_string(),
        WORKSPACE.to_string(),
        "-e".to_string(),
        "HOME=/tmp".to_string(),
    ];
    if !policy.network_allowed {
        args.push("--network".to_string());
        args.push("none".to_string());
    }
    for (key, value) in &policy.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(runtime.image.clone());
    args.extend(runtime.argv(language, policy.memory_limit_bytes));
    args.push(language.entry_file());
    args.extend(policy.args.iter().cloned());
    args
}

pub(crate) async fn run(
    settings: &SandboxSettings,
    runtime: &RuntimeSpec,
    language: Language,
    workdir: &Path,
    policy: &ExecutionPolicy,
    deadline: Instant,
) -> SandboxResult<UnitOutcome> {
    let name = format!("shipwright-{}", uuid::Uuid::new_v4().simple());
    let args = run_args(&name, settings, runtime, language, policy, workdir);
    let rt = settings.container_runtime.as_str();

    let mut child = Command::new(rt)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| SandboxError::Spawn {
            program: rt.to_string(),
            source,
        })?;

    let stdout_task = capture::spawn_capture(child.stdout.take(), settings.output_cap_bytes);
    let stderr_task = capture::spawn_capture(child.stderr.take(), settings.output_cap_bytes);

    let waited = tokio::select! {
        biased;
        status = child.wait() => Some(status),
        _ = tokio::time::sleep_until(deadline) => None,
    };

    let exit = match waited {
        Some(status) => {
            let code = status?.code().unwrap_or(-1);
            if code == 137 && oom_killed(rt, &name).await {
                UnitExit::OutOfMemory
            } else if code > 128 && code < 128 + 32 {
                UnitExit::Signaled(code - 128)
            } else {
                UnitExit::Exited(code)
            }
        }
        None => {
            control(rt, &["kill", name.as_str()]).await;
            let grace = Duration::from_millis(settings.kill_grace_ms);
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                if let Err(e) = child.kill().await {
                    tracing::debug!(error = %e, "container client kill failed");
                }
            }
            UnitExit::TimedOut
        }
    };

    control(rt, &["rm", "-f", name.as_str()]).await;

    let drain = Duration::from_millis(settings.kill_grace_ms.max(500));
    let stdout = capture::collect(stdout_task, drain).await;
    let stderr = capture::collect(stderr_task, drain).await;

    if let UnitExit::Exited(code) = exit {
        if SETUP_EXIT_CODES.contains(&code) {
            return Err(SandboxError::ContainerSetup {
                runtime: rt.to_string(),
                exit_code: code,
                detail: String::from_utf8_lossy(&stderr.bytes).trim().to_string(),
            });
        }
    }

    Ok(UnitOutcome {
        exit,
        stdout,
        stderr,
    })
}

async fn oom_killed(rt: &str, name: &str) -> bool {
    let inspect = Command::new(rt)
        .args(["inspect", "--format", "{{.State.OOMKilled}}", name])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output();
    match tokio::time::timeout(CONTROL_TIMEOUT, inspect).await {
        Ok(Ok(out)) => String::from_utf8_lossy(&out.stdout).trim() == "true",
        _ => false,
    }
}

/// Best-effort control command (`kill`, `rm -f`); failures are logged only.
async fn control(rt: &str, args: &[&str]) {
    let status = Command::new(rt)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match tokio::time::timeout(CONTROL_TIMEOUT, status).await {
        Ok(Ok(s)) if s.success() => {}
        Ok(Ok(s)) => tracing::debug!(runtime = rt, ?args, code = ?s.code(), "container control failed"),
        Ok(Err(e)) => tracing::debug!(runtime = rt, ?args, error = %e, "container control failed"),
        Err(_) => tracing::debug!(runtime = rt, ?args, "container control timed out"),
    }
}
