//! Host-level limits for subprocess isolation: rlimits applied between fork
//! and exec, and process-group signalling.

/// Limits applied in the child before `exec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RunLimits {
    pub cpu_seconds: u64,
    pub address_space_bytes: Option<u64>,
    pub max_processes: Option<u64>,
    pub deny_network: bool,
}

#[cfg(target_os = "linux")]
macro_rules! set_limit {
    ($resource:expr, $value:expr) => {{
        let limit = libc::rlimit {
            rlim_cur: $value as libc::rlim_t,
            rlim_max: $value as libc::rlim_t,
        };
        // SAFETY: setrlimit only reads the struct we pass.
        if unsafe { libc::setrlimit($resource, &limit) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }};
}

/// Apply `limits` to the calling process. Runs inside `pre_exec`, so it
/// must stay async-signal-safe: no allocation, no locks.
#[cfg(target_os = "linux")]
pub(crate) fn apply(limits: &RunLimits) -> std::io::Result<()> {
    set_limit!(libc::RLIMIT_CPU, limits.cpu_seconds);
    set_limit!(libc::RLIMIT_CORE, 0u64);
    if let Some(bytes) = limits.address_space_bytes {
        set_limit!(libc::RLIMIT_AS, bytes);
    }
    if let Some(procs) = limits.max_processes {
        set_limit!(libc::RLIMIT_NPROC, procs);
    }
    if limits.deny_network {
        // Fails without CAP_SYS_ADMIN. The runner checks that up front with
        // `network_isolation_available` and logs reduced isolation.
        // SAFETY: unshare has no memory-safety preconditions.
        let _ = unsafe { libc::unshare(libc::CLONE_NEWNET) };
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn apply(_limits: &RunLimits) -> std::io::Result<()> {
    Ok(())
}

/// Whether children of this process can get a private network namespace.
/// Decided once per process by spawning `true` behind the same `unshare`.
#[cfg(target_os = "linux")]
pub(crate) async fn network_isolation_available() -> bool {
    static AVAILABLE: tokio::sync::OnceCell<bool> = tokio::sync::OnceCell::const_new();
    *AVAILABLE.get_or_init(try_unshare_network).await
}

#[cfg(target_os = "linux")]
async fn try_unshare_network() -> bool {
    let mut cmd = tokio::process::Command::new("true");
    cmd.stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    // SAFETY: the hook only calls unshare, which is async-signal-safe.
    unsafe {
        cmd.pre_exec(|| {
            if libc::unshare(libc::CLONE_NEWNET) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    match cmd.status().await {
        Ok(status) => status.success(),
        Err(e) => {
            tracing::debug!(error = %e, "network namespace unavailable");
            false
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) async fn network_isolation_available() -> bool {
    false
}

/// Send `signal` to every process in group `pgid`. A group that is already
/// gone is not an error.
#[cfg(unix)]
pub(crate) fn signal_group(pgid: u32, signal: libc::c_int) {
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::debug!(pgid, signal, error = %err, "killpg failed");
        }
    }
}

#[cfg(unix)]
pub(crate) const SIGTERM: i32 = libc::SIGTERM;
#[cfg(unix)]
pub(crate) const SIGKILL: i32 = libc::SIGKILL;

/// Signals that mean the kernel stopped the unit for exceeding a limit.
#[cfg(unix)]
pub(crate) fn is_resource_signal(signal: i32) -> bool {
    signal == libc::SIGKILL || signal == libc::SIGXCPU || signal == libc::SIGXFSZ
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn test_resource_signals() {
        assert!(is_resource_signal(libc::SIGKILL));
        assert!(is_resource_signal(libc::SIGXCPU));
        assert!(!is_resource_signal(libc::SIGSEGV));
        assert!(!is_resource_signal(libc::SIGTERM));
    }

    #[tokio::test]
    async fn test_network_isolation_check_is_cached() {
        let first = network_isolation_available().await;
        assert_eq!(network_isolation_available().await, first);
        assert_eq!(try_unshare_network().await, first);
    }

    #[test]
    fn test_signal_missing_group_is_silent() {
        // pid_max on Linux is at most 2^22, so this group cannot exist.
        signal_group(4_194_304 + 17, SIGTERM);
    }
}
