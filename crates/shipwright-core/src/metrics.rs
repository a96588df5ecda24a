//! Global atomic counters.
//!
//! Incremented at the call site without logging; read back through
//! [`Metrics::snapshot`] or logged in one record by [`Metrics::flush`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Counter values at one instant, serializable for `--json` output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub sandbox_runs: u64,
    pub sandbox_failures: u64,
    pub deployments: u64,
    pub rollbacks: u64,
    pub health_checks: u64,
    pub health_alerts: u64,
    pub pipelines_succeeded: u64,
    pub pipelines_failed: u64,
}

pub struct Metrics {
    sandbox_runs: AtomicU64,
    sandbox_failures: AtomicU64,
    deployments: AtomicU64,
    rollbacks: AtomicU64,
    health_checks: AtomicU64,
    health_alerts: AtomicU64,
    pipelines_succeeded: AtomicU64,
    pipelines_failed: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            sandbox_runs: AtomicU64::new(0),
            sandbox_failures: AtomicU64::new(0),
            deployments: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            health_checks: AtomicU64::new(0),
            health_alerts: AtomicU64::new(0),
            pipelines_succeeded: AtomicU64::new(0),
            pipelines_failed: AtomicU64::new(0),
        }
    }

    /// Count one sandbox run; `failed` for anything but success.
    pub fn inc_sandbox_run(&self, failed: bool) {
        self.sandbox_runs.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.sandbox_failures.fetch_add(1, Ordering::Relaxed);
        }
        tracing::trace!(metric = "sandbox_runs", "counter incremented");
    }

    pub fn inc_deployments(&self) {
        self.deployments.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "deployments", "counter incremented");
    }

    pub fn inc_rollbacks(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "rollbacks", "counter incremented");
    }

    pub fn inc_health_checks(&self) {
        self.health_checks.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "health_checks", "counter incremented");
    }

    pub fn inc_health_alerts(&self) {
        self.health_alerts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "health_alerts", "counter incremented");
    }

    /// Count one finished pipeline.
    pub fn inc_pipeline(&self, succeeded: bool) {
        if succeeded {
            self.pipelines_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.pipelines_failed.fetch_add(1, Ordering::Relaxed);
        }
        tracing::trace!(metric = "pipelines", "counter incremented");
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            sandbox_runs: load(&self.sandbox_runs),
            sandbox_failures: load(&self.sandbox_failures),
            deployments: load(&self.deployments),
            rollbacks: load(&self.rollbacks),
            health_checks: load(&self.health_checks),
            health_alerts: load(&self.health_alerts),
            pipelines_succeeded: load(&self.pipelines_succeeded),
            pipelines_failed: load(&self.pipelines_failed),
        }
    }

    /// Log the current values as one `info!` event.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            sandbox_runs = s.sandbox_runs,
            sandbox_failures = s.sandbox_failures,
            deployments = s.deployments,
            rollbacks = s.rollbacks,
            health_checks = s.health_checks,
            health_alerts = s.health_alerts,
            pipelines_succeeded = s.pipelines_succeeded,
            pipelines_failed = s.pipelines_failed,
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for c in [
            &self.sandbox_runs,
            &self.sandbox_failures,
            &self.deployments,
            &self.rollbacks,
            &self.health_checks,
            &self.health_alerts,
            &self.pipelines_succeeded,
            &self.pipelines_failed,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}
