//! The health monitor: runs the check battery once or on a schedule and
//! owns the per-deployment history.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::checks::{self, CommandSyntaxChecker, LogMarkers, SyntaxChecker};
use super::entry::{CheckResult, HealthCheckEntry, HealthStatus};
use super::error::HealthCheckError;
use super::history::HealthHistory;
use super::report;
use crate::deploy::DeploymentRecord;
use crate::metrics::METRICS;
use crate::obs;

/// Extension point invoked when a scheduled monitor raises an alert. The
/// monitor never changes a deployment on its own.
#[async_trait]
pub trait RemediationHook: Send + Sync {
    async fn remediate(
        &self,
        deployment: &DeploymentRecord,
        entry: &HealthCheckEntry,
    ) -> Result<(), HealthCheckError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Bound on one syntax check.
    pub syntax_timeout_ms: u64,
    /// Bound on a whole scheduled check; a run that exceeds it is recorded
    /// as `Unknown`.
    pub check_timeout_ms: u64,
    /// How much of the end of the deployment log is scanned.
    pub log_tail_bytes: u64,
    pub error_pattern: String,
    pub warning_pattern: String,
    /// Entries retained per deployment.
    pub history_capacity: usize,
    /// Consecutive `Unhealthy` results that raise an alert.
    pub alert_threshold: u32,
    /// Where JSONL history is kept; in memory only when unset.
    pub history_dir: Option<PathBuf>,
    /// `PATH` for syntax checker processes.
    pub path_env: String,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            syntax_timeout_ms: 10_000,
            check_timeout_ms: 30_000,
            log_tail_bytes: 64 * 1024,
            error_pattern: checks::DEFAULT_ERROR_PATTERN.to_string(),
            warning_pattern: checks::DEFAULT_WARNING_PATTERN.to_string(),
            history_capacity: 1_000,
            alert_threshold: 3,
            history_dir: None,
            path_env: "/usr/local/bin:/usr/bin:/bin".to_string(),
        }
    }
}

pub struct HealthMonitor {
    settings: MonitorSettings,
    markers: LogMarkers,
    checker: Arc<dyn SyntaxChecker>,
    history: HealthHistory,
    remediation: Option<Arc<dyn RemediationHook>>,
}

impl HealthMonitor {
    pub fn new(settings: MonitorSettings) -> Result<Self, HealthCheckError> {
        let checker = Arc::new(CommandSyntaxChecker::new(settings.path_env.clone()));
        Self::with_checker(settings, checker)
    }

    pub fn with_checker(
        settings: MonitorSettings,
        checker: Arc<dyn SyntaxChecker>,
    ) -> Result<Self, HealthCheckError> {
        let markers = LogMarkers::new(&settings.error_pattern, &settings.warning_pattern)?;
        let history = match &settings.history_dir {
            Some(dir) => HealthHistory::persistent(settings.history_capacity, dir)?,
            None => HealthHistory::in_memory(settings.history_capacity),
        };
        Ok(Self {
            settings,
            markers,
            checker,
            history,
            remediation: None,
        })
    }

    /// Install a hook called when a scheduled monitor raises an alert.
    pub fn with_remediation(mut self, hook: Arc<dyn RemediationHook>) -> Self {
        self.remediation = Some(hook);
        self
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn history(&self) -> &HealthHistory {
        &self.history
    }

    /// Run the battery once and record the result.
    pub async fn check_once(&self, deployment: &DeploymentRecord) -> HealthCheckEntry {
        let entry = self.evaluate(deployment).await;
        self.record(entry).await
    }

    async fn record(&self, entry: HealthCheckEntry) -> HealthCheckEntry {
        let entry = self.history.append(entry).await;
        METRICS.inc_health_checks();
        obs::emit_health_checked(
            &entry.deployment,
            entry.version,
            &entry.status.to_string(),
            entry.failed_checks().count(),
        );
        entry
    }

    /// Run the battery without recording it.
    pub async fn evaluate(&self, deployment: &DeploymentRecord) -> HealthCheckEntry {
        let name = deployment.name.as_str();
        let version = Some(deployment.version);

        if let Err(e) = std::fs::read_dir(&deployment.path) {
            return HealthCheckEntry::unknown(
                name,
                version,
                CheckResult::unknown(
                    checks::DEPLOYMENT_READABLE,
                    format!("{}: {e}", deployment.path.display()),
                ),
            );
        }

        let entry_path = deployment.entry_path();
        let present = checks::artifact_present(&entry_path);
        let integrity = checks::artifact_integrity(&entry_path, &deployment.source_hash);
        let syntax = if present.passed {
            checks::syntax(
                self.checker.as_ref(),
                deployment.language,
                &entry_path,
                Duration::from_millis(self.settings.syntax_timeout_ms),
            )
            .await
        } else {
            CheckResult::unknown(checks::SYNTAX, "skipped: artifact missing")
        };
        let logs = self
            .markers
            .scan(&deployment.log_path(), self.settings.log_tail_bytes);

        HealthCheckEntry::from_checks(name, version, vec![present, integrity, syntax, logs])
    }

    /// Recorded history of `deployment` within the last `window`.
    pub async fn history_since(&self, deployment: &str, window: Duration) -> Vec<HealthCheckEntry> {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let since = chrono::Utc::now()
            .checked_sub_signed(window)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        self.history.since(deployment, since).await
    }

    /// Markdown maintenance report over the last 24 hours.
    pub async fn report(&self, deployment: &str) -> String {
        let window = Duration::from_secs(24 * 60 * 60);
        let entries = self.history_since(deployment, window).await;
        report::maintenance_report(deployment, &entries, 24, chrono::Utc::now())
    }

    /// Check `deployment` every `interval` until the returned handle is
    /// cancelled or dropped. The first check runs immediately.
    pub fn schedule(self: &Arc<Self>, deployment: DeploymentRecord, interval: Duration) -> MonitorHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let state = Arc::new(MonitorState::default());
        let task = tokio::spawn(monitor_loop(
            Arc::clone(self),
            deployment.clone(),
            interval,
            cancel_rx,
            Arc::clone(&state),
        ));
        MonitorHandle {
            deployment: deployment.name,
            cancel: Arc::new(cancel_tx),
            state,
            task,
        }
    }
}

async fn monitor_loop(
    monitor: Arc<HealthMonitor>,
    deployment: DeploymentRecord,
    interval: Duration,
    mut cancel: watch::Receiver<bool>,
    state: Arc<MonitorState>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let check_timeout = Duration::from_millis(monitor.settings.check_timeout_ms);

    loop {
        tokio::select! {
            biased;
            _ = cancel.changed() => break,
            _ = ticker.tick() => {}
        }

        let evaluated = tokio::select! {
            biased;
            _ = cancel.changed() => break,
            r = tokio::time::timeout(check_timeout, monitor.evaluate(&deployment)) => r,
        };
        if *cancel.borrow() {
            break;
        }

        let entry = match evaluated {
            Ok(entry) => entry,
            Err(_) => HealthCheckEntry::unknown(
                &deployment.name,
                Some(deployment.version),
                CheckResult::unknown(
                    "battery",
                    HealthCheckError::Timeout {
                        check: "battery".to_string(),
                        timeout_ms: monitor.settings.check_timeout_ms,
                    }
                    .to_string(),
                ),
            ),
        };
        let entry = monitor.record(entry).await;

        if state.observe(entry.status, monitor.settings.alert_threshold) {
            METRICS.inc_health_alerts();
            obs::emit_health_alert(&deployment.name, state.consecutive_unhealthy());
            if let Some(hook) = &monitor.remediation {
                if let Err(e) = hook.remediate(&deployment, &entry).await {
                    obs::emit_remediation_error(&deployment.name, &e);
                }
            }
        }
    }
    tracing::debug!(deployment = %deployment.name, "monitor stopped");
}

#[derive(Debug, Default)]
struct MonitorState {
    consecutive_unhealthy: AtomicU32,
    alerting: AtomicBool,
    checks_run: AtomicU64,
    last_status: Mutex<Option<HealthStatus>>,
}

impl MonitorState {
    /// Fold one result in. Returns true when this result raised the alert.
    fn observe(&self, status: HealthStatus, threshold: u32) -> bool {
        self.checks_run.fetch_add(1, Ordering::Relaxed);
        *self
            .last_status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(status);

        if status != HealthStatus::Unhealthy {
            self.consecutive_unhealthy.store(0, Ordering::Relaxed);
            self.alerting.store(false, Ordering::Relaxed);
            return false;
        }
        let streak = self.consecutive_unhealthy.fetch_add(1, Ordering::Relaxed) + 1;
        streak >= threshold.max(1) && !self.alerting.swap(true, Ordering::Relaxed)
    }

    fn consecutive_unhealthy(&self) -> u32 {
        self.consecutive_unhealthy.load(Ordering::Relaxed)
    }
}

/// Cancels a scheduled monitor from any task.
#[derive(Debug, Clone)]
pub struct MonitorCanceller(Arc<watch::Sender<bool>>);

impl MonitorCanceller {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Handle to a scheduled monitor. Dropping it stops the monitor unless a
/// [`MonitorCanceller`] is still alive.
#[derive(Debug)]
pub struct MonitorHandle {
    deployment: String,
    cancel: Arc<watch::Sender<bool>>,
    state: Arc<MonitorState>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn deployment(&self) -> &str {
        &self.deployment
    }

    /// Stop the monitor. A check in flight is discarded.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn canceller(&self) -> MonitorCanceller {
        MonitorCanceller(Arc::clone(&self.cancel))
    }

    /// Whether consecutive `Unhealthy` results reached the alert threshold.
    pub fn is_alerting(&self) -> bool {
        self.state.alerting.load(Ordering::Relaxed)
    }

    pub fn consecutive_unhealthy(&self) -> u32 {
        self.state.consecutive_unhealthy()
    }

    pub fn checks_run(&self) -> u64 {
        self.state.checks_run.load(Ordering::Relaxed)
    }

    pub fn last_status(&self) -> Option<HealthStatus> {
        *self
            .state
            .last_status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel and wait for the monitor task to exit.
    pub async fn shutdown(self) {
        self.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(deployment = %self.deployment, error = %e, "monitor task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_raised_once_at_threshold() {
        let state = MonitorState::default();
        assert!(!state.observe(HealthStatus::Unhealthy, 3));
        assert!(!state.observe(HealthStatus::Unhealthy, 3));
        assert!(state.observe(HealthStatus::Unhealthy, 3));
        assert!(!state.observe(HealthStatus::Unhealthy, 3));
        assert!(state.alerting.load(Ordering::Relaxed));
        assert_eq!(state.consecutive_unhealthy(), 4);

        assert!(!state.observe(HealthStatus::Degraded, 3));
        assert!(!state.alerting.load(Ordering::Relaxed));
        assert_eq!(state.consecutive_unhealthy(), 0);
        assert_eq!(state.checks_run.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_invalid_pattern_fails_construction() {
        let settings = MonitorSettings {
            error_pattern: "(".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            HealthMonitor::new(settings),
            Err(HealthCheckError::InvalidPattern(_))
        ));
    }
}
