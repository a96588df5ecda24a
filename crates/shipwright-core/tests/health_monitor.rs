//! Health checks against real deployments on disk.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shipwright_core::deploy::{DeploymentManager, DeploymentRecord};
use shipwright_core::health::checks::{
    ARTIFACT_INTEGRITY, ARTIFACT_PRESENT, DEPLOYMENT_READABLE, LOG_SCAN, SYNTAX,
};
use shipwright_core::health::{
    CheckLevel, HealthCheckEntry, HealthCheckError, HealthMonitor, HealthStatus, MonitorHandle,
    MonitorSettings, RemediationHook,
};
use shipwright_core::{Language, SourceArtifact};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Fixture {
    _dir: tempfile::TempDir,
    deployer: DeploymentManager,
    monitor: Arc<HealthMonitor>,
}

fn fixture(settings: MonitorSettings) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let deployer = DeploymentManager::open(dir.path().join("deployments")).unwrap();
    let monitor = Arc::new(HealthMonitor::new(settings).unwrap());
    Fixture {
        _dir: dir,
        deployer,
        monitor,
    }
}

async fn deploy_shell(f: &Fixture, name: &str, script: &str) -> DeploymentRecord {
    f.deployer
        .deploy(&SourceArtifact::new(script, Language::Shell), name, Language::Shell)
        .await
        .unwrap()
}

fn level_of(entry: &HealthCheckEntry, check: &str) -> CheckLevel {
    entry
        .check(check)
        .unwrap_or_else(|| panic!("missing check {check}"))
        .level
}

async fn wait_for<F: Fn(&MonitorHandle) -> bool>(handle: &MonitorHandle, cond: F) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !cond(handle) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("monitor condition not reached in time");
}

#[derive(Default)]
struct CountingHook {
    calls: AtomicUsize,
}

#[async_trait]
impl RemediationHook for CountingHook {
    async fn remediate(
        &self,
        _deployment: &DeploymentRecord,
        entry: &HealthCheckEntry,
    ) -> Result<(), HealthCheckError> {
        assert_eq!(entry.status, HealthStatus::Unhealthy);
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// One-shot checks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fresh_deployment_is_healthy() {
    let f = fixture(MonitorSettings::default());
    let record = deploy_shell(&f, "svc", "echo ok\n").await;

    let entry = f.monitor.check_once(&record).await;

    assert_eq!(entry.status, HealthStatus::Healthy, "{entry:?}");
    assert_eq!(entry.version, Some(1));
    for check in [ARTIFACT_PRESENT, ARTIFACT_INTEGRITY, SYNTAX, LOG_SCAN] {
        assert_eq!(level_of(&entry, check), CheckLevel::Ok, "{check}");
    }
}

#[tokio::test]
async fn missing_artifact_is_unhealthy() {
    let f = fixture(MonitorSettings::default());
    let record = deploy_shell(&f, "svc", "echo ok\n").await;
    std::fs::remove_file(record.entry_path()).unwrap();

    let entry = f.monitor.check_once(&record).await;

    assert_eq!(entry.status, HealthStatus::Unhealthy);
    assert_eq!(level_of(&entry, ARTIFACT_PRESENT), CheckLevel::Failure);
    assert_eq!(level_of(&entry, SYNTAX), CheckLevel::Unknown);
    let failed: Vec<_> = entry.failed_checks().map(|c| c.name.as_str()).collect();
    assert!(failed.contains(&ARTIFACT_PRESENT));
}

#[tokio::test]
async fn tampered_artifact_fails_integrity() {
    let f = fixture(MonitorSettings::default());
    let record = deploy_shell(&f, "svc", "echo ok\n").await;
    std::fs::write(record.entry_path(), "echo tampered\n").unwrap();

    let entry = f.monitor.check_once(&record).await;

    assert_eq!(entry.status, HealthStatus::Unhealthy);
    assert_eq!(level_of(&entry, ARTIFACT_PRESENT), CheckLevel::Ok);
    assert_eq!(level_of(&entry, ARTIFACT_INTEGRITY), CheckLevel::Failure);
}

#[tokio::test]
async fn syntax_error_is_unhealthy() {
    let f = fixture(MonitorSettings::default());
    let record = deploy_shell(&f, "svc", "if then\n").await;

    let entry = f.monitor.check_once(&record).await;

    assert_eq!(entry.status, HealthStatus::Unhealthy);
    assert_eq!(level_of(&entry, SYNTAX), CheckLevel::Failure);
}

#[tokio::test]
async fn log_warnings_degrade_and_errors_fail() {
    let f = fixture(MonitorSettings::default());
    let record = deploy_shell(&f, "svc", "echo ok\n").await;

    f.deployer.append_log("svc", "WARNING: disk almost full").unwrap();
    let degraded = f.monitor.check_once(&record).await;
    assert_eq!(degraded.status, HealthStatus::Degraded);
    assert_eq!(level_of(&degraded, LOG_SCAN), CheckLevel::Warning);

    f.deployer.append_log("svc", "ERROR: connection refused").unwrap();
    let failed = f.monitor.check_once(&record).await;
    assert_eq!(failed.status, HealthStatus::Unhealthy);
    assert_eq!(level_of(&failed, LOG_SCAN), CheckLevel::Failure);
}

#[tokio::test]
async fn errors_logged_before_a_new_deploy_are_ignored() {
    let f = fixture(MonitorSettings::default());
    deploy_shell(&f, "svc", "echo one\n").await;
    f.deployer.append_log("svc", "Traceback (most recent call last):").unwrap();

    let record = deploy_shell(&f, "svc", "echo two\n").await;
    let entry = f.monitor.check_once(&record).await;

    assert_eq!(entry.status, HealthStatus::Healthy, "{entry:?}");
}

#[tokio::test]
async fn unreadable_deployment_is_unknown() {
    let f = fixture(MonitorSettings::default());
    let record = deploy_shell(&f, "svc", "echo ok\n").await;
    std::fs::remove_dir_all(&record.path).unwrap();

    let entry = f.monitor.check_once(&record).await;

    assert_eq!(entry.status, HealthStatus::Unknown);
    assert_eq!(level_of(&entry, DEPLOYMENT_READABLE), CheckLevel::Unknown);
}

// ---------------------------------------------------------------------------
// History and reporting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn history_is_ordered_and_bounded() {
    let settings = MonitorSettings {
        history_capacity: 3,
        ..MonitorSettings::default()
    };
    let f = fixture(settings);
    let record = deploy_shell(&f, "svc", "echo ok\n").await;

    for _ in 0..5 {
        f.monitor.check_once(&record).await;
    }

    let entries = f.monitor.history().entries("svc").await;
    assert_eq!(entries.len(), 3);
    assert!(entries.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[tokio::test]
async fn persistent_history_survives_a_new_monitor() {
    let history_dir = tempfile::tempdir().unwrap();
    let settings = MonitorSettings {
        history_dir: Some(history_dir.path().to_path_buf()),
        ..MonitorSettings::default()
    };
    let f = fixture(settings.clone());
    let record = deploy_shell(&f, "svc", "echo ok\n").await;
    f.monitor.check_once(&record).await;
    f.monitor.check_once(&record).await;

    let reopened = HealthMonitor::new(settings).unwrap();
    let entries = reopened.history().entries("svc").await;
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.status == HealthStatus::Healthy));
}

#[tokio::test]
async fn report_summarises_recent_checks() {
    let f = fixture(MonitorSettings::default());
    let record = deploy_shell(&f, "svc", "echo ok\n").await;
    f.monitor.check_once(&record).await;
    std::fs::remove_file(record.entry_path()).unwrap();
    f.monitor.check_once(&record).await;

    let report = f.monitor.report("svc").await;

    assert!(report.starts_with("# Maintenance Report: svc"));
    assert!(report.contains("Total checks: 2"));
    assert!(report.contains(ARTIFACT_PRESENT));
}

#[tokio::test]
async fn report_without_history() {
    let f = fixture(MonitorSettings::default());
    let report = f.monitor.report("nothing").await;
    assert_eq!(report, "No health history available for nothing\n");
}

// ---------------------------------------------------------------------------
// Scheduled monitoring
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scheduled_monitor_runs_until_shutdown() {
    let f = fixture(MonitorSettings::default());
    let record = deploy_shell(&f, "svc", "echo ok\n").await;

    let handle = f.monitor.schedule(record, Duration::from_millis(20));
    wait_for(&handle, |h| h.checks_run() >= 3).await;
    assert_eq!(handle.last_status(), Some(HealthStatus::Healthy));
    assert!(!handle.is_alerting());

    handle.shutdown().await;
    let recorded = f.monitor.history().entries("svc").await.len();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(f.monitor.history().entries("svc").await.len(), recorded);
}

#[tokio::test]
async fn cancel_from_another_task_stops_the_monitor() {
    let f = fixture(MonitorSettings::default());
    let record = deploy_shell(&f, "svc", "echo ok\n").await;

    let handle = f.monitor.schedule(record, Duration::from_millis(20));
    let canceller = handle.canceller();
    tokio::spawn(async move { canceller.cancel() }).await.unwrap();

    wait_for(&handle, |h| h.is_finished()).await;
}

#[tokio::test]
async fn sustained_failure_raises_one_alert_and_calls_the_hook() {
    let settings = MonitorSettings {
        alert_threshold: 2,
        ..MonitorSettings::default()
    };
    let hook = Arc::new(CountingHook::default());
    let dir = tempfile::tempdir().unwrap();
    let deployer = DeploymentManager::open(dir.path().join("deployments")).unwrap();
    let monitor = Arc::new(
        HealthMonitor::new(settings)
            .unwrap()
            .with_remediation(hook.clone()),
    );
    let record = deployer
        .deploy(&SourceArtifact::new("echo ok\n", Language::Shell), "svc", Language::Shell)
        .await
        .unwrap();
    std::fs::remove_file(record.entry_path()).unwrap();

    let handle = monitor.schedule(record, Duration::from_millis(20));
    wait_for(&handle, |h| h.checks_run() >= 5).await;

    assert!(handle.is_alerting());
    assert!(handle.consecutive_unhealthy() >= 5);
    assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
    handle.shutdown().await;
}

#[tokio::test]
async fn recovery_clears_the_alert() {
    let settings = MonitorSettings {
        alert_threshold: 1,
        ..MonitorSettings::default()
    };
    let f = fixture(settings);
    let record = deploy_shell(&f, "svc", "echo ok\n").await;
    let content = std::fs::read(record.entry_path()).unwrap();
    std::fs::remove_file(record.entry_path()).unwrap();

    let handle = f.monitor.schedule(record.clone(), Duration::from_millis(20));
    wait_for(&handle, |h| h.is_alerting()).await;

    std::fs::write(record.entry_path(), content).unwrap();
    wait_for(&handle, |h| !h.is_alerting()).await;
    assert_eq!(handle.consecutive_unhealthy(), 0);
    handle.shutdown().await;
}
