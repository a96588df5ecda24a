//! End-to-end pipeline runs: scripted generator, real subprocess sandbox,
//! real deployments and health checks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use shipwright_core::deploy::{DeploymentManager, DeploymentStatus};
use shipwright_core::generator::{GenerationError, GenerationRequest, Generator};
use shipwright_core::health::{HealthMonitor, HealthStatus, MonitorSettings};
use shipwright_core::orchestrator::{
    FailureReason, Orchestrator, PipelineConfig, PipelineJob, PipelineState,
};
use shipwright_core::sandbox::{
    ExecutionPolicy, ExecutionStatus, IsolationMode, LocalSandbox, RuntimeSpec, SandboxSettings,
};
use shipwright_core::{Language, SourceArtifact};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Replays canned replies in order and records every request it saw.
struct ScriptedGenerator {
    replies: Mutex<VecDeque<Result<String, GenerationError>>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    fn new(replies: Vec<Result<&str, GenerationError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().map(|r| r.map(str::to_string)).collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<SourceArtifact, GenerationError> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Ok(code)) => Ok(SourceArtifact::new(code, request.language)),
            Some(Err(e)) => Err(e),
            None => Err(GenerationError::Rejected {
                status: 400,
                body: "script exhausted".to_string(),
            }),
        }
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    deployer: Arc<DeploymentManager>,
    monitor: Arc<HealthMonitor>,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let deployer = Arc::new(DeploymentManager::open(dir.path().join("deployments")).unwrap());
    let monitor = Arc::new(HealthMonitor::new(MonitorSettings::default()).unwrap());
    Harness {
        _dir: dir,
        deployer,
        monitor,
    }
}

fn config(max_attempts: u32) -> PipelineConfig {
    PipelineConfig {
        max_attempts,
        max_backoff_ms: 10,
        start_monitoring: false,
        ..PipelineConfig::default()
    }
}

fn orchestrator(
    h: &Harness,
    generator: Arc<ScriptedGenerator>,
    sandbox: SandboxSettings,
    config: PipelineConfig,
) -> Orchestrator {
    Orchestrator::new(
        generator,
        Arc::new(LocalSandbox::new(sandbox)),
        Arc::clone(&h.deployer),
        Arc::clone(&h.monitor),
        config,
    )
}

fn job(name: &str) -> PipelineJob {
    PipelineJob {
        name: name.to_string(),
        prompt: "print a greeting".to_string(),
        language: Language::Shell,
        constraints: vec!["POSIX sh only".to_string()],
        policy: ExecutionPolicy::default()
            .with_timeout_ms(10_000)
            .with_isolation(IsolationMode::Subprocess),
    }
}

use PipelineState::*;

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_attempt_success_deploys_and_checks() {
    let h = harness();
    let generator = ScriptedGenerator::new(vec![Ok("echo hello\n")]);
    let o = orchestrator(&h, generator.clone(), SandboxSettings::default(), config(3));

    let run = o.run(job("greeter")).await;
    let outcome = run.outcome;

    assert!(outcome.is_success(), "{:?}", outcome.failure);
    assert_eq!(outcome.path(), vec![Generating, Verifying, Deploying, Monitoring, Succeeded]);
    assert_eq!(outcome.attempts.len(), 1);
    assert_eq!(
        outcome.attempts[0].execution.as_ref().unwrap().status,
        ExecutionStatus::Success
    );

    let record = outcome.deployment.unwrap();
    assert_eq!(record.version, 1);
    assert_eq!(record.status, DeploymentStatus::Active);
    assert_eq!(outcome.health.unwrap().status, HealthStatus::Healthy);
    assert!(run.monitor.is_none());

    let log = std::fs::read_to_string(h.deployer.log_path("greeter")).unwrap();
    assert!(log.contains("verification attempt 1: success"));
    assert!(log.contains("hello"));

    let requests = generator.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].constraints, vec!["POSIX sh only".to_string()]);
    assert!(requests[0].feedback.is_none());
}

#[tokio::test]
async fn failed_attempt_is_refined_with_feedback() {
    let h = harness();
    let generator = ScriptedGenerator::new(vec![
        Ok("echo 'cannot open config' >&2\nexit 2\n"),
        Ok("echo fixed\n"),
    ]);
    let o = orchestrator(&h, generator.clone(), SandboxSettings::default(), config(3));

    let outcome = o.run(job("svc")).await.outcome;

    assert!(outcome.is_success(), "{:?}", outcome.failure);
    assert_eq!(
        outcome.path(),
        vec![Generating, Verifying, Refining, Generating, Verifying, Deploying, Monitoring, Succeeded]
    );
    assert_eq!(outcome.attempts.len(), 2);

    let requests = generator.requests();
    let feedback = requests[1].feedback.as_ref().expect("second request carries feedback");
    assert_eq!(feedback.attempt, 1);
    assert_eq!(feedback.status, Some(ExecutionStatus::RuntimeError));
    assert_eq!(feedback.exit_code, Some(2));
    assert!(feedback.detail.contains("cannot open config"));
    assert!(feedback.previous_source.as_deref().unwrap().contains("exit 2"));
}

// ---------------------------------------------------------------------------
// Bounded refinement
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_attempt_bound_fails_without_refining() {
    let h = harness();
    let generator = ScriptedGenerator::new(vec![Ok("exit 1\n"), Ok("echo never\n")]);
    let o = orchestrator(&h, generator.clone(), SandboxSettings::default(), config(1));

    let outcome = o.run(job("svc")).await.outcome;

    assert_eq!(outcome.state, Failed);
    assert!(matches!(
        outcome.failure,
        Some(FailureReason::ExecutionFailed {
            status: ExecutionStatus::RuntimeError,
            ..
        })
    ));
    assert_eq!(generator.requests().len(), 1);
    assert!(outcome.deployment.is_none());
    assert!(h.deployer.list(Some("svc")).unwrap().is_empty());
}

#[tokio::test]
async fn attempts_stop_at_the_bound() {
    let h = harness();
    let generator = ScriptedGenerator::new(vec![
        Ok("exit 1\n"),
        Ok("exit 1\n"),
        Ok("exit 1\n"),
        Ok("echo too late\n"),
    ]);
    let o = orchestrator(&h, generator.clone(), SandboxSettings::default(), config(3));

    let outcome = o.run(job("svc")).await.outcome;

    assert_eq!(outcome.state, Failed);
    assert_eq!(outcome.attempts.len(), 3);
    assert_eq!(generator.requests().len(), 3);
    assert_eq!(
        outcome.path().iter().filter(|s| **s == Refining).count(),
        2
    );
}

#[tokio::test]
async fn timeouts_are_refined_like_other_code_failures() {
    let h = harness();
    let generator = ScriptedGenerator::new(vec![Ok("sleep 30\n"), Ok("echo quick\n")]);
    let o = orchestrator(&h, generator.clone(), SandboxSettings::default(), config(2));
    let mut job = job("svc");
    job.policy = job.policy.with_timeout_ms(300);

    let outcome = o.run(job).await.outcome;

    assert!(outcome.is_success(), "{:?}", outcome.failure);
    let feedback = generator.requests()[1].feedback.clone().unwrap();
    assert_eq!(feedback.status, Some(ExecutionStatus::Timeout));
}

// ---------------------------------------------------------------------------
// Non-refinable failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sandbox_setup_failure_is_not_retried() {
    let h = harness();
    let mut sandbox = SandboxSettings::default();
    sandbox.runtimes.insert(
        Language::Shell,
        RuntimeSpec {
            program: "shipwright-no-such-shell".to_string(),
            ..RuntimeSpec::for_language(Language::Shell)
        },
    );
    let generator = ScriptedGenerator::new(vec![Ok("echo hi\n"), Ok("echo hi\n")]);
    let o = orchestrator(&h, generator.clone(), sandbox, config(3));

    let outcome = o.run(job("svc")).await.outcome;

    assert_eq!(outcome.state, Failed);
    assert!(matches!(outcome.failure, Some(FailureReason::SandboxSetup(_))));
    assert_eq!(generator.requests().len(), 1);
}

#[tokio::test]
async fn rejected_generation_fails_immediately() {
    let h = harness();
    let generator = ScriptedGenerator::new(vec![Err(GenerationError::Rejected {
        status: 401,
        body: "bad key".to_string(),
    })]);
    let o = orchestrator(&h, generator.clone(), SandboxSettings::default(), config(3));

    let outcome = o.run(job("svc")).await.outcome;

    assert_eq!(outcome.state, Failed);
    match &outcome.failure {
        Some(FailureReason::GenerationFailed(msg)) => assert!(msg.contains("bad key")),
        other => panic!("unexpected failure {other:?}"),
    }
    assert_eq!(outcome.path(), vec![Generating, Failed]);
}

#[tokio::test]
async fn transient_generation_error_consumes_an_attempt() {
    let h = harness();
    let generator = ScriptedGenerator::new(vec![
        Err(GenerationError::RateLimited {
            retry_after_ms: Some(5),
        }),
        Ok("echo recovered\n"),
    ]);
    let o = orchestrator(&h, generator.clone(), SandboxSettings::default(), config(3));

    let outcome = o.run(job("svc")).await.outcome;

    assert!(outcome.is_success(), "{:?}", outcome.failure);
    assert_eq!(outcome.attempts.len(), 2);
    assert!(outcome.attempts[0].generation_error.is_some());
    let feedback = generator.requests()[1].feedback.clone().unwrap();
    assert_eq!(feedback.status, None);
}

#[tokio::test]
async fn errors_in_verified_output_fail_post_deploy_check() {
    let h = harness();
    let generator = ScriptedGenerator::new(vec![Ok("echo 'fatal: lost connection'\n")]);
    let o = orchestrator(&h, generator, SandboxSettings::default(), config(1));

    let outcome = o.run(job("svc")).await.outcome;

    assert_eq!(outcome.state, Failed);
    assert!(matches!(
        outcome.failure,
        Some(FailureReason::PostDeployUnhealthy(_))
    ));
    assert!(outcome.deployment.is_some());
    assert_eq!(outcome.health.unwrap().status, HealthStatus::Unhealthy);
}

// ---------------------------------------------------------------------------
// Concurrency and monitoring
// ---------------------------------------------------------------------------

#[tokio::test]
async fn independent_jobs_run_concurrently() {
    let h = harness();
    let generator = ScriptedGenerator::new(vec![
        Ok("echo one\n"),
        Ok("echo two\n"),
        Ok("echo three\n"),
    ]);
    let o = orchestrator(&h, generator, SandboxSettings::default(), config(1));

    let runs = o
        .run_all(vec![job("alpha"), job("beta"), job("gamma")])
        .await;

    assert_eq!(runs.len(), 3);
    for (run, name) in runs.iter().zip(["alpha", "beta", "gamma"]) {
        assert!(run.outcome.is_success(), "{name}: {:?}", run.outcome.failure);
        assert_eq!(run.outcome.name, name);
        assert_eq!(h.deployer.active(name).unwrap().unwrap().version, 1);
    }
    let ids: std::collections::HashSet<_> =
        runs.iter().map(|r| r.outcome.pipeline_id.clone()).collect();
    assert_eq!(ids.len(), 3);
}

#[tokio::test]
async fn success_starts_background_monitoring_when_enabled() {
    let h = harness();
    let generator = ScriptedGenerator::new(vec![Ok("echo watched\n")]);
    let config = PipelineConfig {
        start_monitoring: true,
        monitor_interval_ms: 20,
        ..config(1)
    };
    let o = orchestrator(&h, generator, SandboxSettings::default(), config);

    let run = o.run(job("svc")).await;
    let handle = run.monitor.expect("monitor started");
    assert_eq!(handle.deployment(), "svc");

    tokio::time::timeout(std::time::Duration::from_secs(10), async {
        while handle.checks_run() < 2 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    handle.shutdown().await;
}
