//! The pipeline state machine: generate, verify in the sandbox, deploy,
//! check health, with a bounded refine loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::Instrument;

use super::state::{
    AttemptRecord, ExecutionSummary, FailureReason, PipelineOutcome, PipelineState, Transition,
};
use crate::deploy::{DeploymentManager, DeploymentRecord};
use crate::domain::{Language, SourceArtifact};
use crate::generator::{FailureFeedback, GenerationError, GenerationRequest, Generator};
use crate::health::{HealthCheckEntry, HealthMonitor, HealthStatus, MonitorHandle};
use crate::metrics::METRICS;
use crate::obs;
use crate::sandbox::{ExecutionPolicy, ExecutionResult, ExecutionStatus, SandboxRunner};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Total generate-and-verify attempts, including the first.
    pub max_attempts: u32,
    /// The orchestrator's own bound on one generator call.
    pub generation_timeout_ms: u64,
    /// Cap on waiting out a rate limit before the next attempt.
    pub max_backoff_ms: u64,
    /// Stderr bytes passed back to the generator as feedback.
    pub feedback_tail_bytes: usize,
    /// Start background monitoring when a pipeline succeeds.
    pub start_monitoring: bool,
    pub monitor_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            generation_timeout_ms: 180_000,
            max_backoff_ms: 30_000,
            feedback_tail_bytes: 4 * 1024,
            start_monitoring: true,
            monitor_interval_ms: 300_000,
        }
    }
}

/// What one pipeline should build and deploy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineJob {
    /// Deployment name.
    pub name: String,
    pub prompt: String,
    pub language: Language,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub policy: ExecutionPolicy,
}

/// Outcome of a pipeline plus the background monitor it started, if any.
#[derive(Debug)]
pub struct PipelineRun {
    pub outcome: PipelineOutcome,
    pub monitor: Option<MonitorHandle>,
}

/// Internal state carrying the data each step needs.
enum Step {
    Generating,
    Verifying(SourceArtifact),
    Refining(FailureFeedback),
    Deploying(SourceArtifact, ExecutionResult),
    Monitoring(DeploymentRecord),
    Succeeded,
    Failed(FailureReason),
}

impl Step {
    fn state(&self) -> PipelineState {
        match self {
            Step::Generating => PipelineState::Generating,
            Step::Verifying(_) => PipelineState::Verifying,
            Step::Refining(_) => PipelineState::Refining,
            Step::Deploying(..) => PipelineState::Deploying,
            Step::Monitoring(_) => PipelineState::Monitoring,
            Step::Succeeded => PipelineState::Succeeded,
            Step::Failed(_) => PipelineState::Failed,
        }
    }
}

pub struct Orchestrator {
    generator: Arc<dyn Generator>,
    runner: Arc<dyn SandboxRunner>,
    deployer: Arc<DeploymentManager>,
    monitor: Arc<HealthMonitor>,
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(
        generator: Arc<dyn Generator>,
        runner: Arc<dyn SandboxRunner>,
        deployer: Arc<DeploymentManager>,
        monitor: Arc<HealthMonitor>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            generator,
            runner,
            deployer,
            monitor,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Drive one job to a terminal state.
    pub async fn run(&self, job: PipelineJob) -> PipelineRun {
        let pipeline_id = uuid::Uuid::new_v4().to_string();
        let span = obs::pipeline_span(&pipeline_id);
        self.drive(pipeline_id, job).instrument(span).await
    }

    /// Run independent jobs concurrently. Results are in job order.
    pub async fn run_all(&self, jobs: Vec<PipelineJob>) -> Vec<PipelineRun> {
        futures::future::join_all(jobs.into_iter().map(|job| self.run(job))).await
    }

    async fn drive(&self, pipeline_id: String, job: PipelineJob) -> PipelineRun {
        let started = Instant::now();
        let max_attempts = self.config.max_attempts.max(1);
        obs::emit_pipeline_started(&pipeline_id, job.language.as_str(), max_attempts);

        let mut request = GenerationRequest::new(job.prompt.clone(), job.language)
            .with_constraints(job.constraints.clone());
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut transitions: Vec<Transition> = Vec::new();
        let mut deployment: Option<DeploymentRecord> = None;
        let mut health: Option<HealthCheckEntry> = None;
        let mut step = Step::Generating;

        loop {
            let from = step.state();
            let next = match step {
                Step::Generating => {
                    let attempt = attempts.len() as u32 + 1;
                    match self.generate(&request).await {
                        Ok(artifact) => {
                            attempts.push(AttemptRecord {
                                attempt,
                                content_hash: Some(artifact.content_hash()),
                                generation_error: None,
                                execution: None,
                            });
                            Step::Verifying(artifact)
                        }
                        Err(e) => {
                            attempts.push(AttemptRecord {
                                attempt,
                                content_hash: None,
                                generation_error: Some(e.to_string()),
                                execution: None,
                            });
                            obs::emit_attempt_finished(&pipeline_id, attempt, "generation_error");
                            if e.is_retryable() && attempt < max_attempts {
                                self.backoff(&e).await;
                                Step::Refining(FailureFeedback {
                                    attempt,
                                    status: None,
                                    exit_code: None,
                                    detail: e.to_string(),
                                    previous_source: None,
                                })
                            } else {
                                Step::Failed(FailureReason::GenerationFailed(e.to_string()))
                            }
                        }
                    }
                }

                Step::Verifying(artifact) => {
                    let result = self.runner.run(&artifact, &job.policy).await;
                    let attempt = attempts.len() as u32;
                    if let Some(record) = attempts.last_mut() {
                        record.execution = Some(ExecutionSummary::from(&result));
                    }
                    obs::emit_attempt_finished(&pipeline_id, attempt, &result.status.to_string());

                    match result.status {
                        ExecutionStatus::Success => Step::Deploying(artifact, result),
                        ExecutionStatus::SandboxSetupFailure => {
                            Step::Failed(FailureReason::SandboxSetup(result.stderr_lossy()))
                        }
                        status if attempt < max_attempts => Step::Refining(FailureFeedback {
                            attempt,
                            status: Some(status),
                            exit_code: Some(result.exit_code),
                            detail: result.stderr_tail(self.config.feedback_tail_bytes),
                            previous_source: Some(artifact.content_lossy()),
                        }),
                        status => Step::Failed(FailureReason::ExecutionFailed {
                            status,
                            detail: result.stderr_tail(self.config.feedback_tail_bytes),
                        }),
                    }
                }

                Step::Refining(feedback) => {
                    request = request.refine(feedback);
                    Step::Generating
                }

                Step::Deploying(artifact, result) => {
                    match self.deployer.deploy(&artifact, &job.name, job.language).await {
                        Ok(record) => {
                            let log = verification_log(attempts.len() as u32, &result);
                            if let Err(e) = self.deployer.append_log(&job.name, &log) {
                                tracing::warn!(name = %job.name, error = %e, "could not write verification output to deployment log");
                            }
                            deployment = Some(record.clone());
                            Step::Monitoring(record)
                        }
                        Err(e) => Step::Failed(FailureReason::DeploymentFailed(e.to_string())),
                    }
                }

                Step::Monitoring(record) => {
                    let entry = self.monitor.check_once(&record).await;
                    let next = match entry.status {
                        HealthStatus::Healthy | HealthStatus::Degraded => Step::Succeeded,
                        HealthStatus::Unhealthy => {
                            Step::Failed(FailureReason::PostDeployUnhealthy(health_summary(&entry)))
                        }
                        HealthStatus::Unknown => {
                            Step::Failed(FailureReason::PostDeployUnverified(health_summary(&entry)))
                        }
                    };
                    health = Some(entry);
                    next
                }

                Step::Succeeded => {
                    return self.finish(pipeline_id, job, None, attempts, transitions, deployment, health, started);
                }
                Step::Failed(reason) => {
                    return self.finish(
                        pipeline_id,
                        job,
                        Some(reason),
                        attempts,
                        transitions,
                        deployment,
                        health,
                        started,
                    );
                }
            };

            let to = next.state();
            obs::emit_state_transition(&pipeline_id, from.as_str(), to.as_str());
            transitions.push(Transition {
                from,
                to,
                at: Utc::now(),
            });
            step = next;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        pipeline_id: String,
        job: PipelineJob,
        failure: Option<FailureReason>,
        attempts: Vec<AttemptRecord>,
        transitions: Vec<Transition>,
        deployment: Option<DeploymentRecord>,
        health: Option<HealthCheckEntry>,
        started: Instant,
    ) -> PipelineRun {
        let state = match &failure {
            None => PipelineState::Succeeded,
            Some(reason) => {
                tracing::warn!(name = %job.name, reason = %reason, "pipeline failed");
                PipelineState::Failed
            }
        };

        let monitor = match (&state, &deployment) {
            (PipelineState::Succeeded, Some(record)) if self.config.start_monitoring => {
                let interval = Duration::from_millis(self.config.monitor_interval_ms);
                Some(self.monitor.schedule(record.clone(), interval))
            }
            _ => None,
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let succeeded = state == PipelineState::Succeeded;
        METRICS.inc_pipeline(succeeded);
        obs::emit_pipeline_finished(&pipeline_id, state.as_str(), attempts.len() as u32, duration_ms);

        PipelineRun {
            outcome: PipelineOutcome {
                pipeline_id,
                name: job.name,
                state,
                failure,
                attempts,
                transitions,
                deployment,
                health,
                duration_ms,
            },
            monitor,
        }
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<SourceArtifact, GenerationError> {
        let limit = self.config.generation_timeout_ms;
        match tokio::time::timeout(Duration::from_millis(limit), self.generator.generate(request)).await {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout(limit)),
        }
    }

    async fn backoff(&self, err: &GenerationError) {
        if let Some(ms) = err.retry_after_ms() {
            let wait = ms.min(self.config.max_backoff_ms);
            tracing::info!(wait_ms = wait, "waiting out generator rate limit");
            tokio::time::sleep(Duration::from_millis(wait)).await;
        }
    }
}

fn verification_log(attempt: u32, result: &ExecutionResult) -> String {
    let mut log = format!(
        "verification attempt {attempt}: {} (exit {}) in {}ms{}\n",
        result.status,
        result.exit_code,
        result.duration_ms,
        if result.truncated { ", output truncated" } else { "" },
    );
    for (label, bytes) in [("stdout", &result.stdout), ("stderr", &result.stderr)] {
        if !bytes.is_empty() {
            log.push_str(&format!("[{label}]\n{}", String::from_utf8_lossy(bytes)));
            if !log.ends_with('\n') {
                log.push('\n');
            }
        }
    }
    log
}

fn health_summary(entry: &HealthCheckEntry) -> String {
    let failed: Vec<String> = entry
        .failed_checks()
        .map(|c| format!("{}: {}", c.name, c.detail))
        .collect();
    if failed.is_empty() {
        entry.status.to_string()
    } else {
        format!("{} ({})", entry.status, failed.join("; "))
    }
}
