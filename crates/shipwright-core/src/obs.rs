//! Structured observability hooks for pipeline, sandbox, deployment and
//! health lifecycle events.
//!
//! Every event is an `info!` (or `warn!`) record carrying an `event` field,
//! so JSON output from [`crate::telemetry::init_tracing`] can be filtered on
//! it directly.

use tracing::{info, warn};

/// Span tagging every record of one pipeline run with its id. Attach it to
/// the pipeline future with `tracing::Instrument`.
///
/// ```ignore
/// orchestrator.drive(job).instrument(pipeline_span(&id)).await
/// ```
pub fn pipeline_span(pipeline_id: &str) -> tracing::Span {
    tracing::info_span!("shipwright.pipeline", pipeline_id = %pipeline_id)
}

pub fn emit_pipeline_started(pipeline_id: &str, language: &str, max_attempts: u32) {
    info!(
        event = "pipeline.started",
        pipeline_id = %pipeline_id,
        language = %language,
        max_attempts = max_attempts,
    );
}

pub fn emit_state_transition(pipeline_id: &str, from: &str, to: &str) {
    info!(event = "pipeline.transition", pipeline_id = %pipeline_id, from = %from, to = %to);
}

/// Emit event: one generate-and-test attempt ended.
pub fn emit_attempt_finished(pipeline_id: &str, attempt: u32, status: &str) {
    info!(
        event = "pipeline.attempt_finished",
        pipeline_id = %pipeline_id,
        attempt = attempt,
        status = %status,
    );
}

pub fn emit_pipeline_finished(pipeline_id: &str, outcome: &str, attempts: u32, duration_ms: u64) {
    info!(
        event = "pipeline.finished",
        pipeline_id = %pipeline_id,
        outcome = %outcome,
        attempts = attempts,
        duration_ms = duration_ms,
    );
}

/// Emit event: a sandbox run produced its result.
pub fn emit_sandbox_finished(
    content_hash: &str,
    isolation: &str,
    status: &str,
    exit_code: i32,
    duration_ms: u64,
    truncated: bool,
) {
    info!(
        event = "sandbox.finished",
        content_hash = %content_hash,
        isolation = %isolation,
        status = %status,
        exit_code = exit_code,
        duration_ms = duration_ms,
        truncated = truncated,
    );
}

/// Emit event: the run had weaker isolation than the policy asked for.
pub fn emit_reduced_isolation(content_hash: &str, reason: &str) {
    warn!(event = "sandbox.reduced_isolation", content_hash = %content_hash, reason = %reason);
}

pub fn emit_deployed(name: &str, version: u64, content_hash: &str, reused: bool) {
    info!(
        event = "deploy.activated",
        name = %name,
        version = version,
        content_hash = %content_hash,
        reused = reused,
    );
}

pub fn emit_rolled_back(name: &str, from_version: u64, to_version: u64) {
    info!(
        event = "deploy.rolled_back",
        name = %name,
        from_version = from_version,
        to_version = to_version,
    );
}

pub fn emit_deleted(name: &str, version: Option<u64>) {
    info!(event = "deploy.deleted", name = %name, version = ?version);
}

/// Emit event: a health check completed.
pub fn emit_health_checked(name: &str, version: Option<u64>, status: &str, failed_checks: usize) {
    info!(
        event = "health.checked",
        name = %name,
        version = ?version,
        status = %status,
        failed_checks = failed_checks,
    );
}

/// Emit event: consecutive unhealthy results crossed the alert threshold.
pub fn emit_health_alert(name: &str, consecutive_unhealthy: u32) {
    warn!(
        event = "health.alert",
        name = %name,
        consecutive_unhealthy = consecutive_unhealthy,
    );
}

/// Emit event: a remediation hook failed (warning level).
pub fn emit_remediation_error(name: &str, error: &dyn std::fmt::Display) {
    warn!(event = "health.remediation_error", name = %name, error = %error);
}
