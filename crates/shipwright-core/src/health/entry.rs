//! Health check results and their aggregation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregate status of one health check run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    /// The checks could not run at all.
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Severity of one check's finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckLevel {
    Ok,
    Warning,
    Unknown,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    /// True only when `level` is `Ok`.
    pub passed: bool,
    pub level: CheckLevel,
    pub detail: String,
}

impl CheckResult {
    fn new(name: &str, level: CheckLevel, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: level == CheckLevel::Ok,
            level,
            detail: detail.into(),
        }
    }

    pub fn ok(name: &str, detail: impl Into<String>) -> Self {
        Self::new(name, CheckLevel::Ok, detail)
    }

    pub fn warning(name: &str, detail: impl Into<String>) -> Self {
        Self::new(name, CheckLevel::Warning, detail)
    }

    pub fn failure(name: &str, detail: impl Into<String>) -> Self {
        Self::new(name, CheckLevel::Failure, detail)
    }

    pub fn unknown(name: &str, detail: impl Into<String>) -> Self {
        Self::new(name, CheckLevel::Unknown, detail)
    }
}

/// One completed run of the check battery against one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckEntry {
    pub timestamp: DateTime<Utc>,
    /// Deployment name.
    pub deployment: String,
    pub version: Option<u64>,
    pub status: HealthStatus,
    pub checks: Vec<CheckResult>,
}

impl HealthCheckEntry {
    /// Build an entry whose status is aggregated from `checks`.
    pub fn from_checks(deployment: &str, version: Option<u64>, checks: Vec<CheckResult>) -> Self {
        Self {
            timestamp: Utc::now(),
            deployment: deployment.to_string(),
            version,
            status: aggregate(&checks),
            checks,
        }
    }

    /// An entry for a deployment whose checks could not run at all.
    pub fn unknown(deployment: &str, version: Option<u64>, check: CheckResult) -> Self {
        Self {
            timestamp: Utc::now(),
            deployment: deployment.to_string(),
            version,
            status: HealthStatus::Unknown,
            checks: vec![check],
        }
    }

    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

/// Any failure makes the deployment unhealthy; warnings or checks that
/// could not run make it degraded.
pub fn aggregate(checks: &[CheckResult]) -> HealthStatus {
    match checks.iter().map(|c| c.level).max() {
        None | Some(CheckLevel::Ok) => HealthStatus::Healthy,
        Some(CheckLevel::Warning) | Some(CheckLevel::Unknown) => HealthStatus::Degraded,
        Some(CheckLevel::Failure) => HealthStatus::Unhealthy,
    }
}
