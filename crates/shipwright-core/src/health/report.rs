//! Markdown maintenance report over a window of health history.

use std::fmt::Write;

use chrono::{DateTime, Utc};

use super::entry::{HealthCheckEntry, HealthStatus};

const RECENT_ISSUES: usize = 5;

pub fn maintenance_report(
    deployment: &str,
    entries: &[HealthCheckEntry],
    window_hours: u64,
    now: DateTime<Utc>,
) -> String {
    if entries.is_empty() {
        return format!("No health history available for {deployment}\n");
    }

    let total = entries.len();
    let count = |status: HealthStatus| entries.iter().filter(|e| e.status == status).count();
    let pct = |n: usize| n as f64 * 100.0 / total as f64;

    let mut out = String::new();
    let _ = writeln!(out, "# Maintenance Report: {deployment}\n");
    let _ = writeln!(out, "## Summary");
    let _ = writeln!(out, "- Total checks: {total}");
    let _ = writeln!(out, "- Period: last {window_hours} hours");
    let _ = writeln!(out, "- Generated: {}", now.to_rfc3339());
    if let Some(latest) = entries.last() {
        let _ = writeln!(
            out,
            "- Latest: {} at {}",
            latest.status,
            latest.timestamp.to_rfc3339()
        );
    }

    let _ = writeln!(out, "\n## Health Status");
    for status in [
        HealthStatus::Healthy,
        HealthStatus::Degraded,
        HealthStatus::Unhealthy,
        HealthStatus::Unknown,
    ] {
        let n = count(status);
        let _ = writeln!(out, "- {status}: {n} ({:.1}%)", pct(n));
    }

    let _ = writeln!(out, "\n## Recent Issues");
    let issues: Vec<&HealthCheckEntry> = entries
        .iter()
        .filter(|e| e.status != HealthStatus::Healthy)
        .collect();
    if issues.is_empty() {
        let _ = writeln!(out, "No recent issues detected.");
    }
    for entry in issues.iter().skip(issues.len().saturating_sub(RECENT_ISSUES)) {
        let details: Vec<String> = entry
            .failed_checks()
            .map(|c| format!("{}: {}", c.name, c.detail))
            .collect();
        let version = entry.version.map(|v| format!(" v{v}")).unwrap_or_default();
        let _ = writeln!(
            out,
            "- [{}]{version} {}: {}",
            entry.timestamp.to_rfc3339(),
            entry.status,
            if details.is_empty() {
                "no details".to_string()
            } else {
                details.join("; ")
            }
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::entry::CheckResult;

    #[test]
    fn test_empty_history() {
        let report = maintenance_report("svc", &[], 24, Utc::now());
        assert_eq!(report, "No health history available for svc\n");
    }

    #[test]
    fn test_counts_and_recent_issues() {
        let entries = vec![
            HealthCheckEntry::from_checks("svc", Some(1), vec![CheckResult::ok("syntax", "")]),
            HealthCheckEntry::from_checks(
                "svc",
                Some(1),
                vec![CheckResult::failure("artifact_present", "main.py missing")],
            ),
            HealthCheckEntry::from_checks("svc", Some(1), vec![CheckResult::warning("log_scan", "1 warning line(s)")]),
            HealthCheckEntry::from_checks("svc", Some(1), vec![CheckResult::ok("syntax", "")]),
        ];
        let report = maintenance_report("svc", &entries, 24, Utc::now());
        assert!(report.starts_with("# Maintenance Report: svc"));
        assert!(report.contains("- Total checks: 4"));
        assert!(report.contains("- healthy: 2 (50.0%)"));
        assert!(report.contains("- unhealthy: 1 (25.0%)"));
        assert!(report.contains("artifact_present: main.py missing"));
        assert!(report.contains("degraded: log_scan: 1 warning line(s)"));
        assert!(!report.contains("No recent issues"));
    }
}
