//! Individual checks of the health battery.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;

use super::entry::CheckResult;
use super::error::HealthCheckError;
use crate::cas::Digest;
use crate::deploy::LOG_SECTION_MARKER;
use crate::domain::Language;

pub const ARTIFACT_PRESENT: &str = "artifact_present";
pub const ARTIFACT_INTEGRITY: &str = "artifact_integrity";
pub const SYNTAX: &str = "syntax";
pub const LOG_SCAN: &str = "log_scan";
pub const DEPLOYMENT_READABLE: &str = "deployment_readable";

/// Verdict of a syntax checker that managed to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyntaxVerdict {
    Valid,
    Invalid(String),
    /// No checker exists for the language.
    Unsupported,
}

/// Validates source syntax without executing it.
#[async_trait]
pub trait SyntaxChecker: Send + Sync {
    async fn check(&self, language: Language, path: &Path) -> Result<SyntaxVerdict, HealthCheckError>;
}

/// Runs the language's own parser in a child process.
#[derive(Debug, Clone)]
pub struct CommandSyntaxChecker {
    path_env: String,
}

impl CommandSyntaxChecker {
    pub fn new(path_env: impl Into<String>) -> Self {
        Self {
            path_env: path_env.into(),
        }
    }

    fn argv(language: Language, path: &Path) -> Vec<String> {
        let file = path.display().to_string();
        match language {
            // compile() instead of py_compile so no bytecode lands in the
            // version directory.
            Language::Python => vec![
                "python3".into(),
                "-I".into(),
                "-c".into(),
                "import sys; compile(open(sys.argv[1], 'rb').read(), sys.argv[1], 'exec')".into(),
                file,
            ],
            Language::JavaScript => vec!["node".into(), "--check".into(), file],
            Language::Shell => vec!["sh".into(), "-n".into(), file],
        }
    }
}

impl Default for CommandSyntaxChecker {
    fn default() -> Self {
        Self::new("/usr/local/bin:/usr/bin:/bin")
    }
}

#[async_trait]
impl SyntaxChecker for CommandSyntaxChecker {
    async fn check(&self, language: Language, path: &Path) -> Result<SyntaxVerdict, HealthCheckError> {
        let argv = Self::argv(language, path);
        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .env_clear()
            .env("PATH", &self.path_env)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| HealthCheckError::CheckerUnavailable {
                program: argv[0].clone(),
                source,
            })?;

        if output.status.success() {
            Ok(SyntaxVerdict::Valid)
        } else {
            let diagnostic = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Ok(SyntaxVerdict::Invalid(diagnostic))
        }
    }
}

pub(crate) fn artifact_present(entry: &Path) -> CheckResult {
    match std::fs::metadata(entry) {
        Ok(meta) if meta.is_file() => CheckResult::ok(
            ARTIFACT_PRESENT,
            format!("{} present ({} bytes)", file_name(entry), meta.len()),
        ),
        Ok(_) => CheckResult::failure(
            ARTIFACT_PRESENT,
            format!("{} is not a regular file", file_name(entry)),
        ),
        Err(e) => CheckResult::failure(
            ARTIFACT_PRESENT,
            format!("{} missing: {e}", file_name(entry)),
        ),
    }
}

pub(crate) fn artifact_integrity(entry: &Path, expected: &Digest) -> CheckResult {
    match std::fs::read(entry) {
        Ok(bytes) => {
            let actual = Digest::compute(&bytes);
            if actual == *expected {
                CheckResult::ok(ARTIFACT_INTEGRITY, format!("hash {} matches", expected.short()))
            } else {
                CheckResult::failure(
                    ARTIFACT_INTEGRITY,
                    format!("hash mismatch: expected {}, found {}", expected.short(), actual.short()),
                )
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            CheckResult::failure(ARTIFACT_INTEGRITY, "artifact missing")
        }
        Err(e) => CheckResult::unknown(ARTIFACT_INTEGRITY, format!("could not read artifact: {e}")),
    }
}

pub(crate) async fn syntax(
    checker: &dyn SyntaxChecker,
    language: Language,
    entry: &Path,
    timeout: Duration,
) -> CheckResult {
    match tokio::time::timeout(timeout, checker.check(language, entry)).await {
        Ok(Ok(SyntaxVerdict::Valid)) => CheckResult::ok(SYNTAX, format!("{language} syntax valid")),
        Ok(Ok(SyntaxVerdict::Invalid(diagnostic))) => CheckResult::failure(SYNTAX, diagnostic),
        Ok(Ok(SyntaxVerdict::Unsupported)) => {
            CheckResult::ok(SYNTAX, format!("no syntax checker for {language}"))
        }
        Ok(Err(e)) => CheckResult::unknown(SYNTAX, e.to_string()),
        Err(_) => CheckResult::unknown(
            SYNTAX,
            HealthCheckError::Timeout {
                check: SYNTAX.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }
            .to_string(),
        ),
    }
}

/// Error and warning patterns applied to the deployment log.
#[derive(Debug, Clone)]
pub struct LogMarkers {
    error: Regex,
    warning: Regex,
}

impl LogMarkers {
    pub fn new(error_pattern: &str, warning_pattern: &str) -> Result<Self, HealthCheckError> {
        Ok(Self {
            error: Regex::new(error_pattern)?,
            warning: Regex::new(warning_pattern)?,
        })
    }

    /// Scan the tail of the log at `path`, starting after the most recent
    /// section marker. A missing log counts as clean.
    pub(crate) fn scan(&self, path: &Path, tail_bytes: u64) -> CheckResult {
        let tail = match read_tail(path, tail_bytes) {
            Ok(Some(tail)) => tail,
            Ok(None) => return CheckResult::ok(LOG_SCAN, "no deployment log"),
            Err(e) => return CheckResult::unknown(LOG_SCAN, format!("could not read log: {e}")),
        };
        let section = current_section(&tail);

        let mut errors = Vec::new();
        let mut warnings = 0usize;
        for line in section.lines() {
            if self.error.is_match(line) {
                errors.push(line.trim());
            } else if self.warning.is_match(line) {
                warnings += 1;
            }
        }

        if let Some(last) = errors.last() {
            CheckResult::failure(
                LOG_SCAN,
                format!("{} error line(s), last: {}", errors.len(), truncate(last, 200)),
            )
        } else if warnings > 0 {
            CheckResult::warning(LOG_SCAN, format!("{warnings} warning line(s)"))
        } else {
            CheckResult::ok(LOG_SCAN, "no error or warning markers")
        }
    }
}

pub const DEFAULT_ERROR_PATTERN: &str = r"(?i)\b(error|exception|traceback|fatal|panic)\b";
pub const DEFAULT_WARNING_PATTERN: &str = r"(?i)\b(warn|warning|deprecated)\b";

fn read_tail(path: &Path, tail_bytes: u64) -> std::io::Result<Option<String>> {
    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let len = file.metadata()?.len();
    let start = len.saturating_sub(tail_bytes);
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf)?;
    let mut text = String::from_utf8_lossy(&buf).into_owned();
    // Drop the partial first line of a cut tail.
    if start > 0 {
        if let Some(nl) = text.find('\n') {
            text.drain(..=nl);
        }
    }
    Ok(Some(text))
}

fn current_section(tail: &str) -> &str {
    let mut start = 0;
    let mut offset = 0;
    for line in tail.split_inclusive('\n') {
        offset += line.len();
        if line.starts_with(LOG_SECTION_MARKER) {
            start = offset;
        }
    }
    &tail[start..]
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
