//! Language runtimes and runner-wide settings.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::domain::Language;

/// How to launch one language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSpec {
    /// Interpreter binary, resolved through `PATH` on the host and inside
    /// the container image.
    pub program: String,
    /// Flags placed before the entry file.
    #[serde(default)]
    pub args: Vec<String>,
    /// Container image for [`super::IsolationMode::Container`].
    pub image: String,
    /// Whether `RLIMIT_AS` can enforce the memory cap. Runtimes that reserve
    /// large virtual ranges up front (V8) fail to start under it and get a
    /// heap flag instead.
    #[serde(default = "default_true")]
    pub limit_address_space: bool,
}

fn default_true() -> bool {
    true
}

impl RuntimeSpec {
    pub fn for_language(language: Language) -> Self {
        match language {
            Language::Python => Self {
                program: "python3".to_string(),
                // -I: isolated mode, ignores PYTHON* env and user site-packages.
                args: vec!["-I".to_string()],
                image: "python:3.11-slim".to_string(),
                limit_address_space: true,
            },
            Language::JavaScript => Self {
                program: "node".to_string(),
                args: Vec::new(),
                image: "node:18-slim".to_string(),
                limit_address_space: false,
            },
            Language::Shell => Self {
                program: "sh".to_string(),
                args: Vec::new(),
                image: "alpine:3.19".to_string(),
                limit_address_space: true,
            },
        }
    }

    /// Interpreter argv (without the entry file) honoring `memory_limit_bytes`
    /// for runtimes that cannot live under `RLIMIT_AS`.
    pub fn argv(&self, language: Language, memory_limit_bytes: u64) -> Vec<String> {
        let mut argv = vec![self.program.clone()];
        if language == Language::JavaScript && !self.limit_address_space {
            let mib = (memory_limit_bytes / (1024 * 1024)).max(16);
            argv.push(format!("--max-old-space-size={mib}"));
        }
        argv.extend(self.args.iter().cloned());
        argv
    }
}

/// Settings shared by every run of a [`super::LocalSandbox`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxSettings {
    /// Per-stream capture cap.
    pub output_cap_bytes: usize,
    /// Time between the graceful and the forceful termination signal.
    pub kill_grace_ms: u64,
    /// Docker-compatible CLI used for container isolation.
    pub container_runtime: String,
    /// Parent of per-run scratch directories; the system temp dir if unset.
    pub scratch_root: Option<PathBuf>,
    /// `PATH` given to subprocess units.
    pub path_env: String,
    /// `RLIMIT_NPROC` for subprocess units. Off by default because the limit
    /// counts every process of the invoking user.
    pub max_processes: Option<u64>,
    /// Process cap inside containers.
    pub container_pids_limit: u64,
    pub runtimes: HashMap<Language, RuntimeSpec>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            output_cap_bytes: 1024 * 1024,
            kill_grace_ms: 2_000,
            container_runtime: "docker".to_string(),
            scratch_root: None,
            path_env: "/usr/local/bin:/usr/bin:/bin".to_string(),
            max_processes: None,
            container_pids_limit: 128,
            runtimes: Language::ALL
                .iter()
                .map(|l| (*l, RuntimeSpec::for_language(*l)))
                .collect(),
        }
    }
}

impl SandboxSettings {
    pub fn runtime(&self, language: Language) -> Option<&RuntimeSpec> {
        self.runtimes.get(&language)
    }
}
