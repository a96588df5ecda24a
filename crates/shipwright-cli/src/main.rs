//! Shipwright - generate, verify, deploy and monitor generated code
//!
//! ## Commands
//!
//! - `run`: execute a source file in the sandbox
//! - `deploy`: verify a source file and deploy it as a new version
//! - `list` / `rollback` / `delete` / `deactivate`: manage deployments
//! - `check` / `watch` / `history` / `report`: deployment health
//! - `pipeline`: generate, verify, deploy and check in one go

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

use shipwright_core::{
    DeploymentManager, ExecutionPolicy, ExecutionResult, HealthCheckEntry, HealthMonitor,
    HttpGenerator, IsolationMode, Language, LocalSandbox, Orchestrator, PipelineJob,
    SandboxRunner, ShipwrightConfig, SourceArtifact, METRICS,
};

#[derive(Parser)]
#[command(name = "shipwright")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Generate, sandbox-verify, deploy and monitor code", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and JSON command output
    #[arg(long, global = true)]
    json: bool,

    /// Deployment root (overrides SHIPWRIGHT_ROOT)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone)]
struct PolicyArgs {
    /// Wall-clock timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Memory cap in bytes
    #[arg(long)]
    memory_bytes: Option<u64>,

    /// CPU share in cores
    #[arg(long)]
    cpu: Option<f64>,

    /// Allow network access
    #[arg(long)]
    allow_network: bool,

    /// Isolation mode
    #[arg(long, value_enum)]
    isolation: Option<IsolationArg>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum IsolationArg {
    /// Docker-compatible container
    Container,
    /// Host subprocess with rlimits
    Subprocess,
    /// Container when a runtime is available, otherwise subprocess
    Auto,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a source file in the sandbox
    Run {
        /// Source file
        file: PathBuf,

        /// Language (inferred from the file extension if omitted)
        #[arg(short, long)]
        language: Option<Language>,

        #[command(flatten)]
        policy: PolicyArgs,
    },

    /// Verify a source file in the sandbox and deploy it
    Deploy {
        /// Source file
        file: PathBuf,

        /// Deployment name
        #[arg(short, long)]
        name: String,

        /// Language (inferred from the file extension if omitted)
        #[arg(short, long)]
        language: Option<Language>,

        /// Deploy without running the file first
        #[arg(long)]
        skip_verify: bool,

        #[command(flatten)]
        policy: PolicyArgs,
    },

    /// List deployments, newest first
    List {
        /// Only this deployment name
        name: Option<String>,
    },

    /// Make the previous version of a deployment active again
    Rollback { name: String },

    /// Delete one version, or every version of an inactive deployment
    Delete {
        name: String,

        /// Version to delete (all versions if omitted)
        #[arg(long)]
        version: Option<u64>,
    },

    /// Clear the active version of a deployment
    Deactivate { name: String },

    /// Run the health checks once against the active version
    Check { name: String },

    /// Check the active version periodically until interrupted
    Watch {
        name: String,

        /// Seconds between checks
        #[arg(short, long, default_value = "300")]
        interval: u64,
    },

    /// Show recorded health checks
    History {
        name: String,

        /// Only entries from the last N hours
        #[arg(long, default_value = "24")]
        hours: u64,
    },

    /// Print a markdown maintenance report for the last 24 hours
    Report { name: String },

    /// Generate code from a prompt, verify, deploy and check it
    Pipeline {
        /// Deployment name
        #[arg(short, long)]
        name: String,

        /// What the code should do
        #[arg(short, long)]
        prompt: String,

        #[arg(short, long)]
        language: Language,

        /// Extra constraint passed to the generator (repeatable)
        #[arg(short, long = "constraint")]
        constraints: Vec<String>,

        /// Total generation attempts
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Keep monitoring after a successful deploy until interrupted
        #[arg(long)]
        watch: bool,

        #[command(flatten)]
        policy: PolicyArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    shipwright_core::init_tracing(cli.json, level);

    let mut config = ShipwrightConfig::from_env().context("Invalid configuration")?;
    if let Some(root) = cli.root.clone() {
        config.deploy.root = root;
    }
    config.monitor.history_dir = Some(config.history_dir());

    let json = cli.json;
    let result = match cli.command {
        Commands::Run {
            file,
            language,
            policy,
        } => cmd_run(&config, &file, language, &policy, json).await,
        Commands::Deploy {
            file,
            name,
            language,
            skip_verify,
            policy,
        } => cmd_deploy(&config, &file, &name, language, skip_verify, &policy, json).await,
        Commands::List { name } => cmd_list(&config, name.as_deref(), json),
        Commands::Rollback { name } => cmd_rollback(&config, &name).await,
        Commands::Delete { name, version } => cmd_delete(&config, &name, version).await,
        Commands::Deactivate { name } => cmd_deactivate(&config, &name).await,
        Commands::Check { name } => cmd_check(&config, &name, json).await,
        Commands::Watch { name, interval } => cmd_watch(&config, &name, interval).await,
        Commands::History { name, hours } => cmd_history(&config, &name, hours, json).await,
        Commands::Report { name } => cmd_report(&config, &name).await,
        Commands::Pipeline {
            name,
            prompt,
            language,
            constraints,
            max_attempts,
            watch,
            policy,
        } => {
            if let Some(n) = max_attempts {
                config.pipeline.max_attempts = n;
            }
            config.pipeline.start_monitoring = watch;
            let job = PipelineJob {
                name,
                prompt,
                language,
                constraints,
                policy: resolve_policy(&config, &policy).await?,
            };
            cmd_pipeline(&config, job, json).await
        }
    };

    METRICS.flush();
    result
}

fn open_deployer(config: &ShipwrightConfig) -> Result<DeploymentManager> {
    DeploymentManager::open(&config.deploy.root).context(format!(
        "Failed to open deployment root {}",
        config.deploy.root.display()
    ))
}

fn open_monitor(config: &ShipwrightConfig) -> Result<HealthMonitor> {
    HealthMonitor::new(config.monitor.clone()).context("Failed to set up health monitor")
}

/// Default policy from the configuration with command-line overrides.
async fn resolve_policy(config: &ShipwrightConfig, args: &PolicyArgs) -> Result<ExecutionPolicy> {
    let mut policy = config.sandbox.default_policy.clone();
    if let Some(ms) = args.timeout_ms {
        policy.timeout_ms = ms;
    }
    if let Some(bytes) = args.memory_bytes {
        policy.memory_limit_bytes = bytes;
    }
    if let Some(cpu) = args.cpu {
        policy.cpu_limit = cpu;
    }
    if args.allow_network {
        policy.network_allowed = true;
    }
    policy.isolation_mode = match args.isolation {
        None => policy.isolation_mode,
        Some(IsolationArg::Container) => IsolationMode::Container,
        Some(IsolationArg::Subprocess) => IsolationMode::Subprocess,
        Some(IsolationArg::Auto) => {
            IsolationMode::detect(&config.sandbox.settings.container_runtime).await
        }
    };
    policy.validate()?;
    Ok(policy)
}

fn load_artifact(file: &Path, language: Option<Language>) -> Result<SourceArtifact> {
    let language = match language {
        Some(l) => l,
        None => infer_language(file)
            .context(format!("Cannot infer language of {:?}; pass --language", file))?,
    };
    let content = std::fs::read(file).context(format!("Failed to read {:?}", file))?;
    Ok(SourceArtifact::new(content, language))
}

fn infer_language(file: &Path) -> Option<Language> {
    match file.extension()?.to_str()? {
        "py" => Some(Language::Python),
        "js" | "mjs" | "cjs" => Some(Language::JavaScript),
        "sh" => Some(Language::Shell),
        _ => None,
    }
}

fn print_execution(result: &ExecutionResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }
    println!("Status:   {}", result.status);
    println!("Exit:     {}", result.exit_code);
    println!("Duration: {}ms", result.duration_ms);
    if result.truncated {
        println!("Output was truncated");
    }
    if !result.stdout.is_empty() {
        println!("\n--- stdout ---\n{}", result.stdout_lossy());
    }
    if !result.stderr.is_empty() {
        println!("\n--- stderr ---\n{}", result.stderr_lossy());
    }
    Ok(())
}

fn print_health(entry: &HealthCheckEntry, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(entry)?);
        return Ok(());
    }
    let version = entry
        .version
        .map(|v| format!("v{}", v))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{} {} {}: {}",
        entry.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
        entry.deployment,
        version,
        entry.status
    );
    for check in &entry.checks {
        let mark = if check.passed { "ok" } else { "!!" };
        println!("  [{}] {}: {}", mark, check.name, check.detail);
    }
    Ok(())
}

/// Execute a file in the sandbox
async fn cmd_run(
    config: &ShipwrightConfig,
    file: &Path,
    language: Option<Language>,
    policy: &PolicyArgs,
    json: bool,
) -> Result<()> {
    let artifact = load_artifact(file, language)?;
    let policy = resolve_policy(config, policy).await?;
    let sandbox = LocalSandbox::new(config.sandbox.settings.clone());

    let result = sandbox.run(&artifact, &policy).await;
    print_execution(&result, json)?;

    if !result.is_success() {
        bail!("Execution finished with status {}", result.status);
    }
    Ok(())
}

/// Verify then deploy a file
async fn cmd_deploy(
    config: &ShipwrightConfig,
    file: &Path,
    name: &str,
    language: Option<Language>,
    skip_verify: bool,
    policy: &PolicyArgs,
    json: bool,
) -> Result<()> {
    let artifact = load_artifact(file, language)?;
    let deployer = open_deployer(config)?;

    if !skip_verify {
        let policy = resolve_policy(config, policy).await?;
        let sandbox = LocalSandbox::new(config.sandbox.settings.clone());
        let result = sandbox.run(&artifact, &policy).await;
        if !result.is_success() {
            print_execution(&result, json)?;
            bail!("Verification failed ({}); not deploying", result.status);
        }
        info!(name = %name, duration_ms = result.duration_ms, "verification passed");
    }

    let record = deployer
        .deploy(&artifact, name, artifact.language())
        .await
        .context(format!("Failed to deploy {}", name))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        println!("Deployed {} v{}", record.name, record.version);
        println!("  Hash: {}", record.source_hash.short());
        println!("  Path: {}", record.path.display());
    }
    Ok(())
}

/// List deployments
fn cmd_list(config: &ShipwrightConfig, name: Option<&str>, json: bool) -> Result<()> {
    let deployer = open_deployer(config)?;
    let records = deployer.list(name)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No deployments found");
        return Ok(());
    }

    println!(
        "{:<24} {:>6} {:<12} {:<10} {:<14} CREATED",
        "NAME", "VER", "LANGUAGE", "STATUS", "HASH"
    );
    for r in records {
        println!(
            "{:<24} {:>6} {:<12} {:<10} {:<14} {}",
            r.name,
            format!("v{}", r.version),
            r.language.to_string(),
            r.status.to_string(),
            r.source_hash.short(),
            r.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

/// Roll back to the previous version
async fn cmd_rollback(config: &ShipwrightConfig, name: &str) -> Result<()> {
    let deployer = open_deployer(config)?;
    let record = deployer
        .rollback(name)
        .await
        .context(format!("Failed to roll back {}", name))?;
    println!("{} is now at v{}", record.name, record.version);
    Ok(())
}

/// Delete a version or a whole deployment
async fn cmd_delete(config: &ShipwrightConfig, name: &str, version: Option<u64>) -> Result<()> {
    let deployer = open_deployer(config)?;
    deployer
        .delete(name, version)
        .await
        .context(format!("Failed to delete {}", name))?;

    match version {
        Some(v) => println!("Deleted {} v{}", name, v),
        None => {
            let monitor = open_monitor(config)?;
            monitor.history().clear(name).await?;
            println!("Deleted {}", name);
        }
    }
    Ok(())
}

/// Clear the active version
async fn cmd_deactivate(config: &ShipwrightConfig, name: &str) -> Result<()> {
    let deployer = open_deployer(config)?;
    match deployer.deactivate(name).await? {
        Some(record) => println!("Deactivated {} v{}", name, record.version),
        None => println!("{} had no active version", name),
    }
    Ok(())
}

/// One health check of the active version
async fn cmd_check(config: &ShipwrightConfig, name: &str, json: bool) -> Result<()> {
    let deployer = open_deployer(config)?;
    let record = deployer
        .active(name)?
        .context(format!("{} has no active version", name))?;

    let monitor = open_monitor(config)?;
    let entry = monitor.check_once(&record).await;
    print_health(&entry, json)
}

/// Periodic checks until Ctrl-C
async fn cmd_watch(config: &ShipwrightConfig, name: &str, interval_secs: u64) -> Result<()> {
    if interval_secs == 0 {
        bail!("--interval must be at least 1 second");
    }
    let deployer = open_deployer(config)?;
    let record = deployer
        .active(name)?
        .context(format!("{} has no active version", name))?;

    let monitor = Arc::new(open_monitor(config)?);
    let handle = monitor.schedule(record, Duration::from_secs(interval_secs));
    println!("Watching {} every {}s (Ctrl-C to stop)", name, interval_secs);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    let checks = handle.checks_run();
    let alerting = handle.is_alerting();
    handle.shutdown().await;
    let alerts = METRICS.snapshot().health_alerts;
    println!("Stopped after {} checks ({} alerts raised)", checks, alerts);
    if alerting {
        bail!("{} was alerting when stopped", name);
    }
    Ok(())
}

/// Recorded health entries
async fn cmd_history(config: &ShipwrightConfig, name: &str, hours: u64, json: bool) -> Result<()> {
    let monitor = open_monitor(config)?;
    let entries = monitor
        .history_since(name, Duration::from_secs(hours * 3600))
        .await;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No health checks recorded for '{}'", name);
        return Ok(());
    }
    for entry in &entries {
        print_health(entry, false)?;
    }
    Ok(())
}

/// Markdown maintenance report
async fn cmd_report(config: &ShipwrightConfig, name: &str) -> Result<()> {
    let monitor = open_monitor(config)?;
    print!("{}", monitor.report(name).await);
    Ok(())
}

/// Full generate-verify-deploy-check pipeline
async fn cmd_pipeline(config: &ShipwrightConfig, job: PipelineJob, json: bool) -> Result<()> {
    let generator = HttpGenerator::new(config.generator.clone())
        .context("Failed to set up the code generator")?;
    let orchestrator = Orchestrator::new(
        Arc::new(generator),
        Arc::new(LocalSandbox::new(config.sandbox.settings.clone())),
        Arc::new(open_deployer(config)?),
        Arc::new(open_monitor(config)?),
        config.pipeline.clone(),
    );

    let run = orchestrator.run(job).await;
    let outcome = &run.outcome;

    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
    } else {
        println!("Pipeline {}: {}", outcome.pipeline_id, outcome.state);
        let path: Vec<&str> = outcome.path().iter().map(|s| s.as_str()).collect();
        println!("  Path: {}", path.join(" -> "));
        println!("  Attempts: {}", outcome.attempts.len());
        if let Some(record) = &outcome.deployment {
            println!("  Deployed: {} v{}", record.name, record.version);
        }
        if let Some(health) = &outcome.health {
            println!("  Health: {}", health.status);
        }
        if let Some(reason) = &outcome.failure {
            println!("  Failure: {}", reason);
        }
    }

    if let Some(handle) = run.monitor {
        println!("Monitoring {} (Ctrl-C to stop)", outcome.name);
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        handle.shutdown().await;
    }

    if !outcome.is_success() {
        bail!("Pipeline failed");
    }
    Ok(())
}
