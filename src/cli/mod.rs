mod config;

pub use config::{BrowserConfig, QaflowConfig};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use crate::app::{AppContext, AppSettings, Orchestrator};
use crate::dispatch::{FlowRun, FlowRunStatus};
use crate::engine::IntentPolicy;
use crate::flows::FlowRunRequest;
use crate::governor::GovernorLimits;
use crate::providers::{BrowserActions, RemoteBrowser, ScriptedBrowser};

const DEFAULT_BROWSER_ENDPOINT: &str = "http://127.0.0.1:9323";
const DEFAULT_SWEEP_INTERVAL_S: u64 = 3600;

#[derive(Parser)]
#[command(
    name = "qaflow",
    version,
    about = "Interactive QA run orchestrator for web applications"
)]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Path to qaflow.yaml (default: auto-detect in cwd)
    #[arg(long, global = true, env = "QAFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Root directory for run contexts and artifacts
    #[arg(long, global = true, env = "DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Directory holding flow definitions (.yaml)
    #[arg(long, global = true, env = "FLOWS_DIR")]
    flows_dir: Option<PathBuf>,

    /// Base URL of the browser-action service
    #[arg(long, global = true, env = "BROWSER_ENDPOINT")]
    browser_endpoint: Option<String>,

    /// Drive runs against a scripted site definition instead of a live browser
    #[arg(long, global = true, env = "SITE_SCRIPT")]
    site_script: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST API server
    Serve {
        /// Host to bind to
        #[arg(long, env = "HOST")]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long, env = "PORT")]
        port: Option<u16>,

        /// Maximum request body size in bytes (default: 1048576 = 1 MB)
        #[arg(long, env = "MAX_BODY")]
        max_body: Option<usize>,

        /// Maximum concurrent flow runs
        #[arg(long, env = "MAX_CONCURRENT_RUNS")]
        max_concurrent_runs: Option<usize>,

        /// Maximum concurrent flow runs per flow name
        #[arg(long, env = "MAX_RUNS_PER_KEY")]
        max_runs_per_key: Option<usize>,

        /// What to do after discovery (ask, auto_smoke, stop_after_discovery)
        #[arg(long, env = "INTENT_POLICY")]
        intent_policy: Option<String>,

        /// Seconds between retention sweeps
        #[arg(long, env = "SWEEP_INTERVAL_S")]
        sweep_interval_s: Option<u64>,
    },

    /// List available flows
    Flows,

    /// Run a flow locally and wait for it to finish
    FlowRun {
        /// Flow name
        flow: String,

        /// Target environment
        #[arg(short, long, default_value = "staging")]
        env: String,

        #[arg(long)]
        tenant: Option<String>,

        #[arg(long)]
        project: Option<String>,

        /// Flow variable as key=value (repeatable)
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,

        /// Tag for the run (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Allow a production environment
        #[arg(long)]
        force_allow_prod: bool,

        /// Use this run id instead of generating one
        #[arg(long)]
        run_id: Option<String>,

        /// Print the full run record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect a run (interactive or flow run)
    Inspect {
        /// Run ID
        run_id: String,
    },

    /// List the artifacts of a run
    Artifacts {
        /// Run ID
        run_id: String,
    },

    /// Delete run directories older than the retention period
    Cleanup {
        /// Retention in days (default: configured retention_days)
        #[arg(long)]
        retention_days: Option<u32>,
    },

    /// Show storage usage
    Stats,
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Load .env file
    load_dotenv(cli.dotenv.as_deref());

    let config = QaflowConfig::load(cli.config.as_deref())?;
    let mut settings = base_settings(&cli, &config)?;
    let browser = build_browser(&cli, &config)?;

    match cli.command {
        Commands::Serve {
            host,
            port,
            max_body,
            max_concurrent_runs,
            max_runs_per_key,
            intent_policy,
            sweep_interval_s,
        } => {
            if let Some(n) = max_concurrent_runs {
                settings.limits.max_concurrent = n;
            }
            if let Some(n) = max_runs_per_key {
                settings.limits.max_per_key = n;
            }
            if let Some(p) = intent_policy {
                settings.intent_policy = p.parse().map_err(anyhow::Error::msg)?;
            }
            let host = host
                .or(config.host.clone())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            let port = port.or(config.port).unwrap_or(3000);
            let max_body = max_body.or(config.max_body).unwrap_or(1_048_576);
            let sweep_every = sweep_interval_s
                .or(config.sweep_interval_s)
                .unwrap_or(DEFAULT_SWEEP_INTERVAL_S);
            cmd_serve(settings, browser, &host, port, max_body, sweep_every).await
        }
        Commands::Flows => cmd_flows(orchestrator(settings, browser)?).await,
        Commands::FlowRun {
            flow,
            env,
            tenant,
            project,
            vars,
            tags,
            force_allow_prod,
            run_id,
            json,
        } => {
            let orchestrator = orchestrator(settings, browser)?;
            let mut variables = parse_vars(&vars)?;
            // Backend jobs receive secrets as QAFLOW_VAR_* entries.
            if let Some(config) = orchestrator.context().flows.get(&flow).await? {
                let filled = config.fill_from_env(&mut variables, |key| std::env::var(key).ok());
                if !filled.is_empty() {
                    info!(flow = %flow, count = filled.len(), "Variables taken from environment");
                }
            }
            let request = FlowRunRequest {
                flow_name: flow,
                env,
                tenant,
                project,
                variables,
                tags,
                force_allow_prod,
                run_id,
            };
            cmd_flow_run(orchestrator, request, json).await
        }
        Commands::Inspect { run_id } => cmd_inspect(orchestrator(settings, browser)?, &run_id).await,
        Commands::Artifacts { run_id } => {
            cmd_artifacts(orchestrator(settings, browser)?, &run_id).await
        }
        Commands::Cleanup { retention_days } => {
            cmd_cleanup(orchestrator(settings, browser)?, retention_days).await
        }
        Commands::Stats => cmd_stats(orchestrator(settings, browser)?).await,
    }
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (error if missing).
/// Otherwise, auto-detect .env in the current working directory (silently skip if absent).
fn load_dotenv(explicit_path: Option<&Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {}
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

/// Settings shared by every command: flags and env first, then the config
/// file, then defaults.
pub fn base_settings(cli: &Cli, config: &QaflowConfig) -> Result<AppSettings> {
    let mut settings = AppSettings::default();

    if let Some(dir) = cli
        .data_dir
        .clone()
        .or_else(|| config.data_dir.as_ref().map(PathBuf::from))
    {
        settings.data_dir = dir;
    }
    if let Some(dir) = cli
        .flows_dir
        .clone()
        .or_else(|| config.flows_dir.as_ref().map(PathBuf::from))
    {
        settings.flows_dir = dir;
    }

    let defaults = GovernorLimits::default();
    settings.limits = GovernorLimits::new(
        config.max_concurrent_runs.unwrap_or(defaults.max_concurrent),
        config.max_runs_per_key.unwrap_or(defaults.max_per_key),
    );
    if let Some(n) = config.page_parallelism {
        settings.page_parallelism = n.max(1);
    }
    if let Some(ref policy) = config.intent_policy {
        settings.intent_policy = policy
            .parse::<IntentPolicy>()
            .map_err(anyhow::Error::msg)
            .context("Invalid intent_policy in config")?;
    }
    if let Some(days) = config.retention_days {
        settings.retention_days = days;
    }
    if let Some(secs) = config.driver_wait_s {
        settings.driver_wait = Duration::from_secs(secs);
    }
    if let Some(ref envs) = config.production_envs {
        settings.guards.production_envs = envs.clone();
    }
    if let Some(ref marker) = config.test_account_marker {
        settings.guards.test_account_marker = marker.clone();
    }
    if let Some(ref backend) = config.backend {
        settings.backend = backend.clone();
    }
    if let Ok(url) = std::env::var("JOB_API_URL")
        && !url.is_empty()
    {
        settings.backend.api_url = Some(url);
    }
    if let Ok(token) = std::env::var("JOB_API_TOKEN")
        && !token.is_empty()
    {
        settings.backend.token = Some(token);
    }

    Ok(settings)
}

fn build_browser(cli: &Cli, config: &QaflowConfig) -> Result<Arc<dyn BrowserActions>> {
    let browser_cfg = config.browser.clone().unwrap_or_default();

    let script = cli
        .site_script
        .clone()
        .or_else(|| browser_cfg.script.as_ref().map(PathBuf::from));
    if let Some(path) = script {
        info!(script = %path.display(), "Using scripted browser");
        return Ok(Arc::new(ScriptedBrowser::from_yaml_file(&path)?));
    }

    let endpoint = cli
        .browser_endpoint
        .clone()
        .or(browser_cfg.endpoint)
        .unwrap_or_else(|| DEFAULT_BROWSER_ENDPOINT.to_string());
    let timeout_s = browser_cfg.timeout_s.unwrap_or(30.0);
    info!(endpoint = %endpoint, "Using remote browser service");
    Ok(Arc::new(RemoteBrowser::new(&endpoint, timeout_s)?))
}

fn orchestrator(settings: AppSettings, browser: Arc<dyn BrowserActions>) -> Result<Orchestrator> {
    let ctx = AppContext::from_settings(settings, browser)?;
    Ok(Orchestrator::new(Arc::new(ctx)))
}

/// Parse repeated `key=value` pairs.
pub fn parse_vars(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Invalid --var '{}', expected KEY=VALUE", pair))?;
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("Invalid --var '{}', empty key", pair);
        }
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

async fn cmd_serve(
    settings: AppSettings,
    browser: Arc<dyn BrowserActions>,
    host: &str,
    port: u16,
    max_body: usize,
    sweep_every_s: u64,
) -> Result<()> {
    let orchestrator = orchestrator(settings, browser)?;
    let ctx = Arc::clone(orchestrator.context());

    let restored = ctx.dispatcher.load_persisted().await?;
    let resumed = orchestrator.resume_interrupted().await?;
    info!(
        restored,
        resumed = resumed.len(),
        max_concurrent = ctx.settings.limits.max_concurrent,
        max_per_key = ctx.settings.limits.max_per_key,
        retention_days = ctx.settings.retention_days,
        "Orchestrator ready"
    );

    let sweeper = orchestrator.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(sweep_every_s.max(1)));
        // First tick fires immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match sweeper.sweep(None).await {
                Ok(removed) if !removed.is_empty() => {
                    info!(removed = removed.len(), "Retention sweep removed expired runs")
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Retention sweep failed"),
            }
        }
    });

    crate::api::serve(orchestrator, host, port, max_body).await
}

async fn cmd_flows(orchestrator: Orchestrator) -> Result<()> {
    let flows = orchestrator.list_flows().await?;

    if flows.is_empty() {
        println!("No flows found.");
        return Ok(());
    }

    println!("{:<24} {:<8} {:<24} DESCRIPTION", "FLOW", "STEPS", "ENVIRONMENTS");
    println!("{}", "-".repeat(80));

    for flow in &flows {
        let envs = if flow.allowed_environments.is_empty() {
            "any".to_string()
        } else {
            flow.allowed_environments.join(",")
        };
        println!(
            "{:<24} {:<8} {:<24} {}",
            flow.name,
            flow.steps,
            envs,
            flow.description.as_deref().unwrap_or("")
        );
    }

    println!("\nTotal: {} flow(s)", flows.len());
    Ok(())
}

async fn cmd_flow_run(orchestrator: Orchestrator, request: FlowRunRequest, json: bool) -> Result<()> {
    let submitted = orchestrator.create_flow_run(request).await?;
    println!("Run ID: {}", submitted.run_id);

    let run = orchestrator
        .context()
        .dispatcher
        .join(&submitted.run_id)
        .await
        .ok_or_else(|| anyhow::anyhow!("Flow run '{}' disappeared", submitted.run_id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_flow_run(&run);
    }

    if run.status != FlowRunStatus::Completed {
        anyhow::bail!("Flow run finished with status {}", run.status);
    }
    Ok(())
}

fn print_flow_run(run: &FlowRun) {
    println!("Flow: {} ({})", run.flow_name, run.env);
    println!("Status: {}", run.status);
    if let Some(ms) = run.duration_ms {
        println!("Duration: {}ms", ms);
    }
    if let Some(ref err) = run.error {
        println!("Error: {}", err);
    }

    if !run.steps.is_empty() {
        println!("\nSteps:");
        for step in &run.steps {
            println!(
                "  {} [{}] ({}ms): {}",
                step.name, step.action, step.duration_ms, step.verdict
            );
        }
    }

    println!(
        "\nTotal: {}  Passed: {}  Failed: {}  Skipped: {}",
        run.tally.total, run.tally.passed, run.tally.failed, run.tally.skipped
    );
    println!("Artifacts: {}", run.artifacts_path);
}

async fn cmd_inspect(orchestrator: Orchestrator, run_id: &str) -> Result<()> {
    match orchestrator.get_run(run_id).await {
        Ok(ctx) => {
            println!("{}", serde_json::to_string_pretty(&ctx)?);
            return Ok(());
        }
        Err(e) => info!(run_id = %run_id, error = %e, "No interactive run; trying flow runs"),
    }

    orchestrator.context().dispatcher.load_persisted().await?;
    let run = orchestrator
        .get_flow_run(run_id)
        .with_context(|| format!("Run '{}' not found", run_id))?;
    println!("{}", serde_json::to_string_pretty(&run)?);
    Ok(())
}

async fn cmd_artifacts(orchestrator: Orchestrator, run_id: &str) -> Result<()> {
    let artifacts = orchestrator.list_artifacts(run_id).await?;

    if artifacts.is_empty() {
        println!("No artifacts for run {}.", run_id);
        return Ok(());
    }

    println!("{:<12} {:>10}  PATH", "KIND", "BYTES");
    println!("{}", "-".repeat(72));
    for artifact in &artifacts {
        println!(
            "{:<12} {:>10}  {}",
            artifact.kind.as_str(),
            artifact.size,
            artifact.path
        );
    }

    println!("\nTotal: {} artifact(s)", artifacts.len());
    Ok(())
}

async fn cmd_cleanup(orchestrator: Orchestrator, retention_days: Option<u32>) -> Result<()> {
    let removed = orchestrator.sweep(retention_days).await?;
    println!("Removed {} expired run(s)", removed.len());
    for run_id in &removed {
        println!("  {}", run_id);
    }
    Ok(())
}

async fn cmd_stats(orchestrator: Orchestrator) -> Result<()> {
    let stats = orchestrator.storage_stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
