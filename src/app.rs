use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::artifacts::{ArtifactRecord, ArtifactStore, StorageStats};
use crate::dispatch::{
    BackendConfig, DisabledBackend, DispatcherSettings, ExecutionBackend, FlowRun, FlowRunFilter,
    FlowRunStatus, HttpJobBackend, JobDispatcher, LocalExecutor,
};
use crate::engine::types::{
    Answer, AuthConfig, AuthType, DiscoveryOptions, Question, RunContext, RunOptions, RunState,
};
use crate::engine::executor::RunDriver;
use crate::engine::{HandlerRegistry, IntentPolicy, RunEngine, StepDeps};
use crate::errors::OrchestratorError;
use crate::flows::guards::resolve_variables;
use crate::flows::{FlowRunRequest, FlowSource, FlowSummary, GuardPolicy, YamlFlowSource, redact_secrets};
use crate::governor::{ConcurrencyGovernor, GovernorLimits, GovernorStatus, PageGate};
use crate::plugins::PluginRegistry;
use crate::providers::BrowserActions;
use crate::storage::RunRegistry;
use crate::storage::json_store::JsonRunStore;

/// Resolved settings the services are built from.
#[derive(Debug, Clone)]
pub struct AppSettings {
    pub data_dir: PathBuf,
    pub flows_dir: PathBuf,
    pub limits: GovernorLimits,
    pub page_parallelism: usize,
    pub intent_policy: IntentPolicy,
    pub retention_days: u32,
    pub guards: GuardPolicy,
    pub backend: BackendConfig,
    /// How long a request waits for a run to reach its next question or end.
    /// The run keeps going on its own task after that.
    pub driver_wait: Duration,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/runs"),
            flows_dir: PathBuf::from("./flows"),
            limits: GovernorLimits::default(),
            page_parallelism: PageGate::DEFAULT_WIDTH,
            intent_policy: IntentPolicy::default(),
            retention_days: 14,
            guards: GuardPolicy::default(),
            backend: BackendConfig::default(),
            driver_wait: Duration::from_secs(30),
        }
    }
}

/// Every long-lived service, built once at start-up.
pub struct AppContext {
    pub settings: AppSettings,
    pub registry: Arc<RunRegistry>,
    pub artifacts: Arc<ArtifactStore>,
    pub governor: Arc<ConcurrencyGovernor>,
    pub plugins: Arc<PluginRegistry>,
    pub browser: Arc<dyn BrowserActions>,
    pub flows: Arc<dyn FlowSource>,
    pub engine: Arc<RunEngine>,
    pub dispatcher: Arc<JobDispatcher>,
}

impl AppContext {
    /// Build with explicit collaborators.
    pub fn new(
        settings: AppSettings,
        browser: Arc<dyn BrowserActions>,
        backend: Arc<dyn ExecutionBackend>,
        flows: Arc<dyn FlowSource>,
    ) -> Self {
        let artifacts = Arc::new(ArtifactStore::new(&settings.data_dir));
        let store = Arc::new(JsonRunStore::new(&settings.data_dir));
        let registry = Arc::new(RunRegistry::new(store, artifacts.base_dir()));
        let governor = Arc::new(ConcurrencyGovernor::new(settings.limits));
        let plugins = Arc::new(PluginRegistry::with_builtins());

        let deps = StepDeps {
            browser: Arc::clone(&browser),
            artifacts: Arc::clone(&artifacts),
            plugins: Arc::clone(&plugins),
            page_parallelism: settings.page_parallelism,
            intent_policy: settings.intent_policy,
        };
        let engine = Arc::new(RunEngine::new(
            Arc::clone(&registry),
            Arc::new(HandlerRegistry::with_builtins()),
            deps,
        ));

        let local = Arc::new(LocalExecutor::new(
            Arc::clone(&browser),
            Arc::clone(&artifacts),
            Arc::clone(&plugins),
            settings.page_parallelism,
        ));
        let dispatcher = Arc::new(JobDispatcher::new(
            backend,
            local,
            Arc::clone(&governor),
            Arc::clone(&artifacts),
            DispatcherSettings::from(&settings.backend),
        ));

        Self {
            settings,
            registry,
            artifacts,
            governor,
            plugins,
            browser,
            flows,
            engine,
            dispatcher,
        }
    }

    /// Build from settings: YAML flows from `flows_dir`, and the HTTP job
    /// backend when an API URL is configured.
    pub fn from_settings(settings: AppSettings, browser: Arc<dyn BrowserActions>) -> Result<Self> {
        let backend: Arc<dyn ExecutionBackend> = if settings.backend.api_url.is_some() {
            Arc::new(HttpJobBackend::new(&settings.backend)?)
        } else {
            info!("No job backend configured; flow runs execute locally");
            Arc::new(DisabledBackend)
        };
        let flows = Arc::new(YamlFlowSource::new(&settings.flows_dir));
        Ok(Self::new(settings, browser, backend, flows))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthInput {
    #[serde(default, rename = "type")]
    pub auth_type: AuthType,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_env() -> String {
    "staging".to_string()
}

fn default_headless() -> bool {
    true
}

/// Input for an interactive run.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRunRequest {
    pub base_url: String,
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default = "default_headless")]
    pub headless: bool,
    #[serde(default)]
    pub auth: Option<AuthInput>,
    #[serde(default)]
    pub discovery: Option<DiscoveryOptions>,
}

impl CreateRunRequest {
    pub fn new(base_url: &str, env: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            env: env.to_string(),
            run_id: None,
            headless: true,
            auth: None,
            discovery: None,
        }
    }
}

/// What clients see of an interactive run.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatusView {
    pub run_id: String,
    pub state: RunState,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question: Option<Question>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&RunContext> for RunStatusView {
    fn from(ctx: &RunContext) -> Self {
        Self {
            run_id: ctx.run_id.clone(),
            state: ctx.state,
            progress: ctx.state.progress(),
            question: ctx.question.clone(),
            current_url: ctx.current_url.clone(),
            last_error: ctx.last_error.clone(),
            report_path: ctx.report_path.clone(),
            message: None,
        }
    }
}

/// Service façade over the application context.
#[derive(Clone)]
pub struct Orchestrator {
    ctx: Arc<AppContext>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    // --- Interactive runs ---

    /// Persist a run in START and advance it to its first question or end.
    pub async fn create_interactive_run(
        &self,
        req: CreateRunRequest,
    ) -> Result<RunStatusView, OrchestratorError> {
        let parsed = url::Url::parse(&req.base_url)
            .map_err(|e| OrchestratorError::Validation(format!("invalid base_url: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(OrchestratorError::Validation(format!(
                "base_url must be http or https, got '{}'",
                parsed.scheme()
            )));
        }

        let run_id = req
            .run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let auth = req.auth.clone().unwrap_or_default();
        let opts = RunOptions {
            headless: req.headless,
            auth: AuthConfig {
                auth_type: auth.auth_type,
                username: auth.username,
                password: auth.password,
            },
            discovery: req.discovery.clone().unwrap_or_default(),
        };

        self.ctx
            .registry
            .create(&run_id, &req.base_url, &req.env, opts)
            .await?;
        self.ctx.artifacts.create_run_directory(&run_id).await?;
        let driver = self.ctx.engine.spawn_advance(&run_id);
        let ctx = self.settle(&run_id, driver).await?;
        Ok(RunStatusView::from(&ctx))
    }

    pub async fn submit_answer(
        &self,
        run_id: &str,
        answer: Answer,
    ) -> Result<RunStatusView, OrchestratorError> {
        let driver = self.ctx.engine.spawn_answer(run_id, answer);
        let ctx = self.settle(run_id, driver).await?;
        let mut view = RunStatusView::from(&ctx);
        view.message = Some(match &ctx.question {
            Some(q) => format!("answer accepted; next question: {}", q.prompt),
            None => format!("answer accepted; run is {}", ctx.state),
        });
        Ok(view)
    }

    /// Wait up to `driver_wait` for a driving task. Past that the caller gets
    /// the latest persisted snapshot and the task carries on.
    async fn settle(&self, run_id: &str, driver: RunDriver) -> Result<RunContext, OrchestratorError> {
        match tokio::time::timeout(self.ctx.settings.driver_wait, driver).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(OrchestratorError::Internal(anyhow::anyhow!(
                "driver for run '{}' failed: {}",
                run_id,
                e
            ))),
            Err(_) => {
                debug!(run_id = %run_id, "Run still moving; returning latest snapshot");
                self.ctx.registry.get(run_id).await
            }
        }
    }

    /// Pick up interactive runs a previous process left between steps.
    pub async fn resume_interrupted(&self) -> Result<Vec<String>, OrchestratorError> {
        self.ctx.engine.resume_interrupted().await
    }

    /// Last persisted snapshot; never waits on a driving task.
    pub async fn run_status(&self, run_id: &str) -> Result<RunStatusView, OrchestratorError> {
        let ctx = self.ctx.registry.snapshot(run_id).await?;
        Ok(RunStatusView::from(ctx.as_ref()))
    }

    pub async fn get_run(&self, run_id: &str) -> Result<RunContext, OrchestratorError> {
        self.ctx.registry.get(run_id).await
    }

    pub async fn list_runs(&self) -> Result<Vec<RunStatusView>, OrchestratorError> {
        Ok(self
            .ctx
            .registry
            .list()
            .await?
            .iter()
            .map(RunStatusView::from)
            .collect())
    }

    // --- Flow runs ---

    pub async fn list_flows(&self) -> Result<Vec<FlowSummary>, OrchestratorError> {
        Ok(self.ctx.flows.list().await?)
    }

    /// Validate, guard, admit and dispatch a flow run. Rejections happen
    /// before any slot is taken.
    pub async fn create_flow_run(&self, req: FlowRunRequest) -> Result<FlowRun, OrchestratorError> {
        let flow = self
            .ctx
            .flows
            .get(&req.flow_name)
            .await?
            .ok_or_else(|| {
                OrchestratorError::Validation(format!("unknown flow '{}'", req.flow_name))
            })?;
        let vars = resolve_variables(&flow, &req)?;
        self.ctx.settings.guards.check(&flow, &req, &vars)?;

        let run_id = req
            .run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let artifacts_path = self.ctx.artifacts.run_dir(&run_id)?;
        let run = FlowRun {
            run_id,
            flow_name: flow.name.clone(),
            env: req.env.clone(),
            tenant: req.tenant.clone(),
            project: req.project.clone(),
            variables: redact_secrets(&vars, &flow.secret_names()),
            tags: req.tags.clone(),
            force_allow_prod: req.force_allow_prod,
            status: FlowRunStatus::Pending,
            mode: None,
            job_name: None,
            artifacts_path: artifacts_path.to_string_lossy().to_string(),
            error: None,
            steps: Vec::new(),
            tally: Default::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
        };
        self.ctx.dispatcher.submit(run, flow, vars).await
    }

    pub async fn cancel_flow_run(&self, run_id: &str) -> Result<FlowRun, OrchestratorError> {
        self.ctx.dispatcher.cancel(run_id).await
    }

    pub fn get_flow_run(&self, run_id: &str) -> Result<FlowRun, OrchestratorError> {
        self.ctx
            .dispatcher
            .get(run_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("Flow run '{}'", run_id)))
    }

    pub fn list_flow_runs(&self, filter: &FlowRunFilter) -> Vec<FlowRun> {
        self.ctx.dispatcher.list(filter)
    }

    pub fn rate_limit_status(&self) -> GovernorStatus {
        self.ctx.governor.status()
    }

    pub fn force_release_all(&self) -> usize {
        let released = self.ctx.governor.force_release_all();
        warn!(released, "Operator force-released all governor slots");
        released
    }

    // --- Artifacts ---

    pub async fn list_artifacts(
        &self,
        run_id: &str,
    ) -> Result<Vec<ArtifactRecord>, OrchestratorError> {
        Ok(self.ctx.artifacts.list_artifacts(run_id).await?)
    }

    pub async fn get_artifact(
        &self,
        run_id: &str,
        relative: &str,
    ) -> Result<Vec<u8>, OrchestratorError> {
        Ok(self.ctx.artifacts.get_artifact(run_id, relative).await?)
    }

    pub async fn storage_stats(&self) -> Result<StorageStats, OrchestratorError> {
        Ok(self.ctx.artifacts.storage_stats().await?)
    }

    /// Remove expired run directories and drop them from the caches.
    pub async fn sweep(&self, retention_days: Option<u32>) -> Result<Vec<String>, OrchestratorError> {
        let days = retention_days.unwrap_or(self.ctx.settings.retention_days);
        let removed = self.ctx.artifacts.sweep_expired(days).await?;
        self.ctx.registry.forget(&removed);
        self.ctx.dispatcher.forget(&removed);
        Ok(removed)
    }
}
