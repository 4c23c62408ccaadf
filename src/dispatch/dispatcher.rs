use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::FutureExt;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{
    BackendConfig, ExecutionBackend, ExecutionMode, FlowReport, FlowRun, FlowRunStatus, Job,
    JobSpec, LocalExecutor, StepRecord,
};
use crate::artifacts::{ArtifactStore, is_valid_run_id};
use crate::engine::types::Tally;
use crate::errors::OrchestratorError;
use crate::flows::{FlowConfig, var_env_name};
use crate::governor::ConcurrencyGovernor;

const RUN_RECORD: &str = "flow_run.json";
const REPORT: &str = "report.json";

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    /// Whole-run limit for local execution when the flow sets none.
    pub local_timeout: Duration,
    pub image: String,
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from(&BackendConfig::default())
    }
}

impl From<&BackendConfig> for DispatcherSettings {
    fn from(config: &BackendConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_s.max(1)),
            job_timeout: Duration::from_secs(config.timeout_s),
            local_timeout: Duration::from_secs(config.timeout_s),
            image: config.image.clone(),
            cpu: config.cpu.clone(),
            memory: config.memory.clone(),
        }
    }
}

/// Filters for listing flow runs. Unset fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlowRunFilter {
    pub status: Option<FlowRunStatus>,
    pub flow_name: Option<String>,
    pub env: Option<String>,
    pub tag: Option<String>,
}

impl FlowRunFilter {
    fn matches(&self, run: &FlowRun) -> bool {
        self.status.is_none_or(|s| s == run.status)
            && self.flow_name.as_ref().is_none_or(|f| *f == run.flow_name)
            && self.env.as_ref().is_none_or(|e| *e == run.env)
            && self.tag.as_ref().is_none_or(|t| run.tags.contains(t))
    }
}

/// How the driving task ended, before finalization.
struct Finish {
    status: FlowRunStatus,
    error: Option<String>,
    steps: Vec<StepRecord>,
}

impl Finish {
    fn new(status: FlowRunStatus, error: Option<String>) -> Self {
        Self {
            status,
            error,
            steps: Vec::new(),
        }
    }
}

/// Runs flow runs on the execution backend, falling back to in-process
/// execution, and owns their governor slots from admission to finalization.
pub struct JobDispatcher {
    backend: Arc<dyn ExecutionBackend>,
    local: Arc<LocalExecutor>,
    governor: Arc<ConcurrencyGovernor>,
    artifacts: Arc<ArtifactStore>,
    settings: DispatcherSettings,
    runs: RwLock<HashMap<String, FlowRun>>,
    cancels: Mutex<HashMap<String, watch::Sender<bool>>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl JobDispatcher {
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        local: Arc<LocalExecutor>,
        governor: Arc<ConcurrencyGovernor>,
        artifacts: Arc<ArtifactStore>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            backend,
            local,
            governor,
            artifacts,
            settings,
            runs: RwLock::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Load persisted run records. Runs that were still active when the
    /// process stopped are marked FAILED.
    pub async fn load_persisted(&self) -> anyhow::Result<usize> {
        let base = self.artifacts.base_dir().to_path_buf();
        if !tokio::fs::try_exists(&base).await? {
            return Ok(0);
        }
        let mut loaded = 0;
        let mut entries = tokio::fs::read_dir(&base).await?;
        while let Some(entry) = entries.next_entry().await? {
            let run_id = entry.file_name().to_string_lossy().to_string();
            if !is_valid_run_id(&run_id) {
                continue;
            }
            let path = entry.path().join(RUN_RECORD);
            let Ok(data) = tokio::fs::read(&path).await else {
                continue;
            };
            let mut run: FlowRun = match serde_json::from_slice(&data) {
                Ok(run) => run,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping corrupt flow run record");
                    continue;
                }
            };
            if !run.status.is_terminal() {
                run.status = FlowRunStatus::Failed;
                run.error = Some("interrupted by restart".to_string());
                run.completed_at = Some(Utc::now());
                self.persist(&run).await;
            }
            self.runs
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(run.run_id.clone(), run);
            loaded += 1;
        }
        info!(loaded, "Loaded persisted flow runs");
        Ok(loaded)
    }

    /// Admit a run and start driving it in the background. Ids already held
    /// by a flow run or an interactive run are refused with `Conflict`.
    ///
    /// The governor slot is taken here and released exactly once by the
    /// run's finalization, whatever the outcome.
    pub async fn submit(
        self: &Arc<Self>,
        run: FlowRun,
        flow: FlowConfig,
        vars: BTreeMap<String, String>,
    ) -> Result<FlowRun, OrchestratorError> {
        let run_id = run.run_id.clone();
        let run_dir = self.artifacts.run_dir(&run_id)?;
        if self.get(&run_id).is_some() || tokio::fs::try_exists(&run_dir).await.unwrap_or(true) {
            return Err(OrchestratorError::Conflict(format!(
                "run id '{}' is already in use",
                run_id
            )));
        }
        if !self.governor.acquire(&run_id, &run.flow_name) {
            return Err(OrchestratorError::Capacity(format!(
                "no slot available for flow '{}'",
                run.flow_name
            )));
        }

        if let Err(e) = self.artifacts.create_run_directory(&run_id).await {
            self.governor.release(&run_id);
            return Err(e.into());
        }

        self.persist(&run).await;
        self.runs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id.clone(), run.clone());

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id.clone(), cancel_tx);

        let dispatcher = Arc::clone(self);
        let task_run_id = run_id.clone();
        let handle = tokio::spawn(async move {
            let finish = AssertUnwindSafe(dispatcher.drive(&task_run_id, &flow, &vars, cancel_rx))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    error!(run_id = %task_run_id, "Flow run task panicked");
                    Finish::new(FlowRunStatus::Failed, Some("dispatcher task panicked".to_string()))
                });
            dispatcher.finalize(&task_run_id, finish).await;
        });
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id.clone(), handle);

        info!(run_id = %run_id, flow = %run.flow_name, env = %run.env, "Flow run dispatched");
        Ok(run)
    }

    async fn drive(
        &self,
        run_id: &str,
        flow: &FlowConfig,
        vars: &BTreeMap<String, String>,
        cancel: watch::Receiver<bool>,
    ) -> Finish {
        let Some(run) = self.mutate(run_id, |run| {
            if !run.status.is_terminal() {
                run.status = FlowRunStatus::Running;
                run.started_at = Some(Utc::now());
            }
        }) else {
            return Finish::new(FlowRunStatus::Failed, Some("run record vanished".to_string()));
        };
        if run.status.is_terminal() {
            return Finish::new(run.status, run.error);
        }
        self.persist(&run).await;

        let spec = self.job_spec(&run, flow, vars);
        match self.backend.create_job(&spec).await {
            Ok(job) => {
                info!(run_id = %run_id, job = %job.name, backend = %job.backend, "Running on backend");
                if let Some(run) = self.mutate(run_id, |run| {
                    run.mode = Some(ExecutionMode::Backend);
                    run.job_name = Some(job.name.clone());
                }) {
                    self.persist(&run).await;
                }
                self.monitor(run_id, &job, cancel).await
            }
            Err(e) => {
                let detail = format!("{:#}", e);
                warn!(
                    run_id = %run_id,
                    backend = %self.backend.name(),
                    error = %detail,
                    "Backend unavailable; executing locally"
                );
                if let Some(run) = self.mutate(run_id, |run| run.mode = Some(ExecutionMode::Local))
                {
                    self.persist(&run).await;
                }
                let run_timeout = flow
                    .timeout_s
                    .map(Duration::from_secs)
                    .unwrap_or(self.settings.local_timeout);
                let local = self
                    .local
                    .execute(run_id, flow, vars, &cancel, run_timeout)
                    .await;
                let status = if local.cancelled {
                    FlowRunStatus::Cancelled
                } else if local.timed_out {
                    FlowRunStatus::Timeout
                } else if local.error.is_some() {
                    FlowRunStatus::Failed
                } else {
                    FlowRunStatus::Completed
                };
                Finish {
                    status,
                    error: local.error,
                    steps: local.steps,
                }
            }
        }
    }

    /// Poll the backend until the job settles, times out, or is cancelled.
    async fn monitor(&self, run_id: &str, job: &Job, mut cancel: watch::Receiver<bool>) -> Finish {
        let deadline = Instant::now() + self.settings.job_timeout;
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        let mut cancel_open = true;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = cancel.changed(), if cancel_open => {
                    if changed.is_err() {
                        cancel_open = false;
                    }
                }
            }

            if *cancel.borrow() {
                return Finish::new(FlowRunStatus::Cancelled, Some("cancelled by operator".to_string()));
            }
            if Instant::now() >= deadline {
                warn!(run_id = %run_id, job = %job.name, "Backend job timed out");
                if let Err(e) = self.backend.delete_job(job).await {
                    warn!(run_id = %run_id, job = %job.name, error = %e, "Failed to delete timed out job");
                }
                return Finish::new(
                    FlowRunStatus::Timeout,
                    Some(format!(
                        "job did not finish within {}s",
                        self.settings.job_timeout.as_secs()
                    )),
                );
            }

            match self.backend.job_status(job).await {
                Ok(status) if status.succeeded > 0 => {
                    return Finish::new(FlowRunStatus::Completed, None);
                }
                Ok(status) if status.failed > 0 => {
                    return Finish::new(
                        FlowRunStatus::Failed,
                        Some(format!("backend reported {} failed pod(s)", status.failed)),
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(run_id = %run_id, job = %job.name, error = %e, "Job status poll failed"),
            }
        }
    }

    /// The single exit path of every run: timestamps, slot release, report.
    async fn finalize(&self, run_id: &str, finish: Finish) {
        let released = self.governor.release(run_id);
        self.cancels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id);

        let Some(run) = self.mutate(run_id, |run| {
            let now = Utc::now();
            if !run.status.is_terminal() {
                run.status = finish.status;
            }
            if run.error.is_none() {
                run.error = finish.error.clone();
            }
            run.steps = finish.steps.clone();
            run.tally = Tally::from_verdicts(run.steps.iter().map(|s| &s.verdict));
            let started = run.started_at.unwrap_or(run.created_at);
            run.completed_at = Some(now);
            run.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
        }) else {
            error!(run_id = %run_id, "Finalizing a run with no record");
            return;
        };

        if let Err(e) = self
            .artifacts
            .save_json(run_id, REPORT, &FlowReport::from(&run))
            .await
        {
            error!(run_id = %run_id, error = %e, "Failed to write flow report");
        }
        self.persist(&run).await;
        // Finished tasks need no joining.
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id);

        info!(
            run_id = %run_id,
            status = %run.status,
            duration_ms = run.duration_ms.unwrap_or_default(),
            slot_released = released,
            total = run.tally.total,
            failed = run.tally.failed,
            "Flow run finished"
        );
    }

    /// Cancel a PENDING or RUNNING run. The backend job is deleted best-effort;
    /// a local run stops before its next step.
    pub async fn cancel(&self, run_id: &str) -> Result<FlowRun, OrchestratorError> {
        let mut rejected = None;
        let run = self.mutate(run_id, |run| {
            if run.status.is_terminal() {
                rejected = Some(run.status);
                return;
            }
            run.status = FlowRunStatus::Cancelled;
            run.error = Some("cancelled by operator".to_string());
        });
        let Some(run) = run else {
            return Err(OrchestratorError::NotFound(format!("Flow run '{}'", run_id)));
        };
        if let Some(status) = rejected {
            return Err(OrchestratorError::Conflict(format!(
                "flow run '{}' is already {}",
                run_id, status
            )));
        }
        self.persist(&run).await;

        if let Some(tx) = self
            .cancels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
        {
            let _ = tx.send(true);
        }

        if let Some(job_name) = &run.job_name {
            let job = Job {
                name: job_name.clone(),
                backend: self.backend.name().to_string(),
            };
            if let Err(e) = self.backend.delete_job(&job).await {
                warn!(run_id = %run_id, job = %job_name, error = %e, "Failed to delete cancelled job");
            }
        }
        info!(run_id = %run_id, "Flow run cancelled");
        Ok(run)
    }

    pub fn get(&self, run_id: &str) -> Option<FlowRun> {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned()
    }

    /// Matching runs, newest first.
    pub fn list(&self, filter: &FlowRunFilter) -> Vec<FlowRun> {
        let mut runs: Vec<FlowRun> = self
            .runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }

    /// Wait for a run's background task to finish.
    pub async fn join(&self, run_id: &str) -> Option<FlowRun> {
        let handle = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id);
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(run_id = %run_id, error = %e, "Flow run task failed to join");
            }
        }
        self.get(run_id)
    }

    /// Drop records whose directories were swept.
    pub fn forget(&self, run_ids: &[String]) {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        for id in run_ids {
            runs.remove(id);
        }
    }

    fn mutate(&self, run_id: &str, f: impl FnOnce(&mut FlowRun)) -> Option<FlowRun> {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        let run = runs.get_mut(run_id)?;
        f(run);
        Some(run.clone())
    }

    async fn persist(&self, run: &FlowRun) {
        if let Err(e) = self.artifacts.save_json(&run.run_id, RUN_RECORD, run).await {
            error!(run_id = %run.run_id, error = %e, "Failed to persist flow run record");
        }
    }

    fn job_spec(&self, run: &FlowRun, flow: &FlowConfig, vars: &BTreeMap<String, String>) -> JobSpec {
        let mut name: String = format!("qaflow-{}", run.run_id)
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .take(63)
            .collect();
        while name.ends_with('-') {
            name.pop();
        }

        // Plain variables ride on the command line; secrets only as env
        // entries, which `flow-run` reads back for declared variables.
        let secrets = flow.secret_names();
        let mut env = BTreeMap::new();
        env.insert("QAFLOW_RUN_ID".to_string(), run.run_id.clone());
        env.insert("QAFLOW_FLOW".to_string(), run.flow_name.clone());
        env.insert("QAFLOW_ENV".to_string(), run.env.clone());
        env.insert("QAFLOW_ARTIFACTS_PATH".to_string(), run.artifacts_path.clone());

        let mut command = vec![
            "qaflow".to_string(),
            "flow-run".to_string(),
            run.flow_name.clone(),
            "--env".to_string(),
            run.env.clone(),
            "--run-id".to_string(),
            run.run_id.clone(),
        ];
        for (key, value) in vars {
            if secrets.contains(key) {
                env.insert(var_env_name(key), value.clone());
            } else {
                command.push("--var".to_string());
                command.push(format!("{}={}", key, value));
            }
        }
        for (flag, value) in [("--tenant", &run.tenant), ("--project", &run.project)] {
            if let Some(value) = value {
                command.push(flag.to_string());
                command.push(value.clone());
            }
        }
        for tag in &run.tags {
            command.push("--tag".to_string());
            command.push(tag.clone());
        }
        if run.force_allow_prod {
            command.push("--force-allow-prod".to_string());
        }

        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "qaflow".to_string());
        labels.insert("qaflow/run-id".to_string(), run.run_id.clone());
        labels.insert("qaflow/flow".to_string(), run.flow_name.clone());

        JobSpec {
            name,
            image: flow.image.clone().unwrap_or_else(|| self.settings.image.clone()),
            command,
            env,
            labels,
            cpu: self.settings.cpu.clone(),
            memory: self.settings.memory.clone(),
        }
    }
}
