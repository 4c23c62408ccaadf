pub mod backend;
pub mod dispatcher;
pub mod local;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::types::{Tally, Verdict};

pub use backend::{BackendConfig, DisabledBackend, HttpJobBackend};
pub use dispatcher::{DispatcherSettings, FlowRunFilter, JobDispatcher};
pub use local::{LocalExecutor, LocalRun};

/// Lifecycle of a flow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl FlowRunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FlowRunStatus::Pending | FlowRunStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowRunStatus::Pending => "PENDING",
            FlowRunStatus::Running => "RUNNING",
            FlowRunStatus::Completed => "COMPLETED",
            FlowRunStatus::Failed => "FAILED",
            FlowRunStatus::Timeout => "TIMEOUT",
            FlowRunStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for FlowRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(FlowRunStatus::Pending),
            "RUNNING" => Ok(FlowRunStatus::Running),
            "COMPLETED" => Ok(FlowRunStatus::Completed),
            "FAILED" => Ok(FlowRunStatus::Failed),
            "TIMEOUT" => Ok(FlowRunStatus::Timeout),
            "CANCELLED" => Ok(FlowRunStatus::Cancelled),
            _ => Err(format!("Unknown flow run status '{}'", s)),
        }
    }
}

/// Where a flow run actually executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Backend,
    Local,
}

/// Result of one flow step run in-process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub action: String,
    #[serde(flatten)]
    pub verdict: Verdict,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<String>,
}

/// Persisted record of a flow run (`<base>/<run_id>/flow_run.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRun {
    pub run_id: String,
    pub flow_name: String,
    pub env: String,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    /// Resolved variables with secrets redacted.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Production guard was waived by the caller.
    #[serde(default)]
    pub force_allow_prod: bool,
    pub status: FlowRunStatus,
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
    #[serde(default)]
    pub job_name: Option<String>,
    pub artifacts_path: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub tally: Tally,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

/// Final report written next to the run record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowReport {
    pub run_id: String,
    pub flow_name: String,
    pub env: String,
    pub status: FlowRunStatus,
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
    #[serde(flatten)]
    pub tally: Tally,
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

impl From<&FlowRun> for FlowReport {
    fn from(run: &FlowRun) -> Self {
        Self {
            run_id: run.run_id.clone(),
            flow_name: run.flow_name.clone(),
            env: run.env.clone(),
            status: run.status,
            mode: run.mode,
            tally: run.tally,
            steps: run.steps.clone(),
            error: run.error.clone(),
            started_at: run.started_at,
            completed_at: run.completed_at,
            duration_ms: run.duration_ms,
        }
    }
}

/// Everything a backend needs to create an execution unit.
#[derive(Debug, Clone, Serialize)]
pub struct JobSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

/// Handle to a created backend unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub backend: String,
}

/// Pod counts as reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    #[serde(default)]
    pub active: u32,
    #[serde(default)]
    pub succeeded: u32,
    #[serde(default)]
    pub failed: u32,
}

/// Remote execution of flow runs.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn create_job(&self, spec: &JobSpec) -> Result<Job>;

    async fn job_status(&self, job: &Job) -> Result<JobStatus>;

    async fn delete_job(&self, job: &Job) -> Result<()>;
}
