pub mod guards;
pub mod interpolate;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::artifacts::is_valid_run_id;

pub use guards::GuardPolicy;
pub use interpolate::{interpolate_vars, redact_secrets};

/// A variable a flow accepts at submission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowVariable {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<String>,
    /// Redacted in persisted records.
    #[serde(default)]
    pub secret: bool,
}

/// What a single flow step does. Fields may contain `${var}` placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    Navigate {
        url: String,
    },
    Login {
        username: String,
        password: String,
    },
    SelectContext {
        context: String,
        #[serde(default)]
        selector: Option<String>,
    },
    Crawl {
        #[serde(default)]
        max_pages: Option<usize>,
        #[serde(default)]
        max_depth: Option<u32>,
    },
    ValidateFeature {
        #[serde(default)]
        url: Option<String>,
        feature_type: String,
        #[serde(default)]
        config: serde_json::Value,
    },
    Screenshot {
        #[serde(default)]
        name: Option<String>,
    },
    Wait {
        ms: u64,
    },
}

impl StepAction {
    pub fn kind(&self) -> &'static str {
        match self {
            StepAction::Navigate { .. } => "navigate",
            StepAction::Login { .. } => "login",
            StepAction::SelectContext { .. } => "select_context",
            StepAction::Crawl { .. } => "crawl",
            StepAction::ValidateFeature { .. } => "validate_feature",
            StepAction::Screenshot { .. } => "screenshot",
            StepAction::Wait { .. } => "wait",
        }
    }

    /// Substitute `${var}` placeholders in every string field.
    pub fn interpolate(&self, vars: &BTreeMap<String, String>) -> StepAction {
        let s = |v: &str| interpolate_vars(v, vars);
        match self {
            StepAction::Navigate { url } => StepAction::Navigate { url: s(url) },
            StepAction::Login { username, password } => StepAction::Login {
                username: s(username),
                password: s(password),
            },
            StepAction::SelectContext { context, selector } => StepAction::SelectContext {
                context: s(context),
                selector: selector.as_deref().map(s),
            },
            StepAction::Crawl { .. } | StepAction::Wait { .. } => self.clone(),
            StepAction::ValidateFeature {
                url,
                feature_type,
                config,
            } => StepAction::ValidateFeature {
                url: url.as_deref().map(s),
                feature_type: feature_type.clone(),
                config: interpolate::interpolate_value(config, vars),
            },
            StepAction::Screenshot { name } => StepAction::Screenshot {
                name: name.as_deref().map(s),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStep {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub action: StepAction,
    /// Keep going when this step fails.
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(default)]
    pub timeout_s: Option<u64>,
}

impl FlowStep {
    pub fn display_name(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.action.kind(), index + 1))
    }
}

/// A named, reusable test flow loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Empty means any environment.
    #[serde(default)]
    pub allowed_environments: Vec<String>,
    #[serde(default)]
    pub variables: Vec<FlowVariable>,
    #[serde(default)]
    pub requires_test_account: bool,
    /// Container image for backend execution.
    #[serde(default)]
    pub image: Option<String>,
    /// Whole-run timeout.
    #[serde(default)]
    pub timeout_s: Option<u64>,
    pub steps: Vec<FlowStep>,
}

impl FlowConfig {
    pub fn secret_names(&self) -> Vec<String> {
        self.variables
            .iter()
            .filter(|v| v.secret)
            .map(|v| v.name.clone())
            .collect()
    }

    /// Fill declared variables missing from `vars` via `lookup`, keyed by
    /// [`var_env_name`]. Returns the names filled in.
    pub fn fill_from_env(
        &self,
        vars: &mut BTreeMap<String, String>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Vec<String> {
        let mut filled = Vec::new();
        for var in &self.variables {
            if vars.contains_key(&var.name) {
                continue;
            }
            if let Some(value) = lookup(&var_env_name(&var.name)) {
                vars.insert(var.name.clone(), value);
                filled.push(var.name.clone());
            }
        }
        filled
    }
}

/// Env entry a backend job receives a variable through.
pub fn var_env_name(name: &str) -> String {
    format!("QAFLOW_VAR_{}", name.to_uppercase())
}

/// Request to start a flow run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowRunRequest {
    pub flow_name: String,
    pub env: String,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub force_allow_prod: bool,
    /// Reuse a run id assigned elsewhere (a backend job re-entering the CLI).
    #[serde(default)]
    pub run_id: Option<String>,
}

/// Listing entry for a flow.
#[derive(Debug, Clone, Serialize)]
pub struct FlowSummary {
    pub name: String,
    pub description: Option<String>,
    pub steps: usize,
    pub allowed_environments: Vec<String>,
}

impl From<&FlowConfig> for FlowSummary {
    fn from(flow: &FlowConfig) -> Self {
        Self {
            name: flow.name.clone(),
            description: flow.description.clone(),
            steps: flow.steps.len(),
            allowed_environments: flow.allowed_environments.clone(),
        }
    }
}

/// Where flow definitions come from.
#[async_trait]
pub trait FlowSource: Send + Sync {
    /// Load a flow by name. `Ok(None)` if there is no such flow.
    async fn get(&self, name: &str) -> Result<Option<FlowConfig>>;

    async fn list(&self) -> Result<Vec<FlowSummary>>;
}

/// Flows stored as `<dir>/<name>.yaml` (or `.yml`).
pub struct YamlFlowSource {
    dir: PathBuf,
}

impl YamlFlowSource {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn candidates(&self, name: &str) -> [PathBuf; 2] {
        [
            self.dir.join(format!("{}.yaml", name)),
            self.dir.join(format!("{}.yml", name)),
        ]
    }

    async fn read(path: &Path) -> Result<FlowConfig> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read flow file: {}", path.display()))?;
        serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse flow file: {}", path.display()))
    }
}

#[async_trait]
impl FlowSource for YamlFlowSource {
    async fn get(&self, name: &str) -> Result<Option<FlowConfig>> {
        if !is_valid_run_id(name) {
            return Ok(None);
        }
        for path in self.candidates(name) {
            if tokio::fs::try_exists(&path).await? {
                debug!(flow = %name, path = %path.display(), "Loading flow");
                return Ok(Some(Self::read(&path).await?));
            }
        }
        Ok(None)
    }

    async fn list(&self) -> Result<Vec<FlowSummary>> {
        if !tokio::fs::try_exists(&self.dir).await? {
            return Ok(Vec::new());
        }
        let mut flows = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to read flows dir: {}", self.dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == "yaml" || e == "yml");
            if !is_yaml {
                continue;
            }
            match Self::read(&path).await {
                Ok(flow) => flows.push(FlowSummary::from(&flow)),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable flow"),
            }
        }
        flows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(flows)
    }
}
