mod discovery;
mod login;
mod navigation;
mod testing;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::artifacts::{ArtifactKind, ArtifactStore};
use crate::engine::types::{RunContext, RunState, StepOutcome};
use crate::governor::PageGate;
use crate::plugins::PluginRegistry;
use crate::providers::BrowserActions;

pub use discovery::{DiscoveryRunHandler, DiscoverySummaryHandler, module_of};
pub use login::{
    LoginAttemptHandler, LoginDetectHandler, MAX_LOGIN_ATTEMPTS, PostLoginValidateHandler,
    SessionCheckHandler, parse_credentials,
};
pub use navigation::{ContextDetectHandler, OpenUrlHandler, StartHandler};
pub use testing::{ReportGenerateHandler, RunReport, TestExecuteHandler, TestPlanBuildHandler};

/// What DISCOVERY_SUMMARY does once discovery is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentPolicy {
    /// Ask the operator what to test.
    #[default]
    Ask,
    /// Plan a smoke run without asking.
    AutoSmoke,
    /// End the run in DONE right after discovery.
    StopAfterDiscovery,
}

impl std::str::FromStr for IntentPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ask" => Ok(IntentPolicy::Ask),
            "auto_smoke" => Ok(IntentPolicy::AutoSmoke),
            "stop_after_discovery" => Ok(IntentPolicy::StopAfterDiscovery),
            _ => Err(format!(
                "Invalid intent policy '{}'. Use: ask, auto_smoke, stop_after_discovery",
                s
            )),
        }
    }
}

/// Collaborators available to every handler.
#[derive(Clone)]
pub struct StepDeps {
    pub browser: Arc<dyn BrowserActions>,
    pub artifacts: Arc<ArtifactStore>,
    pub plugins: Arc<PluginRegistry>,
    pub page_parallelism: usize,
    pub intent_policy: IntentPolicy,
}

impl StepDeps {
    /// A fresh gate per invocation, so the bound applies within one run only.
    pub fn page_gate(&self) -> PageGate {
        PageGate::new(self.page_parallelism)
    }

    /// Best-effort screenshot saved into the run's screenshots directory.
    pub async fn capture_evidence(&self, run_id: &str, label: &str) -> Option<String> {
        let bytes = match self.browser.screenshot(run_id).await {
            Ok(b) => b,
            Err(e) => {
                warn!(run_id = %run_id, label = %label, error = %e, "Screenshot failed");
                return None;
            }
        };
        let name = format!("{}_{}.png", label, Utc::now().format("%Y%m%dT%H%M%S%3f"));
        match self
            .artifacts
            .save_artifact(run_id, &name, &bytes, Some(ArtifactKind::Screenshot))
            .await
        {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(run_id = %run_id, label = %label, error = %e, "Saving screenshot failed");
                None
            }
        }
    }
}

/// Trait every state handler implements.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// State this handler drives.
    fn state(&self) -> RunState;

    /// Run the step. Errors are caught by the engine; return
    /// [`crate::errors::StepError::Recoverable`] to ask a human instead of failing.
    async fn handle(&self, ctx: &RunContext, deps: &StepDeps) -> Result<StepOutcome>;
}

/// Registry of state handlers.
pub struct HandlerRegistry {
    handlers: HashMap<RunState, Arc<dyn StepHandler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Create a registry with a handler for every non-WAIT, non-terminal state.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(StartHandler));
        registry.register(Arc::new(OpenUrlHandler));
        registry.register(Arc::new(SessionCheckHandler));
        registry.register(Arc::new(LoginDetectHandler));
        registry.register(Arc::new(LoginAttemptHandler));
        registry.register(Arc::new(PostLoginValidateHandler));
        registry.register(Arc::new(ContextDetectHandler));
        registry.register(Arc::new(DiscoveryRunHandler));
        registry.register(Arc::new(DiscoverySummaryHandler));
        registry.register(Arc::new(TestPlanBuildHandler));
        registry.register(Arc::new(TestExecuteHandler));
        registry.register(Arc::new(ReportGenerateHandler));
        registry
    }

    /// Register a handler, replacing any previous one for the same state.
    pub fn register(&mut self, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(handler.state(), handler);
    }

    pub fn get(&self, state: RunState) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(&state).cloned()
    }
}
