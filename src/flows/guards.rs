use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{FlowConfig, FlowRunRequest};
use crate::errors::OrchestratorError;

/// Environment and account rules applied before a flow run takes a slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardPolicy {
    #[serde(default = "default_production_envs")]
    pub production_envs: Vec<String>,
    /// Substring a test account's username must contain.
    #[serde(default = "default_test_account_marker")]
    pub test_account_marker: String,
}

fn default_production_envs() -> Vec<String> {
    vec!["prod".to_string(), "production".to_string()]
}

fn default_test_account_marker() -> String {
    "test".to_string()
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            production_envs: default_production_envs(),
            test_account_marker: default_test_account_marker(),
        }
    }
}

impl GuardPolicy {
    pub fn is_production(&self, env: &str) -> bool {
        self.production_envs
            .iter()
            .any(|p| p.eq_ignore_ascii_case(env))
    }

    /// Environment and test-account checks. `vars` are the resolved variables.
    pub fn check(
        &self,
        flow: &FlowConfig,
        request: &FlowRunRequest,
        vars: &BTreeMap<String, String>,
    ) -> Result<(), OrchestratorError> {
        let env = request.env.as_str();
        if !flow.allowed_environments.is_empty()
            && !flow
                .allowed_environments
                .iter()
                .any(|e| e.eq_ignore_ascii_case(env))
        {
            warn!(flow = %flow.name, env = %env, "Environment not allowed for flow");
            return Err(OrchestratorError::Guard(format!(
                "flow '{}' may not run in '{}' (allowed: {})",
                flow.name,
                env,
                flow.allowed_environments.join(", ")
            )));
        }

        if self.is_production(env) && !request.force_allow_prod {
            warn!(flow = %flow.name, env = %env, "Production run without force flag");
            return Err(OrchestratorError::Guard(format!(
                "'{}' is a production environment; set force_allow_prod to run there",
                env
            )));
        }

        if flow.requires_test_account {
            let username = vars.get("username").map(String::as_str).unwrap_or_default();
            if !username
                .to_lowercase()
                .contains(&self.test_account_marker.to_lowercase())
            {
                warn!(flow = %flow.name, "Flow requires a test account");
                return Err(OrchestratorError::Guard(format!(
                    "flow '{}' requires a test account (username containing '{}')",
                    flow.name, self.test_account_marker
                )));
            }
        }
        Ok(())
    }
}

/// Merge defaults with the provided values and reject missing required ones.
/// `env`, `tenant` and `project` from the request are exposed as variables
/// unless the caller set them explicitly.
pub fn resolve_variables(
    flow: &FlowConfig,
    request: &FlowRunRequest,
) -> Result<BTreeMap<String, String>, OrchestratorError> {
    let mut vars = request.variables.clone();
    vars.entry("env".to_string())
        .or_insert_with(|| request.env.clone());
    if let Some(tenant) = &request.tenant {
        vars.entry("tenant".to_string())
            .or_insert_with(|| tenant.clone());
    }
    if let Some(project) = &request.project {
        vars.entry("project".to_string())
            .or_insert_with(|| project.clone());
    }

    let mut missing = Vec::new();
    for var in &flow.variables {
        if vars.contains_key(&var.name) {
            continue;
        }
        match &var.default {
            Some(default) => {
                vars.insert(var.name.clone(), default.clone());
            }
            None if var.required => missing.push(var.name.clone()),
            None => {}
        }
    }

    if !missing.is_empty() {
        return Err(OrchestratorError::Validation(format!(
            "flow '{}' is missing required variables: {}",
            flow.name,
            missing.join(", ")
        )));
    }
    Ok(vars)
}
