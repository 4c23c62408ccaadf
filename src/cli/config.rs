use std::path::Path;

use anyhow::{Context as _, Result};
use serde::Deserialize;

use crate::dispatch::BackendConfig;

/// Which browser provider drives the runs.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BrowserConfig {
    /// Base URL of a remote browser-action service.
    pub endpoint: Option<String>,
    /// Path to a scripted site definition (YAML).
    pub script: Option<String>,
    pub timeout_s: Option<f64>,
}

/// Configuration loaded from `qaflow.yaml`.
/// All fields are optional; missing fields fall back to CLI/env/defaults.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct QaflowConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub data_dir: Option<String>,
    pub flows_dir: Option<String>,
    pub max_body: Option<usize>,
    pub max_concurrent_runs: Option<usize>,
    pub max_runs_per_key: Option<usize>,
    pub page_parallelism: Option<usize>,
    /// `ask`, `auto_smoke` or `stop_after_discovery`.
    pub intent_policy: Option<String>,
    pub retention_days: Option<u32>,
    /// Seconds a request waits for a run to reach its next question.
    pub driver_wait_s: Option<u64>,
    pub sweep_interval_s: Option<u64>,
    pub production_envs: Option<Vec<String>>,
    pub test_account_marker: Option<String>,
    pub backend: Option<BackendConfig>,
    pub browser: Option<BrowserConfig>,
}

impl QaflowConfig {
    /// Load configuration from a YAML file.
    ///
    /// - If `path` is `Some`, load that specific file (error if missing).
    /// - If `path` is `None`, auto-detect `qaflow.yaml` in cwd; return defaults if absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let default_path = Path::new("qaflow.yaml");
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path.to_path_buf()
            }
        };

        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config file: {}", file_path.display()))?;

        let config: QaflowConfig = serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", file_path.display()))?;

        Ok(config)
    }
}
