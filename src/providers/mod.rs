pub mod remote;
pub mod scripted;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engine::types::DiscoveryOptions;

pub use remote::RemoteBrowser;
pub use scripted::{ScriptedBrowser, SiteScript};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageVisit {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoginDetection {
    pub present: bool,
    /// The provider could not tell whether the session is authenticated.
    #[serde(default)]
    pub uncertain: bool,
    #[serde(default)]
    pub evidence: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub evidence: Vec<String>,
}

impl ActionResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            evidence: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredPage {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub depth: u32,
}

/// Minimal element summary a provider reports for a page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementInfo {
    pub tag: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub input_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub elements: Vec<ElementInfo>,
    #[serde(default)]
    pub error: Option<String>,
}

impl PageSnapshot {
    pub fn is_healthy(&self) -> bool {
        self.error.is_none() && self.status.is_none_or(|s| s < 400)
    }
}

/// Browser-side actions the orchestrator consumes. Implementations own the
/// DOM heuristics; `session` is the run id.
#[async_trait]
pub trait BrowserActions: Send + Sync {
    async fn open_session(&self, _session: &str, _headless: bool) -> Result<()> {
        Ok(())
    }

    async fn close_session(&self, _session: &str) -> Result<()> {
        Ok(())
    }

    async fn navigate(&self, session: &str, url: &str) -> Result<PageVisit>;

    async fn detect_login_form(&self, session: &str) -> Result<LoginDetection>;

    async fn fill_credentials(
        &self,
        session: &str,
        username: &str,
        password: &str,
    ) -> Result<ActionResult>;

    async fn detect_context_selector(&self, session: &str) -> Result<Vec<String>>;

    async fn select_context(
        &self,
        session: &str,
        name: &str,
        selector: Option<&str>,
    ) -> Result<ActionResult>;

    async fn crawl_navigation(
        &self,
        session: &str,
        limits: &DiscoveryOptions,
    ) -> Result<Vec<DiscoveredPage>>;

    async fn page_snapshot(&self, session: &str, url: &str) -> Result<PageSnapshot>;

    async fn validate_feature(
        &self,
        session: &str,
        url: &str,
        feature_type: &str,
        config: &serde_json::Value,
    ) -> Result<ActionResult>;

    async fn screenshot(&self, session: &str) -> Result<Vec<u8>>;
}
