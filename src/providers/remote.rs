use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use super::{
    ActionResult, BrowserActions, DiscoveredPage, LoginDetection, PageSnapshot, PageVisit,
};
use crate::engine::types::DiscoveryOptions;

/// Talks to an external browser-action service over JSON/HTTP.
///
/// Every action is `POST {endpoint}/sessions/{session}/{action}`.
pub struct RemoteBrowser {
    endpoint: String,
    client: reqwest::Client,
}

impl RemoteBrowser {
    pub fn new(endpoint: &str, timeout_s: f64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(timeout_s))
            .build()?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn call<B: Serialize, T: DeserializeOwned>(
        &self,
        session: &str,
        action: &str,
        body: &B,
    ) -> Result<T> {
        let url = format!("{}/sessions/{}/{}", self.endpoint, session, action);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Browser action '{}' failed", action))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Browser action '{}' returned {}: {}", action, status, text);
        }
        response
            .json::<T>()
            .await
            .with_context(|| format!("Invalid response for browser action '{}'", action))
    }
}

#[async_trait]
impl BrowserActions for RemoteBrowser {
    async fn open_session(&self, session: &str, headless: bool) -> Result<()> {
        let _: serde_json::Value = self
            .call(session, "open", &json!({ "headless": headless }))
            .await?;
        Ok(())
    }

    async fn close_session(&self, session: &str) -> Result<()> {
        let _: serde_json::Value = self.call(session, "close", &json!({})).await?;
        Ok(())
    }

    async fn navigate(&self, session: &str, url: &str) -> Result<PageVisit> {
        self.call(session, "navigate", &json!({ "url": url })).await
    }

    async fn detect_login_form(&self, session: &str) -> Result<LoginDetection> {
        self.call(session, "detect-login-form", &json!({})).await
    }

    async fn fill_credentials(
        &self,
        session: &str,
        username: &str,
        password: &str,
    ) -> Result<ActionResult> {
        self.call(
            session,
            "fill-credentials",
            &json!({ "username": username, "password": password }),
        )
        .await
    }

    async fn detect_context_selector(&self, session: &str) -> Result<Vec<String>> {
        self.call(session, "detect-context-selector", &json!({})).await
    }

    async fn select_context(
        &self,
        session: &str,
        name: &str,
        selector: Option<&str>,
    ) -> Result<ActionResult> {
        self.call(
            session,
            "select-context",
            &json!({ "name": name, "selector": selector }),
        )
        .await
    }

    async fn crawl_navigation(
        &self,
        session: &str,
        limits: &DiscoveryOptions,
    ) -> Result<Vec<DiscoveredPage>> {
        self.call(session, "crawl-navigation", limits).await
    }

    async fn page_snapshot(&self, session: &str, url: &str) -> Result<PageSnapshot> {
        self.call(session, "page-snapshot", &json!({ "url": url })).await
    }

    async fn validate_feature(
        &self,
        session: &str,
        url: &str,
        feature_type: &str,
        config: &serde_json::Value,
    ) -> Result<ActionResult> {
        self.call(
            session,
            "validate-feature",
            &json!({ "url": url, "feature_type": feature_type, "config": config }),
        )
        .await
    }

    async fn screenshot(&self, session: &str) -> Result<Vec<u8>> {
        let url = format!("{}/sessions/{}/screenshot", self.endpoint, session);
        let response = self.client.post(&url).send().await?;
        if !response.status().is_success() {
            bail!("Screenshot returned {}", response.status());
        }
        Ok(response.bytes().await?.to_vec())
    }
}
