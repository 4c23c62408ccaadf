use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;

use super::{
    ActionResult, BrowserActions, DiscoveredPage, ElementInfo, LoginDetection, PageSnapshot,
    PageVisit,
};
use crate::engine::types::DiscoveryOptions;

/// PNG signature; enough for evidence files to classify as screenshots.
const FAKE_PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptedLogin {
    pub username: String,
    pub password: String,
    /// The login form reappears after every successful submit.
    #[serde(default)]
    pub bounce: bool,
    /// The first session probe cannot tell whether the user is logged in.
    #[serde(default)]
    pub uncertain: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptedPage {
    pub path: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub depth: u32,
    #[serde(default)]
    pub elements: Vec<ElementInfo>,
}

/// Declarative description of a fake site, loadable from YAML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SiteScript {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub unreachable: bool,
    #[serde(default)]
    pub login: Option<ScriptedLogin>,
    #[serde(default)]
    pub contexts: Vec<String>,
    #[serde(default)]
    pub pages: Vec<ScriptedPage>,
    /// Feature types whose validation always fails.
    #[serde(default)]
    pub failing_features: Vec<String>,
    #[serde(default)]
    pub snapshot_delay_ms: u64,
}

#[derive(Default)]
struct Session {
    base_url: Option<String>,
    logged_in: bool,
    probed: bool,
    context: Option<String>,
}

/// Deterministic in-process provider driven by a [`SiteScript`].
pub struct ScriptedBrowser {
    script: SiteScript,
    sessions: Mutex<HashMap<String, Session>>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedBrowser {
    pub fn new(script: SiteScript) -> Self {
        Self {
            script,
            sessions: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read site script: {}", path.display()))?;
        let script: SiteScript = serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse site script: {}", path.display()))?;
        Ok(Self::new(script))
    }

    /// Actions recorded so far, as `action:session`.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self, action: &str) -> usize {
        let prefix = format!("{}:", action);
        self.calls()
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    /// Highest number of concurrent `page_snapshot` calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, action: &str, session: &str) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("{}:{}", action, session));
    }

    fn with_session<T>(&self, session: &str, f: impl FnOnce(&mut Session) -> T) -> T {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        f(sessions.entry(session.to_string()).or_default())
    }

    fn page_url(base: &str, path: &str) -> String {
        format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    fn find_page(&self, session: &str, url: &str) -> Option<&ScriptedPage> {
        let base = self.with_session(session, |s| s.base_url.clone()).unwrap_or_default();
        self.script
            .pages
            .iter()
            .find(|p| Self::page_url(&base, &p.path) == url || p.path == url)
    }
}

#[async_trait]
impl BrowserActions for ScriptedBrowser {
    async fn open_session(&self, session: &str, _headless: bool) -> Result<()> {
        self.record("open", session);
        Ok(())
    }

    async fn close_session(&self, session: &str) -> Result<()> {
        self.record("close", session);
        Ok(())
    }

    async fn navigate(&self, session: &str, url: &str) -> Result<PageVisit> {
        self.record("navigate", session);
        if self.script.unreachable {
            bail!("net::ERR_CONNECTION_REFUSED at {}", url);
        }
        self.with_session(session, |s| {
            if s.base_url.is_none() {
                s.base_url = Some(url.to_string());
            }
        });
        Ok(PageVisit {
            url: url.to_string(),
            title: self.script.title.clone(),
            status: Some(200),
        })
    }

    async fn detect_login_form(&self, session: &str) -> Result<LoginDetection> {
        self.record("detect_login_form", session);
        let Some(login) = &self.script.login else {
            return Ok(LoginDetection::default());
        };
        let detection = self.with_session(session, |s| {
            if login.uncertain && !s.probed {
                s.probed = true;
                return LoginDetection {
                    present: false,
                    uncertain: true,
                    evidence: None,
                };
            }
            s.probed = true;
            LoginDetection {
                present: !s.logged_in || login.bounce,
                uncertain: false,
                evidence: None,
            }
        });
        Ok(detection)
    }

    async fn fill_credentials(
        &self,
        session: &str,
        username: &str,
        password: &str,
    ) -> Result<ActionResult> {
        self.record("fill_credentials", session);
        let Some(login) = &self.script.login else {
            return Ok(ActionResult::failed("no login form on page"));
        };
        if login.username == username && login.password == password {
            self.with_session(session, |s| s.logged_in = true);
            Ok(ActionResult::ok())
        } else {
            Ok(ActionResult::failed("Invalid username or password"))
        }
    }

    async fn detect_context_selector(&self, session: &str) -> Result<Vec<String>> {
        self.record("detect_context_selector", session);
        Ok(self.script.contexts.clone())
    }

    async fn select_context(
        &self,
        session: &str,
        name: &str,
        _selector: Option<&str>,
    ) -> Result<ActionResult> {
        self.record("select_context", session);
        if !self.script.contexts.iter().any(|c| c == name) {
            return Ok(ActionResult::failed(format!("context '{}' not offered", name)));
        }
        self.with_session(session, |s| s.context = Some(name.to_string()));
        Ok(ActionResult::ok())
    }

    async fn crawl_navigation(
        &self,
        session: &str,
        limits: &DiscoveryOptions,
    ) -> Result<Vec<DiscoveredPage>> {
        self.record("crawl_navigation", session);
        let base = self.with_session(session, |s| s.base_url.clone()).unwrap_or_default();
        Ok(self
            .script
            .pages
            .iter()
            .filter(|p| p.depth <= limits.max_depth)
            .take(limits.max_pages)
            .map(|p| DiscoveredPage {
                url: Self::page_url(&base, &p.path),
                title: p.title.clone(),
                depth: p.depth,
            })
            .collect())
    }

    async fn page_snapshot(&self, session: &str, url: &str) -> Result<PageSnapshot> {
        self.record("page_snapshot", session);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if self.script.snapshot_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.script.snapshot_delay_ms)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let Some(page) = self.find_page(session, url) else {
            return Ok(PageSnapshot {
                url: url.to_string(),
                status: Some(404),
                error: Some("page not found".to_string()),
                ..PageSnapshot::default()
            });
        };
        Ok(PageSnapshot {
            url: url.to_string(),
            title: page.title.clone(),
            status: Some(page.status.unwrap_or(200)),
            elements: page.elements.clone(),
            error: None,
        })
    }

    async fn validate_feature(
        &self,
        session: &str,
        url: &str,
        feature_type: &str,
        _config: &serde_json::Value,
    ) -> Result<ActionResult> {
        self.record("validate_feature", session);
        if self.script.failing_features.iter().any(|f| f == feature_type) {
            return Ok(ActionResult::failed(format!(
                "{} check failed on {}",
                feature_type, url
            )));
        }
        match self.find_page(session, url) {
            Some(page) if page.status.unwrap_or(200) < 400 => Ok(ActionResult::ok()),
            Some(page) => Ok(ActionResult::failed(format!(
                "page returned {}",
                page.status.unwrap_or_default()
            ))),
            None => Ok(ActionResult::failed(format!("{} not reachable", url))),
        }
    }

    async fn screenshot(&self, session: &str) -> Result<Vec<u8>> {
        self.record("screenshot", session);
        Ok(FAKE_PNG.to_vec())
    }
}
