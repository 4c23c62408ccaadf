use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result, bail};
use tokio::sync::watch;
use tracing::{info, warn};

use super::StepRecord;
use crate::artifacts::{ArtifactKind, ArtifactStore};
use crate::engine::types::{DiscoveryOptions, Tally, Verdict};
use crate::flows::{FlowConfig, StepAction};
use crate::governor::PageGate;
use crate::plugins::PluginRegistry;
use crate::providers::BrowserActions;

/// Outcome of running a flow in-process.
#[derive(Debug, Clone, Default)]
pub struct LocalRun {
    pub steps: Vec<StepRecord>,
    pub cancelled: bool,
    pub timed_out: bool,
    /// First failing step that stopped the run.
    pub error: Option<String>,
}

impl LocalRun {
    pub fn tally(&self) -> Tally {
        Tally::from_verdicts(self.steps.iter().map(|s| &s.verdict))
    }
}

/// Fallback that runs flow steps against the browser provider directly.
pub struct LocalExecutor {
    browser: Arc<dyn BrowserActions>,
    artifacts: Arc<ArtifactStore>,
    plugins: Arc<PluginRegistry>,
    page_parallelism: usize,
}

impl LocalExecutor {
    pub fn new(
        browser: Arc<dyn BrowserActions>,
        artifacts: Arc<ArtifactStore>,
        plugins: Arc<PluginRegistry>,
        page_parallelism: usize,
    ) -> Self {
        Self {
            browser,
            artifacts,
            plugins,
            page_parallelism,
        }
    }

    /// Run every step in order. The whole-run deadline is checked between
    /// steps; cancellation also interrupts the step in flight. Steps that
    /// never ran are recorded as skipped.
    pub async fn execute(
        &self,
        run_id: &str,
        flow: &FlowConfig,
        vars: &BTreeMap<String, String>,
        cancel: &watch::Receiver<bool>,
        run_timeout: Duration,
    ) -> LocalRun {
        let deadline = Instant::now() + run_timeout;
        let mut run = LocalRun::default();
        let mut current_url: Option<String> = vars.get("base_url").cloned();

        if let Err(e) = self.browser.open_session(run_id, true).await {
            warn!(run_id = %run_id, error = %e, "Failed to open browser session");
        }

        let mut stop_reason: Option<String> = None;
        for (index, step) in flow.steps.iter().enumerate() {
            let name = step.display_name(index);
            if let Some(reason) = &stop_reason {
                run.steps.push(StepRecord {
                    name,
                    action: step.action.kind().to_string(),
                    verdict: Verdict::skipped(reason.clone()),
                    duration_ms: 0,
                    evidence: Vec::new(),
                });
                continue;
            }

            if *cancel.borrow() {
                run.cancelled = true;
                stop_reason = Some("run cancelled".to_string());
            } else if Instant::now() >= deadline {
                run.timed_out = true;
                stop_reason = Some("run timed out".to_string());
            }
            if let Some(reason) = &stop_reason {
                run.steps.push(StepRecord {
                    name,
                    action: step.action.kind().to_string(),
                    verdict: Verdict::skipped(reason.clone()),
                    duration_ms: 0,
                    evidence: Vec::new(),
                });
                continue;
            }

            let action = step.action.interpolate(vars);
            let remaining = deadline.saturating_duration_since(Instant::now());
            let limit = step
                .timeout_s
                .map(Duration::from_secs)
                .map_or(remaining, |t| t.min(remaining));
            let started = Instant::now();

            let mut cancel_rx = cancel.clone();
            let cancelled = async move {
                // A dropped sender means nobody can cancel any more.
                if cancel_rx.wait_for(|c| *c).await.is_err() {
                    std::future::pending::<()>().await;
                }
            };
            let step_result = tokio::select! {
                res = tokio::time::timeout(
                    limit,
                    self.run_step(run_id, &name, &action, &mut current_url),
                ) => Some(res),
                _ = cancelled => None,
            };

            let (verdict, evidence) = match step_result {
                Some(Ok(Ok(result))) => result,
                Some(Ok(Err(e))) => (Verdict::failed(format!("{:#}", e)), Vec::new()),
                Some(Err(_)) => {
                    if Instant::now() >= deadline {
                        run.timed_out = true;
                    }
                    (
                        Verdict::failed(format!("step timed out after {}s", limit.as_secs())),
                        Vec::new(),
                    )
                }
                None => {
                    info!(run_id = %run_id, step = %name, "Step interrupted by cancellation");
                    run.cancelled = true;
                    stop_reason = Some("run cancelled".to_string());
                    (Verdict::skipped("run cancelled"), Vec::new())
                }
            };

            info!(run_id = %run_id, step = %name, verdict = %verdict, "Flow step finished");
            if verdict.is_failed() && !step.continue_on_failure {
                run.error = Some(format!("step '{}' {}", name, verdict));
                stop_reason = Some(format!("step '{}' failed", name));
            }
            run.steps.push(StepRecord {
                name,
                action: action.kind().to_string(),
                verdict,
                duration_ms: started.elapsed().as_millis() as u64,
                evidence,
            });
        }

        if let Err(e) = self.browser.close_session(run_id).await {
            warn!(run_id = %run_id, error = %e, "Failed to close browser session");
        }
        run
    }

    async fn run_step(
        &self,
        run_id: &str,
        step_name: &str,
        action: &StepAction,
        current_url: &mut Option<String>,
    ) -> Result<(Verdict, Vec<String>)> {
        match action {
            StepAction::Navigate { url } => {
                let visit = self.browser.navigate(run_id, url).await?;
                *current_url = Some(visit.url.clone());
                match visit.status {
                    Some(status) if status >= 400 => {
                        Ok((Verdict::failed(format!("HTTP {}", status)), Vec::new()))
                    }
                    _ => Ok((Verdict::Passed, Vec::new())),
                }
            }
            StepAction::Login { username, password } => {
                let result = self
                    .browser
                    .fill_credentials(run_id, username, password)
                    .await?;
                if !result.success {
                    let reason = result.message.unwrap_or_else(|| "login failed".to_string());
                    return Ok((Verdict::failed(reason), result.evidence));
                }
                let detection = self.browser.detect_login_form(run_id).await?;
                if detection.present {
                    return Ok((
                        Verdict::failed("login page still shown after submit"),
                        result.evidence,
                    ));
                }
                Ok((Verdict::Passed, result.evidence))
            }
            StepAction::SelectContext { context, selector } => {
                let result = self
                    .browser
                    .select_context(run_id, context, selector.as_deref())
                    .await?;
                Ok(verdict_of(result.success, result.message, result.evidence))
            }
            StepAction::Crawl {
                max_pages,
                max_depth,
            } => {
                let defaults = DiscoveryOptions::default();
                let limits = DiscoveryOptions {
                    max_pages: max_pages.unwrap_or(defaults.max_pages),
                    max_depth: max_depth.unwrap_or(defaults.max_depth),
                };
                let pages = self.browser.crawl_navigation(run_id, &limits).await?;
                let total = pages.len();
                let browser = Arc::clone(&self.browser);
                let owner = run_id.to_string();
                let health = PageGate::new(self.page_parallelism)
                    .run_all(pages, move |page| {
                        let browser = Arc::clone(&browser);
                        let owner = owner.clone();
                        async move {
                            browser
                                .page_snapshot(&owner, &page.url)
                                .await
                                .map(|s| s.is_healthy())
                                .unwrap_or(false)
                        }
                    })
                    .await;
                let broken = health.iter().filter(|ok| !**ok).count();
                if broken > 0 {
                    Ok((
                        Verdict::failed(format!("{} of {} pages unhealthy", broken, total)),
                        Vec::new(),
                    ))
                } else {
                    Ok((Verdict::Passed, Vec::new()))
                }
            }
            StepAction::ValidateFeature {
                url,
                feature_type,
                config,
            } => {
                let Some(target) = url.clone().or_else(|| current_url.clone()) else {
                    bail!("validate_feature needs a url or a preceding navigate step");
                };
                if let Err(e) = self.plugins.validate_config(feature_type, config) {
                    return Ok((Verdict::failed(format!("{:#}", e)), Vec::new()));
                }
                let result = self
                    .browser
                    .validate_feature(run_id, &target, feature_type, config)
                    .await?;
                Ok(verdict_of(result.success, result.message, result.evidence))
            }
            StepAction::Screenshot { name } => {
                let bytes = self.browser.screenshot(run_id).await?;
                let file = format!("{}.png", name.as_deref().unwrap_or(step_name));
                let path = self
                    .artifacts
                    .save_artifact(run_id, &file, &bytes, Some(ArtifactKind::Screenshot))
                    .await
                    .with_context(|| format!("Failed to save screenshot '{}'", file))?;
                Ok((Verdict::Passed, vec![path]))
            }
            StepAction::Wait { ms } => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                Ok((Verdict::Passed, Vec::new()))
            }
        }
    }
}

fn verdict_of(success: bool, message: Option<String>, evidence: Vec<String>) -> (Verdict, Vec<String>) {
    if success {
        (Verdict::Passed, evidence)
    } else {
        (
            Verdict::failed(message.unwrap_or_else(|| "action failed".to_string())),
            evidence,
        )
    }
}
