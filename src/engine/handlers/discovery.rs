use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tracing::info;

use super::{IntentPolicy, StepDeps, StepHandler};
use crate::engine::types::{
    ContextPatch, DiscoverySummary, PageReport, Question, QuestionKind, ResumeMarker, RunContext,
    RunState, StepOutcome, TestIntent,
};
use crate::providers::DiscoveredPage;

/// Module a page belongs to: the first path segment, or `home` for the root.
pub fn module_of(page_url: &str) -> String {
    url::Url::parse(page_url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.find(|s| !s.is_empty()).map(str::to_string))
        })
        .unwrap_or_else(|| "home".to_string())
}

/// Crawls navigation and health-checks every page found.
pub struct DiscoveryRunHandler;

#[async_trait]
impl StepHandler for DiscoveryRunHandler {
    fn state(&self) -> RunState {
        RunState::DiscoveryRun
    }

    async fn handle(&self, ctx: &RunContext, deps: &StepDeps) -> Result<StepOutcome> {
        let mut pages = deps
            .browser
            .crawl_navigation(&ctx.run_id, &ctx.discovery)
            .await
            .context("Navigation crawl failed")?;
        if pages.is_empty() {
            pages.push(DiscoveredPage {
                url: ctx.current_url.clone().unwrap_or_else(|| ctx.base_url.clone()),
                title: None,
                depth: 0,
            });
        }

        let browser = Arc::clone(&deps.browser);
        let plugins = Arc::clone(&deps.plugins);
        let run_id = ctx.run_id.clone();
        let reports = deps
            .page_gate()
            .run_all(pages, move |page: DiscoveredPage| {
                let browser = Arc::clone(&browser);
                let plugins = Arc::clone(&plugins);
                let run_id = run_id.clone();
                async move {
                    let module = Some(module_of(&page.url));
                    match browser.page_snapshot(&run_id, &page.url).await {
                        Ok(snapshot) => PageReport {
                            healthy: snapshot.is_healthy(),
                            features: plugins.detect_all(&snapshot),
                            title: snapshot.title.or(page.title),
                            status: snapshot.status,
                            error: snapshot.error,
                            url: page.url,
                            module,
                        },
                        Err(e) => PageReport {
                            url: page.url,
                            title: page.title,
                            module,
                            healthy: false,
                            status: None,
                            error: Some(format!("{:#}", e)),
                            features: Vec::new(),
                        },
                    }
                }
            })
            .await;

        let summary = DiscoverySummary::from_pages(reports);
        deps.artifacts
            .save_json(&ctx.run_id, "reports/discovery.json", &summary)
            .await?;

        info!(
            run_id = %ctx.run_id,
            pages = summary.total_pages,
            broken = summary.broken_pages,
            "Discovery complete"
        );
        let patch = ContextPatch {
            discovery_summary: Some(summary.clone()),
            ..ContextPatch::default()
        }
        .log(format!(
            "discovered {} pages ({} healthy, {} broken)",
            summary.total_pages, summary.healthy_pages, summary.broken_pages
        ));
        Ok(StepOutcome::next(RunState::DiscoverySummary).with_patch(patch))
    }
}

pub struct DiscoverySummaryHandler;

#[async_trait]
impl StepHandler for DiscoverySummaryHandler {
    fn state(&self) -> RunState {
        RunState::DiscoverySummary
    }

    async fn handle(&self, ctx: &RunContext, deps: &StepDeps) -> Result<StepOutcome> {
        let summary = ctx
            .discovery_summary
            .as_ref()
            .context("Discovery summary missing")?;

        match deps.intent_policy {
            IntentPolicy::StopAfterDiscovery => Ok(StepOutcome::next(RunState::Done)
                .with_patch(ContextPatch::default().log("stopping after discovery"))),
            IntentPolicy::AutoSmoke => {
                let patch = ContextPatch {
                    test_intent: Some(TestIntent::smoke()),
                    ..ContextPatch::default()
                }
                .log("smoke intent chosen automatically");
                Ok(StepOutcome::next(RunState::TestPlanBuild).with_patch(patch))
            }
            IntentPolicy::Ask if ctx.test_intent.is_some() => {
                Ok(StepOutcome::next(RunState::TestPlanBuild))
            }
            IntentPolicy::Ask => {
                let modules = if summary.modules.is_empty() {
                    "none".to_string()
                } else {
                    summary.modules.join(", ")
                };
                let question = Question::new(
                    "intent",
                    QuestionKind::SelectOne,
                    format!(
                        "Discovered {} pages ({} healthy, {} broken) across modules: {}. What should be tested?",
                        summary.total_pages, summary.healthy_pages, summary.broken_pages, modules
                    ),
                )
                .with_options(vec![
                    "smoke".to_string(),
                    "full".to_string(),
                    "module".to_string(),
                ]);
                Ok(StepOutcome::ask(
                    RunState::WaitTestIntent,
                    question,
                    ResumeMarker::to(RunState::TestPlanBuild),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_of() {
        assert_eq!(module_of("https://app.test/billing/invoices"), "billing");
        assert_eq!(module_of("https://app.test/"), "home");
        assert_eq!(module_of("https://app.test"), "home");
        assert_eq!(module_of("not a url"), "home");
    }
}
