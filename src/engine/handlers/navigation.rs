use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tracing::info;

use super::{StepDeps, StepHandler};
use crate::engine::types::{
    ContextPatch, Question, QuestionKind, ResumeMarker, RunContext, RunState, StepOutcome,
};

pub struct StartHandler;

#[async_trait]
impl StepHandler for StartHandler {
    fn state(&self) -> RunState {
        RunState::Start
    }

    async fn handle(&self, ctx: &RunContext, deps: &StepDeps) -> Result<StepOutcome> {
        deps.browser
            .open_session(&ctx.run_id, ctx.headless)
            .await
            .context("Failed to open browser session")?;
        let patch = ContextPatch::default().log(format!("session opened (headless={})", ctx.headless));
        Ok(StepOutcome::next(RunState::OpenUrl).with_patch(patch))
    }
}

pub struct OpenUrlHandler;

#[async_trait]
impl StepHandler for OpenUrlHandler {
    fn state(&self) -> RunState {
        RunState::OpenUrl
    }

    async fn handle(&self, ctx: &RunContext, deps: &StepDeps) -> Result<StepOutcome> {
        let visit = deps
            .browser
            .navigate(&ctx.run_id, &ctx.base_url)
            .await
            .with_context(|| format!("Failed to open {}", ctx.base_url))?;

        if let Some(status) = visit.status.filter(|s| *s >= 400) {
            anyhow::bail!("{} responded with HTTP {}", visit.url, status);
        }

        info!(run_id = %ctx.run_id, url = %visit.url, "Opened target");
        let patch = ContextPatch {
            current_url: Some(visit.url.clone()),
            ..ContextPatch::default()
        }
        .log(format!(
            "opened {} ({})",
            visit.url,
            visit.title.as_deref().unwrap_or("untitled")
        ));
        Ok(StepOutcome::next(RunState::SessionCheck).with_patch(patch))
    }
}

/// Applies a chosen tenant/project context, or asks which one to use.
pub struct ContextDetectHandler;

impl ContextDetectHandler {
    fn ask(ctx: &RunContext, candidates: Vec<String>, prompt: String) -> StepOutcome {
        let question = Question::new("context", QuestionKind::SelectOne, prompt)
            .with_options(candidates.clone());
        let patch = ContextPatch {
            context_candidates: Some(candidates),
            context_applied: Some(false),
            ..ContextPatch::default()
        }
        .log(format!("asking for context on {}", ctx.run_id));
        StepOutcome::ask(
            RunState::WaitContextInput,
            question,
            ResumeMarker::to(RunState::ContextDetect),
        )
        .with_patch(patch)
    }
}

#[async_trait]
impl StepHandler for ContextDetectHandler {
    fn state(&self) -> RunState {
        RunState::ContextDetect
    }

    async fn handle(&self, ctx: &RunContext, deps: &StepDeps) -> Result<StepOutcome> {
        if ctx.context_applied {
            return Ok(StepOutcome::next(RunState::DiscoveryRun));
        }

        if let Some(selected) = &ctx.selected_context {
            let result = deps
                .browser
                .select_context(&ctx.run_id, selected, ctx.context_selector.as_deref())
                .await?;
            if result.success {
                let patch = ContextPatch {
                    context_applied: Some(true),
                    ..ContextPatch::default()
                }
                .log(format!("context '{}' applied", selected));
                return Ok(StepOutcome::next(RunState::DiscoveryRun).with_patch(patch));
            }

            let reason = result.message.unwrap_or_else(|| "selection failed".to_string());
            let candidates = if ctx.context_candidates.is_empty() {
                deps.browser.detect_context_selector(&ctx.run_id).await?
            } else {
                ctx.context_candidates.clone()
            };
            return Ok(Self::ask(
                ctx,
                candidates,
                format!("Could not switch to '{}' ({}). Pick a context.", selected, reason),
            ));
        }

        let candidates = deps.browser.detect_context_selector(&ctx.run_id).await?;
        match candidates.len() {
            0 => Ok(StepOutcome::next(RunState::DiscoveryRun)
                .with_patch(ContextPatch::default().log("no context selector found"))),
            1 => {
                let only = candidates[0].clone();
                let result = deps.browser.select_context(&ctx.run_id, &only, None).await?;
                let patch = ContextPatch {
                    context_candidates: Some(candidates),
                    selected_context: Some(only.clone()),
                    context_applied: Some(result.success),
                    ..ContextPatch::default()
                }
                .log(format!("single context '{}' selected", only));
                Ok(StepOutcome::next(RunState::DiscoveryRun).with_patch(patch))
            }
            n => Ok(Self::ask(
                ctx,
                candidates,
                format!("{} contexts are available. Which one should be tested?", n),
            )),
        }
    }
}
