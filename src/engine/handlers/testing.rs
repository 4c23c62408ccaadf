use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{StepDeps, StepHandler};
use crate::engine::types::{
    CaseResult, ContextPatch, DiscoverySummary, ExecutionSummary, IntentKind, Question,
    QuestionKind, ResumeMarker, RunContext, RunState, StepOutcome, Tally, TestCase, TestIntent,
    TestPlan, Verdict,
};

/// Builds the test plan from the discovery summary and the chosen intent.
pub struct TestPlanBuildHandler;

impl TestPlanBuildHandler {
    fn ask_module(modules: &[String], prompt: String) -> StepOutcome {
        let question = Question::new("intent_module", QuestionKind::SelectOne, prompt)
            .with_options(modules.to_vec());
        StepOutcome::ask(
            RunState::WaitTestIntentModule,
            question,
            ResumeMarker::to(RunState::TestPlanBuild),
        )
    }

    fn build_cases(
        summary: &DiscoverySummary,
        intent: &TestIntent,
        deps: &StepDeps,
        rejected: &mut Vec<String>,
    ) -> Vec<TestCase> {
        let mut cases = Vec::new();
        for page in &summary.pages {
            if intent.kind == IntentKind::Module && page.module != intent.module {
                continue;
            }
            if intent.kind == IntentKind::Smoke && !page.healthy {
                continue;
            }
            let page_title = page.title.clone().unwrap_or_else(|| page.url.clone());
            cases.push(TestCase {
                id: String::new(),
                title: format!("{} loads", page_title),
                page_url: page.url.clone(),
                module: page.module.clone(),
                feature_type: "page_load".to_string(),
                config: serde_json::json!({}),
            });
            if intent.kind == IntentKind::Smoke {
                continue;
            }
            for feature in &page.features {
                if let Err(e) = deps
                    .plugins
                    .validate_config(&feature.feature_type, &feature.config)
                {
                    rejected.push(format!("{} on {}: {:#}", feature.label, page.url, e));
                    continue;
                }
                cases.push(TestCase {
                    id: String::new(),
                    title: format!("{} {} on {}", feature.feature_type, feature.label, page_title),
                    page_url: page.url.clone(),
                    module: page.module.clone(),
                    feature_type: feature.feature_type.clone(),
                    config: feature.config.clone(),
                });
            }
        }
        for (i, case) in cases.iter_mut().enumerate() {
            case.id = format!("TC-{:03}", i + 1);
        }
        cases
    }
}

#[async_trait]
impl StepHandler for TestPlanBuildHandler {
    fn state(&self) -> RunState {
        RunState::TestPlanBuild
    }

    async fn handle(&self, ctx: &RunContext, deps: &StepDeps) -> Result<StepOutcome> {
        let summary = ctx
            .discovery_summary
            .as_ref()
            .context("Cannot build a plan without discovery results")?;
        let mut intent = ctx.test_intent.clone().unwrap_or_else(TestIntent::smoke);
        let mut patch = ContextPatch::default();

        if intent.kind == IntentKind::Module {
            match &intent.module {
                Some(module) if summary.modules.contains(module) => {}
                Some(module) => {
                    return Ok(Self::ask_module(
                        &summary.modules,
                        format!("Module '{}' was not discovered. Pick one of the modules found.", module),
                    ));
                }
                None if summary.modules.len() > 1 => {
                    return Ok(Self::ask_module(
                        &summary.modules,
                        "Which module should be tested?".to_string(),
                    ));
                }
                None => match summary.modules.first() {
                    Some(only) => intent.module = Some(only.clone()),
                    None => {
                        intent.kind = IntentKind::Full;
                        patch = patch.log("no modules discovered; testing everything");
                    }
                },
            }
        }

        let mut rejected = Vec::new();
        let cases = Self::build_cases(summary, &intent, deps, &mut rejected);
        for reason in &rejected {
            warn!(run_id = %ctx.run_id, reason = %reason, "Dropped test case with invalid config");
            patch = patch.log(format!("dropped case: {}", reason));
        }

        let plan = TestPlan {
            intent: intent.clone(),
            cases,
            created_at: Utc::now(),
        };
        deps.artifacts
            .save_json(&ctx.run_id, "reports/test_plan.json", &plan)
            .await?;

        patch = patch.log(format!("planned {} cases", plan.cases.len()));
        patch.test_intent = Some(intent);
        patch.test_plan = Some(plan);
        Ok(StepOutcome::next(RunState::TestExecute).with_patch(patch))
    }
}

/// Runs every planned case through the page gate.
pub struct TestExecuteHandler;

#[async_trait]
impl StepHandler for TestExecuteHandler {
    fn state(&self) -> RunState {
        RunState::TestExecute
    }

    async fn handle(&self, ctx: &RunContext, deps: &StepDeps) -> Result<StepOutcome> {
        let plan = ctx.test_plan.as_ref().context("No test plan to execute")?;
        let unhealthy: Vec<String> = ctx
            .discovery_summary
            .as_ref()
            .map(|s| {
                s.pages
                    .iter()
                    .filter(|p| !p.healthy)
                    .map(|p| p.url.clone())
                    .collect()
            })
            .unwrap_or_default();

        let browser = Arc::clone(&deps.browser);
        let run_id = ctx.run_id.clone();
        let unhealthy = Arc::new(unhealthy);
        let results = deps
            .page_gate()
            .run_all(plan.cases.clone(), move |case: TestCase| {
                let browser = Arc::clone(&browser);
                let run_id = run_id.clone();
                let unhealthy = Arc::clone(&unhealthy);
                async move {
                    let started = Instant::now();
                    let verdict = if case.feature_type != "page_load"
                        && unhealthy.contains(&case.page_url)
                    {
                        Verdict::skipped("page failed its health check")
                    } else {
                        match browser
                            .validate_feature(&run_id, &case.page_url, &case.feature_type, &case.config)
                            .await
                        {
                            Ok(r) if r.success => Verdict::Passed,
                            Ok(r) => Verdict::failed(
                                r.message.unwrap_or_else(|| "validation failed".to_string()),
                            ),
                            Err(e) => Verdict::failed(format!("{:#}", e)),
                        }
                    };
                    CaseResult {
                        case_id: case.id,
                        title: case.title,
                        feature_type: case.feature_type,
                        verdict,
                        duration_ms: started.elapsed().as_millis() as u64,
                        evidence: Vec::new(),
                    }
                }
            })
            .await;

        let execution = ExecutionSummary::from_results(results);
        info!(
            run_id = %ctx.run_id,
            total = execution.tally.total,
            passed = execution.tally.passed,
            failed = execution.tally.failed,
            skipped = execution.tally.skipped,
            "Execution finished"
        );
        let patch = ContextPatch {
            execution: Some(execution.clone()),
            ..ContextPatch::default()
        }
        .log(format!(
            "executed {} cases: {} passed, {} failed, {} skipped",
            execution.tally.total,
            execution.tally.passed,
            execution.tally.failed,
            execution.tally.skipped
        ));
        Ok(StepOutcome::next(RunState::ReportGenerate).with_patch(patch))
    }
}

/// Final report written to `reports/report.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub base_url: String,
    pub env: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub intent: Option<TestIntent>,
    pub pages_total: usize,
    pub pages_broken: usize,
    #[serde(flatten)]
    pub tally: Tally,
    pub results: Vec<CaseResult>,
    pub generated_at: DateTime<Utc>,
}

pub struct ReportGenerateHandler;

#[async_trait]
impl StepHandler for ReportGenerateHandler {
    fn state(&self) -> RunState {
        RunState::ReportGenerate
    }

    async fn handle(&self, ctx: &RunContext, deps: &StepDeps) -> Result<StepOutcome> {
        let (tally, results) = ctx
            .execution
            .as_ref()
            .map(|e| (e.tally, e.results.clone()))
            .unwrap_or_default();
        let (pages_total, pages_broken) = ctx
            .discovery_summary
            .as_ref()
            .map(|s| (s.total_pages, s.broken_pages))
            .unwrap_or_default();

        let report = RunReport {
            run_id: ctx.run_id.clone(),
            base_url: ctx.base_url.clone(),
            env: ctx.env.clone(),
            context: ctx.selected_context.clone(),
            intent: ctx.test_intent.clone(),
            pages_total,
            pages_broken,
            tally,
            results,
            generated_at: Utc::now(),
        };
        let path = deps
            .artifacts
            .save_json(&ctx.run_id, "reports/report.json", &report)
            .await?;

        let patch = ContextPatch {
            report_path: Some(path.clone()),
            ..ContextPatch::default()
        }
        .log(format!("report written to {}", path));
        Ok(StepOutcome::next(RunState::Done).with_patch(patch))
    }
}
