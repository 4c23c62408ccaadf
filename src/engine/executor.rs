use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::handlers::{HandlerRegistry, StepDeps, parse_credentials};
use crate::engine::types::*;
use crate::errors::{OrchestratorError, StepError};
use crate::storage::RunRegistry;

/// Hard stop for a single `advance` call; a cycle of non-WAIT states would
/// otherwise spin forever.
pub const MAX_AUTO_TRANSITIONS: usize = 64;

/// Handle to a run's driving task. Dropping it detaches the task.
pub type RunDriver = JoinHandle<Result<RunContext, OrchestratorError>>;

/// Drives interactive runs through their state machine.
///
/// `advance` runs handlers until the run reaches a WAIT_* or terminal state.
/// Calls for the same run are serialized; different runs proceed in parallel.
/// The `spawn_*` variants give each drive its own task, so a caller that goes
/// away never strands a run between steps.
pub struct RunEngine {
    registry: Arc<RunRegistry>,
    handlers: Arc<HandlerRegistry>,
    deps: StepDeps,
    drivers: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RunEngine {
    pub fn new(registry: Arc<RunRegistry>, handlers: Arc<HandlerRegistry>, deps: StepDeps) -> Self {
        Self {
            registry,
            handlers,
            deps,
            drivers: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    fn driver_lock(&self, run_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.drivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(run_id.to_string())
            .or_default()
            .clone()
    }

    /// Advance the run on its own task.
    pub fn spawn_advance(self: &Arc<Self>, run_id: &str) -> RunDriver {
        let engine = Arc::clone(self);
        let owned = run_id.to_string();
        spawn_driver(run_id, async move { engine.advance(&owned).await })
    }

    /// Fold an answer and advance on the run's own task.
    pub fn spawn_answer(self: &Arc<Self>, run_id: &str, answer: Answer) -> RunDriver {
        let engine = Arc::clone(self);
        let owned = run_id.to_string();
        spawn_driver(run_id, async move { engine.submit_answer(&owned, answer).await })
    }

    /// Re-drive persisted runs that a previous process left between steps.
    /// Runs waiting on a question or already finished are left alone.
    pub async fn resume_interrupted(self: &Arc<Self>) -> Result<Vec<String>, OrchestratorError> {
        let mut resumed = Vec::new();
        for ctx in self.registry.list().await? {
            if ctx.state.is_wait() || ctx.state.is_terminal() {
                continue;
            }
            info!(run_id = %ctx.run_id, state = %ctx.state, "Resuming interrupted run");
            // Detached; the run's own task carries it from here.
            drop(self.spawn_advance(&ctx.run_id));
            resumed.push(ctx.run_id);
        }
        Ok(resumed)
    }

    /// Run handlers until the run needs input or is finished.
    pub async fn advance(&self, run_id: &str) -> Result<RunContext, OrchestratorError> {
        let lock = self.driver_lock(run_id);
        let _guard = lock.lock().await;
        self.drive(run_id).await
    }

    /// Fold an answer into the run, resume at the recorded state and advance.
    pub async fn submit_answer(
        &self,
        run_id: &str,
        answer: Answer,
    ) -> Result<RunContext, OrchestratorError> {
        let lock = self.driver_lock(run_id);
        let _guard = lock.lock().await;

        let mut ctx = self.registry.get(run_id).await?;
        let Some(question) = ctx.question.clone() else {
            return Err(OrchestratorError::InvalidAnswer(format!(
                "run '{}' has no pending question (state {})",
                run_id, ctx.state
            )));
        };
        if question.id != answer.question_id {
            return Err(OrchestratorError::InvalidAnswer(format!(
                "answer is for '{}' but the pending question is '{}'",
                answer.question_id, question.id
            )));
        }

        let Some(resume) = ctx.resume.clone() else {
            error!(run_id = %run_id, state = %ctx.state, "Pending question has no resume marker");
            return Err(OrchestratorError::Internal(anyhow::anyhow!(
                "run '{}' has a pending question but no resume marker",
                run_id
            )));
        };
        let waiting = ctx.state;
        let target = fold_answer(&mut ctx, &question, &resume, &answer)?;

        ctx.question = None;
        ctx.resume = None;
        ctx.log_line(format!("{} answered; resuming at {}", question.topic(), target));
        if target == RunState::Failed && ctx.last_error.is_none() {
            ctx.last_error = Some("aborted by operator".to_string());
        }
        ctx.enter(target);
        info!(run_id = %run_id, from = %waiting, to = %target, "Answer accepted");

        let ctx = self.registry.save(ctx).await?;
        if target.is_terminal() {
            self.close_session(&ctx.run_id).await;
            return Ok(ctx);
        }
        self.drive(run_id).await
    }

    async fn drive(&self, run_id: &str) -> Result<RunContext, OrchestratorError> {
        let mut ctx = self.registry.get(run_id).await?;
        let mut transitions = 0;

        while !ctx.state.is_wait() && !ctx.state.is_terminal() {
            if transitions >= MAX_AUTO_TRANSITIONS {
                error!(run_id = %run_id, state = %ctx.state, "Transition limit reached");
                let outcome = StepOutcome::fail(format!(
                    "exceeded {} automatic transitions at {}",
                    MAX_AUTO_TRANSITIONS, ctx.state
                ));
                return self.apply(ctx, outcome).await;
            }
            transitions += 1;

            let state = ctx.state;
            let outcome = match self.handlers.get(state) {
                Some(handler) => {
                    debug!(run_id = %run_id, state = %state, "Running handler");
                    let result = AssertUnwindSafe(handler.handle(&ctx, &self.deps))
                        .catch_unwind()
                        .await;
                    match result {
                        Ok(Ok(outcome)) => outcome,
                        Ok(Err(err)) => self.outcome_from_error(&ctx, err).await,
                        Err(_) => {
                            self.outcome_from_error(
                                &ctx,
                                anyhow::anyhow!("handler for {} panicked", state),
                            )
                            .await
                        }
                    }
                }
                None => StepOutcome::fail(format!("no handler registered for {}", state)),
            };

            // Credentials are single-use; they never survive the attempt.
            if state == RunState::LoginAttempt {
                ctx.auth.password = None;
            }
            ctx = self.apply(ctx, outcome).await?;
        }
        Ok(ctx)
    }

    /// Map a handler error to an outcome: recoverable errors become a
    /// question, anything else fails the run with evidence.
    async fn outcome_from_error(&self, ctx: &RunContext, err: anyhow::Error) -> StepOutcome {
        let state = ctx.state;
        let label = format!("error_{}", state.as_str().to_lowercase());
        let shot = self.deps.capture_evidence(&ctx.run_id, &label).await;

        if let Some(StepError::Recoverable {
            wait_state,
            resume_state,
            kind,
            prompt,
            options,
        }) = err.downcast_ref::<StepError>()
        {
            warn!(run_id = %ctx.run_id, state = %state, error = %prompt, "Recoverable step error");
            let question = Question::new("recover", *kind, prompt.clone())
                .with_options(options.clone())
                .with_screenshot(shot);
            let mut resume = ResumeMarker::to(*resume_state);
            if *kind == QuestionKind::Confirm {
                resume = resume.on("no", RunState::Failed);
            }
            let patch = ContextPatch {
                last_error: Some(prompt.clone()),
                ..ContextPatch::default()
            };
            return StepOutcome::ask(*wait_state, question, resume)
                .with_status(OutcomeStatus::Failed)
                .with_patch(patch);
        }

        let detail = format!("{:#}", err);
        error!(run_id = %ctx.run_id, state = %state, error = %detail, "Step failed");
        let mut outcome = StepOutcome::fail(format!("{}: {}", state, detail));
        if let Some(path) = shot {
            outcome.patch = outcome.patch.log(format!("failure screenshot: {}", path));
        }
        outcome
    }

    /// Fold an outcome into the context, persist, and return the new snapshot.
    async fn apply(
        &self,
        mut ctx: RunContext,
        outcome: StepOutcome,
    ) -> Result<RunContext, OrchestratorError> {
        let from = ctx.state;
        let StepOutcome {
            status,
            next_state,
            question,
            resume,
            patch,
        } = outcome;
        patch.apply(&mut ctx);

        let next_state = match (question, next_state.is_wait()) {
            (Some(question), true) => {
                ctx.question = Some(question);
                ctx.resume = Some(resume.unwrap_or_else(|| ResumeMarker::to(from)));
                next_state
            }
            (None, false) => {
                ctx.question = None;
                ctx.resume = None;
                next_state
            }
            (Some(_), false) | (None, true) => {
                ctx.question = None;
                ctx.resume = None;
                ctx.last_error = Some(format!(
                    "handler for {} returned an invalid outcome for {}",
                    from, next_state
                ));
                RunState::Failed
            }
        };

        if next_state == RunState::Failed && ctx.last_error.is_none() {
            ctx.last_error = Some(format!("failed at {}", from));
        }
        ctx.enter(next_state);
        ctx.log_line(match status {
            OutcomeStatus::Passed => format!("{} -> {}", from, next_state),
            OutcomeStatus::Failed => format!("{} -> {} (failed)", from, next_state),
            OutcomeStatus::Loop => format!("{} -> {} (loop)", from, next_state),
        });

        match status {
            OutcomeStatus::Loop => {
                warn!(run_id = %ctx.run_id, from = %from, to = %next_state, "Loop detected")
            }
            _ => info!(run_id = %ctx.run_id, from = %from, to = %next_state, "Transition"),
        }

        let ctx = self.registry.save(ctx).await?;
        if next_state.is_terminal() {
            self.close_session(&ctx.run_id).await;
        }
        Ok(ctx)
    }

    async fn close_session(&self, run_id: &str) {
        if let Err(e) = self.deps.browser.close_session(run_id).await {
            warn!(run_id = %run_id, error = %e, "Failed to close browser session");
        }
    }
}

/// Validate an answer against its question and fold it into the context.
/// Returns the state to resume at; the context is left untouched on error.
fn fold_answer(
    ctx: &mut RunContext,
    question: &Question,
    resume: &ResumeMarker,
    answer: &Answer,
) -> Result<RunState, OrchestratorError> {
    let choice = answer.choice();
    let invalid = |msg: String| -> Result<RunState, OrchestratorError> {
        Err(OrchestratorError::InvalidAnswer(msg))
    };

    match question.kind {
        QuestionKind::Confirm => {
            let normalized = normalize_choice(choice);
            if normalized != "yes" && normalized != "no" {
                return invalid(format!("expected yes or no, got '{}'", choice));
            }
            return Ok(resume.target(&normalized));
        }
        QuestionKind::SelectOne => {
            let head = choice.split(':').next().unwrap_or_default().trim();
            let canonical = question
                .options
                .iter()
                .find(|o| o.eq_ignore_ascii_case(head))
                .cloned();
            let Some(canonical) = canonical else {
                return invalid(format!(
                    "'{}' is not one of: {}",
                    choice,
                    question.options.join(", ")
                ));
            };
            match ctx.state {
                RunState::WaitContextInput => {
                    ctx.selected_context = Some(canonical.clone());
                    ctx.context_selector = answer.selector.clone();
                    ctx.context_applied = false;
                }
                RunState::WaitTestIntent => {
                    ctx.test_intent = Some(TestIntent::parse(choice));
                }
                RunState::WaitTestIntentModule => {
                    let intent = ctx.test_intent.get_or_insert_with(|| TestIntent {
                        kind: IntentKind::Module,
                        module: None,
                        notes: None,
                    });
                    intent.kind = IntentKind::Module;
                    intent.module = Some(canonical.clone());
                }
                RunState::WaitLoginConfirm => {
                    // Leaving the login loop starts the attempt count afresh.
                    ctx.login_attempts = 0;
                }
                _ => {}
            }
            return Ok(resume.target(&canonical));
        }
        QuestionKind::Text => {}
    }

    // Free text is read from the raw answer only; option_text belongs to choices.
    let text = answer.answer.trim();
    if text.is_empty() {
        return invalid("answer must not be empty".to_string());
    }
    if ctx.state == RunState::WaitLoginInput {
        let Some((username, password)) = parse_credentials(text) else {
            return invalid("expected credentials as username:password".to_string());
        };
        ctx.auth.username = Some(username);
        ctx.auth.password = Some(password);
    }
    Ok(resume.target(text))
}

fn spawn_driver<F>(run_id: &str, drive: F) -> RunDriver
where
    F: Future<Output = Result<RunContext, OrchestratorError>> + Send + 'static,
{
    let run_id = run_id.to_string();
    tokio::spawn(async move {
        let result = drive.await;
        if let Err(e) = &result {
            debug!(run_id = %run_id, error = %e, "Run driver stopped");
        }
        result
    })
}
