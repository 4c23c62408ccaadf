use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use super::{StepDeps, StepHandler};
use crate::errors::StepError;
use crate::engine::types::{
    AuthType, ContextPatch, OutcomeStatus, Question, QuestionKind, ResumeMarker, RunContext,
    RunState, StepOutcome,
};

/// Consecutive login cycles allowed before the run asks how to proceed.
pub const MAX_LOGIN_ATTEMPTS: u32 = 3;

#[derive(Deserialize)]
struct CredentialsInput {
    username: String,
    #[serde(default)]
    password: String,
}

/// Accepts `{"username":..,"password":..}`, `user:pass`, or user and
/// password on separate lines.
pub fn parse_credentials(input: &str) -> Option<(String, String)> {
    let trimmed = input.trim();
    if trimmed.starts_with('{') {
        let parsed: CredentialsInput = serde_json::from_str(trimmed).ok()?;
        return (!parsed.username.trim().is_empty())
            .then(|| (parsed.username.trim().to_string(), parsed.password));
    }
    let (user, pass) = trimmed
        .split_once('\n')
        .or_else(|| trimmed.split_once(':'))?;
    let user = user.trim();
    if user.is_empty() {
        return None;
    }
    Some((user.to_string(), pass.trim_end_matches('\r').to_string()))
}

fn credentials_question(prompt: impl Into<String>, screenshot: Option<String>) -> Question {
    Question::new("credentials", QuestionKind::Text, prompt).with_screenshot(screenshot)
}

fn ask_credentials(prompt: String, screenshot: Option<String>) -> StepOutcome {
    StepOutcome::ask(
        RunState::WaitLoginInput,
        credentials_question(prompt, screenshot),
        ResumeMarker::to(RunState::LoginAttempt),
    )
}

/// Question raised once login keeps failing or the login page keeps coming back.
fn login_loop(attempts: u32, reason: &str, screenshot: Option<String>) -> StepOutcome {
    let question = Question::new(
        "login_loop",
        QuestionKind::SelectOne,
        format!(
            "Login did not stick after {} attempts ({}). Retry, continue without login, or abort?",
            attempts, reason
        ),
    )
    .with_options(vec![
        "retry".to_string(),
        "continue".to_string(),
        "abort".to_string(),
    ])
    .with_screenshot(screenshot);

    let resume = ResumeMarker::to(RunState::LoginDetect)
        .on("retry", RunState::LoginDetect)
        .on("continue", RunState::ContextDetect)
        .on("abort", RunState::Failed);

    let patch = ContextPatch {
        login_attempts: Some(attempts),
        last_error: Some(format!("login loop: {}", reason)),
        ..ContextPatch::default()
    }
    .log(format!("login loop detected after {} attempts", attempts));

    StepOutcome::ask(RunState::WaitLoginConfirm, question, resume)
        .with_status(OutcomeStatus::Loop)
        .with_patch(patch)
}

/// A login cycle that did not get past the login page.
fn failed_cycle(
    ctx: &RunContext,
    attempts: u32,
    reason: &str,
    screenshot: Option<String>,
) -> StepOutcome {
    if attempts >= MAX_LOGIN_ATTEMPTS {
        warn!(run_id = %ctx.run_id, attempts, reason = %reason, "Login loop detected");
        return login_loop(attempts, reason, screenshot);
    }
    let patch = ContextPatch {
        login_attempts: Some(attempts),
        last_error: Some(reason.to_string()),
        ..ContextPatch::default()
    }
    .log(format!(
        "login attempt {}/{} failed: {}",
        attempts, MAX_LOGIN_ATTEMPTS, reason
    ));
    ask_credentials(
        format!(
            "Login failed ({}). Attempt {} of {}. Enter credentials as username:password.",
            reason, attempts, MAX_LOGIN_ATTEMPTS
        ),
        screenshot,
    )
    .with_status(OutcomeStatus::Failed)
    .with_patch(patch)
}

pub struct SessionCheckHandler;

#[async_trait]
impl StepHandler for SessionCheckHandler {
    fn state(&self) -> RunState {
        RunState::SessionCheck
    }

    async fn handle(&self, ctx: &RunContext, deps: &StepDeps) -> Result<StepOutcome> {
        if ctx.auth.auth_type == AuthType::None {
            return Ok(StepOutcome::next(RunState::ContextDetect)
                .with_patch(ContextPatch::default().log("auth disabled; skipping login")));
        }

        let detection = match deps.browser.detect_login_form(&ctx.run_id).await {
            Ok(d) => d,
            Err(e) => {
                return Err(StepError::retry(
                    RunState::WaitLoginConfirm,
                    RunState::SessionCheck,
                    format!("Session probe failed ({:#}). Retry the check?", e),
                )
                .into());
            }
        };
        if detection.uncertain {
            let shot = deps.capture_evidence(&ctx.run_id, "session_check").await;
            let question = Question::new(
                "session",
                QuestionKind::Confirm,
                "Could not tell whether the session is already authenticated. Is it?",
            )
            .with_screenshot(shot);
            let resume = ResumeMarker::to(RunState::ContextDetect).on("no", RunState::LoginDetect);
            return Ok(StepOutcome::ask(RunState::WaitLoginConfirm, question, resume));
        }

        if detection.present {
            Ok(StepOutcome::next(RunState::LoginDetect))
        } else {
            Ok(StepOutcome::next(RunState::ContextDetect)
                .with_patch(ContextPatch::default().log("existing session is authenticated")))
        }
    }
}

pub struct LoginDetectHandler;

#[async_trait]
impl StepHandler for LoginDetectHandler {
    fn state(&self) -> RunState {
        RunState::LoginDetect
    }

    async fn handle(&self, ctx: &RunContext, deps: &StepDeps) -> Result<StepOutcome> {
        let detection = deps.browser.detect_login_form(&ctx.run_id).await?;
        if !detection.present && !detection.uncertain {
            return Ok(StepOutcome::next(RunState::ContextDetect)
                .with_patch(ContextPatch::default().log("no login form present")));
        }

        if ctx.auth.has_credentials() {
            return Ok(StepOutcome::next(RunState::LoginAttempt));
        }

        let shot = deps.capture_evidence(&ctx.run_id, "login_form").await;
        let url = ctx.current_url.as_deref().unwrap_or(&ctx.base_url);
        Ok(ask_credentials(
            format!(
                "Login form detected at {}. Enter credentials as username:password.",
                url
            ),
            shot,
        ))
    }
}

pub struct LoginAttemptHandler;

#[async_trait]
impl StepHandler for LoginAttemptHandler {
    fn state(&self) -> RunState {
        RunState::LoginAttempt
    }

    async fn handle(&self, ctx: &RunContext, deps: &StepDeps) -> Result<StepOutcome> {
        let (Some(username), Some(password)) = (&ctx.auth.username, &ctx.auth.password) else {
            return Ok(ask_credentials(
                "Credentials are required to continue. Enter them as username:password."
                    .to_string(),
                None,
            ));
        };

        let attempts = ctx.login_attempts + 1;
        let result = deps
            .browser
            .fill_credentials(&ctx.run_id, username, password)
            .await?;

        if result.success {
            info!(run_id = %ctx.run_id, attempts, "Credentials submitted");
            let patch = ContextPatch {
                login_attempts: Some(attempts),
                ..ContextPatch::default()
            }
            .log(format!("credentials submitted for '{}'", username));
            return Ok(StepOutcome::next(RunState::PostLoginValidate).with_patch(patch));
        }

        let reason = result
            .message
            .unwrap_or_else(|| "credentials rejected".to_string());
        let shot = deps.capture_evidence(&ctx.run_id, "login_failed").await;
        Ok(failed_cycle(ctx, attempts, &reason, shot))
    }
}

/// Confirms the login stuck. A login page that comes straight back counts
/// as a failed cycle.
pub struct PostLoginValidateHandler;

#[async_trait]
impl StepHandler for PostLoginValidateHandler {
    fn state(&self) -> RunState {
        RunState::PostLoginValidate
    }

    async fn handle(&self, ctx: &RunContext, deps: &StepDeps) -> Result<StepOutcome> {
        let detection = deps.browser.detect_login_form(&ctx.run_id).await?;
        if detection.present {
            let shot = deps.capture_evidence(&ctx.run_id, "login_bounce").await;
            return Ok(failed_cycle(
                ctx,
                ctx.login_attempts.max(1),
                "login page returned after submit",
                shot,
            ));
        }

        let patch = ContextPatch {
            login_attempts: Some(0),
            ..ContextPatch::default()
        }
        .log("login validated");
        Ok(StepOutcome::next(RunState::ContextDetect).with_patch(patch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_colon_credentials() {
        let (user, pass) = parse_credentials("alice:s3cr:et").unwrap();
        assert_eq!(user, "alice");
        assert_eq!(pass, "s3cr:et");
    }

    #[test]
    fn test_parse_json_and_multiline_credentials() {
        let (user, pass) = parse_credentials(r#"{"username":"bob","password":"pw"}"#).unwrap();
        assert_eq!((user.as_str(), pass.as_str()), ("bob", "pw"));

        let (user, pass) = parse_credentials("carol\nhunter2").unwrap();
        assert_eq!((user.as_str(), pass.as_str()), ("carol", "hunter2"));
    }

    #[test]
    fn test_parse_rejects_missing_username() {
        assert!(parse_credentials(":pw").is_none());
        assert!(parse_credentials("justtext").is_none());
        assert!(parse_credentials(r#"{"username":""}"#).is_none());
    }
}
