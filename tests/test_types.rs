//! Tests for engine types: run states, questions, answers, intents, tallies.

use std::str::FromStr;

use qaflow::engine::types::*;

// --- RunState ---

#[test]
fn run_state_serializes_screaming_snake_case() {
    assert_eq!(
        serde_json::to_value(RunState::WaitLoginConfirm).unwrap(),
        "WAIT_LOGIN_CONFIRM"
    );
    assert_eq!(RunState::PostLoginValidate.to_string(), "POST_LOGIN_VALIDATE");
    let parsed: RunState = serde_json::from_str("\"DISCOVERY_SUMMARY\"").unwrap();
    assert_eq!(parsed, RunState::DiscoverySummary);
}

#[test]
fn run_state_from_str_accepts_any_case() {
    assert_eq!(RunState::from_str("open_url").unwrap(), RunState::OpenUrl);
    assert_eq!(RunState::from_str("DONE").unwrap(), RunState::Done);
    assert!(RunState::from_str("NAPPING").is_err());
}

#[test]
fn every_state_round_trips_through_its_name() {
    for state in RunState::ALL {
        assert_eq!(RunState::from_str(state.as_str()).unwrap(), state);
    }
}

#[test]
fn wait_and_terminal_states_are_disjoint() {
    let waits: Vec<RunState> = RunState::ALL.into_iter().filter(|s| s.is_wait()).collect();
    assert_eq!(waits.len(), 5);
    assert!(waits.iter().all(|s| s.as_str().starts_with("WAIT_")));
    assert!(waits.iter().all(|s| !s.is_terminal()));
    assert!(RunState::Done.is_terminal());
    assert!(RunState::Failed.is_terminal());
}

#[test]
fn progress_is_monotonic_along_the_happy_path() {
    let path = [
        RunState::Start,
        RunState::OpenUrl,
        RunState::SessionCheck,
        RunState::LoginDetect,
        RunState::LoginAttempt,
        RunState::PostLoginValidate,
        RunState::ContextDetect,
        RunState::DiscoveryRun,
        RunState::DiscoverySummary,
        RunState::TestPlanBuild,
        RunState::TestExecute,
        RunState::ReportGenerate,
        RunState::Done,
    ];
    for pair in path.windows(2) {
        assert!(pair[0].progress() < pair[1].progress(), "{:?}", pair);
    }
    assert_eq!(RunState::Done.progress(), 100);
}

// --- Question / Answer ---

#[test]
fn question_ids_carry_their_topic() {
    let q = Question::new("login_loop", QuestionKind::SelectOne, "Retry?");
    assert!(q.id.starts_with("login_loop-"));
    assert_eq!(q.topic(), "login_loop");

    let other = Question::new("login_loop", QuestionKind::SelectOne, "Retry?");
    assert_ne!(q.id, other.id);
}

#[test]
fn question_kind_serializes_as_type() {
    let q = Question::new("context", QuestionKind::SelectOne, "Pick one")
        .with_options(vec!["Acme".to_string(), "Globex".to_string()]);
    let value = serde_json::to_value(&q).unwrap();
    assert_eq!(value["type"], "select_one");
    assert_eq!(value["options"][1], "Globex");
    assert!(value.get("screenshot").is_none());
}

#[test]
fn answer_choice_prefers_option_text() {
    let mut answer = Answer::new("context-1", "2");
    assert_eq!(answer.choice(), "2");
    answer.option_text = Some("Globex".to_string());
    assert_eq!(answer.choice(), "Globex");
    answer.option_text = Some("   ".to_string());
    assert_eq!(answer.choice(), "2");
}

#[test]
fn answer_deserializes_with_optional_fields() {
    let answer: Answer = serde_json::from_str(r#"{"question_id":"q-1","answer":"yes"}"#).unwrap();
    assert_eq!(answer.question_id, "q-1");
    assert!(answer.selector.is_none());
    assert!(answer.option_text.is_none());
}

#[test]
fn confirm_synonyms_normalize() {
    assert_eq!(normalize_choice(" Y "), "yes");
    assert_eq!(normalize_choice("true"), "yes");
    assert_eq!(normalize_choice("N"), "no");
    assert_eq!(normalize_choice("Retry"), "retry");
}

#[test]
fn resume_marker_routes_by_option() {
    let resume = ResumeMarker::to(RunState::LoginDetect)
        .on("continue", RunState::ContextDetect)
        .on("abort", RunState::Failed);
    assert_eq!(resume.target("Continue"), RunState::ContextDetect);
    assert_eq!(resume.target("abort"), RunState::Failed);
    assert_eq!(resume.target("retry"), RunState::LoginDetect);
}

// --- Auth / options ---

#[test]
fn auth_password_is_skipped_by_serde_and_debug() {
    let auth = AuthConfig {
        auth_type: AuthType::Form,
        username: Some("qa-test".to_string()),
        password: Some("hunter2".to_string()),
    };
    let json = serde_json::to_string(&auth).unwrap();
    assert!(!json.contains("hunter2"));
    assert!(!format!("{:?}", auth).contains("hunter2"));
    assert!(auth.has_credentials());

    let back: AuthConfig = serde_json::from_str(&json).unwrap();
    assert!(back.password.is_none());
    assert!(!back.has_credentials());
}

#[test]
fn auth_type_defaults_to_form() {
    let auth: AuthConfig = serde_json::from_str("{}").unwrap();
    assert_eq!(auth.auth_type, AuthType::Form);
    let none: AuthConfig = serde_json::from_str(r#"{"type":"none"}"#).unwrap();
    assert_eq!(none.auth_type, AuthType::None);
}

#[test]
fn discovery_defaults() {
    let opts = DiscoveryOptions::default();
    assert_eq!(opts.max_pages, 25);
    assert_eq!(opts.max_depth, 2);
    let partial: DiscoveryOptions = serde_json::from_str(r#"{"max_pages":5}"#).unwrap();
    assert_eq!(partial.max_pages, 5);
    assert_eq!(partial.max_depth, 2);
}

// --- TestIntent ---

#[test]
fn intent_parsing() {
    assert_eq!(TestIntent::parse("smoke").kind, IntentKind::Smoke);
    assert_eq!(TestIntent::parse("FULL").kind, IntentKind::Full);
    assert_eq!(TestIntent::parse("regression").kind, IntentKind::Full);

    let module = TestIntent::parse("module: billing");
    assert_eq!(module.kind, IntentKind::Module);
    assert_eq!(module.module.as_deref(), Some("billing"));

    let bare = TestIntent::parse("module");
    assert_eq!(bare.kind, IntentKind::Module);
    assert!(bare.module.is_none());

    let free = TestIntent::parse("check the invoice export");
    assert_eq!(free.kind, IntentKind::Full);
    assert_eq!(free.notes.as_deref(), Some("check the invoice export"));
}

// --- Verdict / Tally ---

#[test]
fn verdict_serializes_with_status_tag() {
    let value = serde_json::to_value(Verdict::failed("timeout")).unwrap();
    assert_eq!(value["status"], "failed");
    assert_eq!(value["reason"], "timeout");
    assert_eq!(serde_json::to_value(Verdict::Passed).unwrap()["status"], "passed");
    assert_eq!(Verdict::skipped("blocked").to_string(), "skipped: blocked");
}

#[test]
fn tally_total_is_sum_of_parts() {
    let verdicts = vec![
        Verdict::Passed,
        Verdict::Passed,
        Verdict::failed("x"),
        Verdict::skipped("y"),
    ];
    let tally = Tally::from_verdicts(&verdicts);
    assert_eq!(tally.passed, 2);
    assert_eq!(tally.failed, 1);
    assert_eq!(tally.skipped, 1);
    assert_eq!(tally.total, tally.passed + tally.failed + tally.skipped);

    assert_eq!(Tally::from_verdicts(&Vec::new()), Tally::default());
}

// --- RunContext ---

#[test]
fn run_context_starts_consistent() {
    let ctx = RunContext::new(
        "r1",
        "https://app.test",
        "staging",
        RunOptions::default(),
        "/data/r1".to_string(),
    );
    assert_eq!(ctx.state, RunState::Start);
    assert!(ctx.timestamps.contains_key("START"));
    assert!(ctx.question_invariant_holds());
    assert_eq!(ctx.login_attempts, 0);
}

#[test]
fn question_invariant_detects_mismatch() {
    let mut ctx = RunContext::new(
        "r1",
        "https://app.test",
        "staging",
        RunOptions::default(),
        "/data/r1".to_string(),
    );
    ctx.enter(RunState::WaitContextInput);
    assert!(!ctx.question_invariant_holds());

    ctx.question = Some(Question::new("context", QuestionKind::SelectOne, "Pick"));
    ctx.resume = Some(ResumeMarker::to(RunState::ContextDetect));
    assert!(ctx.question_invariant_holds());

    ctx.enter(RunState::DiscoveryRun);
    assert!(!ctx.question_invariant_holds());
}

#[test]
fn context_patch_applies_only_set_fields() {
    let mut ctx = RunContext::new(
        "r1",
        "https://app.test",
        "staging",
        RunOptions::default(),
        "/data/r1".to_string(),
    );
    ctx.selected_context = Some("Acme".to_string());

    ContextPatch {
        login_attempts: Some(2),
        last_error: Some("bad password".to_string()),
        ..ContextPatch::default()
    }
    .log("attempt failed")
    .apply(&mut ctx);

    assert_eq!(ctx.login_attempts, 2);
    assert_eq!(ctx.last_error.as_deref(), Some("bad password"));
    assert_eq!(ctx.selected_context.as_deref(), Some("Acme"));
    assert!(ctx.log.last().unwrap().ends_with("attempt failed"));
}
