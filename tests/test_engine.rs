//! Tests for the interactive run engine, driven through the orchestrator
//! against a scripted browser.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use qaflow::app::{AppContext, AppSettings, AuthInput, CreateRunRequest, Orchestrator, RunStatusView};
use qaflow::dispatch::DisabledBackend;
use qaflow::engine::IntentPolicy;
use qaflow::engine::types::*;
use qaflow::errors::OrchestratorError;
use qaflow::flows::YamlFlowSource;
use qaflow::providers::scripted::{ScriptedLogin, ScriptedPage};
use qaflow::providers::{ElementInfo, ScriptedBrowser, SiteScript};
use tempfile::TempDir;

const BASE: &str = "https://app.test";

struct Harness {
    _dir: TempDir,
    data_dir: PathBuf,
    browser: Arc<ScriptedBrowser>,
    orchestrator: Orchestrator,
}

fn page(path: &str, depth: u32, status: Option<u16>, elements: &[&str]) -> ScriptedPage {
    ScriptedPage {
        path: path.to_string(),
        title: Some(path.to_string()),
        status,
        depth,
        elements: elements
            .iter()
            .map(|tag| ElementInfo {
                tag: tag.to_string(),
                ..ElementInfo::default()
            })
            .collect(),
    }
}

fn site() -> SiteScript {
    SiteScript {
        title: Some("Test App".to_string()),
        login: Some(ScriptedLogin {
            username: "qa-test".to_string(),
            password: "secret".to_string(),
            ..ScriptedLogin::default()
        }),
        contexts: vec!["Acme".to_string(), "Globex".to_string()],
        pages: vec![
            page("/", 0, None, &[]),
            page("/billing/invoices", 1, None, &["table"]),
            page("/customers", 1, None, &["form", "input"]),
            page("/broken", 1, Some(500), &[]),
        ],
        ..SiteScript::default()
    }
}

fn open_site() -> SiteScript {
    SiteScript {
        login: None,
        contexts: Vec::new(),
        ..site()
    }
}

fn harness_with(script: SiteScript, settings: impl FnOnce(&mut AppSettings)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("runs");
    let mut app_settings = AppSettings {
        data_dir: data_dir.clone(),
        flows_dir: dir.path().join("flows"),
        ..AppSettings::default()
    };
    settings(&mut app_settings);
    let browser = Arc::new(ScriptedBrowser::new(script));
    let orchestrator = build(app_settings, &browser);
    Harness {
        _dir: dir,
        data_dir,
        browser,
        orchestrator,
    }
}

fn harness(script: SiteScript) -> Harness {
    harness_with(script, |_| {})
}

fn build(settings: AppSettings, browser: &Arc<ScriptedBrowser>) -> Orchestrator {
    let flows = Arc::new(YamlFlowSource::new(&settings.flows_dir));
    let ctx = AppContext::new(
        settings,
        browser.clone(),
        Arc::new(DisabledBackend),
        flows,
    );
    Orchestrator::new(Arc::new(ctx))
}

fn request(run_id: &str) -> CreateRunRequest {
    CreateRunRequest {
        run_id: Some(run_id.to_string()),
        ..CreateRunRequest::new(BASE, "staging")
    }
}

fn no_auth(run_id: &str) -> CreateRunRequest {
    CreateRunRequest {
        auth: Some(AuthInput {
            auth_type: AuthType::None,
            ..AuthInput::default()
        }),
        ..request(run_id)
    }
}

fn topic(view: &RunStatusView) -> &str {
    view.question.as_ref().map(|q| q.topic()).unwrap_or_default()
}

async fn answer(h: &Harness, view: &RunStatusView, text: &str) -> RunStatusView {
    let question = view.question.as_ref().expect("run should be waiting");
    h.orchestrator
        .submit_answer(&view.run_id, Answer::new(&question.id, text))
        .await
        .unwrap()
}

async fn assert_invariant(h: &Harness, run_id: &str) {
    let ctx = h.orchestrator.get_run(run_id).await.unwrap();
    assert!(
        ctx.question_invariant_holds(),
        "question/state mismatch in {}",
        ctx.state
    );
}

// ===== Happy path =====

#[tokio::test]
async fn full_run_reaches_done_with_report() {
    let h = harness(site());

    let view = h.orchestrator.create_interactive_run(request("run-1")).await.unwrap();
    assert_eq!(view.state, RunState::WaitLoginInput);
    assert_eq!(topic(&view), "credentials");
    assert_invariant(&h, "run-1").await;

    let view = answer(&h, &view, "qa-test:secret").await;
    assert_eq!(view.state, RunState::WaitContextInput);
    assert_eq!(topic(&view), "context");
    assert_eq!(
        view.question.as_ref().unwrap().options,
        vec!["Acme".to_string(), "Globex".to_string()]
    );
    assert_invariant(&h, "run-1").await;

    let view = answer(&h, &view, "globex").await;
    assert_eq!(view.state, RunState::WaitTestIntent);
    assert_eq!(topic(&view), "intent");
    assert_invariant(&h, "run-1").await;

    let view = answer(&h, &view, "full").await;
    assert_eq!(view.state, RunState::Done);
    assert!(view.question.is_none());
    assert_eq!(view.report_path.as_deref(), Some("reports/report.json"));
    assert_invariant(&h, "run-1").await;

    let ctx = h.orchestrator.get_run("run-1").await.unwrap();
    assert_eq!(ctx.selected_context.as_deref(), Some("Globex"));
    assert!(ctx.context_applied);
    assert_eq!(ctx.login_attempts, 0);
    assert!(ctx.auth.password.is_none());
    for state in ["START", "OPEN_URL", "LOGIN_ATTEMPT", "DISCOVERY_RUN", "REPORT_GENERATE", "DONE"] {
        assert!(ctx.timestamps.contains_key(state), "missing timestamp {}", state);
    }

    let summary = ctx.discovery_summary.unwrap();
    assert_eq!(summary.total_pages, 4);
    assert_eq!(summary.broken_pages, 1);
    assert_eq!(summary.modules, vec!["billing", "broken", "customers", "home"]);

    let report_file = h.data_dir.join("run-1/reports/report.json");
    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(report_file).unwrap()).unwrap();
    let total = report["total"].as_u64().unwrap();
    let sum = report["passed"].as_u64().unwrap()
        + report["failed"].as_u64().unwrap()
        + report["skipped"].as_u64().unwrap();
    assert_eq!(total, sum);
    assert_eq!(total, 6);
    assert_eq!(report["failed"], 1);
    assert_eq!(report["context"], "Globex");

    assert!(h.browser.calls().contains(&"close:run-1".to_string()));
}

#[tokio::test]
async fn credentials_in_request_skip_the_question() {
    let h = harness(site());
    let req = CreateRunRequest {
        auth: Some(AuthInput {
            auth_type: AuthType::Form,
            username: Some("qa-test".to_string()),
            password: Some("secret".to_string()),
        }),
        ..request("run-1")
    };

    let view = h.orchestrator.create_interactive_run(req).await.unwrap();
    assert_eq!(view.state, RunState::WaitContextInput);
    assert_eq!(h.browser.call_count("fill_credentials"), 1);

    let raw = std::fs::read_to_string(h.data_dir.join("run-1/run_context.json")).unwrap();
    assert!(!raw.contains("secret"));
}

#[tokio::test]
async fn auto_smoke_runs_without_questions() {
    let h = harness_with(open_site(), |s| s.intent_policy = IntentPolicy::AutoSmoke);

    let view = h.orchestrator.create_interactive_run(request("run-1")).await.unwrap();
    assert_eq!(view.state, RunState::Done);

    let ctx = h.orchestrator.get_run("run-1").await.unwrap();
    assert_eq!(ctx.test_intent.unwrap().kind, IntentKind::Smoke);
    let execution = ctx.execution.unwrap();
    // Smoke plans only load the healthy pages.
    assert_eq!(execution.tally.total, 3);
    assert_eq!(execution.tally.passed, 3);
    assert_eq!(h.browser.call_count("fill_credentials"), 0);
}

#[tokio::test]
async fn stop_after_discovery_ends_in_done_without_plan() {
    let h = harness_with(open_site(), |s| {
        s.intent_policy = IntentPolicy::StopAfterDiscovery
    });

    let view = h.orchestrator.create_interactive_run(no_auth("run-1")).await.unwrap();
    assert_eq!(view.state, RunState::Done);

    let ctx = h.orchestrator.get_run("run-1").await.unwrap();
    assert!(ctx.discovery_summary.is_some());
    assert!(ctx.test_plan.is_none());
    assert!(ctx.report_path.is_none());
    assert!(h.data_dir.join("run-1/reports/discovery.json").exists());
    assert_eq!(h.browser.call_count("detect_login_form"), 0);
}

#[tokio::test]
async fn module_intent_asks_which_module() {
    let h = harness(open_site());

    let view = h.orchestrator.create_interactive_run(request("run-1")).await.unwrap();
    assert_eq!(view.state, RunState::WaitTestIntent);

    let view = answer(&h, &view, "module").await;
    assert_eq!(view.state, RunState::WaitTestIntentModule);
    assert_eq!(topic(&view), "intent_module");
    assert_invariant(&h, "run-1").await;

    let view = answer(&h, &view, "billing").await;
    assert_eq!(view.state, RunState::Done);

    let ctx = h.orchestrator.get_run("run-1").await.unwrap();
    let plan = ctx.test_plan.unwrap();
    assert_eq!(plan.intent.module.as_deref(), Some("billing"));
    let kinds: Vec<&str> = plan.cases.iter().map(|c| c.feature_type.as_str()).collect();
    assert_eq!(kinds, vec!["page_load", "table"]);
    assert_eq!(plan.cases[0].id, "TC-001");
}

#[tokio::test]
async fn module_named_in_answer_goes_straight_to_plan() {
    let h = harness(open_site());
    let view = h.orchestrator.create_interactive_run(request("run-1")).await.unwrap();

    let view = answer(&h, &view, "module:customers").await;
    assert_eq!(view.state, RunState::Done);
    let ctx = h.orchestrator.get_run("run-1").await.unwrap();
    assert_eq!(ctx.test_plan.unwrap().cases.len(), 2);
}

// ===== Login loop =====

#[tokio::test]
async fn three_wrong_passwords_raise_login_loop() {
    let h = harness(site());

    let mut view = h.orchestrator.create_interactive_run(request("run-1")).await.unwrap();
    for attempt in 1..=3 {
        assert_eq!(view.state, RunState::WaitLoginInput, "before attempt {}", attempt);
        view = answer(&h, &view, "qa-test:wrong").await;
        assert_invariant(&h, "run-1").await;
    }

    assert_eq!(view.state, RunState::WaitLoginConfirm);
    assert_eq!(topic(&view), "login_loop");
    assert_eq!(
        view.question.as_ref().unwrap().options,
        vec!["retry", "continue", "abort"]
    );
    assert_eq!(h.browser.call_count("fill_credentials"), 3);

    let ctx = h.orchestrator.get_run("run-1").await.unwrap();
    assert_eq!(ctx.login_attempts, 3);
    assert!(ctx
        .log
        .iter()
        .any(|line| line.ends_with("LOGIN_ATTEMPT -> WAIT_LOGIN_CONFIRM (loop)")));
}

#[tokio::test]
async fn login_loop_retry_resets_the_counter() {
    let h = harness(site());
    let mut view = h.orchestrator.create_interactive_run(request("run-1")).await.unwrap();
    for _ in 0..3 {
        view = answer(&h, &view, "qa-test:wrong").await;
    }
    assert_eq!(topic(&view), "login_loop");

    let view = answer(&h, &view, "retry").await;
    assert_eq!(view.state, RunState::WaitLoginInput);
    assert_eq!(h.orchestrator.get_run("run-1").await.unwrap().login_attempts, 0);

    let view = answer(&h, &view, "qa-test:secret").await;
    assert_eq!(view.state, RunState::WaitContextInput);
}

#[tokio::test]
async fn login_loop_continue_and_abort() {
    let h = harness(site());
    let mut view = h.orchestrator.create_interactive_run(request("go-on")).await.unwrap();
    for _ in 0..3 {
        view = answer(&h, &view, "qa-test:wrong").await;
    }
    let view = answer(&h, &view, "Continue").await;
    assert_eq!(view.state, RunState::WaitContextInput);

    let mut view = h.orchestrator.create_interactive_run(request("stop")).await.unwrap();
    for _ in 0..3 {
        view = answer(&h, &view, "qa-test:wrong").await;
    }
    let view = answer(&h, &view, "abort").await;
    assert_eq!(view.state, RunState::Failed);
    assert!(view.last_error.is_some());
    assert!(h.browser.calls().contains(&"close:stop".to_string()));
}

#[tokio::test]
async fn bouncing_login_page_counts_as_failed_cycles() {
    let mut script = site();
    script.login = Some(ScriptedLogin {
        username: "qa-test".to_string(),
        password: "secret".to_string(),
        bounce: true,
        uncertain: false,
    });
    let h = harness(script);

    let mut view = h.orchestrator.create_interactive_run(request("run-1")).await.unwrap();
    for _ in 0..3 {
        assert_eq!(view.state, RunState::WaitLoginInput);
        view = answer(&h, &view, "qa-test:secret").await;
    }
    assert_eq!(view.state, RunState::WaitLoginConfirm);
    assert_eq!(topic(&view), "login_loop");
    assert_eq!(h.browser.call_count("fill_credentials"), 3);
}

#[tokio::test]
async fn malformed_credentials_are_rejected_without_side_effects() {
    let h = harness(site());
    let view = h.orchestrator.create_interactive_run(request("run-1")).await.unwrap();
    let question = view.question.clone().unwrap();

    let err = h
        .orchestrator
        .submit_answer("run-1", Answer::new(&question.id, "no-colon-here"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidAnswer(_)));

    let ctx = h.orchestrator.get_run("run-1").await.unwrap();
    assert_eq!(ctx.state, RunState::WaitLoginInput);
    assert_eq!(ctx.question.unwrap().id, question.id);
    assert_eq!(h.browser.call_count("fill_credentials"), 0);
}

// ===== Session probe =====

#[tokio::test]
async fn uncertain_session_asks_for_confirmation() {
    let mut script = site();
    script.login = Some(ScriptedLogin {
        username: "qa-test".to_string(),
        password: "secret".to_string(),
        bounce: false,
        uncertain: true,
    });
    script.contexts.clear();
    let h = harness_with(script, |s| s.intent_policy = IntentPolicy::StopAfterDiscovery);

    let view = h.orchestrator.create_interactive_run(request("yes-run")).await.unwrap();
    assert_eq!(view.state, RunState::WaitLoginConfirm);
    assert_eq!(topic(&view), "session");
    assert_eq!(view.question.as_ref().unwrap().kind, QuestionKind::Confirm);

    let view = answer(&h, &view, "y").await;
    assert_eq!(view.state, RunState::Done);

    let view = h.orchestrator.create_interactive_run(request("no-run")).await.unwrap();
    let view = answer(&h, &view, "no").await;
    assert_eq!(view.state, RunState::WaitLoginInput);

    let err = h
        .orchestrator
        .submit_answer(
            "no-run",
            Answer::new(&view.question.as_ref().unwrap().id, ""),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidAnswer(_)));
}

// ===== Answers =====

#[tokio::test]
async fn answer_for_another_question_is_rejected() {
    let h = harness(site());
    let view = h.orchestrator.create_interactive_run(request("run-1")).await.unwrap();

    let err = h
        .orchestrator
        .submit_answer("run-1", Answer::new("credentials-stale", "qa-test:secret"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidAnswer(_)));

    let status = h.orchestrator.run_status("run-1").await.unwrap();
    assert_eq!(status.state, view.state);
    assert_eq!(status.question.unwrap().id, view.question.unwrap().id);
}

#[tokio::test]
async fn option_outside_the_list_is_rejected() {
    let h = harness(site());
    let view = h.orchestrator.create_interactive_run(request("run-1")).await.unwrap();
    let view = answer(&h, &view, "qa-test:secret").await;
    assert_eq!(view.state, RunState::WaitContextInput);

    let err = h
        .orchestrator
        .submit_answer(
            "run-1",
            Answer::new(&view.question.as_ref().unwrap().id, "Initech"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidAnswer(_)));
    assert_eq!(h.browser.call_count("select_context"), 0);
}

#[tokio::test]
async fn answering_a_finished_run_is_rejected() {
    let h = harness_with(open_site(), |s| s.intent_policy = IntentPolicy::AutoSmoke);
    h.orchestrator.create_interactive_run(request("run-1")).await.unwrap();

    let err = h
        .orchestrator
        .submit_answer("run-1", Answer::new("anything", "yes"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidAnswer(_)));
}

// ===== Failures =====

#[tokio::test]
async fn unreachable_site_fails_at_open_url() {
    let h = harness(SiteScript {
        unreachable: true,
        ..site()
    });

    let view = h.orchestrator.create_interactive_run(request("run-1")).await.unwrap();
    assert_eq!(view.state, RunState::Failed);
    let error = view.last_error.unwrap();
    assert!(error.starts_with("OPEN_URL"), "{}", error);
    assert!(error.contains("ERR_CONNECTION_REFUSED"));

    let ctx = h.orchestrator.get_run("run-1").await.unwrap();
    assert!(ctx.timestamps.contains_key("FAILED"));
    assert!(!ctx.timestamps.contains_key("SESSION_CHECK"));
    assert!(ctx.question.is_none());
}

#[tokio::test]
async fn invalid_base_url_is_rejected_before_anything_is_stored() {
    let h = harness(site());
    for bad in ["not a url", "ftp://files.test"] {
        let err = h
            .orchestrator
            .create_interactive_run(CreateRunRequest::new(bad, "staging"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)), "{}", bad);
    }
    assert!(h.orchestrator.list_runs().await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_run_id_conflicts() {
    let h = harness(site());
    h.orchestrator.create_interactive_run(request("run-1")).await.unwrap();
    let err = h
        .orchestrator
        .create_interactive_run(request("run-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Conflict(_)));
}

// ===== Concurrency and restart =====

#[tokio::test]
async fn discovery_respects_page_parallelism() {
    let mut script = open_site();
    script.snapshot_delay_ms = 20;
    script.pages.extend((0..6).map(|i| page(&format!("/extra/{}", i), 1, None, &[])));
    let h = harness_with(script, |s| {
        s.page_parallelism = 2;
        s.intent_policy = IntentPolicy::StopAfterDiscovery;
    });

    let view = h.orchestrator.create_interactive_run(request("run-1")).await.unwrap();
    assert_eq!(view.state, RunState::Done);
    assert_eq!(h.browser.call_count("page_snapshot"), 10);
    assert!(h.browser.peak_in_flight() <= 2);
    assert!(h.browser.peak_in_flight() >= 1);
}

#[tokio::test]
async fn waiting_run_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let settings = AppSettings {
        data_dir: dir.path().join("runs"),
        flows_dir: dir.path().join("flows"),
        ..AppSettings::default()
    };

    let first = Arc::new(ScriptedBrowser::new(site()));
    let view = build(settings.clone(), &first)
        .create_interactive_run(request("run-1"))
        .await
        .unwrap();
    let question_id = view.question.unwrap().id;

    // A new process: fresh caches, a browser that already holds the session.
    let second = Arc::new(ScriptedBrowser::new(site()));
    let orchestrator = build(settings, &second);
    let status = orchestrator.run_status("run-1").await.unwrap();
    assert_eq!(status.state, RunState::WaitLoginInput);
    assert_eq!(status.question.as_ref().unwrap().id, question_id);

    let view = orchestrator
        .submit_answer("run-1", Answer::new(&question_id, "qa-test:secret"))
        .await
        .unwrap();
    assert_eq!(view.state, RunState::WaitContextInput);
    assert!(view.message.unwrap().starts_with("answer accepted"));
}

#[tokio::test]
async fn parallel_runs_do_not_interfere() {
    let h = harness_with(open_site(), |s| s.intent_policy = IntentPolicy::AutoSmoke);
    let orchestrator = h.orchestrator.clone();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .create_interactive_run(request(&format!("par-{}", i)))
                    .await
            })
        })
        .collect();
    for handle in handles {
        let view = handle.await.unwrap().unwrap();
        assert_eq!(view.state, RunState::Done);
    }

    let runs = h.orchestrator.list_runs().await.unwrap();
    assert_eq!(runs.len(), 4);
    assert!(runs.iter().all(|r| r.state == RunState::Done));
}

async fn wait_until_settled(orchestrator: &Orchestrator, run_id: &str) -> RunStatusView {
    for _ in 0..500 {
        let status = orchestrator.run_status(run_id).await.unwrap();
        if status.state.is_wait() || status.state.is_terminal() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {} never settled", run_id);
}

// ===== Driver tasks =====

#[tokio::test]
async fn dropped_request_does_not_strand_the_run() {
    let mut script = open_site();
    script.snapshot_delay_ms = 300;
    let h = harness(script);

    let dropped = tokio::time::timeout(
        Duration::from_millis(50),
        h.orchestrator.create_interactive_run(request("run-1")),
    )
    .await;
    assert!(dropped.is_err());

    let status = wait_until_settled(&h.orchestrator, "run-1").await;
    assert_eq!(status.state, RunState::WaitTestIntent);
    assert_eq!(status.question.as_ref().unwrap().topic(), "intent");
    assert_invariant(&h, "run-1").await;
}

#[tokio::test]
async fn slow_run_returns_snapshot_after_driver_wait() {
    let mut script = open_site();
    script.snapshot_delay_ms = 300;
    let h = harness_with(script, |s| s.driver_wait = Duration::from_millis(20));

    let view = h.orchestrator.create_interactive_run(request("run-1")).await.unwrap();
    assert!(!view.state.is_wait());
    assert!(view.question.is_none());

    let status = wait_until_settled(&h.orchestrator, "run-1").await;
    assert_eq!(status.state, RunState::WaitTestIntent);
}

#[tokio::test]
async fn interrupted_run_is_resumed_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let settings = AppSettings {
        data_dir: dir.path().join("runs"),
        flows_dir: dir.path().join("flows"),
        ..AppSettings::default()
    };

    // A process that died in the middle of discovery.
    let first = build(settings.clone(), &Arc::new(ScriptedBrowser::new(open_site())));
    let registry = &first.context().registry;
    registry
        .create("run-1", BASE, "staging", RunOptions::default())
        .await
        .unwrap();
    registry
        .transition_state("run-1", RunState::DiscoveryRun)
        .await
        .unwrap();
    first
        .context()
        .artifacts
        .create_run_directory("run-1")
        .await
        .unwrap();

    let browser = Arc::new(ScriptedBrowser::new(open_site()));
    let restarted = build(settings, &browser);
    let stuck = restarted.run_status("run-1").await.unwrap();
    assert_eq!(stuck.state, RunState::DiscoveryRun);

    let resumed = restarted.resume_interrupted().await.unwrap();
    assert_eq!(resumed, vec!["run-1".to_string()]);

    let status = wait_until_settled(&restarted, "run-1").await;
    assert_eq!(status.state, RunState::WaitTestIntent);
    assert!(browser.call_count("page_snapshot") > 0);

    let question = status.question.unwrap();
    let view = restarted
        .submit_answer("run-1", Answer::new(&question.id, "smoke"))
        .await
        .unwrap();
    assert_eq!(view.state, RunState::Done);

    // Nothing left to resume.
    assert!(restarted.resume_interrupted().await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_resume_marker_is_an_internal_error() {
    let h = harness(site());
    let view = h.orchestrator.create_interactive_run(request("run-1")).await.unwrap();
    let question_id = view.question.unwrap().id;

    h.orchestrator
        .context()
        .registry
        .update("run-1", |ctx| ctx.resume = None)
        .await
        .unwrap();

    let err = h
        .orchestrator
        .submit_answer("run-1", Answer::new(&question_id, "qa-test:secret"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Internal(_)));

    let status = h.orchestrator.run_status("run-1").await.unwrap();
    assert_eq!(status.state, RunState::WaitLoginInput);
    assert_eq!(status.question.unwrap().id, question_id);
}

#[tokio::test]
async fn text_answers_read_only_the_raw_answer() {
    let h = harness(site());
    let view = h.orchestrator.create_interactive_run(request("run-1")).await.unwrap();
    let question_id = view.question.unwrap().id;

    let blank = Answer {
        option_text: Some("qa-test:secret".to_string()),
        ..Answer::new(&question_id, "   ")
    };
    let err = h.orchestrator.submit_answer("run-1", blank).await.unwrap_err();
    match err {
        OrchestratorError::InvalidAnswer(msg) => assert!(msg.contains("must not be empty")),
        other => panic!("expected invalid answer, got {:?}", other),
    }

    let with_option = Answer {
        option_text: Some("ignored".to_string()),
        ..Answer::new(&question_id, "qa-test:secret")
    };
    let view = h.orchestrator.submit_answer("run-1", with_option).await.unwrap();
    assert_eq!(view.state, RunState::WaitContextInput);
}
