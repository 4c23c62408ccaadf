use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of an interactive run. Persisted as its SCREAMING_SNAKE_CASE name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Start,
    OpenUrl,
    SessionCheck,
    LoginDetect,
    WaitLoginInput,
    WaitLoginConfirm,
    LoginAttempt,
    PostLoginValidate,
    ContextDetect,
    WaitContextInput,
    DiscoveryRun,
    DiscoverySummary,
    WaitTestIntent,
    WaitTestIntentModule,
    TestPlanBuild,
    TestExecute,
    ReportGenerate,
    Done,
    Failed,
}

impl RunState {
    pub const ALL: [RunState; 19] = [
        RunState::Start,
        RunState::OpenUrl,
        RunState::SessionCheck,
        RunState::LoginDetect,
        RunState::WaitLoginInput,
        RunState::WaitLoginConfirm,
        RunState::LoginAttempt,
        RunState::PostLoginValidate,
        RunState::ContextDetect,
        RunState::WaitContextInput,
        RunState::DiscoveryRun,
        RunState::DiscoverySummary,
        RunState::WaitTestIntent,
        RunState::WaitTestIntentModule,
        RunState::TestPlanBuild,
        RunState::TestExecute,
        RunState::ReportGenerate,
        RunState::Done,
        RunState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Start => "START",
            RunState::OpenUrl => "OPEN_URL",
            RunState::SessionCheck => "SESSION_CHECK",
            RunState::LoginDetect => "LOGIN_DETECT",
            RunState::WaitLoginInput => "WAIT_LOGIN_INPUT",
            RunState::WaitLoginConfirm => "WAIT_LOGIN_CONFIRM",
            RunState::LoginAttempt => "LOGIN_ATTEMPT",
            RunState::PostLoginValidate => "POST_LOGIN_VALIDATE",
            RunState::ContextDetect => "CONTEXT_DETECT",
            RunState::WaitContextInput => "WAIT_CONTEXT_INPUT",
            RunState::DiscoveryRun => "DISCOVERY_RUN",
            RunState::DiscoverySummary => "DISCOVERY_SUMMARY",
            RunState::WaitTestIntent => "WAIT_TEST_INTENT",
            RunState::WaitTestIntentModule => "WAIT_TEST_INTENT_MODULE",
            RunState::TestPlanBuild => "TEST_PLAN_BUILD",
            RunState::TestExecute => "TEST_EXECUTE",
            RunState::ReportGenerate => "REPORT_GENERATE",
            RunState::Done => "DONE",
            RunState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }

    /// WAIT_* states always carry exactly one pending question.
    pub fn is_wait(&self) -> bool {
        matches!(
            self,
            RunState::WaitLoginInput
                | RunState::WaitLoginConfirm
                | RunState::WaitContextInput
                | RunState::WaitTestIntent
                | RunState::WaitTestIntentModule
        )
    }

    /// Rough completion percentage along the documented path.
    pub fn progress(&self) -> u8 {
        match self {
            RunState::Start => 0,
            RunState::OpenUrl => 5,
            RunState::SessionCheck => 10,
            RunState::LoginDetect => 15,
            RunState::WaitLoginInput | RunState::WaitLoginConfirm => 18,
            RunState::LoginAttempt => 20,
            RunState::PostLoginValidate => 25,
            RunState::ContextDetect => 30,
            RunState::WaitContextInput => 32,
            RunState::DiscoveryRun => 40,
            RunState::DiscoverySummary => 55,
            RunState::WaitTestIntent | RunState::WaitTestIntentModule => 58,
            RunState::TestPlanBuild => 65,
            RunState::TestExecute => 75,
            RunState::ReportGenerate => 90,
            RunState::Done | RunState::Failed => 100,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunState::ALL
            .iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| format!("Unknown run state '{}'", s))
    }
}

/// How a question expects to be answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    Text,
    SelectOne,
    Confirm,
}

/// A question put to the operator while the run is suspended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
}

impl Question {
    /// Question ids carry a topic prefix (`login_loop-…`) so clients can tell
    /// questions apart without parsing prompts.
    pub fn new(topic: &str, kind: QuestionKind, prompt: impl Into<String>) -> Self {
        Self {
            id: format!("{}-{}", topic, uuid::Uuid::new_v4().simple()),
            kind,
            prompt: prompt.into(),
            options: Vec::new(),
            screenshot: None,
        }
    }

    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    pub fn with_screenshot(mut self, path: Option<String>) -> Self {
        self.screenshot = path;
        self
    }

    pub fn topic(&self) -> &str {
        self.id.rsplit_once('-').map(|(topic, _)| topic).unwrap_or(&self.id)
    }
}

/// Persisted marker telling `submit_answer` where to resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeMarker {
    pub default: RunState,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub by_option: BTreeMap<String, RunState>,
}

impl ResumeMarker {
    pub fn to(state: RunState) -> Self {
        Self {
            default: state,
            by_option: BTreeMap::new(),
        }
    }

    pub fn on(mut self, option: &str, state: RunState) -> Self {
        self.by_option.insert(option.to_lowercase(), state);
        self
    }

    /// Resolve the resume target for the chosen option.
    pub fn target(&self, choice: &str) -> RunState {
        let choice = normalize_choice(choice);
        self.by_option
            .get(&choice)
            .copied()
            .unwrap_or(self.default)
    }
}

/// Lowercase the choice and fold confirm synonyms onto `yes` / `no`.
pub fn normalize_choice(choice: &str) -> String {
    let lower = choice.trim().to_lowercase();
    match lower.as_str() {
        "y" | "true" | "confirm" | "ok" => "yes".to_string(),
        "n" | "false" => "no".to_string(),
        _ => lower,
    }
}

/// Operator's reply to a pending question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub question_id: String,
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub option_text: Option<String>,
}

impl Answer {
    pub fn new(question_id: &str, answer: &str) -> Self {
        Self {
            question_id: question_id.to_string(),
            answer: answer.to_string(),
            selector: None,
            option_text: None,
        }
    }

    /// The option picked: `option_text` when the UI bound one, else the raw answer.
    pub fn choice(&self) -> &str {
        self.option_text
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(self.answer.trim())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    None,
    #[default]
    Form,
}

/// Authentication options. The password lives only in memory.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default, rename = "type")]
    pub auth_type: AuthType,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(skip)]
    pub password: Option<String>,
}

impl AuthConfig {
    pub fn has_credentials(&self) -> bool {
        self.username.as_deref().is_some_and(|u| !u.is_empty()) && self.password.is_some()
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("auth_type", &self.auth_type)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Crawl limits; callers may override per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryOptions {
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
}

fn default_max_pages() -> usize {
    25
}

fn default_max_depth() -> u32 {
    2
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            max_pages: default_max_pages(),
            max_depth: default_max_depth(),
        }
    }
}

/// Options supplied when an interactive run is created.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub headless: bool,
    pub auth: AuthConfig,
    pub discovery: DiscoveryOptions,
}

/// A feature one of the validation plugins recognised on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFeature {
    pub feature_type: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Health-check result for one discovered page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageReport {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub module: Option<String>,
    pub healthy: bool,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub features: Vec<DetectedFeature>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoverySummary {
    pub total_pages: usize,
    pub healthy_pages: usize,
    pub broken_pages: usize,
    pub modules: Vec<String>,
    pub pages: Vec<PageReport>,
}

impl DiscoverySummary {
    pub fn from_pages(pages: Vec<PageReport>) -> Self {
        let healthy_pages = pages.iter().filter(|p| p.healthy).count();
        let mut modules: Vec<String> = pages.iter().filter_map(|p| p.module.clone()).collect();
        modules.sort();
        modules.dedup();
        Self {
            total_pages: pages.len(),
            healthy_pages,
            broken_pages: pages.len() - healthy_pages,
            modules,
            pages,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    Smoke,
    Full,
    Module,
}

/// What the operator wants tested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestIntent {
    pub kind: IntentKind,
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl TestIntent {
    pub fn smoke() -> Self {
        Self {
            kind: IntentKind::Smoke,
            module: None,
            notes: None,
        }
    }

    /// Parse `smoke`, `full`, `module`, `module:<name>` or free text.
    /// Free text falls back to a full run with the text kept as notes.
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        let (head, rest) = match trimmed.split_once(':') {
            Some((head, rest)) => (head.trim().to_lowercase(), Some(rest.trim().to_string())),
            None => (trimmed.to_lowercase(), None),
        };
        match head.as_str() {
            "smoke" => Self::smoke(),
            "full" | "regression" => Self {
                kind: IntentKind::Full,
                module: None,
                notes: None,
            },
            "module" => Self {
                kind: IntentKind::Module,
                module: rest.filter(|m| !m.is_empty()),
                notes: None,
            },
            _ => Self {
                kind: IntentKind::Full,
                module: None,
                notes: Some(trimmed.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub title: String,
    pub page_url: String,
    #[serde(default)]
    pub module: Option<String>,
    pub feature_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestPlan {
    pub intent: TestIntent,
    pub cases: Vec<TestCase>,
    pub created_at: DateTime<Utc>,
}

/// Result of a single check. Every executor returns one of these explicitly;
/// there is no implicit pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    Failed { reason: String },
    Skipped { reason: String },
}

impl Verdict {
    pub fn failed(reason: impl Into<String>) -> Self {
        Verdict::Failed {
            reason: reason.into(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Verdict::Skipped {
            reason: reason.into(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Verdict::Failed { .. })
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Passed => write!(f, "passed"),
            Verdict::Failed { reason } => write!(f, "failed: {}", reason),
            Verdict::Skipped { reason } => write!(f, "skipped: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_id: String,
    pub title: String,
    pub feature_type: String,
    #[serde(flatten)]
    pub verdict: Verdict,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<String>,
}

/// Pass/fail/skip tallies. `total` is always the sum of the other three.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Tally {
    pub fn from_verdicts<'a>(verdicts: impl IntoIterator<Item = &'a Verdict>) -> Self {
        let mut tally = Tally::default();
        for verdict in verdicts {
            match verdict {
                Verdict::Passed => tally.passed += 1,
                Verdict::Failed { .. } => tally.failed += 1,
                Verdict::Skipped { .. } => tally.skipped += 1,
            }
        }
        tally.total = tally.passed + tally.failed + tally.skipped;
        tally
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    #[serde(flatten)]
    pub tally: Tally,
    pub results: Vec<CaseResult>,
}

impl ExecutionSummary {
    pub fn from_results(results: Vec<CaseResult>) -> Self {
        Self {
            tally: Tally::from_verdicts(results.iter().map(|r| &r.verdict)),
            results,
        }
    }
}

/// Full mutable state of one interactive run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: String,
    pub base_url: String,
    pub env: String,
    pub headless: bool,
    #[serde(default)]
    pub auth: AuthConfig,
    pub state: RunState,
    #[serde(default)]
    pub question: Option<Question>,
    #[serde(default)]
    pub resume: Option<ResumeMarker>,
    #[serde(default)]
    pub current_url: Option<String>,
    #[serde(default)]
    pub login_attempts: u32,
    #[serde(default)]
    pub context_candidates: Vec<String>,
    #[serde(default)]
    pub selected_context: Option<String>,
    #[serde(default)]
    pub context_selector: Option<String>,
    #[serde(default)]
    pub context_applied: bool,
    #[serde(default)]
    pub discovery: DiscoveryOptions,
    #[serde(default)]
    pub discovery_summary: Option<DiscoverySummary>,
    #[serde(default)]
    pub test_intent: Option<TestIntent>,
    #[serde(default)]
    pub test_plan: Option<TestPlan>,
    #[serde(default)]
    pub execution: Option<ExecutionSummary>,
    #[serde(default)]
    pub report_path: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub timestamps: BTreeMap<String, DateTime<Utc>>,
    pub artifacts_path: String,
    #[serde(default)]
    pub log: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new(
        run_id: &str,
        base_url: &str,
        env: &str,
        opts: RunOptions,
        artifacts_path: String,
    ) -> Self {
        let now = Utc::now();
        let mut timestamps = BTreeMap::new();
        timestamps.insert(RunState::Start.to_string(), now);
        Self {
            run_id: run_id.to_string(),
            base_url: base_url.to_string(),
            env: env.to_string(),
            headless: opts.headless,
            auth: opts.auth,
            state: RunState::Start,
            question: None,
            resume: None,
            current_url: None,
            login_attempts: 0,
            context_candidates: Vec::new(),
            selected_context: None,
            context_selector: None,
            context_applied: false,
            discovery: opts.discovery,
            discovery_summary: None,
            test_intent: None,
            test_plan: None,
            execution: None,
            report_path: None,
            last_error: None,
            timestamps,
            artifacts_path,
            log: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `state`, keeping the time of first entry.
    pub fn enter(&mut self, state: RunState) {
        let now = Utc::now();
        self.timestamps.entry(state.to_string()).or_insert(now);
        self.state = state;
        self.updated_at = now;
    }

    pub fn log_line(&mut self, line: impl AsRef<str>) {
        self.log.push(format!(
            "[{}] {}",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            line.as_ref()
        ));
    }

    /// Question present iff the run sits in a WAIT_* state.
    pub fn question_invariant_holds(&self) -> bool {
        self.question.is_some() == self.state.is_wait()
            && self.resume.is_some() == self.state.is_wait()
    }
}

/// Status attached to a handler's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Passed,
    Failed,
    Loop,
}

/// Partial update a handler asks the engine to fold into the context.
#[derive(Debug, Clone, Default)]
pub struct ContextPatch {
    pub current_url: Option<String>,
    pub login_attempts: Option<u32>,
    pub context_candidates: Option<Vec<String>>,
    pub selected_context: Option<String>,
    pub context_applied: Option<bool>,
    pub discovery_summary: Option<DiscoverySummary>,
    pub test_intent: Option<TestIntent>,
    pub test_plan: Option<TestPlan>,
    pub execution: Option<ExecutionSummary>,
    pub report_path: Option<String>,
    pub last_error: Option<String>,
    pub log: Vec<String>,
}

impl ContextPatch {
    pub fn log(mut self, line: impl Into<String>) -> Self {
        self.log.push(line.into());
        self
    }

    pub fn apply(self, ctx: &mut RunContext) {
        if let Some(url) = self.current_url {
            ctx.current_url = Some(url);
        }
        if let Some(attempts) = self.login_attempts {
            ctx.login_attempts = attempts;
        }
        if let Some(candidates) = self.context_candidates {
            ctx.context_candidates = candidates;
        }
        if let Some(selected) = self.selected_context {
            ctx.selected_context = Some(selected);
        }
        if let Some(applied) = self.context_applied {
            ctx.context_applied = applied;
        }
        if let Some(summary) = self.discovery_summary {
            ctx.discovery_summary = Some(summary);
        }
        if let Some(intent) = self.test_intent {
            ctx.test_intent = Some(intent);
        }
        if let Some(plan) = self.test_plan {
            ctx.test_plan = Some(plan);
        }
        if let Some(execution) = self.execution {
            ctx.execution = Some(execution);
        }
        if let Some(path) = self.report_path {
            ctx.report_path = Some(path);
        }
        if let Some(err) = self.last_error {
            ctx.last_error = Some(err);
        }
        for line in self.log {
            ctx.log_line(line);
        }
    }
}

/// What a state handler returns to the engine.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub status: OutcomeStatus,
    pub next_state: RunState,
    pub question: Option<Question>,
    pub resume: Option<ResumeMarker>,
    pub patch: ContextPatch,
}

impl StepOutcome {
    /// Continue straight to `next`.
    pub fn next(next: RunState) -> Self {
        Self {
            status: OutcomeStatus::Passed,
            next_state: next,
            question: None,
            resume: None,
            patch: ContextPatch::default(),
        }
    }

    /// Suspend in `wait_state` until `question` is answered.
    pub fn ask(wait_state: RunState, question: Question, resume: ResumeMarker) -> Self {
        Self {
            status: OutcomeStatus::Passed,
            next_state: wait_state,
            question: Some(question),
            resume: Some(resume),
            patch: ContextPatch::default(),
        }
    }

    /// Unrecoverable failure; the run ends in FAILED.
    pub fn fail(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            status: OutcomeStatus::Failed,
            next_state: RunState::Failed,
            question: None,
            resume: None,
            patch: ContextPatch {
                last_error: Some(reason),
                ..ContextPatch::default()
            },
        }
    }

    pub fn with_status(mut self, status: OutcomeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_patch(mut self, patch: ContextPatch) -> Self {
        self.patch = patch;
        self
    }
}
