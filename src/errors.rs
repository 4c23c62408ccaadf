//! Typed error hierarchy for the run orchestrator.
//!
//! - `OrchestratorError`: everything the service façade can reject a request with
//! - `StepError`: what a state handler raises when a step cannot complete
//! - `ArtifactError`: artifact store failures, including path escapes

use std::path::PathBuf;

use thiserror::Error;

use crate::engine::types::{QuestionKind, RunState};

/// Errors surfaced to callers of the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Disallowed environment or missing test-account marker. Never retried.
    #[error("Guard rejected run: {0}")]
    Guard(String),

    /// Unknown flow, missing variable, malformed input.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The concurrency governor refused a slot. No slot was consumed.
    #[error("Capacity exhausted: {0}")]
    Capacity(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Answer does not match the pending question.
    #[error("Invalid answer: {0}")]
    InvalidAnswer(String),

    #[error("Security violation: {0}")]
    Security(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<ArtifactError> for OrchestratorError {
    fn from(err: ArtifactError) -> Self {
        match err {
            ArtifactError::PathEscape { .. } => OrchestratorError::Security(err.to_string()),
            ArtifactError::InvalidRunId(id) => {
                OrchestratorError::Validation(format!("invalid run id '{}'", id))
            }
            ArtifactError::NotFound(what) => OrchestratorError::NotFound(what),
            ArtifactError::Io(e) => OrchestratorError::Internal(e.into()),
        }
    }
}

/// Raised by step handlers. The engine downcasts this at its boundary to
/// decide between asking a human and failing the run.
#[derive(Debug, Error)]
pub enum StepError {
    /// An ambiguous or failed external condition a human can resolve.
    #[error("{prompt}")]
    Recoverable {
        wait_state: RunState,
        resume_state: RunState,
        kind: QuestionKind,
        prompt: String,
        options: Vec<String>,
    },

    #[error("{0}")]
    Unrecoverable(String),
}

impl StepError {
    /// Recoverable error that asks the operator to confirm a retry of `resume_state`.
    pub fn retry(wait_state: RunState, resume_state: RunState, prompt: impl Into<String>) -> Self {
        StepError::Recoverable {
            wait_state,
            resume_state,
            kind: QuestionKind::Confirm,
            prompt: prompt.into(),
            options: Vec::new(),
        }
    }
}

/// Artifact store errors.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("path '{requested}' escapes artifact root {root}")]
    PathEscape { requested: String, root: PathBuf },

    #[error("invalid run id '{0}'")]
    InvalidRunId(String),

    #[error("artifact {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
