//! Typed error hierarchy for the iteration pipeline.
//!
//! - `ClassificationError`: why the model path was abandoned (always
//!   recovered by the rule fallback, never surfaced to users)
//! - `TriggerError`: an execution request violated its construction rules
//! - `ServiceError`: failures of a prompt submission as seen by handlers

use thiserror::Error;

/// Reasons the model classification path failed.
#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("No classification model configured")]
    ModelUnavailable,

    #[error("Model call timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Model call failed: {0}")]
    ModelCall(#[source] anyhow::Error),

    #[error("Model response is not valid JSON: {0}")]
    MalformedJson(#[source] serde_json::Error),

    #[error("Model response has invalid {field}: {message}")]
    InvalidField { field: &'static str, message: String },
}

/// Errors building or dispatching an execution request.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error(
        "QUESTION classification cannot carry file mutations ({to_create} to create, {to_modify} to modify)"
    )]
    QuestionWithMutation { to_create: usize, to_modify: usize },

    #[error("Execution worker is not configured")]
    WorkerUnavailable,
}

/// Errors from submitting a prompt through the iteration service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Prompt must not be empty")]
    EmptyPrompt,

    #[error("Store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
