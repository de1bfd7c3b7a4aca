//! Typed error hierarchy for pipewatch.
//!
//! Four enums cover the subsystems:
//! - `ClientError`: GitHub API calls (status, jobs, run listing)
//! - `LocateError`: artifact lookup
//! - `DeliveryError`: output channel sends
//! - `OrchestratorError`: terminal failures of one orchestration

use thiserror::Error;

/// Errors from a remote API call.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Connection refused, DNS failure, timeout. Safe to retry.
    #[error("{operation}: transport failure: {message}")]
    Transport { operation: String, message: String },

    /// The service answered with a non-success status.
    #[error("{operation}: rejected with HTTP {status}: {body}")]
    Rejected {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("{operation}: could not decode response: {message}")]
    Decode { operation: String, message: String },
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Transport { .. })
    }
}

/// Errors from the artifact locator.
#[derive(Debug, Clone, Error)]
pub enum LocateError {
    #[error("artifact not found after {attempts} attempt(s); tried: {}", attempted.join(", "))]
    NotFound {
        attempted: Vec<String>,
        attempts: u32,
    },

    #[error("artifact lookup cancelled")]
    Cancelled,
}

/// Errors from sending to an output channel.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    #[error("output channel unreachable: {0}")]
    Transport(String),

    #[error("output channel rejected message with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("message of {len} chars exceeds channel limit of {limit}")]
    TooLong { len: usize, limit: usize },

    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,
}

/// Terminal failures of a single orchestration.
#[derive(Debug, Clone, Error)]
pub enum OrchestratorError {
    #[error("run reference must not be empty")]
    InvalidReference,

    #[error("Failed to trigger workflow: {status} - {body}")]
    TriggerRejected { status: u16, body: String },

    #[error("Failed to trigger workflow: {0}")]
    TriggerTransport(String),

    #[error("Could not find the run triggered for '{reference}' after {attempts} lookup(s)")]
    RunNotResolved { reference: String, attempts: u32 },

    #[error("Stage '{stage}' finished with conclusion '{conclusion}'")]
    StageFailed { stage: String, conclusion: String },

    #[error("Stage '{stage}' did not complete within {iterations} poll(s)")]
    TimedOut { stage: String, iterations: u32 },

    #[error("Polling aborted: {0}")]
    Client(#[from] ClientError),

    #[error(transparent)]
    Artifact(#[from] LocateError),

    #[error("Delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Orchestration cancelled")]
    Cancelled,
}
