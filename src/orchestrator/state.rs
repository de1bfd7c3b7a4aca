use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::OrchestratorError;
use crate::github::{RunHandle, RunReference, RunStatus, StageStatus};

/// Where one orchestration is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationState {
    Idle,
    Triggering,
    Waiting,
    Polling,
    Delivering,
    Delivered,
    Failed,
    TimedOut,
    Cancelled,
}

impl OrchestrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Triggering => "triggering",
            Self::Waiting => "waiting",
            Self::Polling => "polling",
            Self::Delivering => "delivering",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Delivered | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    /// Edges of the state machine. Terminal states have no way out.
    pub fn can_transition_to(&self, next: OrchestrationState) -> bool {
        use OrchestrationState::*;
        matches!(
            (self, next),
            (Idle, Triggering)
                | (Triggering, Waiting | Failed | Cancelled)
                | (Waiting, Polling | Failed | Cancelled)
                | (Polling, Delivering | Failed | TimedOut | Cancelled)
                | (Delivering, Delivered | Failed | Cancelled)
        )
    }
}

impl fmt::Display for OrchestrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Poll bookkeeping owned by a single orchestration.
#[derive(Debug, Clone)]
pub struct PollState {
    pub retry_counter: u32,
    pub max_retries: u32,
    pub last_observed: Option<StageStatus>,
    /// Transport failures in a row; reset by any successful query.
    pub consecutive_errors: u32,
}

impl PollState {
    pub fn new(max_retries: u32) -> Self {
        Self {
            retry_counter: 0,
            max_retries,
            last_observed: None,
            consecutive_errors: 0,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.retry_counter >= self.max_retries
    }

    /// Count one status query against the budget.
    pub fn advance(&mut self) {
        if self.retry_counter < self.max_retries {
            self.retry_counter += 1;
        }
    }

    pub fn observe(&mut self, stage: StageStatus) {
        self.consecutive_errors = 0;
        self.last_observed = Some(stage);
    }

    pub fn record_error(&mut self) -> u32 {
        self.consecutive_errors += 1;
        self.consecutive_errors
    }
}

/// Human-readable progress of one orchestration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ProgressEvent {
    Triggering {
        reference: String,
    },
    Triggered {
        reference: String,
    },
    RunResolved {
        run_id: u64,
        html_url: Option<String>,
    },
    StagePolled {
        stage: String,
        lifecycle: String,
        iteration: u32,
        max_retries: u32,
    },
    PollFailed {
        iteration: u32,
        message: String,
    },
    StageSucceeded {
        stage: String,
    },
    Finished {
        state: OrchestrationState,
        summary: String,
    },
}

impl ProgressEvent {
    /// Per-poll heartbeats and the final summary stay off the output
    /// channel; the final report is posted separately.
    pub fn is_for_channel(&self) -> bool {
        !matches!(self, Self::StagePolled { .. } | Self::Finished { .. })
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Triggering { reference } => {
                write!(f, "Triggering analysis for branch: {}", reference)
            }
            Self::Triggered { reference } => {
                write!(f, "Workflow triggered successfully for branch: {}", reference)
            }
            Self::RunResolved { run_id, html_url } => match html_url {
                Some(url) => write!(f, "Tracking run #{} ({})", run_id, url),
                None => write!(f, "Tracking run #{}", run_id),
            },
            Self::StagePolled {
                stage,
                lifecycle,
                iteration,
                max_retries,
            } => write!(
                f,
                "Stage '{}' is {} (check {}/{})",
                stage, lifecycle, iteration, max_retries
            ),
            Self::PollFailed { iteration, message } => {
                write!(f, "Status check {} failed, will retry: {}", iteration, message)
            }
            Self::StageSucceeded { stage } => {
                write!(f, "Stage '{}' succeeded, fetching results", stage)
            }
            Self::Finished { summary, .. } => f.write_str(summary),
        }
    }
}

/// Outcome of one orchestration, returned to the caller.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub instance: Uuid,
    pub reference: RunReference,
    pub state: OrchestrationState,
    /// Every state entered, starting with `Idle`.
    pub transitions: Vec<OrchestrationState>,
    pub run: Option<RunHandle>,
    /// Stage status queries made.
    pub polls: u32,
    pub last_stage: Option<StageStatus>,
    /// Overall run status, fetched after a timeout.
    pub run_status: Option<RunStatus>,
    pub artifact_location: Option<String>,
    pub chunks_delivered: usize,
    pub error: Option<OrchestratorError>,
    pub summary: String,
}

impl RunReport {
    pub fn new(instance: Uuid, reference: RunReference) -> Self {
        Self {
            instance,
            reference,
            state: OrchestrationState::Idle,
            transitions: vec![OrchestrationState::Idle],
            run: None,
            polls: 0,
            last_stage: None,
            run_status: None,
            artifact_location: None,
            chunks_delivered: 0,
            error: None,
            summary: String::new(),
        }
    }

    pub fn enter(&mut self, next: OrchestrationState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {} -> {}",
            self.state,
            next
        );
        tracing::debug!(from = %self.state, to = %next, "state transition");
        self.state = next;
        self.transitions.push(next);
    }

    pub fn is_success(&self) -> bool {
        self.state == OrchestrationState::Delivered
    }
}
