use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::OrchestratorError;

/// Branch or ref a run is triggered for. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunReference(String);

impl RunReference {
    pub fn new(raw: impl AsRef<str>) -> Result<Self, OrchestratorError> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(OrchestratorError::InvalidReference);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RunReference {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// One triggered workflow run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub id: u64,
    pub html_url: Option<String>,
}

impl RunHandle {
    pub fn new(id: u64) -> Self {
        Self { id, html_url: None }
    }
}

impl fmt::Display for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.id)
    }
}

/// How a completed stage or run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed,
    Errored,
}

impl Outcome {
    /// `success` and `failure` map directly; every other conclusion
    /// (cancelled, timed_out, skipped, neutral, ...) counts as errored.
    pub fn from_conclusion(conclusion: Option<&str>) -> Self {
        match conclusion {
            Some("success") => Self::Succeeded,
            Some("failure") => Self::Failed,
            _ => Self::Errored,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Errored => "errored",
        }
    }
}

/// Lifecycle of a stage or run. The outcome only exists once completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Pending,
    InProgress,
    Completed(Outcome),
}

impl Lifecycle {
    pub fn from_remote(status: &str, conclusion: Option<&str>) -> Self {
        match status {
            "completed" => Self::Completed(Outcome::from_conclusion(conclusion)),
            "in_progress" => Self::InProgress,
            _ => Self::Pending,
        }
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            Self::Completed(outcome) => Some(*outcome),
            _ => None,
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in progress"),
            Self::Completed(outcome) => write!(f, "completed ({})", outcome.as_str()),
        }
    }
}

/// Snapshot of one named stage (a workflow job), fresh on every poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStatus {
    pub name: String,
    pub lifecycle: Lifecycle,
    /// Raw conclusion string as reported, kept for reports.
    pub conclusion: Option<String>,
}

impl StageStatus {
    /// A stage the run has not scheduled yet.
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lifecycle: Lifecycle::Pending,
            conclusion: None,
        }
    }

    pub fn conclusion_label(&self) -> String {
        match (&self.conclusion, self.lifecycle.outcome()) {
            (Some(raw), _) => raw.clone(),
            (None, Some(outcome)) => outcome.as_str().to_string(),
            (None, None) => self.lifecycle.to_string(),
        }
    }
}

impl From<ApiJob> for StageStatus {
    fn from(job: ApiJob) -> Self {
        Self {
            lifecycle: Lifecycle::from_remote(&job.status, job.conclusion.as_deref()),
            name: job.name,
            conclusion: job.conclusion,
        }
    }
}

/// Whole-run status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStatus {
    pub lifecycle: Lifecycle,
    pub conclusion: Option<String>,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.lifecycle, &self.conclusion) {
            (Lifecycle::Completed(_), Some(raw)) => write!(f, "completed ({})", raw),
            (lifecycle, _) => write!(f, "{}", lifecycle),
        }
    }
}

/// One entry of the recent-runs listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub id: u64,
    pub head_branch: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub html_url: Option<String>,
    pub lifecycle: Lifecycle,
}

impl RunSummary {
    pub fn handle(&self) -> RunHandle {
        RunHandle {
            id: self.id,
            html_url: self.html_url.clone(),
        }
    }
}

impl From<ApiWorkflowRun> for RunSummary {
    fn from(run: ApiWorkflowRun) -> Self {
        Self {
            lifecycle: run.lifecycle(),
            id: run.id,
            head_branch: run.head_branch,
            created_at: run.created_at,
            html_url: run.html_url,
        }
    }
}

/// Immediate result of a dispatch request. Never an `Err`: non-2xx and
/// network failures are ordinary outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Accepted { triggered_at: DateTime<Utc> },
    Rejected { status: u16, body: String },
    TransportFailed { message: String },
}

// ── Wire types (subset of fields we care about) ──────────────────────

/// A workflow run as returned by the Actions API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiWorkflowRun {
    pub id: u64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub head_branch: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl ApiWorkflowRun {
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_remote(
            self.status.as_deref().unwrap_or("queued"),
            self.conclusion.as_deref(),
        )
    }

    pub fn status(&self) -> RunStatus {
        RunStatus {
            lifecycle: self.lifecycle(),
            conclusion: self.conclusion.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRunsPage {
    #[serde(default)]
    pub workflow_runs: Vec<ApiWorkflowRun>,
}

/// A job within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiJob {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub conclusion: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiJobsPage {
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub jobs: Vec<ApiJob>,
}
