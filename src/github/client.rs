use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use serde_json::json;

use super::models::{
    ApiJobsPage, ApiRunsPage, ApiWorkflowRun, RunHandle, RunReference, RunStatus, RunSummary,
    StageStatus, TriggerOutcome,
};
use super::repo::RepoSlug;
use crate::errors::ClientError;
use crate::util::{retry_delay, truncate_chars};

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
const GITHUB_API_VERSION: &str = "2022-11-28";
const JOBS_PER_PAGE: usize = 100;
/// GitHub serves at most 1000 results per listing.
const MAX_JOB_PAGES: u32 = 10;
const MAX_ERROR_BODY_CHARS: usize = 800;

/// Starts workflow runs. Real implementation: `GitHubClient`.
#[async_trait]
pub trait TriggerClient: Send + Sync {
    /// Issue exactly one dispatch request for `reference`.
    async fn trigger(&self, reference: &RunReference) -> TriggerOutcome;
}

/// Read-only queries against workflow runs. Real implementation: `GitHubClient`.
#[async_trait]
pub trait RunStatusClient: Send + Sync {
    async fn run_status(&self, handle: &RunHandle) -> Result<RunStatus, ClientError>;

    /// Every stage of the run in the order the service reports them. A stage
    /// that has not been scheduled yet is simply absent.
    async fn stage_statuses(&self, handle: &RunHandle) -> Result<Vec<StageStatus>, ClientError>;

    /// Recent dispatch runs for `reference`, most recent first.
    async fn recent_runs(&self, reference: &RunReference) -> Result<Vec<RunSummary>, ClientError>;
}

/// Connection settings for one repository + workflow.
#[derive(Debug, Clone)]
pub struct GitHubSettings {
    pub api_base: String,
    pub repo: RepoSlug,
    /// Workflow file name (`ci-cd.yml`) or numeric id.
    pub workflow: String,
    pub token: String,
    pub inputs: BTreeMap<String, String>,
    pub request_timeout: Duration,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub runs_per_page: u32,
}

impl GitHubSettings {
    pub fn new(repo: RepoSlug, workflow: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            repo,
            workflow: workflow.into(),
            token: token.into(),
            inputs: BTreeMap::new(),
            request_timeout: Duration::from_secs(30),
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            runs_per_page: 10,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

/// GitHub Actions REST client. Cheap to clone; clones share one
/// connection pool.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
    repo: RepoSlug,
    workflow: String,
    inputs: BTreeMap<String, String>,
    retry_max_attempts: u32,
    retry_base_delay: Duration,
    runs_per_page: u32,
}

impl GitHubClient {
    pub fn new(settings: GitHubSettings) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("pipewatch"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "x-github-api-version",
            HeaderValue::from_static(GITHUB_API_VERSION),
        );
        let auth_header = format!("Bearer {}", settings.token.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth_header).context("Invalid GitHub authorization header")?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(settings.request_timeout)
            .build()
            .context("Failed to create GitHub API client")?;

        Ok(Self {
            http,
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            repo: settings.repo,
            workflow: settings.workflow,
            inputs: settings.inputs,
            retry_max_attempts: settings.retry_max_attempts.max(1),
            retry_base_delay: settings.retry_base_delay,
            runs_per_page: settings.runs_per_page.clamp(1, 100),
        })
    }

    pub fn repo(&self) -> &RepoSlug {
        &self.repo
    }

    fn repo_url(&self, suffix: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.api_base, self.repo.owner, self.repo.name, suffix
        )
    }

    /// `POST .../actions/workflows/{workflow}/dispatches`. Never retried.
    pub async fn dispatch(&self, reference: &RunReference) -> TriggerOutcome {
        let url = self.repo_url(&format!("actions/workflows/{}/dispatches", self.workflow));
        let payload = json!({ "ref": reference.as_str(), "inputs": &self.inputs });
        let triggered_at = Utc::now();

        match self.http.post(&url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                TriggerOutcome::Accepted { triggered_at }
            }
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                TriggerOutcome::Rejected { status, body }
            }
            Err(error) => TriggerOutcome::TransportFailed {
                message: error.to_string(),
            },
        }
    }

    pub async fn get_run(&self, run_id: u64) -> Result<ApiWorkflowRun, ClientError> {
        let url = self.repo_url(&format!("actions/runs/{}", run_id));
        self.get_json("get run", &url, &[]).await
    }

    /// List jobs of a run. Follows pages until `total_count` jobs are seen,
    /// a page comes back short, or `MAX_JOB_PAGES` pages have been read.
    pub async fn list_jobs(&self, run_id: u64) -> Result<Vec<StageStatus>, ClientError> {
        let url = self.repo_url(&format!("actions/runs/{}/jobs", run_id));
        let mut stages = Vec::new();

        for page in 1..=MAX_JOB_PAGES {
            let resp: ApiJobsPage = self
                .get_json(
                    "list jobs",
                    &url,
                    &[
                        ("filter", "latest".to_string()),
                        ("per_page", JOBS_PER_PAGE.to_string()),
                        ("page", page.to_string()),
                    ],
                )
                .await?;

            let count = resp.jobs.len();
            stages.extend(resp.jobs.into_iter().map(StageStatus::from));

            if count < JOBS_PER_PAGE || stages.len() as u64 >= resp.total_count {
                break;
            }
            if page == MAX_JOB_PAGES {
                tracing::warn!(run_id, seen = stages.len(), "job listing truncated");
            }
        }

        Ok(stages)
    }

    /// Most recent `workflow_dispatch` runs of the workflow on `branch`.
    pub async fn list_runs(&self, branch: &str) -> Result<Vec<RunSummary>, ClientError> {
        let url = self.repo_url(&format!("actions/workflows/{}/runs", self.workflow));
        let page: ApiRunsPage = self
            .get_json(
                "list runs",
                &url,
                &[
                    ("event", "workflow_dispatch".to_string()),
                    ("branch", branch.to_string()),
                    ("per_page", self.runs_per_page.to_string()),
                ],
            )
            .await?;
        Ok(page.workflow_runs.into_iter().map(RunSummary::from).collect())
    }

    /// GET with transport-level retries. Non-2xx answers are returned as
    /// `Rejected` straight away.
    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, ClientError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.http.get(url).query(query).send().await {
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.map_err(|e| ClientError::Transport {
                        operation: operation.to_string(),
                        message: e.to_string(),
                    })?;
                    if !status.is_success() {
                        return Err(ClientError::Rejected {
                            operation: operation.to_string(),
                            status: status.as_u16(),
                            body: truncate_chars(&body, MAX_ERROR_BODY_CHARS),
                        });
                    }
                    return serde_json::from_str(&body).map_err(|e| ClientError::Decode {
                        operation: operation.to_string(),
                        message: e.to_string(),
                    });
                }
                Err(error) => {
                    if attempt < self.retry_max_attempts && is_retryable_transport_error(&error) {
                        let delay = retry_delay(self.retry_base_delay, attempt);
                        tracing::debug!(
                            operation,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "retrying GitHub request"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(ClientError::Transport {
                        operation: operation.to_string(),
                        message: error.to_string(),
                    });
                }
            }
        }
    }
}

fn is_retryable_transport_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[async_trait]
impl TriggerClient for GitHubClient {
    async fn trigger(&self, reference: &RunReference) -> TriggerOutcome {
        self.dispatch(reference).await
    }
}

#[async_trait]
impl RunStatusClient for GitHubClient {
    async fn run_status(&self, handle: &RunHandle) -> Result<RunStatus, ClientError> {
        Ok(self.get_run(handle.id).await?.status())
    }

    async fn stage_statuses(&self, handle: &RunHandle) -> Result<Vec<StageStatus>, ClientError> {
        self.list_jobs(handle.id).await
    }

    async fn recent_runs(&self, reference: &RunReference) -> Result<Vec<RunSummary>, ClientError> {
        self.list_runs(reference.as_str()).await
    }
}
