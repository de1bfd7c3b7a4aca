//! Configuration for pipewatch, read from `.pipewatch/pipewatch.toml`.
//!
//! Values are layered: file, then environment, then CLI flags. When the
//! project has no config file the per-user one under the platform config
//! directory (`~/.config/pipewatch/pipewatch.toml` on Linux) is used.
//!
//! # Configuration File Format
//!
//! ```toml
//! [github]
//! owner = "acme"
//! repo = "payments"
//! workflow = "ci-cd.yml"
//! # token = "ghp_..."        # prefer GITHUB_TOKEN
//!
//! [github.inputs]
//! scan_profile = "full"
//!
//! [poll]
//! target_stage = "security-scan"
//! max_retries = 30
//! interval_ms = 10000
//!
//! [artifact]
//! candidates = ["snyk_summary.txt", "reports/snyk_summary.txt"]
//!
//! [delivery]
//! max_chunk_size = 2000
//! webhook_url = "https://discord.com/api/webhooks/..."
//! code_fence = false
//!
//! [logging]
//! dir = ".pipewatch/logs"
//! ```

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::delivery::{DISCORD_MESSAGE_LIMIT, FENCE_OVERHEAD};
use crate::github::client::DEFAULT_API_BASE;
use crate::github::{GitHubSettings, RepoSlug, is_valid_github_token};
use crate::locator::ArtifactLocator;
use crate::orchestrator::OrchestratorSettings;

pub const CONFIG_DIR: &str = ".pipewatch";
pub const CONFIG_FILE: &str = "pipewatch.toml";

pub const ENV_TOKEN: &str = "GITHUB_TOKEN";
pub const ENV_WEBHOOK_URL: &str = "PIPEWATCH_WEBHOOK_URL";
pub const ENV_REPOSITORY: &str = "PIPEWATCH_REPOSITORY";

/// Remote repository and workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubSection {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    /// Workflow file name or numeric id
    #[serde(default = "default_workflow")]
    pub workflow: String,
    /// Personal access token; `GITHUB_TOKEN` overrides it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// `workflow_dispatch` inputs sent with every trigger
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_workflow() -> String {
    "ci-cd.yml".to_string()
}

impl Default for GithubSection {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            owner: None,
            repo: None,
            workflow: default_workflow(),
            token: None,
            inputs: BTreeMap::new(),
        }
    }
}

/// Poll loop budgets and delays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollSection {
    #[serde(default = "default_target_stage")]
    pub target_stage: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_settle_ms")]
    pub trigger_settle_ms: u64,
    #[serde(default = "default_settle_ms")]
    pub artifact_settle_ms: u64,
    /// Consecutive transport failures tolerated while polling
    #[serde(default = "default_inner_retry_budget")]
    pub inner_retry_budget: u32,
    #[serde(default = "default_run_lookup_attempts")]
    pub run_lookup_attempts: u32,
    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: u64,
}

fn default_target_stage() -> String {
    "security-scan".to_string()
}

fn default_max_retries() -> u32 {
    30
}

fn default_interval_ms() -> u64 {
    10_000
}

fn default_settle_ms() -> u64 {
    5_000
}

fn default_inner_retry_budget() -> u32 {
    3
}

fn default_run_lookup_attempts() -> u32 {
    3
}

fn default_clock_skew_secs() -> u64 {
    30
}

impl Default for PollSection {
    fn default() -> Self {
        Self {
            target_stage: default_target_stage(),
            max_retries: default_max_retries(),
            interval_ms: default_interval_ms(),
            trigger_settle_ms: default_settle_ms(),
            artifact_settle_ms: default_settle_ms(),
            inner_retry_budget: default_inner_retry_budget(),
            run_lookup_attempts: default_run_lookup_attempts(),
            clock_skew_secs: default_clock_skew_secs(),
        }
    }
}

/// Where the scan stage leaves its summary, in priority order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSection {
    #[serde(default = "default_candidates")]
    pub candidates: Vec<String>,
    #[serde(default = "default_locate_attempts")]
    pub locate_attempts: u32,
    #[serde(default = "default_locate_delay_ms")]
    pub locate_delay_ms: u64,
}

fn default_candidates() -> Vec<String> {
    vec![
        "snyk_summary.txt".to_string(),
        "reports/snyk_summary.txt".to_string(),
        "artifacts/snyk_summary.txt".to_string(),
    ]
}

fn default_locate_attempts() -> u32 {
    3
}

fn default_locate_delay_ms() -> u64 {
    2_000
}

impl Default for ArtifactSection {
    fn default() -> Self {
        Self {
            candidates: default_candidates(),
            locate_attempts: default_locate_attempts(),
            locate_delay_ms: default_locate_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverySection {
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    /// Discord-compatible webhook; `PIPEWATCH_WEBHOOK_URL` overrides it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default = "default_code_fence")]
    pub code_fence: bool,
}

fn default_max_chunk_size() -> usize {
    DISCORD_MESSAGE_LIMIT
}

fn default_code_fence() -> bool {
    false
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            max_chunk_size: default_max_chunk_size(),
            webhook_url: None,
            code_fence: default_code_fence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSection {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Attempts per GET when the transport fails
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_runs_per_page")]
    pub runs_per_page: u32,
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_runs_per_page() -> u32 {
    10
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            runs_per_page: default_runs_per_page(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Directory for the daily rolling log file. Relative paths resolve
    /// against the project directory. Unset means stderr only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

/// The complete pipewatch.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipewatchToml {
    #[serde(default)]
    pub github: GithubSection,
    #[serde(default)]
    pub poll: PollSection,
    #[serde(default)]
    pub artifact: ArtifactSection,
    #[serde(default)]
    pub delivery: DeliverySection,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl PipewatchToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse pipewatch.toml")
    }

    /// Load `<config_dir>/pipewatch.toml`, or defaults if it doesn't exist.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize pipewatch.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Checks that don't depend on the environment.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.poll.target_stage.trim().is_empty() {
            warnings.push("poll.target_stage is empty; no stage can ever match".to_string());
        }
        if self.poll.max_retries == 0 {
            warnings.push("poll.max_retries is 0; every run will time out immediately".to_string());
        }
        if self.artifact.candidates.is_empty() {
            warnings.push("artifact.candidates is empty; results can never be found".to_string());
        }
        if self.delivery.max_chunk_size == 0 {
            warnings.push("delivery.max_chunk_size must be greater than 0".to_string());
        } else if self.delivery.max_chunk_size > DISCORD_MESSAGE_LIMIT {
            warnings.push(format!(
                "delivery.max_chunk_size {} exceeds the {}-character message limit",
                self.delivery.max_chunk_size, DISCORD_MESSAGE_LIMIT
            ));
        }
        if self.delivery.code_fence && self.delivery.max_chunk_size <= FENCE_OVERHEAD {
            warnings.push(format!(
                "delivery.max_chunk_size must exceed {} when code_fence is on",
                FENCE_OVERHEAD
            ));
        }
        if let Some(token) = &self.github.token
            && !is_valid_github_token(token)
        {
            warnings.push(
                "github.token does not look like a GitHub token (expected ghp_, gho_, ghs_, ... prefix)"
                    .to_string(),
            );
        }
        if let Some(url) = &self.delivery.webhook_url
            && !url.starts_with("https://")
            && !url.starts_with("http://")
        {
            warnings.push(format!("delivery.webhook_url '{}' is not an http(s) URL", url));
        }

        warnings
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Effective configuration: file merged with environment and CLI overrides.
#[derive(Debug, Clone)]
pub struct PipewatchConfig {
    pub project_dir: PathBuf,
    /// `.pipewatch` under the project directory
    pub config_dir: PathBuf,
    /// File the settings were read from, if any
    pub source: Option<PathBuf>,
    pub toml: PipewatchToml,
    pub verbose: bool,
    pub cli_stage: Option<String>,
    pub cli_max_retries: Option<u32>,
}

impl PipewatchConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let config_dir = project_dir.join(CONFIG_DIR);

        let project_file = config_dir.join(CONFIG_FILE);
        let (toml, source) = if project_file.exists() {
            (PipewatchToml::load(&project_file)?, Some(project_file))
        } else if let Some(global) = global_config_path().filter(|p| p.exists()) {
            (PipewatchToml::load(&global)?, Some(global))
        } else {
            (PipewatchToml::default(), None)
        };

        Ok(Self {
            project_dir,
            config_dir,
            source,
            toml,
            verbose: false,
            cli_stage: None,
            cli_max_retries: None,
        })
    }

    pub fn with_cli_args(
        project_dir: PathBuf,
        verbose: bool,
        stage: Option<String>,
        max_retries: Option<u32>,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        config.cli_stage = stage;
        config.cli_max_retries = max_retries;
        Ok(config)
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Token (env → file).
    pub fn token(&self) -> Option<String> {
        self.token_with(&env_var)
    }

    pub fn token_with(&self, env: &dyn Fn(&str) -> Option<String>) -> Option<String> {
        env(ENV_TOKEN).or_else(|| self.toml.github.token.clone())
    }

    /// Webhook URL (env → file).
    pub fn webhook_url(&self) -> Option<String> {
        self.webhook_url_with(&env_var)
    }

    pub fn webhook_url_with(&self, env: &dyn Fn(&str) -> Option<String>) -> Option<String> {
        env(ENV_WEBHOOK_URL).or_else(|| self.toml.delivery.webhook_url.clone())
    }

    /// Repository (env `owner/repo` → file owner + repo).
    pub fn repo(&self) -> Result<RepoSlug> {
        self.repo_with(&env_var)
    }

    pub fn repo_with(&self, env: &dyn Fn(&str) -> Option<String>) -> Result<RepoSlug> {
        if let Some(raw) = env(ENV_REPOSITORY) {
            return RepoSlug::parse(&raw).with_context(|| {
                format!("{} must be owner/repo or a GitHub URL, got '{}'", ENV_REPOSITORY, raw)
            });
        }
        match (&self.toml.github.owner, &self.toml.github.repo) {
            (Some(owner), Some(repo)) if !owner.trim().is_empty() && !repo.trim().is_empty() => {
                Ok(RepoSlug::new(owner.trim(), repo.trim()))
            }
            (None, Some(repo)) => RepoSlug::parse(repo).with_context(|| {
                format!("github.owner is missing and github.repo '{}' is not owner/repo", repo)
            }),
            _ => bail!(
                "No repository configured. Set [github] owner and repo in {} or {}",
                self.config_path().display(),
                ENV_REPOSITORY
            ),
        }
    }

    /// Target stage (CLI → file).
    pub fn target_stage(&self) -> String {
        self.cli_stage
            .clone()
            .unwrap_or_else(|| self.toml.poll.target_stage.clone())
    }

    /// Poll budget (CLI → file).
    pub fn max_retries(&self) -> u32 {
        self.cli_max_retries.unwrap_or(self.toml.poll.max_retries)
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.toml.logging.dir.as_ref().map(|dir| {
            if dir.is_absolute() {
                dir.clone()
            } else {
                self.project_dir.join(dir)
            }
        })
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        let poll = &self.toml.poll;
        let artifact = &self.toml.artifact;
        OrchestratorSettings {
            target_stage: self.target_stage(),
            max_retries: self.max_retries(),
            poll_interval: Duration::from_millis(poll.interval_ms),
            trigger_settle: Duration::from_millis(poll.trigger_settle_ms),
            artifact_settle: Duration::from_millis(poll.artifact_settle_ms),
            inner_retry_budget: poll.inner_retry_budget,
            run_lookup_attempts: poll.run_lookup_attempts,
            clock_skew: Duration::from_secs(poll.clock_skew_secs),
            locate_attempts: artifact.locate_attempts,
            locate_delay: Duration::from_millis(artifact.locate_delay_ms),
            max_chunk_size: self.toml.delivery.max_chunk_size,
            code_fence: self.toml.delivery.code_fence,
        }
    }

    pub fn github_settings(&self) -> Result<GitHubSettings> {
        self.github_settings_with(&env_var)
    }

    pub fn github_settings_with(
        &self,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<GitHubSettings> {
        let repo = self.repo_with(env)?;
        let Some(token) = self.token_with(env) else {
            bail!(
                "No GitHub token found. Set {} or [github] token in {}",
                ENV_TOKEN,
                self.config_path().display()
            );
        };
        let github = &self.toml.github;
        let http = &self.toml.http;

        let mut settings = GitHubSettings::new(repo, github.workflow.clone(), token)
            .with_api_base(github.api_base.clone());
        settings.inputs = github.inputs.clone();
        settings.request_timeout = Duration::from_millis(http.request_timeout_ms);
        settings.retry_max_attempts = http.retry_max_attempts;
        settings.retry_base_delay = Duration::from_millis(http.retry_base_delay_ms);
        settings.runs_per_page = http.runs_per_page;
        Ok(settings)
    }

    /// File candidates resolved against the project directory.
    pub fn artifact_locator(&self) -> ArtifactLocator {
        ArtifactLocator::from_paths(&self.project_dir, self.toml.artifact.candidates.as_slice())
    }

    pub fn validate(&self) -> Vec<String> {
        self.validate_with(&env_var)
    }

    /// File checks plus the ones that need the environment.
    pub fn validate_with(&self, env: &dyn Fn(&str) -> Option<String>) -> Vec<String> {
        let mut warnings = self.toml.validate();

        if let Err(e) = self.repo_with(env) {
            warnings.push(e.to_string());
        }
        match self.token_with(env) {
            None => warnings.push(format!("No GitHub token: set {} or [github] token", ENV_TOKEN)),
            Some(token) if !is_valid_github_token(&token) => warnings.push(format!(
                "{} does not look like a GitHub token",
                ENV_TOKEN
            )),
            Some(_) => {}
        }
        if self.max_retries() == 0 && self.cli_max_retries.is_some() {
            warnings.push("--max-retries 0 means the stage is never polled".to_string());
        }

        warnings
    }
}

/// Per-user fallback, e.g. `~/.config/pipewatch/pipewatch.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("pipewatch").join(CONFIG_FILE))
}
