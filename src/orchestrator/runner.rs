use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::state::{OrchestrationState, PollState, ProgressEvent, RunReport};
use crate::delivery::{DISCORD_MESSAGE_LIMIT, OutputChannel, deliver_with};
use crate::errors::{LocateError, OrchestratorError};
use crate::github::{
    Lifecycle, Outcome, RunHandle, RunReference, RunStatus, RunStatusClient, RunSummary,
    StageStatus, TriggerClient, TriggerOutcome,
};
use crate::locator::ArtifactLocator;
use crate::util::{sleep_or_cancel, truncate_chars};

pub const DEFAULT_TARGET_STAGE: &str = "security-scan";
pub const DEFAULT_MAX_RETRIES: u32 = 30;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_SETTLE: Duration = Duration::from_secs(5);

/// Timing and budget knobs for one orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Exact name of the stage whose completion gates delivery.
    pub target_stage: String,
    /// Stage status queries before giving up.
    pub max_retries: u32,
    pub poll_interval: Duration,
    /// Pause between an accepted trigger and each run lookup.
    pub trigger_settle: Duration,
    /// Pause between stage success and the first artifact lookup.
    pub artifact_settle: Duration,
    /// Consecutive transport failures tolerated while polling.
    pub inner_retry_budget: u32,
    pub run_lookup_attempts: u32,
    /// Tolerance when comparing our trigger time to the remote `created_at`.
    pub clock_skew: Duration,
    pub locate_attempts: u32,
    pub locate_delay: Duration,
    pub max_chunk_size: usize,
    pub code_fence: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            target_stage: DEFAULT_TARGET_STAGE.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            poll_interval: DEFAULT_POLL_INTERVAL,
            trigger_settle: DEFAULT_SETTLE,
            artifact_settle: DEFAULT_SETTLE,
            inner_retry_budget: 3,
            run_lookup_attempts: 3,
            clock_skew: Duration::from_secs(30),
            locate_attempts: 3,
            locate_delay: Duration::from_secs(2),
            max_chunk_size: DISCORD_MESSAGE_LIMIT,
            code_fence: false,
        }
    }
}

impl OrchestratorSettings {
    pub fn with_target_stage(mut self, stage: impl Into<String>) -> Self {
        self.target_stage = stage.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Pick the run our dispatch created: same branch, created no earlier than
/// `triggered_at - skew`. The newest match wins.
pub fn select_triggered_run(
    runs: &[RunSummary],
    reference: &RunReference,
    triggered_at: DateTime<Utc>,
    skew: Duration,
) -> Option<RunHandle> {
    let skew = chrono::Duration::from_std(skew).unwrap_or_else(|_| chrono::Duration::zero());
    let earliest = triggered_at - skew;
    runs.iter()
        .filter(|run| run.head_branch.as_deref() == Some(reference.as_str()))
        .filter(|run| run.created_at.is_some_and(|created| created >= earliest))
        .max_by_key(|run| run.created_at)
        .map(RunSummary::handle)
}

/// Drives trigger → wait → poll → locate → deliver for one reference at a
/// time. Clones share the clients and the channel; every `run` call owns its
/// own poll state, so clones may run concurrently.
#[derive(Clone)]
pub struct Orchestrator {
    trigger: Arc<dyn TriggerClient>,
    status: Arc<dyn RunStatusClient>,
    locator: Arc<ArtifactLocator>,
    channel: Arc<dyn OutputChannel>,
    settings: Arc<OrchestratorSettings>,
    events: Option<broadcast::Sender<ProgressEvent>>,
}

impl Orchestrator {
    pub fn new(
        trigger: Arc<dyn TriggerClient>,
        status: Arc<dyn RunStatusClient>,
        locator: ArtifactLocator,
        channel: Arc<dyn OutputChannel>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            trigger,
            status,
            locator: Arc::new(locator),
            channel,
            settings: Arc::new(settings),
            events: None,
        }
    }

    /// Also publish every progress event, heartbeats included, on `sender`.
    pub fn with_progress(mut self, sender: broadcast::Sender<ProgressEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Run one orchestration to a terminal state. Never returns an error:
    /// failures end up in the report, and exactly one final report is sent
    /// to the output channel.
    pub async fn run(&self, reference: RunReference, cancel: CancellationToken) -> RunReport {
        let instance = Uuid::new_v4();
        let span = tracing::info_span!("orchestration", %instance, reference = %reference);
        async move {
            let mut report = RunReport::new(instance, reference);
            let result = self.drive(&mut report, &cancel).await;
            self.finish(&mut report, result).await;
            report
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        report: &mut RunReport,
        cancel: &CancellationToken,
    ) -> Result<usize, OrchestratorError> {
        let reference = report.reference.clone();

        report.enter(OrchestrationState::Triggering);
        self.emit(ProgressEvent::Triggering {
            reference: reference.to_string(),
        })
        .await;
        let triggered_at = match self.trigger.trigger(&reference).await {
            TriggerOutcome::Accepted { triggered_at } => triggered_at,
            TriggerOutcome::Rejected { status, body } => {
                return Err(OrchestratorError::TriggerRejected { status, body });
            }
            TriggerOutcome::TransportFailed { message } => {
                return Err(OrchestratorError::TriggerTransport(message));
            }
        };

        report.enter(OrchestrationState::Waiting);
        self.emit(ProgressEvent::Triggered {
            reference: reference.to_string(),
        })
        .await;
        let handle = self.resolve_run(&reference, triggered_at, cancel).await?;
        tracing::info!(run_id = handle.id, "run resolved");
        self.emit(ProgressEvent::RunResolved {
            run_id: handle.id,
            html_url: handle.html_url.clone(),
        })
        .await;
        report.run = Some(handle.clone());

        report.enter(OrchestrationState::Polling);
        let mut poll = PollState::new(self.settings.max_retries);
        let result = self.poll_stage(&handle, &mut poll, cancel).await;
        report.polls = poll.retry_counter;
        report.last_stage = poll.last_observed.clone();
        let stage = result?;

        report.enter(OrchestrationState::Delivering);
        self.emit(ProgressEvent::StageSucceeded {
            stage: stage.name.clone(),
        })
        .await;
        if !sleep_or_cancel(self.settings.artifact_settle, cancel).await {
            return Err(OrchestratorError::Cancelled);
        }
        let artifact = self
            .locator
            .locate_with_retry(
                self.settings.locate_attempts,
                self.settings.locate_delay,
                cancel,
            )
            .await?;
        report.artifact_location = Some(artifact.location.clone());

        let text = if artifact.text.trim().is_empty() {
            format!("Scan finished but {} is empty.", artifact.location)
        } else {
            artifact.text
        };
        let limit = self
            .settings
            .max_chunk_size
            .min(self.channel.max_message_len());
        let sent = deliver_with(self.channel.as_ref(), &text, limit, self.settings.code_fence).await?;
        Ok(sent)
    }

    async fn resolve_run(
        &self,
        reference: &RunReference,
        triggered_at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<RunHandle, OrchestratorError> {
        let attempts = self.settings.run_lookup_attempts.max(1);
        for attempt in 1..=attempts {
            if !sleep_or_cancel(self.settings.trigger_settle, cancel).await {
                return Err(OrchestratorError::Cancelled);
            }
            match self.status.recent_runs(reference).await {
                Ok(runs) => {
                    if let Some(handle) =
                        select_triggered_run(&runs, reference, triggered_at, self.settings.clock_skew)
                    {
                        return Ok(handle);
                    }
                    tracing::debug!(attempt, listed = runs.len(), "triggered run not listed yet");
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(attempt, error = %e, "run lookup failed");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(OrchestratorError::RunNotResolved {
            reference: reference.to_string(),
            attempts,
        })
    }

    /// Query the target stage until it completes or the budget runs out.
    /// Makes at most `max_retries` queries.
    async fn poll_stage(
        &self,
        handle: &RunHandle,
        poll: &mut PollState,
        cancel: &CancellationToken,
    ) -> Result<StageStatus, OrchestratorError> {
        let target = self.settings.target_stage.as_str();

        while !poll.exhausted() {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
            let iteration = poll.retry_counter + 1;

            match self.status.stage_statuses(handle).await {
                Ok(stages) => {
                    let stage = stages
                        .into_iter()
                        .find(|s| s.name == target)
                        .unwrap_or_else(|| StageStatus::pending(target));
                    self.emit(ProgressEvent::StagePolled {
                        stage: stage.name.clone(),
                        lifecycle: stage.lifecycle.to_string(),
                        iteration,
                        max_retries: poll.max_retries,
                    })
                    .await;
                    poll.observe(stage.clone());
                    poll.advance();

                    if let Lifecycle::Completed(outcome) = stage.lifecycle {
                        return match outcome {
                            Outcome::Succeeded => Ok(stage),
                            Outcome::Failed | Outcome::Errored => {
                                Err(OrchestratorError::StageFailed {
                                    stage: stage.name.clone(),
                                    conclusion: stage.conclusion_label(),
                                })
                            }
                        };
                    }
                }
                Err(e) if e.is_retryable() => {
                    poll.advance();
                    let streak = poll.record_error();
                    tracing::warn!(iteration, streak, error = %e, "stage status query failed");
                    if streak > self.settings.inner_retry_budget {
                        return Err(e.into());
                    }
                    if streak == 1 {
                        self.emit(ProgressEvent::PollFailed {
                            iteration,
                            message: e.to_string(),
                        })
                        .await;
                    }
                }
                Err(e) => {
                    poll.advance();
                    return Err(e.into());
                }
            }

            if !poll.exhausted() && !sleep_or_cancel(self.settings.poll_interval, cancel).await {
                return Err(OrchestratorError::Cancelled);
            }
        }

        Err(OrchestratorError::TimedOut {
            stage: target.to_string(),
            iterations: poll.retry_counter,
        })
    }

    async fn finish(&self, report: &mut RunReport, result: Result<usize, OrchestratorError>) {
        match result {
            Ok(chunks) => {
                report.enter(OrchestrationState::Delivered);
                report.chunks_delivered = chunks;
                report.summary = format!(
                    "Delivered {} chunk(s) from {}",
                    chunks,
                    report.artifact_location.as_deref().unwrap_or("artifact")
                );
                tracing::info!(chunks, "results delivered");
            }
            Err(err) => {
                let state = match &err {
                    OrchestratorError::TimedOut { .. } => OrchestrationState::TimedOut,
                    OrchestratorError::Cancelled
                    | OrchestratorError::Artifact(LocateError::Cancelled) => {
                        OrchestrationState::Cancelled
                    }
                    _ => OrchestrationState::Failed,
                };
                report.enter(state);

                let mut summary = err.to_string();
                if state == OrchestrationState::TimedOut {
                    if let Some(run_status) = self.best_effort_run_status(report.run.as_ref()).await
                    {
                        summary = format!("{}; run is {}", summary, run_status);
                        report.run_status = Some(run_status);
                    }
                }
                tracing::warn!(state = %state, error = %err, "orchestration ended without delivery");
                self.post(&summary).await;
                report.summary = summary;
                report.error = Some(err);
            }
        }

        self.emit(ProgressEvent::Finished {
            state: report.state,
            summary: report.summary.clone(),
        })
        .await;
    }

    async fn best_effort_run_status(&self, handle: Option<&RunHandle>) -> Option<RunStatus> {
        let handle = handle?;
        match self.status.run_status(handle).await {
            Ok(status) => Some(status),
            Err(e) => {
                tracing::debug!(error = %e, "run status unavailable after timeout");
                None
            }
        }
    }

    async fn emit(&self, event: ProgressEvent) {
        match &event {
            ProgressEvent::StagePolled { .. } => tracing::debug!(event = %event, "progress"),
            _ => tracing::info!(event = %event, "progress"),
        }
        if event.is_for_channel() {
            self.post(&event.to_string()).await;
        }
        if let Some(sender) = &self.events {
            // No subscribers is fine.
            let _ = sender.send(event);
        }
    }

    async fn post(&self, message: &str) {
        let text = truncate_chars(message, self.channel.max_message_len());
        if let Err(e) = self.channel.send(&text).await {
            tracing::warn!(error = %e, "could not post to output channel");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::RecordingChannel;
    use crate::errors::ClientError;
    use crate::locator::{ArtifactSource, MemorySource};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    const STAGE: &str = "security-scan";

    struct FakeTrigger {
        outcome: TriggerOutcome,
        calls: AtomicUsize,
    }

    impl FakeTrigger {
        fn accepting() -> Self {
            Self::with(TriggerOutcome::Accepted {
                triggered_at: Utc::now(),
            })
        }

        fn with(outcome: TriggerOutcome) -> Self {
            Self {
                outcome,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TriggerClient for FakeTrigger {
        async fn trigger(&self, _reference: &RunReference) -> TriggerOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    /// Replays scripted stage responses, then repeats `fallback` forever.
    struct FakeStatus {
        script: Mutex<VecDeque<Result<Vec<StageStatus>, ClientError>>>,
        fallback: Vec<StageStatus>,
        run_id: u64,
        list_runs: bool,
        stage_calls: AtomicUsize,
        status_calls: AtomicUsize,
    }

    impl FakeStatus {
        fn new(script: Vec<Result<Vec<StageStatus>, ClientError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback: Vec::new(),
                run_id: 4242,
                list_runs: true,
                stage_calls: AtomicUsize::new(0),
                status_calls: AtomicUsize::new(0),
            }
        }

        fn never_completing(stages: Vec<StageStatus>) -> Self {
            let mut fake = Self::new(Vec::new());
            fake.fallback = stages;
            fake
        }

        fn stage_calls(&self) -> usize {
            self.stage_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RunStatusClient for FakeStatus {
        async fn run_status(&self, _handle: &RunHandle) -> Result<RunStatus, ClientError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            Ok(RunStatus {
                lifecycle: Lifecycle::InProgress,
                conclusion: None,
            })
        }

        async fn stage_statuses(
            &self,
            _handle: &RunHandle,
        ) -> Result<Vec<StageStatus>, ClientError> {
            self.stage_calls.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().await.pop_front() {
                Some(next) => next,
                None => Ok(self.fallback.clone()),
            }
        }

        async fn recent_runs(
            &self,
            reference: &RunReference,
        ) -> Result<Vec<RunSummary>, ClientError> {
            if !self.list_runs {
                return Ok(Vec::new());
            }
            Ok(vec![RunSummary {
                id: self.run_id,
                head_branch: Some(reference.to_string()),
                created_at: Some(Utc::now()),
                html_url: None,
                lifecycle: Lifecycle::Pending,
            }])
        }
    }

    fn stage(name: &str, lifecycle: Lifecycle, conclusion: Option<&str>) -> StageStatus {
        StageStatus {
            name: name.into(),
            lifecycle,
            conclusion: conclusion.map(String::from),
        }
    }

    fn succeeded(name: &str) -> StageStatus {
        stage(name, Lifecycle::Completed(Outcome::Succeeded), Some("success"))
    }

    fn transport() -> ClientError {
        ClientError::Transport {
            operation: "list jobs".into(),
            message: "connection reset".into(),
        }
    }

    fn fast_settings() -> OrchestratorSettings {
        OrchestratorSettings {
            target_stage: STAGE.into(),
            max_retries: 5,
            poll_interval: Duration::from_millis(1),
            trigger_settle: Duration::from_millis(1),
            artifact_settle: Duration::from_millis(1),
            inner_retry_budget: 2,
            run_lookup_attempts: 2,
            clock_skew: Duration::from_secs(30),
            locate_attempts: 2,
            locate_delay: Duration::from_millis(1),
            max_chunk_size: 2000,
            code_fence: false,
        }
    }

    fn locator_with(second: &str) -> ArtifactLocator {
        let sources: Vec<Arc<dyn ArtifactSource>> = vec![
            Arc::new(MemorySource::empty("memory://first")),
            Arc::new(MemorySource::with_content("memory://second", second)),
        ];
        ArtifactLocator::new(sources)
    }

    fn orchestrator(
        trigger: Arc<FakeTrigger>,
        status: Arc<FakeStatus>,
        locator: ArtifactLocator,
        channel: Arc<RecordingChannel>,
        settings: OrchestratorSettings,
    ) -> Orchestrator {
        Orchestrator::new(trigger, status, locator, channel, settings)
    }

    fn reference(name: &str) -> RunReference {
        RunReference::new(name).unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_delivers_single_chunk() {
        let trigger = Arc::new(FakeTrigger::accepting());
        let status = Arc::new(FakeStatus::new(vec![
            Ok(vec![stage("build", Lifecycle::InProgress, None)]),
            Ok(vec![succeeded("build"), succeeded(STAGE)]),
        ]));
        let channel = Arc::new(RecordingChannel::new());
        let orch = orchestrator(
            trigger.clone(),
            status.clone(),
            locator_with("OK"),
            channel.clone(),
            fast_settings(),
        );

        let report = orch.run(reference("main"), CancellationToken::new()).await;

        assert!(report.is_success(), "report: {:?}", report.error);
        assert_eq!(report.chunks_delivered, 1);
        assert_eq!(report.polls, 2);
        assert_eq!(status.stage_calls(), 2);
        assert_eq!(trigger.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.artifact_location.as_deref(), Some("memory://second"));
        assert_eq!(report.run.as_ref().map(|r| r.id), Some(4242));

        let messages = channel.messages().await;
        assert_eq!(messages.iter().filter(|m| m.as_str() == "OK").count(), 1);
        assert_eq!(messages.last().map(String::as_str), Some("OK"));
        assert_eq!(
            report.transitions,
            vec![
                OrchestrationState::Idle,
                OrchestrationState::Triggering,
                OrchestrationState::Waiting,
                OrchestrationState::Polling,
                OrchestrationState::Delivering,
                OrchestrationState::Delivered,
            ]
        );
    }

    #[tokio::test]
    async fn test_default_settings_deliver_short_artifact_verbatim() {
        let trigger = Arc::new(FakeTrigger::accepting());
        let status = Arc::new(FakeStatus::new(vec![Ok(vec![succeeded(STAGE)])]));
        let channel = Arc::new(RecordingChannel::new());
        let settings = OrchestratorSettings {
            poll_interval: Duration::from_millis(1),
            trigger_settle: Duration::from_millis(1),
            artifact_settle: Duration::from_millis(1),
            locate_delay: Duration::from_millis(1),
            ..OrchestratorSettings::default()
        };
        let orch = orchestrator(trigger, status, locator_with("OK"), channel.clone(), settings);

        let report = orch.run(reference("main"), CancellationToken::new()).await;

        assert!(report.is_success(), "report: {:?}", report.error);
        assert_eq!(report.chunks_delivered, 1);
        assert_eq!(channel.messages().await.last().map(String::as_str), Some("OK"));
    }

    #[tokio::test]
    async fn test_default_settings_keep_full_width_text_in_one_chunk() {
        let trigger = Arc::new(FakeTrigger::accepting());
        let status = Arc::new(FakeStatus::new(vec![Ok(vec![succeeded(STAGE)])]));
        let channel = Arc::new(RecordingChannel::new());
        let body = "x".repeat(DISCORD_MESSAGE_LIMIT);
        let settings = OrchestratorSettings {
            poll_interval: Duration::from_millis(1),
            trigger_settle: Duration::from_millis(1),
            artifact_settle: Duration::from_millis(1),
            locate_delay: Duration::from_millis(1),
            ..OrchestratorSettings::default()
        };
        let orch = orchestrator(trigger, status, locator_with(&body), channel.clone(), settings);

        let report = orch.run(reference("main"), CancellationToken::new()).await;

        assert!(report.is_success(), "report: {:?}", report.error);
        assert_eq!(report.chunks_delivered, 1);
        assert_eq!(channel.messages().await.last(), Some(&body));
    }

    #[tokio::test]
    async fn test_rejected_trigger_reports_once_without_polling() {
        let trigger = Arc::new(FakeTrigger::with(TriggerOutcome::Rejected {
            status: 404,
            body: "Not Found".into(),
        }));
        let status = Arc::new(FakeStatus::new(Vec::new()));
        let channel = Arc::new(RecordingChannel::new());
        let orch = orchestrator(
            trigger,
            status.clone(),
            locator_with("OK"),
            channel.clone(),
            fast_settings(),
        );

        let report = orch.run(reference("main"), CancellationToken::new()).await;

        assert_eq!(report.state, OrchestrationState::Failed);
        assert_eq!(report.polls, 0);
        assert_eq!(status.stage_calls(), 0);
        let messages = channel.messages().await;
        let terminal: Vec<_> = messages.iter().filter(|m| m.contains("404")).collect();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0], "Failed to trigger workflow: 404 - Not Found");
        assert!(matches!(
            report.error,
            Some(OrchestratorError::TriggerRejected { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_transport_failure_on_trigger_fails() {
        let trigger = Arc::new(FakeTrigger::with(TriggerOutcome::TransportFailed {
            message: "dns error".into(),
        }));
        let status = Arc::new(FakeStatus::new(Vec::new()));
        let channel = Arc::new(RecordingChannel::new());
        let orch = orchestrator(trigger, status, locator_with("OK"), channel.clone(), fast_settings());

        let report = orch.run(reference("main"), CancellationToken::new()).await;

        assert_eq!(report.state, OrchestrationState::Failed);
        assert!(matches!(report.error, Some(OrchestratorError::TriggerTransport(_))));
        assert_eq!(
            channel.messages().await.last().map(String::as_str),
            Some("Failed to trigger workflow: dns error")
        );
    }

    #[tokio::test]
    async fn test_times_out_after_exactly_max_retries() {
        let trigger = Arc::new(FakeTrigger::accepting());
        let status = Arc::new(FakeStatus::never_completing(vec![stage(
            STAGE,
            Lifecycle::InProgress,
            None,
        )]));
        let channel = Arc::new(RecordingChannel::new());
        let settings = fast_settings().with_max_retries(7);
        let orch = orchestrator(trigger, status.clone(), locator_with("OK"), channel.clone(), settings);

        let report = orch.run(reference("main"), CancellationToken::new()).await;

        assert_eq!(report.state, OrchestrationState::TimedOut);
        assert_eq!(status.stage_calls(), 7);
        assert_eq!(report.polls, 7);
        assert!(matches!(
            report.error,
            Some(OrchestratorError::TimedOut { iterations: 7, .. })
        ));
        assert_eq!(status.status_calls.load(Ordering::SeqCst), 1);
        assert!(report.run_status.is_some());
        let last = channel.messages().await.pop().unwrap();
        assert!(last.contains("did not complete"));
        assert!(last.contains("run is in progress"));
    }

    #[tokio::test]
    async fn test_unrelated_stage_names_never_match() {
        let trigger = Arc::new(FakeTrigger::accepting());
        let status = Arc::new(FakeStatus::never_completing(vec![
            succeeded("security-scan-extra"),
            stage("Security-Scan", Lifecycle::Completed(Outcome::Failed), Some("failure")),
            succeeded("build"),
        ]));
        let channel = Arc::new(RecordingChannel::new());
        let orch = orchestrator(trigger, status, locator_with("OK"), channel.clone(), fast_settings());

        let report = orch.run(reference("main"), CancellationToken::new()).await;

        assert_eq!(report.state, OrchestrationState::TimedOut);
        assert!(!report.transitions.contains(&OrchestrationState::Delivering));
        assert!(!channel.messages().await.iter().any(|m| m == "OK"));
    }

    #[tokio::test]
    async fn test_failed_stage_is_not_a_timeout() {
        let trigger = Arc::new(FakeTrigger::accepting());
        let status = Arc::new(FakeStatus::new(vec![Ok(vec![stage(
            STAGE,
            Lifecycle::Completed(Outcome::Errored),
            Some("cancelled"),
        )])]));
        let channel = Arc::new(RecordingChannel::new());
        let orch = orchestrator(trigger, status.clone(), locator_with("OK"), channel.clone(), fast_settings());

        let report = orch.run(reference("main"), CancellationToken::new()).await;

        assert_eq!(report.state, OrchestrationState::Failed);
        assert_eq!(status.stage_calls(), 1);
        match &report.error {
            Some(OrchestratorError::StageFailed { conclusion, .. }) => {
                assert_eq!(conclusion, "cancelled")
            }
            other => panic!("Expected StageFailed, got {:?}", other),
        }
        let last = channel.messages().await.pop().unwrap();
        assert!(last.contains("cancelled"));
    }

    #[tokio::test]
    async fn test_failure_conclusion_fails_stage() {
        let trigger = Arc::new(FakeTrigger::accepting());
        let status = Arc::new(FakeStatus::new(vec![
            Ok(vec![stage(STAGE, Lifecycle::InProgress, None)]),
            Ok(vec![stage(STAGE, Lifecycle::Completed(Outcome::Failed), Some("failure"))]),
        ]));
        let channel = Arc::new(RecordingChannel::new());
        let orch = orchestrator(trigger, status.clone(), locator_with("OK"), channel.clone(), fast_settings());

        let report = orch.run(reference("main"), CancellationToken::new()).await;

        assert_eq!(report.state, OrchestrationState::Failed);
        assert_eq!(status.stage_calls(), 2);
        assert!(!report.transitions.contains(&OrchestrationState::Delivering));
        match &report.error {
            Some(OrchestratorError::StageFailed { stage, conclusion }) => {
                assert_eq!(stage, STAGE);
                assert_eq!(conclusion, "failure");
            }
            other => panic!("Expected StageFailed, got {:?}", other),
        }
        let messages = channel.messages().await;
        assert!(!messages.iter().any(|m| m == "OK"));
        assert_eq!(messages.iter().filter(|m| m.contains("failure")).count(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_during_run_lookup() {
        let trigger = Arc::new(FakeTrigger::accepting());
        let status = Arc::new(FakeStatus::new(vec![Ok(vec![succeeded(STAGE)])]));
        let channel = Arc::new(RecordingChannel::new());
        let mut settings = fast_settings();
        settings.trigger_settle = Duration::from_secs(60);
        let orch = orchestrator(trigger, status.clone(), locator_with("OK"), channel.clone(), settings);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let report = tokio::time::timeout(Duration::from_secs(5), orch.run(reference("main"), cancel))
            .await
            .expect("settle delay should observe cancellation");

        assert_eq!(report.state, OrchestrationState::Cancelled);
        assert!(report.run.is_none());
        assert_eq!(report.polls, 0);
        assert_eq!(status.stage_calls(), 0);
        assert!(matches!(report.error, Some(OrchestratorError::Cancelled)));
        assert_eq!(
            channel.messages().await.last().map(String::as_str),
            Some("Orchestration cancelled")
        );
    }

    #[tokio::test]
    async fn test_transient_poll_errors_are_absorbed() {
        let trigger = Arc::new(FakeTrigger::accepting());
        let status = Arc::new(FakeStatus::new(vec![
            Err(transport()),
            Err(transport()),
            Ok(vec![succeeded(STAGE)]),
        ]));
        let channel = Arc::new(RecordingChannel::new());
        let orch = orchestrator(trigger, status, locator_with("OK"), channel.clone(), fast_settings());

        let report = orch.run(reference("main"), CancellationToken::new()).await;

        assert!(report.is_success());
        assert_eq!(report.polls, 3);
        let messages = channel.messages().await;
        let poll_failures = messages
            .iter()
            .filter(|m| m.starts_with("Status check"))
            .count();
        assert_eq!(poll_failures, 1);
    }

    #[tokio::test]
    async fn test_inner_retry_budget_exhaustion_fails() {
        let trigger = Arc::new(FakeTrigger::accepting());
        let status = Arc::new(FakeStatus::new(vec![
            Err(transport()),
            Err(transport()),
            Err(transport()),
            Ok(vec![succeeded(STAGE)]),
        ]));
        let channel = Arc::new(RecordingChannel::new());
        let orch = orchestrator(trigger, status.clone(), locator_with("OK"), channel, fast_settings());

        let report = orch.run(reference("main"), CancellationToken::new()).await;

        assert_eq!(report.state, OrchestrationState::Failed);
        assert_eq!(status.stage_calls(), 3);
        assert!(matches!(report.error, Some(OrchestratorError::Client(_))));
    }

    #[tokio::test]
    async fn test_rejected_status_query_fails_immediately() {
        let trigger = Arc::new(FakeTrigger::accepting());
        let status = Arc::new(FakeStatus::new(vec![Err(ClientError::Rejected {
            operation: "list jobs".into(),
            status: 401,
            body: "Bad credentials".into(),
        })]));
        let channel = Arc::new(RecordingChannel::new());
        let orch = orchestrator(trigger, status.clone(), locator_with("OK"), channel, fast_settings());

        let report = orch.run(reference("main"), CancellationToken::new()).await;

        assert_eq!(report.state, OrchestrationState::Failed);
        assert_eq!(status.stage_calls(), 1);
        assert_eq!(report.polls, 1);
    }

    #[tokio::test]
    async fn test_unresolved_run_fails_before_polling() {
        let trigger = Arc::new(FakeTrigger::accepting());
        let mut fake = FakeStatus::new(Vec::new());
        fake.list_runs = false;
        let status = Arc::new(fake);
        let channel = Arc::new(RecordingChannel::new());
        let orch = orchestrator(trigger, status.clone(), locator_with("OK"), channel, fast_settings());

        let report = orch.run(reference("main"), CancellationToken::new()).await;

        assert_eq!(report.state, OrchestrationState::Failed);
        assert_eq!(status.stage_calls(), 0);
        assert!(matches!(
            report.error,
            Some(OrchestratorError::RunNotResolved { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_artifact_fails_with_paths() {
        let trigger = Arc::new(FakeTrigger::accepting());
        let status = Arc::new(FakeStatus::new(vec![Ok(vec![succeeded(STAGE)])]));
        let channel = Arc::new(RecordingChannel::new());
        let locator = ArtifactLocator::new(vec![Arc::new(MemorySource::empty("memory://only"))]);
        let orch = orchestrator(trigger, status, locator, channel.clone(), fast_settings());

        let report = orch.run(reference("main"), CancellationToken::new()).await;

        assert_eq!(report.state, OrchestrationState::Failed);
        let last = channel.messages().await.pop().unwrap();
        assert!(last.contains("memory://only"));
    }

    #[tokio::test]
    async fn test_empty_artifact_sends_notice() {
        let trigger = Arc::new(FakeTrigger::accepting());
        let status = Arc::new(FakeStatus::new(vec![Ok(vec![succeeded(STAGE)])]));
        let channel = Arc::new(RecordingChannel::new());
        let orch = orchestrator(trigger, status, locator_with("  \n"), channel.clone(), fast_settings());

        let report = orch.run(reference("main"), CancellationToken::new()).await;

        assert!(report.is_success());
        assert_eq!(report.chunks_delivered, 1);
        let last = channel.messages().await.pop().unwrap();
        assert_eq!(last, "Scan finished but memory://second is empty.");
    }

    #[tokio::test]
    async fn test_long_artifact_is_chunked_to_channel_limit() {
        let trigger = Arc::new(FakeTrigger::accepting());
        let status = Arc::new(FakeStatus::new(vec![Ok(vec![succeeded(STAGE)])]));
        let channel = Arc::new(RecordingChannel::with_limit(100));
        let body = "v".repeat(250);
        let mut settings = fast_settings();
        settings.code_fence = true;
        let orch = orchestrator(trigger, status, locator_with(&body), channel.clone(), settings);

        let report = orch.run(reference("main"), CancellationToken::new()).await;

        assert!(report.is_success(), "report: {:?}", report.error);
        assert_eq!(report.chunks_delivered, 3);
        let fenced: Vec<_> = channel
            .messages()
            .await
            .into_iter()
            .filter(|m| m.starts_with("```"))
            .collect();
        assert_eq!(fenced.len(), 3);
        assert!(fenced.iter().all(|m| m.chars().count() <= 100));
    }

    #[tokio::test]
    async fn test_channel_failure_mid_delivery_stops_sending() {
        let trigger = Arc::new(FakeTrigger::accepting());
        let status = Arc::new(FakeStatus::new(vec![Ok(vec![succeeded(STAGE)])]));
        // Four progress messages precede the chunks, so only the first chunk lands.
        let channel = Arc::new(RecordingChannel::with_limit(100).failing_after(5));
        let body = format!("{}{}{}", "a".repeat(100), "b".repeat(100), "c".repeat(50));
        let orch = orchestrator(trigger, status, locator_with(&body), channel.clone(), fast_settings());

        let report = orch.run(reference("main"), CancellationToken::new()).await;

        assert_eq!(report.state, OrchestrationState::Failed);
        assert!(report.transitions.contains(&OrchestrationState::Delivering));
        assert!(matches!(report.error, Some(OrchestratorError::Delivery(_))));
        assert_eq!(report.chunks_delivered, 0);

        let messages = channel.messages().await;
        assert_eq!(messages.len(), 5);
        assert_eq!(messages.last(), Some(&"a".repeat(100)));
        assert!(!messages.iter().any(|m| m.starts_with('b') || m.starts_with('c')));
    }

    #[tokio::test]
    async fn test_cancellation_stops_polling() {
        let trigger = Arc::new(FakeTrigger::accepting());
        let status = Arc::new(FakeStatus::never_completing(Vec::new()));
        let channel = Arc::new(RecordingChannel::new());
        let mut settings = fast_settings().with_max_retries(10_000);
        settings.poll_interval = Duration::from_millis(5);
        let orch = orchestrator(trigger, status, locator_with("OK"), channel.clone(), settings);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });
        let report = orch.run(reference("main"), cancel).await;

        assert_eq!(report.state, OrchestrationState::Cancelled);
        assert!(report.polls < 10_000);
        assert!(!channel.messages().await.iter().any(|m| m == "OK"));
    }

    #[tokio::test]
    async fn test_progress_events_are_broadcast() {
        let trigger = Arc::new(FakeTrigger::accepting());
        let status = Arc::new(FakeStatus::new(vec![Ok(vec![succeeded(STAGE)])]));
        let channel = Arc::new(RecordingChannel::new());
        let (tx, mut rx) = broadcast::channel(64);
        let orch = orchestrator(trigger, status, locator_with("OK"), channel, fast_settings())
            .with_progress(tx);

        let report = orch.run(reference("main"), CancellationToken::new()).await;
        assert!(report.is_success());

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(ProgressEvent::Triggering { .. })));
        assert!(events.iter().any(|e| matches!(e, ProgressEvent::StagePolled { .. })));
        assert!(matches!(
            events.last(),
            Some(ProgressEvent::Finished {
                state: OrchestrationState::Delivered,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_orchestrations_are_independent() {
        let trigger = Arc::new(FakeTrigger::accepting());
        let status = Arc::new(FakeStatus::never_completing(vec![succeeded(STAGE)]));
        let channel = Arc::new(RecordingChannel::new());
        let orch = orchestrator(trigger.clone(), status, locator_with("OK"), channel.clone(), fast_settings());

        let (a, b) = tokio::join!(
            orch.run(reference("feature/a"), CancellationToken::new()),
            orch.run(reference("feature/b"), CancellationToken::new())
        );

        assert!(a.is_success() && b.is_success());
        assert_ne!(a.instance, b.instance);
        assert_eq!(a.reference.as_str(), "feature/a");
        assert_eq!(b.reference.as_str(), "feature/b");
        assert_eq!(trigger.calls.load(Ordering::SeqCst), 2);
        let delivered = channel.messages().await.iter().filter(|m| *m == "OK").count();
        assert_eq!(delivered, 2);
    }

    #[test]
    fn test_select_run_filters_branch_and_time() {
        let triggered_at = Utc::now();
        let summary = |id: u64, branch: &str, offset_secs: i64| RunSummary {
            id,
            head_branch: Some(branch.into()),
            created_at: Some(triggered_at + chrono::Duration::seconds(offset_secs)),
            html_url: None,
            lifecycle: Lifecycle::Pending,
        };
        let runs = vec![
            summary(1, "other", 5),
            summary(2, "main", -600),
            summary(3, "main", 2),
            summary(4, "main", -10),
        ];

        let picked = select_triggered_run(&runs, &reference("main"), triggered_at, Duration::from_secs(30));
        assert_eq!(picked.map(|h| h.id), Some(3));

        let strict = select_triggered_run(&runs[..2], &reference("main"), triggered_at, Duration::from_secs(30));
        assert!(strict.is_none());
    }

    #[test]
    fn test_select_run_ignores_missing_created_at() {
        let runs = vec![RunSummary {
            id: 9,
            head_branch: Some("main".into()),
            created_at: None,
            html_url: None,
            lifecycle: Lifecycle::Pending,
        }];
        assert!(select_triggered_run(&runs, &reference("main"), Utc::now(), Duration::ZERO).is_none());
    }
}
