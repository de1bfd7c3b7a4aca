//! Full orchestration and bare triggering: `pipewatch run` and `pipewatch trigger`.

use anyhow::{Result, bail};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use pipewatch::config::{ENV_WEBHOOK_URL, PipewatchConfig};
use pipewatch::delivery::{OutputChannel, StdoutChannel, WebhookChannel};
use pipewatch::github::{GitHubClient, RunReference, TriggerOutcome};
use pipewatch::orchestrator::{OrchestrationState, Orchestrator, ProgressEvent};

fn output_channel(config: &PipewatchConfig, to_stdout: bool) -> Result<Arc<dyn OutputChannel>> {
    if to_stdout {
        return Ok(Arc::new(StdoutChannel));
    }
    match config.webhook_url() {
        Some(url) => Ok(Arc::new(WebhookChannel::new(reqwest::Client::new(), url))),
        None => bail!(
            "No output channel configured. Set {} or [delivery] webhook_url, or pass --stdout",
            ENV_WEBHOOK_URL
        ),
    }
}

fn print_event(event: &ProgressEvent, to_stdout: bool) {
    match event {
        ProgressEvent::StagePolled { .. } => {
            eprintln!("  {}", console::style(event).dim());
        }
        ProgressEvent::Finished { .. } => {}
        // Already printed by the stdout channel.
        _ if to_stdout => {}
        ProgressEvent::PollFailed { .. } => {
            eprintln!("  {} {}", console::style("⚠").yellow(), event);
        }
        _ => eprintln!("{} {}", console::style("→").cyan(), event),
    }
}

pub async fn cmd_run(config: &PipewatchConfig, reference: &str, to_stdout: bool) -> Result<()> {
    let reference = RunReference::new(reference)?;
    let client = Arc::new(GitHubClient::new(config.github_settings()?)?);
    let channel = output_channel(config, to_stdout)?;
    let settings = config.orchestrator_settings();

    tracing::info!(
        repo = %client.repo(),
        stage = %settings.target_stage,
        max_retries = settings.max_retries,
        "starting orchestration"
    );

    let (events_tx, mut events_rx) = broadcast::channel(64);
    let orchestrator = Orchestrator::new(
        client.clone(),
        client,
        config.artifact_locator(),
        channel,
        settings,
    )
    .with_progress(events_tx);

    let printer = tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(event) => print_event(&event, to_stdout),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "progress printer lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling");
            on_interrupt.cancel();
        }
    });

    let report = orchestrator.run(reference, cancel).await;
    drop(orchestrator);
    if let Err(e) = printer.await {
        tracing::debug!(error = %e, "progress printer stopped");
    }

    eprintln!();
    let label = match report.state {
        OrchestrationState::Delivered => console::style("Delivered").green().bold(),
        OrchestrationState::TimedOut => console::style("Timed out").yellow().bold(),
        OrchestrationState::Cancelled => console::style("Cancelled").yellow().bold(),
        _ => console::style("Failed").red().bold(),
    };
    eprintln!("{} {}", label, report.summary);
    if let Some(run) = &report.run {
        match &run.html_url {
            Some(url) => eprintln!("  run {} ({})", run, url),
            None => eprintln!("  run {}", run),
        }
    }
    eprintln!("  stage checks: {}", report.polls);

    if !report.is_success() {
        bail!(
            "Run for '{}' ended in state {}",
            report.reference,
            report.state
        );
    }
    Ok(())
}

pub async fn cmd_trigger(config: &PipewatchConfig, reference: &str) -> Result<()> {
    let reference = RunReference::new(reference)?;
    let client = GitHubClient::new(config.github_settings()?)?;

    println!("Triggering analysis for branch: {}", reference);
    match client.dispatch(&reference).await {
        TriggerOutcome::Accepted { triggered_at } => {
            println!(
                "{} Workflow triggered successfully for branch: {}",
                console::style("✓").green(),
                reference
            );
            tracing::debug!(%triggered_at, "dispatch accepted");
            Ok(())
        }
        TriggerOutcome::Rejected { status, body } => {
            bail!("Failed to trigger workflow: {} - {}", status, body)
        }
        TriggerOutcome::TransportFailed { message } => {
            bail!("Failed to trigger workflow: {}", message)
        }
    }
}
