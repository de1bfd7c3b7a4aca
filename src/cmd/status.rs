//! Run inspection: `pipewatch status <run-id>`.

use anyhow::{Context, Result};

use pipewatch::config::PipewatchConfig;
use pipewatch::github::{GitHubClient, Lifecycle, Outcome};

fn styled_lifecycle(lifecycle: &Lifecycle) -> console::StyledObject<String> {
    let text = lifecycle.to_string();
    match lifecycle.outcome() {
        Some(Outcome::Succeeded) => console::style(text).green(),
        Some(Outcome::Failed) => console::style(text).red(),
        Some(Outcome::Errored) => console::style(text).yellow(),
        None => console::style(text).dim(),
    }
}

pub async fn cmd_status(config: &PipewatchConfig, run_id: u64) -> Result<()> {
    let client = GitHubClient::new(config.github_settings()?)?;
    let target = config.target_stage();

    let run = client
        .get_run(run_id)
        .await
        .with_context(|| format!("Failed to load run {}", run_id))?;
    let stages = client
        .list_jobs(run_id)
        .await
        .with_context(|| format!("Failed to load stages of run {}", run_id))?;

    println!();
    println!(
        "{} #{} on {}",
        console::style("Run").bold(),
        run.id,
        run.head_branch.as_deref().unwrap_or("?")
    );
    println!("  status: {}", styled_lifecycle(&run.lifecycle()));
    if let Some(url) = &run.html_url {
        println!("  url:    {}", url);
    }
    println!();

    if stages.is_empty() {
        println!("No stages scheduled yet.");
    }
    for stage in &stages {
        let marker = if stage.name == target { "▶" } else { " " };
        println!(
            "  {} {:<30} {}",
            console::style(marker).cyan(),
            stage.name,
            styled_lifecycle(&stage.lifecycle)
        );
    }
    if !stages.iter().any(|s| s.name == target) {
        println!();
        println!("Target stage '{}' is not scheduled yet.", target);
    }
    println!();

    Ok(())
}
