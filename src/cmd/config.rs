//! Configuration view and validation commands: `pipewatch config`.

use anyhow::{Context, Result};
use std::path::Path;

use super::super::ConfigCommands;

use pipewatch::config::{CONFIG_DIR, CONFIG_FILE, ENV_TOKEN, PipewatchConfig, PipewatchToml};

fn redacted(toml: &PipewatchToml) -> PipewatchToml {
    let mut shown = toml.clone();
    if shown.github.token.is_some() {
        shown.github.token = Some("<redacted>".to_string());
    }
    shown
}

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_dir = project_dir.join(CONFIG_DIR);
    let config_path = config_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Pipewatch Configuration");
            println!("=======================");
            println!();

            let config = PipewatchConfig::new(project_dir.to_path_buf())?;
            match &config.source {
                Some(source) => println!("Config file: {}", source.display()),
                None => {
                    println!("No pipewatch.toml found at {}", config_path.display());
                    println!("Using default configuration.");
                }
            }
            println!();

            let rendered = toml::to_string_pretty(&redacted(&config.toml))
                .context("Failed to render configuration")?;
            for line in rendered.lines() {
                println!("  {}", line);
            }
            println!();

            println!("Effective values (with env/CLI overrides):");
            match config.repo() {
                Ok(repo) => println!("  repository = \"{}\"", repo),
                Err(_) => println!("  repository = (not set)"),
            }
            let token_source = if std::env::var(ENV_TOKEN).is_ok_and(|v| !v.trim().is_empty()) {
                ENV_TOKEN
            } else if config.toml.github.token.is_some() {
                "file"
            } else {
                "missing"
            };
            println!("  token = ({})", token_source);
            println!(
                "  webhook = {}",
                if config.webhook_url().is_some() { "(set)" } else { "(not set)" }
            );
            println!("  target_stage = \"{}\"", config.target_stage());
            println!("  max_retries = {}", config.max_retries());
            println!();

            if config.source.is_none() {
                println!("Run 'pipewatch config init' to create a pipewatch.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let config = PipewatchConfig::new(project_dir.to_path_buf())?;
            if config.source.is_none() {
                println!("No pipewatch.toml found. Checking defaults and environment.");
            }
            let warnings = config.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("pipewatch.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !config_dir.exists() {
                std::fs::create_dir_all(&config_dir).with_context(|| {
                    format!("Failed to create {}", config_dir.display())
                })?;
            }

            PipewatchToml::default().save(&config_path)?;

            println!("Created pipewatch.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [github] owner, repo, workflow, inputs");
            println!("  - [poll] target_stage, max_retries, interval_ms");
            println!("  - [artifact] candidates");
            println!("  - [delivery] webhook_url, max_chunk_size, code_fence");
            println!();
            println!("Keep the token out of the file: export {} instead.", ENV_TOKEN);
            println!();
        }
    }

    Ok(())
}
