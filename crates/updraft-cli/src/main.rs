//! updraft - console host for appcast-driven updates

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use updraft_cli::console::ConsoleDriver;
use updraft_cli::{Cli, Commands, SettingsCommands, load_config};
use updraft_core::session::{CheckInitiation, CheckOutcome, UpdateSession};
use updraft_core::settings::{SettingsHandle, SettingsStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let settings = SettingsHandle::spawn(SettingsStore::open(config.settings_path()))?;

    let result = match cli.command {
        Commands::Check => run_check(config, settings.clone(), CheckInitiation::UserInitiated).await,
        Commands::Background => run_check(config, settings.clone(), CheckInitiation::Background).await,
        Commands::Settings { command } => run_settings(&settings, command).await,
    };

    settings.shutdown();
    result
}

async fn run_check(
    config: updraft_core::UpdaterConfig,
    settings: SettingsHandle,
    initiation: CheckInitiation,
) -> Result<()> {
    let driver = match initiation {
        CheckInitiation::UserInitiated => ConsoleDriver::interactive(),
        CheckInitiation::Background => {
            // Scheduled checks only act on the user's recorded consent.
            let current = settings.get().await?;
            ConsoleDriver::unattended(
                current.automatic_downloads_enabled(config.allows_automatic_downloads),
            )
        }
    };
    let session = UpdateSession::new(config, settings, Arc::new(driver))?;

    let outcome = session.check(initiation).await?;
    match outcome {
        CheckOutcome::UpdateInstalled { .. }
        | CheckOutcome::Dismissed
        | CheckOutcome::Skipped
        | CheckOutcome::NoUpdate(_)
        | CheckOutcome::Cancelled => Ok(()),
        CheckOutcome::AlreadyInProgress => bail!("another check is already in progress"),
    }
}

async fn run_settings(settings: &SettingsHandle, command: SettingsCommands) -> Result<()> {
    match command {
        SettingsCommands::Show => {
            let current = settings.get().await?;
            println!("{}", serde_json::to_string_pretty(&current)?);
            Ok(())
        }
        SettingsCommands::Set { key, value } => {
            match key.as_str() {
                "automatic-checks" => {
                    let enabled = parse_bool(&value)?;
                    settings
                        .update(move |s| s.automatic_checks = Some(enabled))
                        .await?;
                }
                "automatic-downloads" => {
                    let enabled = parse_bool(&value)?;
                    settings
                        .update(move |s| s.automatic_downloads = Some(enabled))
                        .await?;
                }
                "check-interval" => {
                    let seconds: u64 = value
                        .parse()
                        .with_context(|| format!("'{value}' is not a number of seconds"))?;
                    if seconds == 0 {
                        bail!("check-interval must be positive");
                    }
                    settings
                        .update(move |s| s.update_check_interval = Some(seconds))
                        .await?;
                }
                "send-profile" => {
                    let enabled = parse_bool(&value)?;
                    settings
                        .update(move |s| s.send_system_profile = enabled)
                        .await?;
                }
                "clear-skips" => {
                    settings.update(|s| s.clear_skips()).await?;
                }
                other => bail!("unknown setting '{other}'"),
            }
            println!("ok");
            Ok(())
        }
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        other => bail!("'{other}' is not a boolean"),
    }
}
