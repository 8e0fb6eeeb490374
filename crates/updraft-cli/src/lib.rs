//! updraft - console host for appcast-driven updates
//!
//! A terminal front end for the `updraft-core` engine: it loads the host
//! description from a TOML file, implements the user-interaction boundary
//! on stdin/stdout, and drives check cycles through the session machine.

pub mod console;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use updraft_core::UpdaterConfig;

/// Command-line interface definition.
#[derive(Parser)]
#[command(name = "updraft", version, about = "Appcast-driven application updates")]
pub struct Cli {
    /// Path to the host configuration file.
    #[arg(long, global = true, default_value = "updraft.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Check for an update now, interactively. Ignores skip markers and
    /// phased rollout.
    Check,
    /// Check with scheduled-check semantics: honors skip markers, phased
    /// rollout, and automatic-download consent; quiet when nothing applies.
    Background,
    /// Inspect or change persisted updater settings.
    Settings {
        #[command(subcommand)]
        command: SettingsCommands,
    },
}

/// `updraft settings` subcommands.
#[derive(Subcommand)]
pub enum SettingsCommands {
    /// Print the persisted settings as JSON.
    Show,
    /// Set one setting.
    ///
    /// Keys: automatic-checks, automatic-downloads, check-interval,
    /// send-profile, clear-skips.
    Set {
        /// Setting key.
        key: String,
        /// New value (`true`/`false`, or seconds for check-interval; ignored
        /// for clear-skips).
        #[arg(default_value = "")]
        value: String,
    },
}

/// Loads the host configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<UpdaterConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("could not read {}", path.display()))?;
    let config: UpdaterConfig =
        toml::from_str(&text).with_context(|| format!("invalid config in {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("updraft.toml");
        std::fs::write(
            &path,
            r#"
bundle_id = "com.example.app"
host_version = "1.0"
os_version = "14.2"
feed_url = "https://example.com/appcast.json"
target_path = "/tmp/example-app"
allowed_channels = ["beta"]
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.bundle_id, "com.example.app");
        assert!(config.allowed_channels.contains("beta"));
        assert!(config.public_key.is_none());
    }

    #[test]
    fn test_invalid_feed_url_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("updraft.toml");
        std::fs::write(
            &path,
            r#"
bundle_id = "com.example.app"
host_version = "1.0"
os_version = "14.2"
feed_url = "nope"
target_path = "/tmp/example-app"
"#,
        )
        .unwrap();
        assert!(load_config(&path).is_err());
    }
}
