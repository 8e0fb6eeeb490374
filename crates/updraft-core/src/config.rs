//! Host configuration for an updater instance.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

/// Everything the engine needs to know about the hosting application.
///
/// Built once by the host and handed to [`crate::session::UpdateSession`].
/// Paths that are left `None` default to the per-bundle layout under
/// `~/.updraft/<bundle id>/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Stable identity of the hosting application. Keys the settings file
    /// and the staging directory.
    pub bundle_id: String,

    /// Currently installed version, compared against feed items.
    pub host_version: String,

    /// Running OS version, checked against item OS bounds.
    pub os_version: String,

    /// Appcast feed URL. Settings may override it at runtime.
    pub feed_url: String,

    /// Base64-encoded Ed25519 public key for artifact signatures. `None`
    /// means the host explicitly runs unsigned.
    #[serde(default)]
    pub public_key: Option<String>,

    /// Install destination: the application binary or bundle directory to
    /// replace.
    pub target_path: PathBuf,

    /// Executable to relaunch after a successful install. Defaults to the
    /// target path.
    #[serde(default)]
    pub relaunch_path: Option<PathBuf>,

    /// Whether this host is capable of silent automatic downloads at all.
    /// Caps the user's persisted preference.
    #[serde(default)]
    pub allows_automatic_downloads: bool,

    /// Channels the host subscribes to. Items on an unlisted channel are
    /// never offered; channel-less items always are.
    #[serde(default)]
    pub allowed_channels: HashSet<String>,

    /// Overrides the default `User-Agent` on feed and artifact requests.
    #[serde(default)]
    pub user_agent: Option<String>,

    /// Extra headers sent on every feed and artifact request.
    #[serde(default)]
    pub http_headers: Vec<(String, String)>,

    /// Overrides the default staging directory.
    #[serde(default)]
    pub staging_root: Option<PathBuf>,

    /// Overrides the default settings file path.
    #[serde(default)]
    pub settings_path: Option<PathBuf>,
}

impl UpdaterConfig {
    /// Validates the parts the engine cannot limp along without.
    pub fn validate(&self) -> Result<(), UpdateError> {
        if self.bundle_id.trim().is_empty() {
            return Err(UpdateError::Configuration("bundle_id is empty".into()));
        }
        if self.host_version.trim().is_empty() {
            return Err(UpdateError::Configuration("host_version is empty".into()));
        }
        reqwest::Url::parse(&self.feed_url)
            .map_err(|e| UpdateError::Configuration(format!("invalid feed URL: {e}")))?;
        Ok(())
    }

    /// Resolved user-agent string.
    pub fn user_agent(&self) -> &str {
        self.user_agent.as_deref().unwrap_or(crate::USER_AGENT)
    }

    /// Resolved relaunch executable.
    pub fn relaunch_path(&self) -> &PathBuf {
        self.relaunch_path.as_ref().unwrap_or(&self.target_path)
    }

    /// Resolved settings file path.
    pub fn settings_path(&self) -> PathBuf {
        self.settings_path
            .clone()
            .unwrap_or_else(|| crate::settings_path(&self.bundle_id))
    }

    /// Resolved staging directory.
    pub fn staging_root(&self) -> PathBuf {
        self.staging_root
            .clone()
            .unwrap_or_else(|| crate::staging_path(&self.bundle_id))
    }

    /// Anonymous system-profile pairs, sent with feed requests only when the
    /// user has consented.
    pub fn system_profile(&self) -> Vec<(String, String)> {
        vec![
            ("appName".into(), self.bundle_id.clone()),
            ("appVersion".into(), self.host_version.clone()),
            ("osVersion".into(), self.os_version.clone()),
            ("cpuArch".into(), std::env::consts::ARCH.into()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> UpdaterConfig {
        UpdaterConfig {
            bundle_id: "com.example.app".into(),
            host_version: "1.0".into(),
            os_version: "14.2".into(),
            feed_url: "https://example.com/appcast.json".into(),
            public_key: None,
            target_path: PathBuf::from("/Applications/Example"),
            relaunch_path: None,
            allows_automatic_downloads: false,
            allowed_channels: HashSet::new(),
            user_agent: None,
            http_headers: Vec::new(),
            staging_root: None,
            settings_path: None,
        }
    }

    #[test]
    fn test_valid_config_passes() {
        base_config().validate().unwrap();
    }

    #[test]
    fn test_bad_feed_url_is_rejected() {
        let mut config = base_config();
        config.feed_url = "not a url".into();
        assert!(matches!(
            config.validate(),
            Err(UpdateError::Configuration(_))
        ));
    }

    #[test]
    fn test_empty_bundle_id_is_rejected() {
        let mut config = base_config();
        config.bundle_id = "  ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_path_defaults() {
        let config = base_config();
        assert_eq!(config.relaunch_path(), &config.target_path);
        assert_eq!(config.user_agent(), crate::USER_AGENT);
        assert!(config.settings_path().ends_with("com.example.app/settings.json"));
    }

    #[test]
    fn test_profile_carries_host_identity() {
        let profile = base_config().system_profile();
        assert!(profile.iter().any(|(k, v)| k == "appVersion" && v == "1.0"));
        assert!(profile.iter().any(|(k, v)| k == "osVersion" && v == "14.2"));
    }
}
