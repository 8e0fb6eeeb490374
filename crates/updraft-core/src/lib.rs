//! updraft - appcast-driven application updates
//!
//! Updraft turns a published update feed (an "appcast") into a ranked
//! decision and drives the download → extract → authorize → install →
//! relaunch lifecycle through a cancellable, resumable session machine.
//!
//! # Architecture
//!
//! - **Session machine**: [`session::UpdateSession`] serializes every state
//!   transition on one logical task; downloads and extraction run on
//!   background contexts and report back through generation-tagged events,
//!   so a cancelled operation can never transition the session.
//! - **Actor pattern**: persisted settings are owned by a dedicated thread
//!   behind [`settings::SettingsHandle`] for write serialization.
//! - **Seams**: the user-interaction boundary ([`driver::UserDriver`]), the
//!   installer handoff ([`install::Installer`]), and signature checking
//!   ([`signing::SignatureVerifier`]) are traits the host supplies or takes
//!   the built-in implementations of.
//!
//! # Directory Layout
//!
//! ```text
//! ~/.updraft/<bundle id>/
//! ├── settings.json   # persisted user choices (checks, interval, skips)
//! └── staging/        # downloaded artifact, extraction tree, resume marker
//! ```

pub mod appcast;
pub mod config;
pub mod download;
pub mod driver;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod install;
pub mod select;
pub mod session;
pub mod settings;
pub mod signing;
pub mod version;

// Re-exports for convenience
pub use appcast::{Appcast, AppcastError, AppcastItem, InstallationKind};
pub use config::UpdaterConfig;
pub use driver::{UserChoice, UserDriver, UserUpdateState};
pub use error::UpdateError;
pub use select::{NoUpdateReason, SelectedUpdate, UpdateSelector};
pub use session::{CheckInitiation, CheckOutcome, UpdateSession};
pub use settings::{PermissionRequest, PermissionResponse, Settings, SettingsHandle};
pub use version::{StandardComparator, VersionComparator};

use std::path::PathBuf;

use dirs::home_dir;

/// Returns the primary updraft data directory, or None if the user's home
/// cannot be resolved.
pub fn try_updraft_home() -> Option<PathBuf> {
    if let Ok(val) = std::env::var("UPDRAFT_HOME") {
        return Some(PathBuf::from(val));
    }
    home_dir().map(|h| h.join(".updraft"))
}

/// Returns the canonical updraft data directory (`~/.updraft`).
///
/// # Panics
/// Panics if the home directory cannot be determined.
pub fn updraft_home() -> PathBuf {
    try_updraft_home().expect("Could not determine home directory")
}

/// Per-host settings file path: `~/.updraft/<bundle id>/settings.json`
pub fn settings_path(bundle_id: &str) -> PathBuf {
    updraft_home().join(bundle_id).join("settings.json")
}

/// Per-host staging area path: `~/.updraft/<bundle id>/staging`
///
/// The staging area holds the downloaded artifact, the extraction tree, and
/// the resume marker for interrupted sessions. It lives on the same volume
/// as the settings file so marker writes stay atomic.
pub fn staging_path(bundle_id: &str) -> PathBuf {
    updraft_home().join(bundle_id).join("staging")
}

/// Extract the filename from a URL.
///
/// # Example
///
/// ```
/// use updraft_core::filename_from_url;
///
/// assert_eq!(filename_from_url("https://example.com/path/App-2.0.tar.gz"), "App-2.0.tar.gz");
/// assert_eq!(filename_from_url(""), "");
/// ```
pub fn filename_from_url(url: &str) -> &str {
    url.split('/').next_back().unwrap_or("")
}

/// User Agent string sent on feed and artifact requests
pub const USER_AGENT: &str = concat!("updraft/", env!("CARGO_PKG_VERSION"));
