//! Domain-specific errors for update sessions.
//!
//! The taxonomy follows how a failure should be handled: configuration
//! errors abort before a session starts, appcast errors end the check,
//! download errors leave the session resumable by a fresh check,
//! extraction/signature failures discard the artifact, and installation
//! errors keep the artifact when a retry is safe. Cancellation is not an
//! error anywhere in this crate.

use thiserror::Error;

use crate::appcast::AppcastError;
use crate::download::DownloadError;
use crate::extract::ExtractError;
use crate::settings::SettingsError;
use crate::signing::SignatureError;

/// Everything a check cycle can fail with.
#[derive(Error, Debug)]
pub enum UpdateError {
    /// The host is misconfigured (bad feed URL, empty identity). Fatal to
    /// starting a session; never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Fetching or resolving the feed failed.
    #[error("Appcast error: {0}")]
    Appcast(#[from] AppcastError),

    /// Streaming the artifact failed; a later check may succeed.
    #[error("Download failed: {0}")]
    Download(#[from] DownloadError),

    /// Unpacking or validating the artifact failed; the artifact is
    /// discarded, never installed.
    #[error("Extraction failed: {0}")]
    Extraction(#[from] ExtractError),

    /// The artifact did not authenticate; it is discarded.
    #[error("Signature verification failed: {0}")]
    Signature(#[from] SignatureError),

    /// The resolved update does not move the host forward.
    #[error("Refusing to install {candidate}: not newer than installed {installed}")]
    Downgrade {
        /// Version offered by the feed.
        candidate: String,
        /// Version the host currently runs.
        installed: String,
    },

    /// The privileged installer launch was denied or failed. Non-fatal to
    /// the staged update, which remains resumable.
    #[error("Authorization failed: {0}")]
    Authorization(String),

    /// The installer handoff itself failed.
    #[error("Installation failed: {0}")]
    Installation(String),

    /// Settings could not be read or persisted.
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    /// Staging-area or other local I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
