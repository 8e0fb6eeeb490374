//! The user-interaction boundary.
//!
//! The session machine never presents anything itself; it talks to whatever
//! the host supplies through [`UserDriver`]. The trait is a capability set:
//! every report has an explicit default (a no-op), and only the three
//! choice-bearing calls must be implemented. Every call is made from the
//! session task and completes by returning; nothing is polled, and a
//! returned future acts as the acknowledgement handshake, so each terminal
//! report is observed exactly once.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::appcast::AppcastItem;
use crate::error::UpdateError;
use crate::select::NoUpdateReason;
use crate::settings::{PermissionRequest, PermissionResponse};

/// The user's three-way answer when an update is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserChoice {
    /// Proceed with the update from its current stage.
    Install,
    /// Put the update aside; artifacts are kept and the session resumes on
    /// a later check.
    Dismiss,
    /// Decline the update. At the found stage this persists a skip marker;
    /// at the ready-to-install stage it only abandons the in-flight install.
    Skip,
}

/// Where the presented update currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStage {
    /// Nothing staged yet.
    NotDownloaded,
    /// Artifact downloaded and validated in the staging area.
    Downloaded,
    /// An installer was already engaged in a prior session.
    Installing,
    /// Informational item; there is nothing to download.
    Informational,
}

/// Transient description of the session for one presentation.
///
/// Recomputed whenever the session needs to describe itself; never
/// persisted.
#[derive(Debug, Clone, Copy)]
pub struct UserUpdateState {
    /// Current stage of the presented item.
    pub stage: UpdateStage,
    /// Whether a human initiated the check.
    pub user_initiated: bool,
    /// Whether the item is a major upgrade needing explicit consent.
    pub major_upgrade: bool,
}

/// Whether the host application will terminate for the installer now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationResponse {
    /// Terminate and hand off immediately.
    Terminate,
    /// The application wants to delay; the session retries once before
    /// handing off regardless (the installer outlives the host).
    Delay,
}

/// Host-supplied presentation capabilities consumed by the session machine.
///
/// All methods are invoked from the session task only; implementations may
/// assume single-threaded confinement of their own state per session.
#[async_trait]
pub trait UserDriver: Send + Sync {
    /// Asks the one-time permission question while settings are unresolved.
    async fn request_permission(&self, request: PermissionRequest) -> PermissionResponse;

    /// A check has started; `cancel` aborts it up to download completion.
    async fn check_started(&self, cancel: CancellationToken) {
        let _ = cancel;
    }

    /// Presents a found update and waits for the user's choice.
    async fn update_found(&self, item: &AppcastItem, state: UserUpdateState) -> UserChoice;

    /// Incremental download progress.
    async fn download_progress(&self, received: u64, expected: Option<u64>) {
        let _ = (received, expected);
    }

    /// Fractional extraction progress in `0.0..=1.0`.
    async fn extraction_progress(&self, fraction: f64) {
        let _ = fraction;
    }

    /// Final confirmation before the installer engages.
    async fn ready_to_install(&self, item: &AppcastItem) -> UserChoice;

    /// Asks whether the application may terminate for installation now.
    async fn request_termination(&self) -> TerminationResponse {
        TerminationResponse::Terminate
    }

    /// The installer has been handed the update; `terminated` reports
    /// whether the application agreed to exit first.
    async fn installing(&self, terminated: bool) {
        let _ = terminated;
    }

    /// Terminal: the update installed; acknowledged once.
    async fn installed(&self, relaunched: bool) {
        let _ = relaunched;
    }

    /// Terminal: no update qualified; acknowledged once.
    async fn no_update(&self, reason: NoUpdateReason) {
        let _ = reason;
    }

    /// Terminal: the session failed; acknowledged once.
    async fn error(&self, error: &UpdateError) {
        let _ = error;
    }

    /// A user-initiated check arrived while a session is already in
    /// progress; bring whatever is currently presented into focus.
    async fn bring_to_focus(&self) {}

    /// Tear down any visible presentation.
    async fn dismiss_all(&self) {}
}
