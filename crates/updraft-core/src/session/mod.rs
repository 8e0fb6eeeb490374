//! The update session machine.
//!
//! One [`UpdateSession`] owns everything a check cycle touches: the feed
//! client, the staging area, the settings actor, and the seams (driver,
//! verifier, installer). All state transitions happen on the task that
//! called [`UpdateSession::check`]; downloads and extraction run on
//! background contexts and report through generation-tagged events, so
//! completions from a superseded operation are discarded rather than
//! transitioning the session.
//!
//! A session that ends in `Dismiss` after the artifact landed leaves a
//! resume marker behind; the next check re-enters at the confirm stage
//! without re-downloading, re-validating the artifact by content hash.

mod gate;

pub use gate::GenerationGate;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::appcast::{Appcast, AppcastItem, InstallationKind, ItemResolver, parse_feed};
use crate::config::UpdaterConfig;
use crate::download::{self, DownloadError, DownloadedArtifact};
use crate::driver::{TerminationResponse, UpdateStage, UserChoice, UserDriver, UserUpdateState};
use crate::error::UpdateError;
use crate::extract;
use crate::fetch::FeedClient;
use crate::install::{
    InstallJob, Installer, ProcessInstaller, ResumeMarker, ResumeStage, StagingArea,
};
use crate::select::{
    PHASED_ROLLOUT_GROUP_COUNT, SelectedUpdate, Selection, SelectionContext, UpdateSelector,
};
use crate::settings::{PermissionRequest, SettingsHandle};
use crate::signing::{AcceptAllVerifier, Ed25519Verifier, SignatureVerifier};
use crate::version::{StandardComparator, VersionComparator};
use gate::InProgressGuard;

/// Who asked for this check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckInitiation {
    /// A human explicitly asked. Ignores skip markers and rollout deferral,
    /// and focuses an in-progress session instead of being rejected.
    UserInitiated,
    /// Scheduled or host-triggered background check.
    Background,
}

impl CheckInitiation {
    fn is_user_initiated(self) -> bool {
        matches!(self, Self::UserInitiated)
    }
}

/// How a check cycle ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The update was handed to the installer and completed.
    UpdateInstalled {
        /// Whether the application was relaunched afterwards.
        relaunched: bool,
    },
    /// The user put the update aside; staged artifacts were preserved.
    Dismissed,
    /// The user declined the update and a skip marker was persisted.
    Skipped,
    /// No update qualified.
    NoUpdate(crate::select::NoUpdateReason),
    /// The check was cancelled, or the final confirmation abandoned the
    /// staged install.
    Cancelled,
    /// Another check is already in progress; nothing was started.
    AlreadyInProgress,
}

/// Observable coarse session state, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session running.
    Idle,
    /// Waiting on the one-time permission answer.
    PermissionPending,
    /// Fetching and resolving the feed.
    Checking,
    /// An update was found and is being presented.
    Found,
    /// Streaming the artifact.
    Downloading,
    /// Unpacking and validating the artifact.
    Extracting,
    /// Waiting on install authorization.
    Authorizing,
    /// Staged and waiting on the final confirmation.
    ReadyToInstall,
    /// Handed to the installer; no longer cancellable.
    Installing,
}

/// Drives one check/download/install cycle end to end.
pub struct UpdateSession {
    config: UpdaterConfig,
    settings: SettingsHandle,
    driver: Arc<dyn UserDriver>,
    installer: Arc<dyn Installer>,
    verifier: Arc<dyn SignatureVerifier>,
    comparator: Arc<dyn VersionComparator>,
    http: reqwest::Client,
    in_progress: AtomicBool,
    gate: GenerationGate,
    state_tx: watch::Sender<SessionState>,
}

impl std::fmt::Debug for UpdateSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateSession")
            .field("bundle_id", &self.config.bundle_id)
            .field("in_progress", &self.session_in_progress())
            .finish_non_exhaustive()
    }
}

impl UpdateSession {
    /// Builds a session over validated configuration with the default
    /// installer and comparator. The verifier comes from the configured
    /// public key; a host without one runs permissive.
    pub fn new(
        config: UpdaterConfig,
        settings: SettingsHandle,
        driver: Arc<dyn UserDriver>,
    ) -> Result<Self, UpdateError> {
        config.validate()?;
        let verifier: Arc<dyn SignatureVerifier> = match config.public_key.as_deref() {
            Some(key) => Arc::new(Ed25519Verifier::from_base64(key)?),
            None => {
                tracing::warn!("no public key configured; artifact signatures are not checked");
                Arc::new(AcceptAllVerifier)
            }
        };
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Ok(Self {
            config,
            settings,
            driver,
            installer: Arc::new(ProcessInstaller),
            verifier,
            comparator: Arc::new(StandardComparator),
            http: reqwest::Client::new(),
            in_progress: AtomicBool::new(false),
            gate: GenerationGate::default(),
            state_tx,
        })
    }

    /// Replaces the installer seam.
    #[must_use]
    pub fn with_installer(mut self, installer: Arc<dyn Installer>) -> Self {
        self.installer = installer;
        self
    }

    /// Replaces the signature verifier seam.
    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Replaces the application version comparator used for ranking. The
    /// anti-downgrade check stays on the standard comparator regardless.
    #[must_use]
    pub fn with_comparator(mut self, comparator: Arc<dyn VersionComparator>) -> Self {
        self.comparator = comparator;
        self
    }

    /// Whether a check cycle is currently running.
    pub fn session_in_progress(&self) -> bool {
        self.in_progress.load(AtomicOrdering::Acquire)
    }

    /// Whether a new check would be accepted right now.
    pub fn can_check_for_updates(&self) -> bool {
        !self.session_in_progress()
    }

    /// Subscribes to coarse state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: SessionState) {
        self.state_tx.send_replace(state);
    }

    /// Runs one full check cycle.
    ///
    /// Every terminal result crosses the driver boundary exactly once:
    /// outcomes through their respective report calls, errors through
    /// [`UserDriver::error`] before the same error is returned.
    pub async fn check(&self, initiation: CheckInitiation) -> Result<CheckOutcome, UpdateError> {
        let Some(guard) = InProgressGuard::claim(&self.in_progress) else {
            if initiation.is_user_initiated() {
                self.driver.bring_to_focus().await;
            } else {
                tracing::debug!("background check rejected, session in progress");
            }
            return Ok(CheckOutcome::AlreadyInProgress);
        };

        let cancel = CancellationToken::new();
        self.gate.advance();

        let result = self.check_inner(initiation, &cancel).await;
        self.gate.advance();
        self.set_state(SessionState::Idle);
        drop(guard);

        match result {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                self.driver.error(&error).await;
                Err(error)
            }
        }
    }

    async fn check_inner(
        &self,
        initiation: CheckInitiation,
        cancel: &CancellationToken,
    ) -> Result<CheckOutcome, UpdateError> {
        let user_initiated = initiation.is_user_initiated();

        // Permission bootstrap, once per installation.
        let mut settings = self.settings.get().await?;
        if !settings.is_resolved() {
            self.set_state(SessionState::PermissionPending);
            let response = self
                .driver
                .request_permission(PermissionRequest {
                    system_profile: self.config.system_profile(),
                })
                .await;
            settings = self
                .settings
                .record_permission(response, self.config.allows_automatic_downloads)
                .await?;
        }
        if !user_initiated && !settings.automatic_checks_enabled() {
            tracing::debug!("background checks disabled, skipping");
            return Ok(CheckOutcome::Cancelled);
        }

        let staging = StagingArea::claim(self.config.staging_root())?;
        let resumed = self.validated_marker(&staging).await;

        self.set_state(SessionState::Checking);
        self.driver.check_started(cancel.clone()).await;

        let feed_url = settings
            .feed_url_override
            .clone()
            .unwrap_or_else(|| self.config.feed_url.clone());
        let profile = if settings.send_system_profile {
            self.config.system_profile()
        } else {
            Vec::new()
        };
        let feed = FeedClient::with_client(
            self.http.clone(),
            self.config.user_agent(),
            self.config.http_headers.clone(),
        );

        let bytes = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::info!("check cancelled during feed fetch");
                self.driver.dismiss_all().await;
                return Ok(CheckOutcome::Cancelled);
            }
            result = feed.fetch(&feed_url, &profile) => result?,
        };

        let entries = parse_feed(&bytes)?;
        let resolver = ItemResolver::new(
            self.config.host_version.clone(),
            self.config.os_version.clone(),
            Arc::clone(&self.comparator),
        );
        let appcast = Appcast::resolve(&entries, &resolver)?;

        // Persist the check timestamp and the stable rollout group before
        // selection reads them.
        let settings = self
            .settings
            .update(|s| {
                s.last_check = Some(Utc::now());
                s.ensure_rollout_group(PHASED_ROLLOUT_GROUP_COUNT);
            })
            .await?;

        let selector = UpdateSelector::new(
            self.config.host_version.clone(),
            Arc::clone(&self.comparator),
            self.config.allowed_channels.clone(),
        );
        let ctx = SelectionContext {
            settings: &settings,
            user_initiated,
            resumed_version: resumed.as_ref().map(|m| m.version.as_str()),
            now: Utc::now(),
        };
        let selected = match selector.select(&appcast, &ctx) {
            Selection::Update(selected) => selected,
            Selection::NoUpdate(reason) => {
                tracing::info!(?reason, "no update");
                self.driver.no_update(reason).await;
                return Ok(CheckOutcome::NoUpdate(reason));
            }
        };

        self.drive_update(selected, resumed, staging, user_initiated, cancel)
            .await
    }

    /// Everything after selection: presentation, download, validation,
    /// authorization, handoff.
    async fn drive_update(
        &self,
        selected: SelectedUpdate,
        resumed: Option<ResumeMarker>,
        staging: StagingArea,
        user_initiated: bool,
        cancel: &CancellationToken,
    ) -> Result<CheckOutcome, UpdateError> {
        let item = selected.item.clone();
        let resumed = resumed.filter(|m| m.version == item.version);
        let stage = if item.is_information_only() {
            UpdateStage::Informational
        } else {
            match resumed.as_ref().map(|m| m.stage) {
                Some(ResumeStage::Installing) => UpdateStage::Installing,
                Some(ResumeStage::Downloaded) => UpdateStage::Downloaded,
                None => UpdateStage::NotDownloaded,
            }
        };
        self.set_state(SessionState::Found);
        tracing::info!(version = %item.version, ?stage, "update found");

        let user_state = UserUpdateState {
            stage,
            user_initiated,
            major_upgrade: item.is_major_upgrade(),
        };

        // Background sessions with download consent stage the update
        // silently and only surface the final confirmation.
        let settings = self.settings.get().await?;
        let silent_download = !user_initiated
            && stage == UpdateStage::NotDownloaded
            && settings.automatic_downloads_enabled(self.config.allows_automatic_downloads)
            && !item.is_major_upgrade();

        if !silent_download {
            match self.driver.update_found(&item, user_state).await {
                UserChoice::Install => {}
                UserChoice::Dismiss => {
                    tracing::info!(version = %item.version, "update dismissed");
                    return Ok(CheckOutcome::Dismissed);
                }
                UserChoice::Skip => {
                    self.persist_skip(&item).await?;
                    staging.clear()?;
                    return Ok(CheckOutcome::Skipped);
                }
            }
        }

        if item.is_information_only() {
            // Nothing to stage; the presentation was the whole update.
            return Ok(CheckOutcome::Dismissed);
        }

        // Stage the artifact, unless a resumed session already did.
        let artifact_path = match (&resumed, stage) {
            (Some(marker), UpdateStage::Downloaded | UpdateStage::Installing) => {
                tracing::info!(artifact = %marker.artifact.display(), "reusing staged artifact");
                marker.artifact.clone()
            }
            _ => {
                let artifact = self.run_download(&selected, &staging, cancel).await?;
                let Some(artifact) = artifact else {
                    self.driver.dismiss_all().await;
                    return Ok(CheckOutcome::Cancelled);
                };
                staging.save_marker(&ResumeMarker {
                    version: item.version.clone(),
                    stage: ResumeStage::Downloaded,
                    artifact: artifact.path.clone(),
                    blake3: artifact.blake3.clone(),
                })?;
                artifact.path
            }
        };

        // Authenticate before any archive byte is parsed, then refuse
        // anything that does not move the host forward.
        let source = selected.download_source();
        if let Err(e) = self.verify_artifact(&artifact_path, source).await {
            staging.clear()?;
            return Err(e);
        }
        if StandardComparator.compare(&item.version, &self.config.host_version)
            != std::cmp::Ordering::Greater
        {
            staging.clear()?;
            return Err(UpdateError::Downgrade {
                candidate: item.version.clone(),
                installed: self.config.host_version.clone(),
            });
        }

        let extraction_dir = staging.extraction_dir();
        if stage != UpdateStage::Installing || !extraction_dir.exists() {
            self.set_state(SessionState::Extracting);
            if let Err(e) = self.run_extract(artifact_path.clone(), extraction_dir.clone()).await {
                staging.clear()?;
                return Err(e);
            }
        }

        // Authorization, cancellable until the installer is engaged.
        self.set_state(SessionState::Authorizing);
        let payload = ProcessInstaller::locate_payload(&extraction_dir, item.installation_kind)?;
        let needs_authorization = !matches!(item.installation_kind, InstallationKind::Application)
            || ProcessInstaller::requires_elevation(
                &self.config.target_path,
                &self.config.staging_root(),
            );
        let job = InstallJob {
            kind: item.installation_kind,
            payload,
            target: self.config.target_path.clone(),
            needs_authorization,
        };
        if cancel.is_cancelled() {
            tracing::info!("cancelled before authorization; staged update kept");
            self.driver.dismiss_all().await;
            return Ok(CheckOutcome::Cancelled);
        }
        // Authorization failure leaves the update resumable as downloaded.
        self.installer.authorize(&job).await?;

        if stage != UpdateStage::Installing {
            self.set_state(SessionState::ReadyToInstall);
            match self.driver.ready_to_install(&item).await {
                UserChoice::Install => {}
                UserChoice::Dismiss => {
                    tracing::info!(version = %item.version, "install deferred, artifact kept");
                    return Ok(CheckOutcome::Dismissed);
                }
                UserChoice::Skip => {
                    // Abandons this staged install without a persistent
                    // skip marker.
                    staging.clear()?;
                    return Ok(CheckOutcome::Cancelled);
                }
            }
        }

        // Point of no return.
        self.set_state(SessionState::Installing);
        staging.save_marker(&ResumeMarker {
            version: item.version.clone(),
            stage: ResumeStage::Installing,
            artifact: artifact_path.clone(),
            blake3: String::new(),
        })?;

        let mut response = self.driver.request_termination().await;
        if response == TerminationResponse::Delay {
            // One retry, then the handoff proceeds regardless; the
            // installer outlives the host.
            response = self.driver.request_termination().await;
        }
        let terminated = response == TerminationResponse::Terminate;
        self.driver.installing(terminated).await;

        self.installer.install(&job).await?;

        let relaunched = if matches!(item.installation_kind, InstallationKind::Application) {
            match crate::install::relaunch(self.config.relaunch_path()) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(error = %e, "relaunch failed");
                    false
                }
            }
        } else {
            false
        };

        staging.clear()?;
        self.driver.installed(relaunched).await;
        self.driver.dismiss_all().await;
        tracing::info!(version = %item.version, relaunched, "update installed");
        Ok(CheckOutcome::UpdateInstalled { relaunched })
    }

    /// Loads the resume marker and re-validates the staged artifact by
    /// content hash; anything stale is cleared.
    async fn validated_marker(&self, staging: &StagingArea) -> Option<ResumeMarker> {
        let marker = staging.load_marker()?;
        let valid = match download::artifact_hash(&marker.artifact).await {
            Ok(hash) => marker.blake3.is_empty() || hash == marker.blake3,
            Err(_) => false,
        };
        if valid {
            tracing::info!(version = %marker.version, "resuming staged update");
            Some(marker)
        } else {
            tracing::warn!(version = %marker.version, "staged artifact failed validation");
            if let Err(e) = staging.clear() {
                tracing::warn!(error = %e, "failed to clear stale staging area");
            }
            None
        }
    }

    /// Streams the selected artifact into the staging area, forwarding
    /// progress events that survive the generation gate.
    ///
    /// `Ok(None)` means the download was cancelled.
    async fn run_download(
        &self,
        selected: &SelectedUpdate,
        staging: &StagingArea,
        cancel: &CancellationToken,
    ) -> Result<Option<DownloadedArtifact>, UpdateError> {
        let source = selected.download_source();
        let download_ref = source
            .download
            .clone()
            .ok_or_else(|| UpdateError::Configuration("selected item has no download".into()))?;

        std::fs::create_dir_all(staging.artifact_dir())?;
        let filename = crate::filename_from_url(&download_ref.url);
        let dest = if filename.is_empty() {
            staging.artifact_path("artifact")
        } else {
            staging.artifact_path(filename)
        };

        self.set_state(SessionState::Downloading);
        if selected.delta.is_some() {
            tracing::info!(url = %download_ref.url, "downloading delta artifact");
        }

        let generation = self.gate.current();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = self.http.clone();
        let url = download_ref.url.clone();
        let user_agent = self.config.user_agent().to_string();
        let token = cancel.clone();
        let dest_for_task = dest.clone();
        let handle = tokio::spawn(async move {
            download_artifact_task(
                client,
                url,
                dest_for_task,
                user_agent,
                download_ref.length,
                token,
                tx,
                generation,
            )
            .await
        });

        while let Some((tag, received, expected)) = rx.recv().await {
            if self.gate.accepts(tag) {
                self.driver.download_progress(received, expected).await;
            }
        }

        match handle.await.map_err(|e| std::io::Error::other(e.to_string()))? {
            Ok(artifact) => Ok(Some(artifact)),
            Err(DownloadError::Cancelled) => {
                tracing::info!("download cancelled");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn verify_artifact(
        &self,
        artifact: &std::path::Path,
        source: &AppcastItem,
    ) -> Result<(), UpdateError> {
        let bytes = tokio::fs::read(artifact).await?;
        self.verifier
            .verify(&bytes, source.ed_signature.as_deref())?;
        tracing::debug!(artifact = %artifact.display(), "artifact signature verified");
        Ok(())
    }

    /// Unpacks the staged archive on a blocking context, forwarding
    /// fractional progress that survives the generation gate.
    async fn run_extract(
        &self,
        artifact: PathBuf,
        dest: PathBuf,
    ) -> Result<(), UpdateError> {
        let generation = self.gate.current();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = tokio::task::spawn_blocking(move || {
            extract::extract_archive(&artifact, &dest, move |fraction| {
                tx.send((generation, fraction)).ok();
            })
        });

        while let Some((tag, fraction)) = rx.recv().await {
            if self.gate.accepts(tag) {
                self.driver.extraction_progress(fraction).await;
            }
        }

        let files = handle
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))??;
        tracing::debug!(files = files.len(), "archive extracted");
        Ok(())
    }

    async fn persist_skip(&self, item: &AppcastItem) -> Result<(), UpdateError> {
        let version = item.version.clone();
        let major_key = if item.is_major_upgrade() {
            item.minimum_autoupdate_version.clone()
        } else {
            None
        };
        self.settings
            .update(move |s| {
                s.skip_version(&version);
                if let Some(key) = major_key {
                    s.skip_major_upgrade(&key);
                }
            })
            .await?;
        tracing::info!(version = %item.version, "skip marker persisted");
        Ok(())
    }
}

/// The spawned download operation: every progress event carries the
/// generation it was spawned under.
#[allow(clippy::too_many_arguments)]
async fn download_artifact_task(
    client: reqwest::Client,
    url: String,
    dest: PathBuf,
    user_agent: String,
    expected_length: Option<u64>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<(u64, u64, Option<u64>)>,
    generation: u64,
) -> Result<DownloadedArtifact, DownloadError> {
    download::download_artifact(
        &client,
        &url,
        &dest,
        &user_agent,
        expected_length,
        &cancel,
        move |received, expected| {
            events.send((generation, received, expected)).ok();
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_for_resumed_marker() {
        // Stage derivation is inline in drive_update; exercised end to end
        // in the integration suite. Here: the marker filter by version.
        let marker = ResumeMarker {
            version: "2.0".into(),
            stage: ResumeStage::Downloaded,
            artifact: PathBuf::from("/tmp/a.tar.gz"),
            blake3: String::new(),
        };
        let filtered = Some(marker).filter(|m| m.version == "3.0");
        assert!(filtered.is_none());
    }

    #[test]
    fn test_initiation_flags() {
        assert!(CheckInitiation::UserInitiated.is_user_initiated());
        assert!(!CheckInitiation::Background.is_user_initiated());
    }
}
