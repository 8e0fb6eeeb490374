//! Persisted update settings and the actor that owns them.
//!
//! Settings are mutated only by explicit user choice or by consuming a
//! permission response, and every read/write funnels through
//! [`SettingsHandle`]: a dedicated background thread owns the on-disk store
//! and callers communicate via message passing, so concurrent sessions and
//! user-facing preference changes can never race a write.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{oneshot, watch};

/// Skip-map key prefix for skipped major upgrades. Major skips are keyed by
/// the upgrade's minimum-autoupdate version, not its exact version.
const MAJOR_SKIP_PREFIX: &str = "major:";

/// Delay used to coalesce rapid successive cycle resets.
const RESET_COALESCE_DELAY: Duration = Duration::from_secs(1);

/// Default background check interval: one day.
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 86_400;

/// Settings persistence failures.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// Reading or writing the store file failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The store file did not round-trip through serde.
    #[error("Settings serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The owning actor thread is gone.
    #[error("settings actor stopped")]
    ActorDied,
}

/// Persisted user choices governing whether and how checks run.
///
/// `automatic_checks` and `automatic_downloads` are tri-state on disk:
/// `None` means the user has never been asked, which is what makes the
/// session machine raise the one-time permission request.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    /// Automatic background checks consent; `None` until first resolved.
    pub automatic_checks: Option<bool>,
    /// Automatic background downloads consent; `None` means no choice made.
    pub automatic_downloads: Option<bool>,
    /// Seconds between scheduled background checks.
    pub update_check_interval: Option<u64>,
    /// Whether the anonymized system profile accompanies feed requests.
    pub send_system_profile: bool,
    /// When the last check completed, if any.
    pub last_check: Option<DateTime<Utc>>,
    /// Feed URL override persisted by the host, if any.
    pub feed_url_override: Option<String>,
    /// Skip markers: exact version strings, or major-upgrade keys.
    pub skipped: BTreeMap<String, bool>,
    /// Stable phased-rollout group for this installation.
    pub rollout_group: Option<u64>,
}

impl Settings {
    /// True once a permission response has been recorded (or the host has
    /// otherwise set the automatic-check preference).
    pub fn is_resolved(&self) -> bool {
        self.automatic_checks.is_some()
    }

    /// Automatic checks consent, defaulting to off while unresolved.
    pub fn automatic_checks_enabled(&self) -> bool {
        self.automatic_checks.unwrap_or(false)
    }

    /// Automatic downloads consent, clamped off when the host application
    /// disallows the capability altogether.
    pub fn automatic_downloads_enabled(&self, capability_allowed: bool) -> bool {
        capability_allowed && self.automatic_downloads.unwrap_or(false)
    }

    /// Effective check interval in seconds.
    pub fn check_interval_secs(&self) -> u64 {
        self.update_check_interval
            .filter(|i| *i > 0)
            .unwrap_or(DEFAULT_CHECK_INTERVAL_SECS)
    }

    /// Marks an exact version as skipped.
    pub fn skip_version(&mut self, version: &str) {
        self.skipped.insert(version.to_string(), true);
    }

    /// Marks a major upgrade as skipped by its minimum-autoupdate key.
    pub fn skip_major_upgrade(&mut self, key: &str) {
        self.skipped.insert(format!("{MAJOR_SKIP_PREFIX}{key}"), true);
    }

    /// True iff an exact-version skip marker is set.
    pub fn is_version_skipped(&self, version: &str) -> bool {
        self.skipped.get(version).copied().unwrap_or(false)
    }

    /// The minimum-autoupdate keys of all skipped major upgrades.
    pub fn skipped_major_keys(&self) -> impl Iterator<Item = &str> {
        self.skipped
            .iter()
            .filter(|(_, marked)| **marked)
            .filter_map(|(k, _)| k.strip_prefix(MAJOR_SKIP_PREFIX))
    }

    /// Clears every skip marker.
    pub fn clear_skips(&mut self) {
        self.skipped.clear();
    }

    /// Returns the stable rollout group, drawing and recording one on first
    /// use so the same installation always lands in the same group.
    pub fn ensure_rollout_group(&mut self, group_count: u64) -> u64 {
        match self.rollout_group {
            Some(g) if g < group_count => g,
            _ => {
                let g = rand::rng().random_range(0..group_count);
                self.rollout_group = Some(g);
                g
            }
        }
    }
}

/// The one-time permission request shown when settings are unresolved.
///
/// Created once per installation (or whenever settings are unresolved),
/// consumed synchronously by the session machine, discarded after the
/// resulting settings persist.
#[derive(Debug, Clone)]
pub struct PermissionRequest {
    /// Anonymized system-profile snapshot, in a stable presentation order.
    pub system_profile: Vec<(String, String)>,
}

/// The user's answer to a [`PermissionRequest`].
#[derive(Debug, Clone, Copy)]
pub struct PermissionResponse {
    /// Consent for scheduled background checks.
    pub automatic_checks: bool,
    /// Consent for background downloads; `None` means no choice made.
    pub automatic_downloads: Option<bool>,
    /// Consent for sending the system profile with feed requests.
    pub send_system_profile: bool,
}

/// The on-disk JSON store behind the actor.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    /// Opens a store at `path`. The file need not exist yet.
    pub fn open(path: PathBuf) -> Self {
        Self { path }
    }

    /// Loads settings; a missing file yields defaults.
    pub fn load(&self) -> Result<Settings, SettingsError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Settings::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persists settings atomically (write-temp, rename).
    pub fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.new");
        std::fs::write(&tmp, serde_json::to_vec_pretty(settings)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

type Mutator = Box<dyn FnOnce(&mut Settings) + Send>;

/// Events that can be sent to the settings actor.
enum SettingsEvent {
    /// Read the current settings.
    Get {
        resp: oneshot::Sender<Settings>,
    },
    /// Apply a mutation, persist, and return the result.
    Update {
        apply: Mutator,
        resp: oneshot::Sender<Result<Settings, SettingsError>>,
    },
    /// Shut the actor down.
    Shutdown,
}

/// A handle to the settings actor that is Send + Sync and Clone.
#[derive(Clone)]
pub struct SettingsHandle {
    sender: mpsc::Sender<SettingsEvent>,
}

impl std::fmt::Debug for SettingsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SettingsHandle")
    }
}

impl SettingsHandle {
    /// Spawns the actor thread over an on-disk store.
    pub fn spawn(store: SettingsStore) -> Result<Self, SettingsError> {
        let settings = store.load()?;
        Ok(Self::spawn_inner(Some(store), settings))
    }

    /// Spawns an actor with no backing file. Used by hosts that persist
    /// elsewhere and by tests.
    pub fn in_memory(settings: Settings) -> Self {
        Self::spawn_inner(None, settings)
    }

    fn spawn_inner(store: Option<SettingsStore>, settings: Settings) -> Self {
        let (sender, receiver) = mpsc::channel();
        thread::spawn(move || run_event_loop(store, settings, &receiver));
        Self { sender }
    }

    /// Current settings snapshot.
    pub async fn get(&self) -> Result<Settings, SettingsError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SettingsEvent::Get { resp: tx })
            .map_err(|_| SettingsError::ActorDied)?;
        rx.await.map_err(|_| SettingsError::ActorDied)
    }

    /// Applies a mutation on the actor thread and persists the result.
    pub async fn update<F>(&self, apply: F) -> Result<Settings, SettingsError>
    where
        F: FnOnce(&mut Settings) + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SettingsEvent::Update {
                apply: Box::new(apply),
                resp: tx,
            })
            .map_err(|_| SettingsError::ActorDied)?;
        rx.await.map_err(|_| SettingsError::ActorDied)?
    }

    /// Records the completion time of a check.
    pub async fn mark_checked(&self, when: DateTime<Utc>) -> Result<Settings, SettingsError> {
        self.update(move |s| s.last_check = Some(when)).await
    }

    /// Consumes a permission response: persists the consents and resolves
    /// the settings. The automatic-download consent is clamped off when the
    /// host forbids the capability.
    pub async fn record_permission(
        &self,
        response: PermissionResponse,
        downloads_capability_allowed: bool,
    ) -> Result<Settings, SettingsError> {
        self.update(move |s| {
            s.automatic_checks = Some(response.automatic_checks);
            if let Some(consent) = response.automatic_downloads {
                s.automatic_downloads = Some(consent && downloads_capability_allowed);
            }
            s.send_system_profile = response.send_system_profile;
        })
        .await
    }

    /// Requests actor shutdown. Pending events are drained first.
    pub fn shutdown(&self) {
        let _ = self.sender.send(SettingsEvent::Shutdown);
    }
}

/// The actual event loop running in the background thread.
fn run_event_loop(
    store: Option<SettingsStore>,
    mut settings: Settings,
    receiver: &mpsc::Receiver<SettingsEvent>,
) {
    while let Ok(event) = receiver.recv() {
        match event {
            SettingsEvent::Get { resp } => {
                let _ = resp.send(settings.clone());
            }
            SettingsEvent::Update { apply, resp } => {
                apply(&mut settings);
                let result = match &store {
                    Some(store) => store.save(&settings).map(|()| settings.clone()),
                    None => Ok(settings.clone()),
                };
                let _ = resp.send(result);
            }
            SettingsEvent::Shutdown => break,
        }
    }
}

/// Schedules background checks from the persisted interval and last-check
/// date, and debounces rapid preference changes.
#[derive(Clone)]
pub struct CheckScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    settings: SettingsHandle,
    next_check: watch::Sender<Option<DateTime<Utc>>>,
    pending: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for CheckScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CheckScheduler")
    }
}

impl CheckScheduler {
    /// Creates a scheduler over the settings actor.
    pub fn new(settings: SettingsHandle) -> Self {
        let (next_check, _) = watch::channel(None);
        Self {
            inner: Arc::new(SchedulerInner {
                settings,
                next_check,
                pending: Mutex::new(None),
            }),
        }
    }

    /// Observes the next scheduled background-check instant. `None` means
    /// automatic checks are off.
    pub fn subscribe(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.inner.next_check.subscribe()
    }

    /// Recomputes the next scheduled check time from the check interval and
    /// the last-check date, publishing it to subscribers.
    pub async fn reset_cycle(&self) -> Result<Option<DateTime<Utc>>, SettingsError> {
        let settings = self.inner.settings.get().await?;
        let next = if settings.automatic_checks_enabled() {
            let interval = chrono::Duration::seconds(settings.check_interval_secs() as i64);
            let now = Utc::now();
            Some(
                settings
                    .last_check
                    .map(|last| last + interval)
                    .filter(|due| *due > now)
                    .unwrap_or(now),
            )
        } else {
            None
        };
        self.inner.next_check.send_replace(next);
        Ok(next)
    }

    /// Debounced [`reset_cycle`](Self::reset_cycle): coalesces repeated
    /// calls into one reset after a short fixed delay, cancelling any reset
    /// still pending from an earlier call.
    pub fn reset_cycle_after_delay(&self) {
        let mut pending = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(task) = pending.take() {
            task.abort();
        }
        let scheduler = self.clone();
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(RESET_COALESCE_DELAY).await;
            if let Err(err) = scheduler.reset_cycle().await {
                tracing::warn!(%err, "debounced cycle reset failed");
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::open(dir.path().join("settings.json"));

        // Missing file yields unresolved defaults.
        let settings = store.load().unwrap();
        assert!(!settings.is_resolved());
        assert_eq!(settings.check_interval_secs(), DEFAULT_CHECK_INTERVAL_SECS);

        let handle = SettingsHandle::spawn(store.clone()).unwrap();
        handle
            .update(|s| {
                s.automatic_checks = Some(true);
                s.skip_version("2.0");
                s.skip_major_upgrade("3.0");
            })
            .await
            .unwrap();

        let reloaded = store.load().unwrap();
        assert!(reloaded.automatic_checks_enabled());
        assert!(reloaded.is_version_skipped("2.0"));
        assert_eq!(reloaded.skipped_major_keys().collect::<Vec<_>>(), ["3.0"]);
    }

    #[tokio::test]
    async fn test_permission_response_clamps_downloads() {
        let handle = SettingsHandle::in_memory(Settings::default());
        let response = PermissionResponse {
            automatic_checks: true,
            automatic_downloads: Some(true),
            send_system_profile: false,
        };
        let settings = handle.record_permission(response, false).await.unwrap();
        assert!(settings.is_resolved());
        assert!(!settings.automatic_downloads_enabled(false));
        // The clamp is recorded, not just applied at read time.
        assert_eq!(settings.automatic_downloads, Some(false));
    }

    #[tokio::test]
    async fn test_permission_tri_state_preserved() {
        let handle = SettingsHandle::in_memory(Settings::default());
        let response = PermissionResponse {
            automatic_checks: true,
            automatic_downloads: None,
            send_system_profile: true,
        };
        let settings = handle.record_permission(response, true).await.unwrap();
        assert_eq!(settings.automatic_downloads, None);
        assert!(settings.send_system_profile);
    }

    #[test]
    fn test_rollout_group_is_stable() {
        let mut settings = Settings::default();
        let group = settings.ensure_rollout_group(7);
        assert!(group < 7);
        for _ in 0..32 {
            assert_eq!(settings.ensure_rollout_group(7), group);
        }
    }

    #[tokio::test]
    async fn test_reset_cycle_schedules_from_last_check() {
        let mut settings = Settings::default();
        settings.automatic_checks = Some(true);
        settings.update_check_interval = Some(3600);
        settings.last_check = Some(Utc::now() - chrono::Duration::seconds(600));

        let handle = SettingsHandle::in_memory(settings);
        let scheduler = CheckScheduler::new(handle);
        let next = scheduler.reset_cycle().await.unwrap().expect("scheduled");
        let in_secs = (next - Utc::now()).num_seconds();
        assert!((2900..=3000).contains(&in_secs), "next check in {in_secs}s");
    }

    #[tokio::test]
    async fn test_reset_cycle_disabled_when_unresolved() {
        let handle = SettingsHandle::in_memory(Settings::default());
        let scheduler = CheckScheduler::new(handle);
        assert_eq!(scheduler.reset_cycle().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_after_delay_coalesces() {
        let mut settings = Settings::default();
        settings.automatic_checks = Some(true);
        let handle = SettingsHandle::in_memory(settings);
        let scheduler = CheckScheduler::new(handle);
        let mut watcher = scheduler.subscribe();

        scheduler.reset_cycle_after_delay();
        scheduler.reset_cycle_after_delay();
        scheduler.reset_cycle_after_delay();

        tokio::time::sleep(RESET_COALESCE_DELAY * 2).await;
        watcher.changed().await.unwrap();
        assert!(watcher.borrow().is_some());
        // Only the last call's reset ran; no further change is pending.
        assert!(!watcher.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_reset_after_delay_survives_poisoned_lock() {
        let handle = SettingsHandle::in_memory(Settings::default());
        let scheduler = CheckScheduler::new(handle);

        let poisoner = scheduler.clone();
        std::thread::spawn(move || {
            let _guard = poisoner.inner.pending.lock().unwrap();
            panic!("poison the scheduler lock");
        })
        .join()
        .unwrap_err();

        scheduler.reset_cycle_after_delay();
    }
}
