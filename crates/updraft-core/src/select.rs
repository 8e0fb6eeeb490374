//! Best-candidate selection over a resolved appcast.
//!
//! Selection runs a fixed filter pipeline: OS bounds, channel membership,
//! best version, skip markers, delta substitution, phased rollout. The
//! application-supplied comparator ranks candidates, but the final
//! anti-downgrade check always uses the standard comparator so a custom
//! ordering can never select something at or below the installed version.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::appcast::{Appcast, AppcastItem};
use crate::settings::Settings;
use crate::version::{StandardComparator, VersionComparator};

/// Number of phased-rollout groups an installation can land in.
pub const PHASED_ROLLOUT_GROUP_COUNT: u64 = 7;

/// Why no update qualified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoUpdateReason {
    /// The best candidate matches the installed version.
    OnLatestVersion,
    /// The installed version is newer than anything published.
    OnNewerThanLatest,
    /// Every candidate requires a newer OS.
    SystemTooOld,
    /// Every candidate requires an older OS.
    SystemTooNew,
    /// No candidate qualified for another reason (empty channel set,
    /// deferred rollout, skipped item).
    Unknown,
}

/// The selector's verdict over one appcast.
#[derive(Debug, Clone)]
pub enum Selection {
    /// An eligible update was found.
    Update(SelectedUpdate),
    /// Nothing qualified, with the closest-fitting reason.
    NoUpdate(NoUpdateReason),
}

/// The chosen candidate.
///
/// When a delta applies, `delta` drives the download while `item` keeps
/// supplying everything the user sees.
#[derive(Debug, Clone)]
pub struct SelectedUpdate {
    /// The top-level item: presentation metadata, skip keys, flags.
    pub item: AppcastItem,
    /// Delta substitute keyed by the exact installed version, when present.
    pub delta: Option<AppcastItem>,
}

impl SelectedUpdate {
    /// The item whose artifact actually downloads.
    pub fn download_source(&self) -> &AppcastItem {
        self.delta.as_ref().unwrap_or(&self.item)
    }
}

/// Ambient inputs for one selection run.
#[derive(Debug)]
pub struct SelectionContext<'a> {
    /// Current persisted settings (skip markers, rollout group).
    pub settings: &'a Settings,
    /// Whether a human explicitly asked for this check. User-initiated
    /// checks ignore skip markers and phased rollout deferral.
    pub user_initiated: bool,
    /// Version of an already-downloaded item being re-presented from a
    /// resumed session; bypasses the anti-downgrade re-check for that item.
    pub resumed_version: Option<&'a str>,
    /// Selection instant, injectable for tests.
    pub now: DateTime<Utc>,
}

/// Picks the single best eligible item from an appcast, or none.
pub struct UpdateSelector {
    host_version: String,
    application: Arc<dyn VersionComparator>,
    standard: StandardComparator,
    allowed_channels: HashSet<String>,
}

impl std::fmt::Debug for UpdateSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateSelector")
            .field("host_version", &self.host_version)
            .field("allowed_channels", &self.allowed_channels)
            .finish_non_exhaustive()
    }
}

impl UpdateSelector {
    /// Creates a selector for the given host version. An empty allowed
    /// channel set means only default (channel-less) items pass.
    pub fn new(
        host_version: impl Into<String>,
        application: Arc<dyn VersionComparator>,
        allowed_channels: HashSet<String>,
    ) -> Self {
        Self {
            host_version: host_version.into(),
            application,
            standard: StandardComparator,
            allowed_channels,
        }
    }

    /// Runs the selection pipeline.
    pub fn select(&self, appcast: &Appcast, ctx: &SelectionContext<'_>) -> Selection {
        let mut saw_too_old = false;
        let mut saw_too_new = false;
        let mut candidates: Vec<&AppcastItem> = Vec::new();

        for item in appcast.items() {
            if !item.passes_minimum_os() {
                saw_too_old = true;
                continue;
            }
            if !item.passes_maximum_os() {
                saw_too_new = true;
                continue;
            }
            match &item.channel {
                None => {}
                Some(channel) if self.allowed_channels.contains(channel) => {}
                Some(channel) => {
                    tracing::trace!(version = %item.version, channel, "item not in an allowed channel");
                    continue;
                }
            }
            candidates.push(item);
        }

        let Some(best) = candidates
            .into_iter()
            .max_by(|a, b| self.application.compare(&a.version, &b.version))
        else {
            let reason = if saw_too_old {
                NoUpdateReason::SystemTooOld
            } else if saw_too_new {
                NoUpdateReason::SystemTooNew
            } else {
                NoUpdateReason::Unknown
            };
            return Selection::NoUpdate(reason);
        };

        // Anti-downgrade: the standard comparator has the final say, no
        // matter what the application comparator ranked highest. A resumed,
        // already-downloaded item skips only this re-check.
        let resumed = ctx.resumed_version == Some(best.version.as_str());
        if !resumed {
            match self.standard.compare(&best.version, &self.host_version) {
                Ordering::Greater => {}
                Ordering::Equal => return Selection::NoUpdate(NoUpdateReason::OnLatestVersion),
                Ordering::Less => return Selection::NoUpdate(NoUpdateReason::OnNewerThanLatest),
            }
        }

        if !ctx.user_initiated {
            if best.is_major_upgrade() && self.major_upgrade_skipped(ctx.settings, best) {
                tracing::debug!(version = %best.version, "major upgrade previously skipped");
                return Selection::NoUpdate(NoUpdateReason::OnLatestVersion);
            }
            if ctx.settings.is_version_skipped(&best.version) {
                tracing::debug!(version = %best.version, "version previously skipped");
                return Selection::NoUpdate(NoUpdateReason::OnLatestVersion);
            }
        }

        let delta = best.deltas.get(&self.host_version).cloned();

        // Phased rollout defers, it never skips: the candidate reappears on
        // a later scheduled check once its group comes up. Critical updates
        // and user-initiated checks are always eligible.
        if !ctx.user_initiated
            && !resumed
            && !best.critical
            && !self.rollout_eligible(best, ctx)
        {
            tracing::debug!(version = %best.version, "deferred by phased rollout");
            return Selection::NoUpdate(NoUpdateReason::Unknown);
        }

        Selection::Update(SelectedUpdate {
            item: best.clone(),
            delta,
        })
    }

    fn major_upgrade_skipped(&self, settings: &Settings, item: &AppcastItem) -> bool {
        let Some(key) = item.minimum_autoupdate_version.as_deref() else {
            return false;
        };
        settings.skipped_major_keys().any(|skipped| {
            // A skip covers this item when the skipped upgrade's key is at
            // or above the item's key.
            if self.application.compare(skipped, key) == Ordering::Less {
                return false;
            }
            // The feed can force re-presentation of upgrades skipped below
            // a given version.
            if let Some(ignore_below) = item.ignore_skipped_upgrades_below_version.as_deref() {
                if self.application.compare(skipped, ignore_below) == Ordering::Less {
                    return false;
                }
            }
            true
        })
    }

    fn rollout_eligible(&self, item: &AppcastItem, ctx: &SelectionContext<'_>) -> bool {
        let (Some(interval), Some(date)) = (item.phased_rollout_interval, item.date) else {
            return true;
        };
        if interval == 0 {
            return true;
        }
        let elapsed = (ctx.now - date).num_seconds().max(0) as u64;
        let group = ctx.settings.rollout_group.unwrap_or(0);
        elapsed / interval >= group
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appcast::raw::{RawEntry, keys};
    use crate::appcast::ItemResolver;

    fn entry(version: &str) -> RawEntry {
        RawEntry::new()
            .with(keys::VERSION, version)
            .with(keys::URL, format!("https://e.com/{version}.tar.gz"))
    }

    fn appcast_for(host_version: &str, os_version: &str, entries: &[RawEntry]) -> Appcast {
        let resolver = ItemResolver::new(host_version, os_version, Arc::new(StandardComparator));
        Appcast::resolve(entries, &resolver).unwrap()
    }

    fn selector(host_version: &str) -> UpdateSelector {
        UpdateSelector::new(host_version, Arc::new(StandardComparator), HashSet::new())
    }

    fn ctx(settings: &Settings) -> SelectionContext<'_> {
        SelectionContext {
            settings,
            user_initiated: false,
            resumed_version: None,
            now: Utc::now(),
        }
    }

    #[test]
    fn test_picks_best_eligible_item() {
        // Host on 1.0; 1.5 needs a newer OS; 2.0 is eligible.
        let entries = vec![
            entry("1.0"),
            entry("1.5").with(keys::MINIMUM_SYSTEM_VERSION, "99.0"),
            entry("2.0"),
        ];
        let appcast = appcast_for("1.0", "14.0", &entries);
        let settings = Settings::default();
        match selector("1.0").select(&appcast, &ctx(&settings)) {
            Selection::Update(update) => assert_eq!(update.item.version, "2.0"),
            Selection::NoUpdate(reason) => panic!("expected update, got {reason:?}"),
        }
    }

    #[test]
    fn test_on_latest_and_newer_than_latest() {
        let entries = vec![entry("2.0")];
        let appcast = appcast_for("2.0", "14.0", &entries);
        let settings = Settings::default();
        assert!(matches!(
            selector("2.0").select(&appcast, &ctx(&settings)),
            Selection::NoUpdate(NoUpdateReason::OnLatestVersion)
        ));
        assert!(matches!(
            selector("3.0").select(&appcast, &ctx(&settings)),
            Selection::NoUpdate(NoUpdateReason::OnNewerThanLatest)
        ));
    }

    #[test]
    fn test_os_bound_reasons() {
        let too_old = vec![entry("2.0").with(keys::MINIMUM_SYSTEM_VERSION, "99.0")];
        let appcast = appcast_for("1.0", "14.0", &too_old);
        let settings = Settings::default();
        assert!(matches!(
            selector("1.0").select(&appcast, &ctx(&settings)),
            Selection::NoUpdate(NoUpdateReason::SystemTooOld)
        ));

        let too_new = vec![entry("2.0").with(keys::MAXIMUM_SYSTEM_VERSION, "10.0")];
        let appcast = appcast_for("1.0", "14.0", &too_new);
        assert!(matches!(
            selector("1.0").select(&appcast, &ctx(&settings)),
            Selection::NoUpdate(NoUpdateReason::SystemTooNew)
        ));
    }

    /// A custom comparator can rank candidates however it likes, but it must
    /// never smuggle a non-upgrade past the standard comparator.
    #[test]
    fn test_custom_comparator_cannot_downgrade() {
        #[derive(Debug)]
        struct Backwards;
        impl VersionComparator for Backwards {
            fn compare(&self, a: &str, b: &str) -> Ordering {
                StandardComparator.compare(a, b).reverse()
            }
        }

        let entries = vec![entry("0.5"), entry("2.0")];
        let resolver = ItemResolver::new("1.0", "14.0", Arc::new(Backwards));
        let appcast = Appcast::resolve(&entries, &resolver).unwrap();
        let sel = UpdateSelector::new("1.0", Arc::new(Backwards), HashSet::new());
        let settings = Settings::default();
        // Backwards ranks 0.5 "highest"; the standard re-check rejects it.
        assert!(matches!(
            sel.select(&appcast, &ctx(&settings)),
            Selection::NoUpdate(NoUpdateReason::OnNewerThanLatest)
        ));
    }

    #[test]
    fn test_channel_filtering() {
        let entries = vec![
            entry("2.0"),
            entry("3.0-beta.1").with(keys::CHANNEL, "beta"),
        ];
        let appcast = appcast_for("1.0", "14.0", &entries);
        let settings = Settings::default();

        // Empty allowed set: only the default-channel item passes.
        match selector("1.0").select(&appcast, &ctx(&settings)) {
            Selection::Update(update) => assert_eq!(update.item.version, "2.0"),
            Selection::NoUpdate(reason) => panic!("expected 2.0, got {reason:?}"),
        }

        let sel = UpdateSelector::new(
            "1.0",
            Arc::new(StandardComparator),
            HashSet::from(["beta".to_string()]),
        );
        match sel.select(&appcast, &ctx(&settings)) {
            Selection::Update(update) => assert_eq!(update.item.version, "3.0-beta.1"),
            Selection::NoUpdate(reason) => panic!("expected 3.0-beta.1, got {reason:?}"),
        }
    }

    #[test]
    fn test_skip_marker_honored_until_user_initiated() {
        let entries = vec![entry("2.0")];
        let appcast = appcast_for("1.0", "14.0", &entries);
        let mut settings = Settings::default();
        settings.skip_version("2.0");

        assert!(matches!(
            selector("1.0").select(&appcast, &ctx(&settings)),
            Selection::NoUpdate(NoUpdateReason::OnLatestVersion)
        ));

        let user_ctx = SelectionContext {
            user_initiated: true,
            ..ctx(&settings)
        };
        assert!(matches!(
            selector("1.0").select(&appcast, &user_ctx),
            Selection::Update(_)
        ));
    }

    #[test]
    fn test_major_upgrade_skip_keys() {
        let entries = vec![entry("3.1").with(keys::MINIMUM_AUTOUPDATE_VERSION, "3.0")];
        let appcast = appcast_for("1.0", "14.0", &entries);

        // Skipping the 3.0 major band hides 3.1 too.
        let mut settings = Settings::default();
        settings.skip_major_upgrade("3.0");
        assert!(matches!(
            selector("1.0").select(&appcast, &ctx(&settings)),
            Selection::NoUpdate(_)
        ));

        // A later major band is a fresh decision.
        let entries = vec![entry("4.0").with(keys::MINIMUM_AUTOUPDATE_VERSION, "4.0")];
        let appcast = appcast_for("1.0", "14.0", &entries);
        assert!(matches!(
            selector("1.0").select(&appcast, &ctx(&settings)),
            Selection::Update(_)
        ));
    }

    #[test]
    fn test_major_skip_override() {
        let entries = vec![
            entry("3.2")
                .with(keys::MINIMUM_AUTOUPDATE_VERSION, "3.0")
                .with(keys::IGNORE_SKIPPED_UPGRADES_BELOW_VERSION, "3.1"),
        ];
        let appcast = appcast_for("1.0", "14.0", &entries);
        let mut settings = Settings::default();
        settings.skip_major_upgrade("3.0");
        // The skip predates the ignore threshold, so the upgrade reappears.
        assert!(matches!(
            selector("1.0").select(&appcast, &ctx(&settings)),
            Selection::Update(_)
        ));
    }

    #[test]
    fn test_delta_substitution_keeps_parent_metadata() {
        let entries = vec![
            entry("2.0").with(keys::TITLE, "Big release").with_delta(
                RawEntry::new()
                    .with(keys::VERSION, "2.0")
                    .with(keys::DELTA_FROM, "1.0")
                    .with(keys::URL, "https://e.com/delta-1.0-2.0.tar.gz"),
            ),
        ];
        let appcast = appcast_for("1.0", "14.0", &entries);
        let settings = Settings::default();
        match selector("1.0").select(&appcast, &ctx(&settings)) {
            Selection::Update(update) => {
                assert_eq!(update.item.title.as_deref(), Some("Big release"));
                assert_eq!(
                    update.download_source().download.as_ref().unwrap().url,
                    "https://e.com/delta-1.0-2.0.tar.gz"
                );
            }
            Selection::NoUpdate(reason) => panic!("expected delta update, got {reason:?}"),
        }

        // A host version with no delta entry downloads the full artifact.
        let appcast = appcast_for("1.5", "14.0", &entries);
        match selector("1.5").select(&appcast, &ctx(&settings)) {
            Selection::Update(update) => {
                assert!(update.delta.is_none());
                assert_eq!(update.download_source().download.as_ref().unwrap().url, "https://e.com/2.0.tar.gz");
            }
            Selection::NoUpdate(reason) => panic!("expected full update, got {reason:?}"),
        }
    }

    #[test]
    fn test_phased_rollout_defers_then_releases() {
        let published = Utc::now() - chrono::Duration::hours(1);
        let entries = vec![
            entry("2.0")
                .with(keys::PHASED_ROLLOUT_INTERVAL, "86400")
                .with(keys::PUB_DATE, published.to_rfc3339()),
        ];
        let appcast = appcast_for("1.0", "14.0", &entries);

        let mut settings = Settings::default();
        settings.rollout_group = Some(6);
        // One hour into a one-day interval, group 6 is not yet eligible.
        assert!(matches!(
            selector("1.0").select(&appcast, &ctx(&settings)),
            Selection::NoUpdate(NoUpdateReason::Unknown)
        ));

        // Group 0 is always eligible.
        settings.rollout_group = Some(0);
        assert!(matches!(
            selector("1.0").select(&appcast, &ctx(&settings)),
            Selection::Update(_)
        ));

        // A user-initiated check never defers.
        settings.rollout_group = Some(6);
        let user_ctx = SelectionContext {
            user_initiated: true,
            ..ctx(&settings)
        };
        assert!(matches!(
            selector("1.0").select(&appcast, &user_ctx),
            Selection::Update(_)
        ));
    }

    #[test]
    fn test_critical_update_bypasses_rollout() {
        let published = Utc::now() - chrono::Duration::hours(1);
        let entries = vec![
            entry("2.0")
                .with(keys::PHASED_ROLLOUT_INTERVAL, "86400")
                .with(keys::PUB_DATE, published.to_rfc3339())
                .with(keys::CRITICAL_UPDATE, "true"),
        ];
        let appcast = appcast_for("1.0", "14.0", &entries);
        let mut settings = Settings::default();
        settings.rollout_group = Some(6);
        assert!(matches!(
            selector("1.0").select(&appcast, &ctx(&settings)),
            Selection::Update(_)
        ));
    }

    #[test]
    fn test_resumed_item_bypasses_downgrade_recheck() {
        let entries = vec![entry("2.0")];
        let appcast = appcast_for("2.0", "14.0", &entries);
        let settings = Settings::default();
        let resumed_ctx = SelectionContext {
            resumed_version: Some("2.0"),
            ..ctx(&settings)
        };
        // Already downloaded 2.0 stays presentable even though the host now
        // reports the same version.
        assert!(matches!(
            selector("2.0").select(&appcast, &resumed_ctx),
            Selection::Update(_)
        ));
    }
}
