//! Resolved appcast items.
//!
//! An [`AppcastItem`] is the immutable, query-ready form of one raw feed
//! record: every eligibility flag is computed once against the host context
//! by [`ItemResolver`] and never changes afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::raw::{RawEntry, keys};
use super::AppcastError;
use crate::version::{StandardComparator, VersionComparator};

/// How an update artifact is applied to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallationKind {
    /// Replace the application bundle/binary in place.
    Application,
    /// Hand a package file to the platform's guided (non-interactive) installer.
    GuidedPackage,
    /// Hand a package file to an interactive installer UI.
    InteractivePackage,
}

impl InstallationKind {
    fn from_field(value: &str) -> Option<Self> {
        match value {
            "application" => Some(Self::Application),
            "package" => Some(Self::GuidedPackage),
            "interactive-package" => Some(Self::InteractivePackage),
            _ => None,
        }
    }

    fn infer_from_url(url: &str) -> Self {
        let lower = url.to_ascii_lowercase();
        if lower.ends_with(".mpkg") {
            Self::InteractivePackage
        } else if lower.ends_with(".pkg") {
            Self::GuidedPackage
        } else {
            Self::Application
        }
    }
}

/// A downloadable artifact reference.
#[derive(Debug, Clone)]
pub struct DownloadRef {
    /// Artifact URL.
    pub url: String,
    /// Expected byte length, when the feed publishes one.
    pub length: Option<u64>,
}

/// One immutable, resolved update description.
///
/// Owned by its [`Appcast`](super::Appcast) (or, for deltas, by the parent
/// item's delta map) and never mutated after resolution.
#[derive(Debug, Clone)]
pub struct AppcastItem {
    /// Entry title.
    pub title: Option<String>,
    /// Machine version string.
    pub version: String,
    /// Human display version; falls back to [`version`](Self::version).
    pub display_version: String,
    /// Download reference, absent for informational-only items.
    pub download: Option<DownloadRef>,
    /// Informational-only link.
    pub info_url: Option<String>,
    /// External release notes link.
    pub release_notes_url: Option<String>,
    /// Inline release description.
    pub description: Option<String>,
    /// Lowest OS version bound, verbatim from the feed.
    pub minimum_system_version: Option<String>,
    /// Highest OS version bound, verbatim from the feed.
    pub maximum_system_version: Option<String>,
    /// Channel name; `None` is the default channel.
    pub channel: Option<String>,
    /// Phased rollout interval in seconds.
    pub phased_rollout_interval: Option<u64>,
    /// Publish date as published.
    pub date_string: Option<String>,
    /// Parsed publish date, when parseable.
    pub date: Option<DateTime<Utc>>,
    /// Below this installed version the item is a major upgrade.
    pub minimum_autoupdate_version: Option<String>,
    /// Major upgrades skipped below this version are re-presented.
    pub ignore_skipped_upgrades_below_version: Option<String>,
    /// Critical update flag.
    pub critical: bool,
    /// How the artifact installs.
    pub installation_kind: InstallationKind,
    /// Base64 Ed25519 signature over the artifact bytes.
    pub ed_signature: Option<String>,
    /// Delta items keyed by the installed version they apply from.
    pub deltas: HashMap<String, AppcastItem>,

    is_major_upgrade: bool,
    passes_minimum_os: bool,
    passes_maximum_os: bool,
    is_delta: bool,
}

impl AppcastItem {
    /// True iff the item carries no download, only an informational link.
    pub fn is_information_only(&self) -> bool {
        self.download.is_none()
    }

    /// True iff the host's installed version fails the item's
    /// minimum-autoupdate requirement.
    pub fn is_major_upgrade(&self) -> bool {
        self.is_major_upgrade
    }

    /// True iff the host OS satisfies the minimum bound (or there is none).
    pub fn passes_minimum_os(&self) -> bool {
        self.passes_minimum_os
    }

    /// True iff the host OS satisfies the maximum bound (or there is none).
    pub fn passes_maximum_os(&self) -> bool {
        self.passes_maximum_os
    }

    /// Both OS bounds at once.
    pub fn passes_os_requirements(&self) -> bool {
        self.passes_minimum_os && self.passes_maximum_os
    }

    /// True iff this item is reachable only through a parent's delta map.
    pub fn is_delta(&self) -> bool {
        self.is_delta
    }
}

/// Resolves raw feed records into [`AppcastItem`]s against one host context.
///
/// Two comparators are involved on purpose: the application-supplied one
/// orders versions for selection and the major-upgrade test, while the
/// standard comparator is reserved for the downgrade guard so a custom
/// ordering can never smuggle an older build past installation.
pub struct ItemResolver {
    host_version: String,
    os_version: String,
    application: Arc<dyn VersionComparator>,
    standard: StandardComparator,
}

impl std::fmt::Debug for ItemResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemResolver")
            .field("host_version", &self.host_version)
            .field("os_version", &self.os_version)
            .finish_non_exhaustive()
    }
}

impl ItemResolver {
    /// Creates a resolver for the given host version and OS version.
    pub fn new(
        host_version: impl Into<String>,
        os_version: impl Into<String>,
        application: Arc<dyn VersionComparator>,
    ) -> Self {
        Self {
            host_version: host_version.into(),
            os_version: os_version.into(),
            application,
            standard: StandardComparator,
        }
    }

    /// Resolves one top-level record. Pure: no side effects, no I/O.
    pub fn resolve(&self, raw: &RawEntry) -> Result<AppcastItem, AppcastError> {
        self.resolve_entry(raw, false)
    }

    fn resolve_entry(&self, raw: &RawEntry, is_delta: bool) -> Result<AppcastItem, AppcastError> {
        let version = raw
            .get(keys::VERSION)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppcastError::MalformedItem("item has no version string".into()))?
            .to_string();

        let url = raw.get(keys::URL).filter(|u| !u.is_empty());
        let info_url = raw.get(keys::INFO_LINK).filter(|u| !u.is_empty());
        if url.is_none() && info_url.is_none() {
            return Err(AppcastError::MalformedItem(format!(
                "item {version} has neither a download nor an informational link"
            )));
        }

        let download = url.map(|u| DownloadRef {
            url: u.to_string(),
            length: raw.get(keys::LENGTH).and_then(|l| l.parse().ok()),
        });

        let installation_kind = raw
            .get(keys::INSTALLATION_TYPE)
            .and_then(InstallationKind::from_field)
            .unwrap_or_else(|| {
                url.map(InstallationKind::infer_from_url)
                    .unwrap_or(InstallationKind::Application)
            });

        let minimum_autoupdate_version = raw
            .get(keys::MINIMUM_AUTOUPDATE_VERSION)
            .map(str::to_string);
        let is_major_upgrade = minimum_autoupdate_version.as_deref().is_some_and(|min| {
            self.application.compare(&self.host_version, min) == std::cmp::Ordering::Less
        });

        let minimum_system_version = raw.get(keys::MINIMUM_SYSTEM_VERSION).map(str::to_string);
        let maximum_system_version = raw.get(keys::MAXIMUM_SYSTEM_VERSION).map(str::to_string);
        let passes_minimum_os = self.passes_bound(minimum_system_version.as_deref(), Bound::Minimum);
        let passes_maximum_os = self.passes_bound(maximum_system_version.as_deref(), Bound::Maximum);

        let date_string = raw.get(keys::PUB_DATE).map(str::to_string);
        let date = date_string.as_deref().and_then(parse_date);

        let mut deltas = HashMap::new();
        for delta_raw in raw.deltas() {
            let Some(from) = delta_raw.get(keys::DELTA_FROM) else {
                tracing::warn!(version, "delta record has no deltaFrom key, dropping");
                continue;
            };
            let from = from.to_string();
            match self.resolve_entry(delta_raw, true) {
                Ok(delta) if delta.download.is_some() => {
                    deltas.insert(from, delta);
                }
                Ok(_) => {
                    tracing::warn!(version, from, "delta record has no download, dropping");
                }
                Err(err) => {
                    tracing::warn!(version, from, %err, "malformed delta record, dropping");
                }
            }
        }

        Ok(AppcastItem {
            title: raw.get(keys::TITLE).map(str::to_string),
            display_version: raw
                .get(keys::SHORT_VERSION)
                .map_or_else(|| version.clone(), str::to_string),
            version,
            download,
            info_url: info_url.map(str::to_string),
            release_notes_url: raw.get(keys::RELEASE_NOTES_LINK).map(str::to_string),
            description: raw.get(keys::DESCRIPTION).map(str::to_string),
            minimum_system_version,
            maximum_system_version,
            channel: raw.get(keys::CHANNEL).filter(|c| !c.is_empty()).map(str::to_string),
            phased_rollout_interval: raw
                .get(keys::PHASED_ROLLOUT_INTERVAL)
                .and_then(|i| i.parse().ok()),
            date_string,
            date,
            minimum_autoupdate_version,
            ignore_skipped_upgrades_below_version: raw
                .get(keys::IGNORE_SKIPPED_UPGRADES_BELOW_VERSION)
                .map(str::to_string),
            critical: raw
                .get(keys::CRITICAL_UPDATE)
                .is_some_and(|c| matches!(c, "true" | "1" | "yes")),
            installation_kind,
            ed_signature: raw.get(keys::ED_SIGNATURE).map(str::to_string),
            deltas,
            is_major_upgrade,
            passes_minimum_os,
            passes_maximum_os,
            is_delta,
        })
    }

    /// A missing bound always passes; a malformed bound never does.
    fn passes_bound(&self, bound: Option<&str>, kind: Bound) -> bool {
        let Some(bound) = bound else { return true };
        if !valid_os_bound(bound) {
            tracing::warn!(bound, "malformed OS version bound, treating item as ineligible");
            return false;
        }
        let ord = self.standard.compare(&self.os_version, bound);
        match kind {
            Bound::Minimum => ord != std::cmp::Ordering::Less,
            Bound::Maximum => ord != std::cmp::Ordering::Greater,
        }
    }
}

#[derive(Clone, Copy)]
enum Bound {
    Minimum,
    Maximum,
}

fn valid_os_bound(bound: &str) -> bool {
    !bound.is_empty()
        && bound.chars().any(|c| c.is_ascii_digit())
        && bound.chars().all(|c| c.is_ascii_digit() || c == '.')
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|d| d.with_timezone(&Utc))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(host_version: &str, os_version: &str) -> ItemResolver {
        ItemResolver::new(host_version, os_version, Arc::new(StandardComparator))
    }

    fn entry(version: &str, url: &str) -> RawEntry {
        RawEntry::new()
            .with(keys::VERSION, version)
            .with(keys::URL, url)
    }

    #[test]
    fn test_requires_version() {
        let raw = RawEntry::new().with(keys::URL, "https://example.com/a.tar.gz");
        assert!(matches!(
            resolver("1.0", "14.0").resolve(&raw),
            Err(AppcastError::MalformedItem(_))
        ));
    }

    #[test]
    fn test_requires_download_or_info_link() {
        let raw = RawEntry::new().with(keys::VERSION, "2.0");
        assert!(resolver("1.0", "14.0").resolve(&raw).is_err());

        let info = RawEntry::new()
            .with(keys::VERSION, "2.0")
            .with(keys::INFO_LINK, "https://example.com/notes");
        let item = resolver("1.0", "14.0").resolve(&info).unwrap();
        assert!(item.is_information_only());
    }

    #[test]
    fn test_display_version_falls_back() {
        let item = resolver("1.0", "14.0")
            .resolve(&entry("200", "https://example.com/a.tar.gz"))
            .unwrap();
        assert_eq!(item.display_version, "200");

        let raw = entry("200", "https://example.com/a.tar.gz").with(keys::SHORT_VERSION, "2.0");
        let item = resolver("1.0", "14.0").resolve(&raw).unwrap();
        assert_eq!(item.display_version, "2.0");
    }

    #[test]
    fn test_installation_kind_inference() {
        let cases = [
            ("https://example.com/a.tar.gz", InstallationKind::Application),
            ("https://example.com/a.PKG", InstallationKind::GuidedPackage),
            ("https://example.com/a.mpkg", InstallationKind::InteractivePackage),
        ];
        for (url, expected) in cases {
            let item = resolver("1.0", "14.0").resolve(&entry("2.0", url)).unwrap();
            assert_eq!(item.installation_kind, expected, "{url}");
        }

        // An explicit field beats extension inference.
        let raw = entry("2.0", "https://example.com/a.tar.gz")
            .with(keys::INSTALLATION_TYPE, "package");
        let item = resolver("1.0", "14.0").resolve(&raw).unwrap();
        assert_eq!(item.installation_kind, InstallationKind::GuidedPackage);
    }

    #[test]
    fn test_major_upgrade_flag() {
        let raw = entry("3.0", "https://example.com/a.tar.gz")
            .with(keys::MINIMUM_AUTOUPDATE_VERSION, "2.0");
        assert!(resolver("1.5", "14.0").resolve(&raw).unwrap().is_major_upgrade());
        assert!(!resolver("2.0", "14.0").resolve(&raw).unwrap().is_major_upgrade());
        assert!(!resolver("2.5", "14.0").resolve(&raw).unwrap().is_major_upgrade());
    }

    #[test]
    fn test_os_bounds() {
        let raw = entry("2.0", "https://example.com/a.tar.gz")
            .with(keys::MINIMUM_SYSTEM_VERSION, "13.0")
            .with(keys::MAXIMUM_SYSTEM_VERSION, "15.0");

        let item = resolver("1.0", "14.0").resolve(&raw).unwrap();
        assert!(item.passes_os_requirements());

        let item = resolver("1.0", "12.6").resolve(&raw).unwrap();
        assert!(!item.passes_minimum_os());
        assert!(item.passes_maximum_os());

        let item = resolver("1.0", "15.1").resolve(&raw).unwrap();
        assert!(item.passes_minimum_os());
        assert!(!item.passes_maximum_os());
    }

    #[test]
    fn test_malformed_os_bound_fails_closed() {
        let raw = entry("2.0", "https://example.com/a.tar.gz")
            .with(keys::MINIMUM_SYSTEM_VERSION, "not a version");
        let item = resolver("1.0", "14.0").resolve(&raw).unwrap();
        assert!(!item.passes_minimum_os());
    }

    #[test]
    fn test_delta_resolution() {
        let raw = entry("2.0", "https://example.com/full.tar.gz").with_delta(
            RawEntry::new()
                .with(keys::VERSION, "2.0")
                .with(keys::DELTA_FROM, "1.0")
                .with(keys::URL, "https://example.com/delta.tar.gz"),
        );
        let item = resolver("1.0", "14.0").resolve(&raw).unwrap();
        assert!(!item.is_delta());
        let delta = item.deltas.get("1.0").expect("delta keyed by source version");
        assert!(delta.is_delta());
        assert_eq!(delta.download.as_ref().unwrap().url, "https://example.com/delta.tar.gz");
    }

    #[test]
    fn test_pub_date_parsing() {
        let raw = entry("2.0", "https://example.com/a.tar.gz")
            .with(keys::PUB_DATE, "Wed, 09 Jul 2025 10:00:00 +0000");
        let item = resolver("1.0", "14.0").resolve(&raw).unwrap();
        assert!(item.date.is_some());
        assert_eq!(item.date_string.as_deref(), Some("Wed, 09 Jul 2025 10:00:00 +0000"));
    }
}
