//! Ordered key/value feed records.
//!
//! The engine never tokenizes feed markup itself; an external parser turns
//! the transport bytes into ordered key/value records first, and the item
//! resolver consumes those. [`parse_feed`] is the built-in collaborator for
//! JSON-published feeds and the format the test suites speak.

use serde_json::Value;

use super::AppcastError;

/// Well-known record keys, mirroring the published feed vocabulary.
pub mod keys {
    /// Machine version string (required).
    pub const VERSION: &str = "version";
    /// Human-facing version, falls back to [`VERSION`].
    pub const SHORT_VERSION: &str = "shortVersionString";
    /// Entry title.
    pub const TITLE: &str = "title";
    /// Download URL.
    pub const URL: &str = "url";
    /// Download length in bytes.
    pub const LENGTH: &str = "length";
    /// Informational-only link (no download).
    pub const INFO_LINK: &str = "informationalLink";
    /// External release notes link.
    pub const RELEASE_NOTES_LINK: &str = "releaseNotesLink";
    /// Inline release description.
    pub const DESCRIPTION: &str = "description";
    /// Lowest OS version the update runs on.
    pub const MINIMUM_SYSTEM_VERSION: &str = "minimumSystemVersion";
    /// Highest OS version the update runs on.
    pub const MAXIMUM_SYSTEM_VERSION: &str = "maximumSystemVersion";
    /// Feed channel name (absent means the default channel).
    pub const CHANNEL: &str = "channel";
    /// Phased rollout interval in seconds.
    pub const PHASED_ROLLOUT_INTERVAL: &str = "phasedRolloutInterval";
    /// Publish date, RFC 2822 or RFC 3339.
    pub const PUB_DATE: &str = "pubDate";
    /// Below this installed version the update is a major upgrade.
    pub const MINIMUM_AUTOUPDATE_VERSION: &str = "minimumAutoupdateVersion";
    /// Re-presents major upgrades skipped below this version.
    pub const IGNORE_SKIPPED_UPGRADES_BELOW_VERSION: &str = "ignoreSkippedUpgradesBelowVersion";
    /// Critical update flag.
    pub const CRITICAL_UPDATE: &str = "criticalUpdate";
    /// Installation kind: `application`, `package`, or `interactive-package`.
    pub const INSTALLATION_TYPE: &str = "installationType";
    /// Base64 Ed25519 signature over the artifact bytes.
    pub const ED_SIGNATURE: &str = "edSignature";
    /// The installed version a delta record applies from.
    pub const DELTA_FROM: &str = "deltaFrom";
}

/// One feed entry as ordered key/value pairs, plus its nested delta records.
#[derive(Debug, Clone, Default)]
pub struct RawEntry {
    fields: Vec<(String, String)>,
    deltas: Vec<RawEntry>,
}

impl RawEntry {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a field, preserving insertion order.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.push((key.into(), value.into()));
    }

    /// Builder-style [`push`](Self::push).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(key, value);
        self
    }

    /// Appends a nested delta record.
    pub fn push_delta(&mut self, delta: RawEntry) {
        self.deltas.push(delta);
    }

    /// Builder-style [`push_delta`](Self::push_delta).
    pub fn with_delta(mut self, delta: RawEntry) -> Self {
        self.push_delta(delta);
        self
    }

    /// Returns the first value recorded under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All fields in publication order.
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// Nested delta records in publication order.
    pub fn deltas(&self) -> &[RawEntry] {
        &self.deltas
    }
}

/// Parses a JSON feed document into ordered records.
///
/// Accepts either a top-level array of entries or an object with an `items`
/// array. Scalar fields are stringified; `deltas` nests further entries.
/// Entry order is the publication order and is preserved.
pub fn parse_feed(bytes: &[u8]) -> Result<Vec<RawEntry>, AppcastError> {
    let doc: Value = serde_json::from_slice(bytes)
        .map_err(|e| AppcastError::Parse(format!("invalid feed document: {e}")))?;

    let items = match &doc {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => map
            .get("items")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .ok_or_else(|| AppcastError::Parse("feed object has no `items` array".into()))?,
        _ => return Err(AppcastError::Parse("feed is neither array nor object".into())),
    };

    items.iter().map(entry_from_value).collect()
}

fn entry_from_value(value: &Value) -> Result<RawEntry, AppcastError> {
    let Value::Object(map) = value else {
        return Err(AppcastError::Parse("feed entry is not an object".into()));
    };

    let mut entry = RawEntry::new();
    for (key, value) in map {
        if key == "deltas" {
            let deltas = value
                .as_array()
                .ok_or_else(|| AppcastError::Parse("`deltas` is not an array".into()))?;
            for delta in deltas {
                entry.push_delta(entry_from_value(delta)?);
            }
            continue;
        }
        match value {
            Value::String(s) => entry.push(key, s.clone()),
            Value::Number(n) => entry.push(key, n.to_string()),
            Value::Bool(b) => entry.push(key, b.to_string()),
            // Nulls and nested structure other than deltas carry no field value.
            _ => {}
        }
    }
    Ok(entry)
}
