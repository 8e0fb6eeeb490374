//! The appcast: an ordered, immutable feed of update items.

pub mod item;
pub mod raw;

pub use item::{AppcastItem, DownloadRef, InstallationKind, ItemResolver};
pub use raw::{RawEntry, parse_feed};

use thiserror::Error;

/// Failures while obtaining or resolving a feed.
#[derive(Error, Debug)]
pub enum AppcastError {
    /// Transport-level failure fetching the feed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The feed bytes did not parse into records.
    #[error("Feed parse error: {0}")]
    Parse(String),

    /// The feed parsed but resolved to zero usable items.
    #[error("Feed contains no usable items")]
    EmptyFeed,

    /// One record was structurally unusable.
    #[error("Malformed appcast item: {0}")]
    MalformedItem(String),
}

/// The ordered, immutable sequence of items exactly as published.
///
/// Publication order carries no selection meaning; it is preserved for
/// inspection and debugging only. Selection is [`crate::select`]'s job.
#[derive(Debug, Clone)]
pub struct Appcast {
    items: Vec<AppcastItem>,
}

impl Appcast {
    /// Resolves raw records into an appcast, preserving publication order.
    ///
    /// Individually malformed records are dropped with a warning rather than
    /// failing the whole feed; a feed with no usable records at all is an
    /// [`AppcastError::EmptyFeed`].
    pub fn resolve(entries: &[RawEntry], resolver: &ItemResolver) -> Result<Self, AppcastError> {
        let mut items = Vec::with_capacity(entries.len());
        for entry in entries {
            match resolver.resolve(entry) {
                Ok(item) => items.push(item),
                Err(err) => tracing::warn!(%err, "dropping malformed feed entry"),
            }
        }
        if items.is_empty() {
            return Err(AppcastError::EmptyFeed);
        }
        Ok(Self { items })
    }

    /// Items in publication order.
    pub fn items(&self) -> &[AppcastItem] {
        &self.items
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True iff the appcast has no items (never true for a resolved one).
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
