//! Generation tagging and the in-progress flag.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Monotonic generation counter for in-flight operations.
///
/// Each download or extraction is tagged with the generation current at
/// spawn time; events carrying a stale tag are discarded, so a cancelled
/// operation's late completions can never transition the session.
#[derive(Debug, Default)]
pub struct GenerationGate {
    current: AtomicU64,
}

impl GenerationGate {
    /// Invalidates all outstanding tags and returns the new generation.
    pub fn advance(&self) -> u64 {
        self.current.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The generation new operations should be tagged with.
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Whether an event tagged `generation` is still live.
    pub fn accepts(&self, generation: u64) -> bool {
        self.current.load(Ordering::Acquire) == generation
    }
}

/// Releases the session's in-progress flag when the check returns by any
/// path, early returns and errors included.
pub(super) struct InProgressGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InProgressGuard<'a> {
    /// Claims the flag; `None` when a session is already in progress.
    pub(super) fn claim(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Self { flag })
    }
}

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
