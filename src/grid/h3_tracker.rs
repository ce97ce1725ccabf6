//! Per-origin H3 liveness tracking (§4.A).
//!
//! Three flags, deliberately not collapsed into one enum: a pool can be
//! `broken` and `confirmed` from different, non-overlapping points in its
//! history (confirmed once, long ago; broken since). `failed_recently` is
//! the soft signal that lets the grid skip the happy-eyeballs delay without
//! giving up on H3 outright.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::grid::origin::Origin;

/// Liveness tracking the grid needs from its host application.
pub trait H3StatusTracker: Send + Sync {
    fn is_broken(&self, origin: &Origin) -> bool;
    fn has_failed_recently(&self, origin: &Origin) -> bool;
    fn mark_broken(&self, origin: &Origin);
    fn mark_confirmed(&self, origin: &Origin);
    fn mark_failed_recently(&self, origin: &Origin);
}

#[derive(Clone, Copy, Debug, Default)]
struct Flags {
    broken: bool,
    confirmed: bool,
    failed_recently: bool,
}

/// The in-memory tracker this crate ships by default. Flags never expire on
/// their own; a host application that wants `failed_recently` to decay
/// after some window should wrap this (or implement `H3StatusTracker`
/// itself) and clear the flag on a timer; the grid only ever sets it, it
/// never clears it.
#[derive(Default)]
pub struct InMemoryH3StatusTracker {
    origins: Mutex<HashMap<Origin, Flags>>,
}

impl InMemoryH3StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_flags<R>(&self, origin: &Origin, f: impl FnOnce(&mut Flags) -> R) -> R {
        let mut origins = self.origins.lock().unwrap();
        let flags = origins.entry(origin.clone()).or_default();
        f(flags)
    }
}

impl H3StatusTracker for InMemoryH3StatusTracker {
    fn is_broken(&self, origin: &Origin) -> bool {
        self.with_flags(origin, |f| f.broken)
    }

    fn has_failed_recently(&self, origin: &Origin) -> bool {
        self.with_flags(origin, |f| f.failed_recently)
    }

    fn mark_broken(&self, origin: &Origin) {
        self.with_flags(origin, |f| f.broken = true)
    }

    fn mark_confirmed(&self, origin: &Origin) {
        self.with_flags(origin, |f| f.confirmed = true)
    }

    fn mark_failed_recently(&self, origin: &Origin) {
        self.with_flags(origin, |f| f.failed_recently = true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_independent_and_per_origin() {
        let tracker = InMemoryH3StatusTracker::new();
        let a = Origin::new("a.example.com", 443);
        let b = Origin::new("b.example.com", 443);

        tracker.mark_failed_recently(&a);
        assert!(tracker.has_failed_recently(&a));
        assert!(!tracker.is_broken(&a));
        assert!(!tracker.has_failed_recently(&b));

        tracker.mark_broken(&a);
        assert!(tracker.is_broken(&a));
        assert!(tracker.has_failed_recently(&a));
    }
}
