//! Construction-time configuration for a `Grid`.
//!
//! Mirrors the constructor argument list Envoy's `ConnectivityGrid` takes
//! (host, priority, transport-socket options, alternate-protocols cache,
//! quic stat names, persistent quic info) collapsed into a builder, the
//! way this crate's H3 client builds its pools.

use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::grid::alt_cache::AltProtocolCache;
use crate::grid::grid::Grid;
use crate::grid::h3_tracker::{H3StatusTracker, InMemoryH3StatusTracker};
use crate::grid::origin::Origin;
use crate::grid::pool::PoolHandle;

/// The default happy-eyeballs delay before a pending H3 attempt's H2
/// fallback is allowed to start, absent a recent H3 failure for the
/// origin. 300ms matches the interval Chromium and Envoy both use.
pub const DEFAULT_HAPPY_EYEBALLS_DELAY: Duration = Duration::from_millis(300);

pub(crate) type PoolFactory = Arc<dyn Fn(&Origin) -> Arc<dyn PoolHandle> + Send + Sync>;

/// Builds the H3 pool for an origin. Gets a weak handle back to the grid
/// that's creating it so the pool can report handshake outcomes through
/// [`Grid::on_handshake_complete`]/[`Grid::on_zero_rtt_handshake_failed`]
/// without the grid and its own pool holding a strong reference to each
/// other.
pub(crate) type H3PoolFactory = Arc<dyn Fn(&Origin, Weak<Grid>) -> Arc<dyn PoolHandle> + Send + Sync>;

/// Builds a [`Grid`](crate::Grid) for a single upstream origin.
pub struct GridBuilder {
    origin: Origin,
    alt_cache: Option<Arc<dyn AltProtocolCache>>,
    h3_tracker: Option<Arc<dyn H3StatusTracker>>,
    h2_factory: Option<PoolFactory>,
    h3_factory: Option<H3PoolFactory>,
    happy_eyeballs_delay: Duration,
}

impl GridBuilder {
    pub fn new(origin: Origin) -> Self {
        GridBuilder {
            origin,
            alt_cache: None,
            h3_tracker: None,
            h2_factory: None,
            h3_factory: None,
            happy_eyeballs_delay: DEFAULT_HAPPY_EYEBALLS_DELAY,
        }
    }

    /// The alternate-protocols cache the grid consults to decide whether
    /// H3 is even worth attempting for this origin. Required: a grid with
    /// no cache configured never attempts H3, and behaves like a plain H2
    /// pool adapter.
    pub fn alt_protocol_cache(mut self, cache: Arc<dyn AltProtocolCache>) -> Self {
        self.alt_cache = Some(cache);
        self
    }

    /// Overrides the default in-memory [`H3StatusTracker`]. Useful for a
    /// caller that wants liveness state shared across multiple `Grid`s, or
    /// persisted across process restarts.
    pub fn h3_status_tracker(mut self, tracker: Arc<dyn H3StatusTracker>) -> Self {
        self.h3_tracker = Some(tracker);
        self
    }

    /// How the grid builds (or rebuilds, after drain) its H2 pool for this
    /// origin. Required.
    pub fn h2_pool(mut self, factory: impl Fn(&Origin) -> Arc<dyn PoolHandle> + Send + Sync + 'static) -> Self {
        self.h2_factory = Some(Arc::new(factory));
        self
    }

    /// How the grid builds its H3 pool for this origin. Omitting this
    /// (the default) means the grid never races H3 at all, regardless of
    /// what the alt-protocol cache advertises.
    ///
    /// The factory is handed a weak reference to the grid it's building
    /// for; a pool that wants to report handshake outcomes (see
    /// [`Grid::on_handshake_complete`]) should hold onto it and upgrade it
    /// when a handshake resolves.
    pub fn h3_pool(
        mut self,
        factory: impl Fn(&Origin, Weak<Grid>) -> Arc<dyn PoolHandle> + Send + Sync + 'static,
    ) -> Self {
        self.h3_factory = Some(Arc::new(factory));
        self
    }

    /// Overrides [`DEFAULT_HAPPY_EYEBALLS_DELAY`].
    pub fn happy_eyeballs_delay(mut self, delay: Duration) -> Self {
        self.happy_eyeballs_delay = delay;
        self
    }

    /// Builds the grid. Panics if no H2 pool factory was configured: a
    /// grid with neither protocol available can't serve anything.
    ///
    /// Returns an `Arc<Grid>` rather than a bare `Grid` because the grid
    /// hands a weak reference to itself to its H3 pool factory, which
    /// requires `Arc::new_cyclic`.
    pub fn build(self) -> Arc<Grid> {
        let h2_factory = self
            .h2_factory
            .expect("GridBuilder requires h2_pool() to be configured");
        let alt_cache = self
            .alt_cache
            .unwrap_or_else(|| Arc::new(crate::grid::alt_cache::StaticAltProtocolCache::new()));
        let h3_tracker = self
            .h3_tracker
            .unwrap_or_else(|| Arc::new(InMemoryH3StatusTracker::new()));
        Arc::new_cyclic(|weak: &Weak<Grid>| {
            Grid::new(
                self.origin,
                alt_cache,
                h3_tracker,
                h2_factory,
                self.h3_factory,
                self.happy_eyeballs_delay,
                weak.clone(),
            )
        })
    }
}
