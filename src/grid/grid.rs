//! The public entry point: one `Grid` per upstream origin, racing H3 and
//! H2 connection attempts for every `new_stream` call.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::error::{self, Error};
use crate::grid::alt_cache::AltProtocolCache;
use crate::grid::builder::{H3PoolFactory, PoolFactory};
use crate::grid::h3_tracker::H3StatusTracker;
use crate::grid::origin::Origin;
use crate::grid::pool::{DrainBehavior, NewStreamOptions, PoolHandle};
use crate::grid::wrapper::{self, NewStreamOutcome, PlannedAttempt, WrapperConfig};
use tokio::sync::oneshot;

struct GridInner {
    h2_pool: Option<Arc<dyn PoolHandle>>,
    h3_pool: Option<Arc<dyn PoolHandle>>,
    draining: bool,
    in_flight: Vec<oneshot::Sender<()>>,
}

/// A happy-eyeballs-style connection pool for a single upstream origin.
///
/// A `Grid` owns at most one H2 pool and one H3 pool, created lazily on
/// first use via the factories given to [`GridBuilder`](crate::GridBuilder).
/// Every call to [`new_stream`](Grid::new_stream) races whichever of the
/// two protocols are eligible for this call and returns whichever
/// completes first; see the crate documentation for the exact fallback
/// policy.
pub struct Grid {
    origin: Origin,
    alt_cache: Arc<dyn AltProtocolCache>,
    h3_tracker: Arc<dyn H3StatusTracker>,
    h2_factory: PoolFactory,
    h3_factory: Option<H3PoolFactory>,
    happy_eyeballs_delay: Duration,
    self_weak: Weak<Grid>,
    inner: Mutex<GridInner>,
}

impl Grid {
    pub(crate) fn new(
        origin: Origin,
        alt_cache: Arc<dyn AltProtocolCache>,
        h3_tracker: Arc<dyn H3StatusTracker>,
        h2_factory: PoolFactory,
        h3_factory: Option<H3PoolFactory>,
        happy_eyeballs_delay: Duration,
        self_weak: Weak<Grid>,
    ) -> Self {
        Grid {
            origin,
            alt_cache,
            h3_tracker,
            h2_factory,
            h3_factory,
            happy_eyeballs_delay,
            self_weak,
            inner: Mutex::new(GridInner {
                h2_pool: None,
                h3_pool: None,
                draining: false,
                in_flight: Vec::new(),
            }),
        }
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Whether this call should even try H3: the grid has an H3 pool
    /// factory configured, the origin isn't marked broken, and the
    /// alt-protocol cache actually advertises a supported H3 alternative
    /// for this exact host and port.
    ///
    /// An alternative that names a *different* host or port is ignored:
    /// following one would mean connecting somewhere other than the
    /// origin the caller asked for, which is out of scope here (see
    /// DESIGN.md).
    fn should_attempt_h3(&self) -> bool {
        if self.h3_factory.is_none() {
            return false;
        }
        if self.h3_tracker.is_broken(&self.origin) {
            return false;
        }
        match self.alt_cache.find_alternatives(&self.origin) {
            Some(alts) => alts.iter().any(|alt| {
                crate::grid::alt_cache::is_alpn_supported(&alt.alpn)
                    && (alt.hostname.is_empty() || alt.hostname == self.origin.sni_host())
                    && (alt.port == 0 || alt.port == self.origin.port())
            }),
            None => false,
        }
    }

    /// Starts (or joins) a race for a new stream. `options.can_use_http3`
    /// lets a caller opt a specific request out of H3 even when the grid
    /// would otherwise attempt it (e.g. a request that must not tolerate
    /// 0-RTT replay).
    pub fn new_stream(&self, options: NewStreamOptions) -> NewStreamOutcome {
        let mut inner = self.inner.lock().unwrap();
        if inner.draining {
            return NewStreamOutcome::Immediate(Err(error::overflow()));
        }

        let attempt_h3 = options.can_use_http3 && self.should_attempt_h3();
        let mut plan = Vec::with_capacity(2);

        if attempt_h3 {
            let pool = inner
                .h3_pool
                .get_or_insert_with(|| {
                    (self.h3_factory.as_ref().unwrap())(&self.origin, self.self_weak.clone())
                })
                .clone();
            plan.push(PlannedAttempt { pool, start_after: Duration::ZERO });
        }

        let h2_delay = if attempt_h3 && !self.h3_tracker.has_failed_recently(&self.origin) {
            self.happy_eyeballs_delay
        } else {
            Duration::ZERO
        };
        let h2_pool = inner
            .h2_pool
            .get_or_insert_with(|| (self.h2_factory)(&self.origin))
            .clone();
        plan.push(PlannedAttempt { pool: h2_pool, start_after: h2_delay });

        inner.in_flight.retain(|tx| !tx.is_closed());
        drop(inner);

        let started = wrapper::start(
            WrapperConfig {
                origin: self.origin.clone(),
                options: options.stream,
                can_use_h3: options.can_use_http3,
                plan,
            },
            self.h3_tracker.clone(),
        );

        if let Some(teardown) = started.teardown {
            self.inner.lock().unwrap().in_flight.push(teardown);
        }

        started.outcome
    }

    /// True if either protocol's pool has at least one usable connection.
    pub fn has_active_connections(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.h2_pool.as_ref().is_some_and(|p| p.has_active_connections())
            || inner.h3_pool.as_ref().is_some_and(|p| p.has_active_connections())
    }

    /// True once both pools (that exist) are idle and no race is in flight.
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.in_flight.iter().all(|tx| tx.is_closed())
            && inner.h2_pool.as_ref().map_or(true, |p| p.is_idle())
            && inner.h3_pool.as_ref().map_or(true, |p| p.is_idle())
    }

    pub fn delete_is_pending(&self) -> bool {
        self.inner.lock().unwrap().draining
    }

    /// Stops accepting new streams on already-open connections in both
    /// pools. New calls to `new_stream` still start fresh races until
    /// `behavior` is `DrainAndDelete`, at which point they're rejected.
    pub fn drain_connections(&self, behavior: DrainBehavior) {
        let inner = self.inner.lock().unwrap();
        if let Some(pool) = &inner.h2_pool {
            pool.drain_connections(behavior);
        }
        if let Some(pool) = &inner.h3_pool {
            pool.drain_connections(behavior);
        }
        drop(inner);
        if behavior == DrainBehavior::DrainAndDelete {
            self.inner.lock().unwrap().draining = true;
        }
    }

    /// Called by the H3 pool adapter once a connection's QUIC handshake
    /// completes successfully, confirming the origin is H3-reachable.
    pub fn on_handshake_complete(&self) {
        self.h3_tracker.mark_confirmed(&self.origin);
    }

    /// Called by the H3 pool adapter when 0-RTT data was rejected,
    /// short of marking the origin broken outright.
    pub fn on_zero_rtt_handshake_failed(&self) {
        self.h3_tracker.mark_failed_recently(&self.origin);
    }

    /// Marks H3 broken for this origin directly, bypassing the usual
    /// post-handshake-failure detection. Exposed for callers that learn
    /// about breakage out of band (e.g. a network change notification).
    pub fn mark_h3_broken(&self) {
        self.h3_tracker.mark_broken(&self.origin);
    }
}

impl Drop for Grid {
    fn drop(&mut self) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        for teardown in inner.in_flight.drain(..) {
            let _ = teardown.send(());
        }
    }
}
