//! The interface the grid races. `PoolHandle` is the crate's equivalent of
//! Envoy's `ConnectionPool::Instance`, one concrete implementation per
//! protocol, `h2_pool::H2Pool` and (with the `http3` feature) `h3_pool::H3Pool`,
//! both built against this trait rather than against each other.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use crate::error::Error;
use crate::grid::origin::Origin;

/// Which wire protocol a `PoolHandle` speaks. Used only for logging and for
/// the `protocol_description` the grid reports back to callers; the grid's
/// own branching is on trait object identity, not on this enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http2,
    Http3,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Http2 => "h2",
            Protocol::Http3 => "h3",
        })
    }
}

/// What a caller is allowed to do with a new stream before the grid even
/// knows which pool will serve it. `can_send_early_data` only matters to an
/// H3 pool attempting 0-RTT; an H2 pool ignores it.
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamOptions {
    pub can_send_early_data: bool,
}

/// What the caller asked for when a policy decision is still outstanding,
/// e.g. whether H3 is even allowed to race at all for this request.
#[derive(Clone, Copy, Debug, Default)]
pub struct NewStreamOptions {
    pub can_use_http3: bool,
    pub stream: StreamOptions,
}

/// A successfully established stream, handed back to the caller. This
/// crate doesn't know or care what an "encoder" looks like to the caller;
/// it's an opaque box keyed only by which protocol produced it.
pub struct StreamReady {
    pub protocol: Protocol,
    pub encoder: Box<dyn std::any::Any + Send>,
}

impl fmt::Debug for StreamReady {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamReady")
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// A pool-side connection failure, carrying enough detail for the wrapper
/// to decide whether to try another pool and for the grid to decide
/// whether to mark H3 broken.
#[derive(Debug)]
pub struct PoolFailure {
    pub reason: Error,
    /// True once the connection was usable at all (e.g. the QUIC handshake
    /// completed) before the stream itself failed. Informational only; the
    /// wrapper's H3-broken decision doesn't key off this (see `wrapper.rs`).
    pub connection_used: bool,
}

/// Why a pending pool attempt is being torn down before it completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelPolicy {
    /// Default Envoy/h2/h3 client behaviour: let the attempt keep running
    /// in the background so its connection, if it lands, can be cached.
    Default,
    /// Actively abort the attempt; used when the caller cancels for a
    /// reason that makes the connection itself undesirable (e.g. request
    /// timeout where no retry will reuse this origin soon).
    CloseExcess,
}

/// What draining a pool asks it to do with connections already open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainBehavior {
    /// Stop handing out new streams on existing connections but let
    /// in-flight streams finish.
    DrainOnly,
    /// Drain, then close the pool down entirely once it goes idle.
    DrainAndDelete,
}

pub type IdleCallback = Box<dyn Fn() + Send + Sync>;

/// A boxed future resolving to the outcome of one connection attempt.
pub type NewStreamFuture =
    Pin<Box<dyn Future<Output = Result<StreamReady, PoolFailure>> + Send>>;

/// The trait every pool the grid can race must implement.
///
/// Unlike Envoy's `ConnectionPool::Instance`, `new_stream` returns a future
/// rather than taking a callback; the grid's `Attempt` is the thing that
/// polls it once with `now_or_never` to detect synchronous completion
/// before ever spawning a background task (see `attempt.rs`).
pub trait PoolHandle: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Start (or join) a connection attempt for `origin` and return a
    /// future that resolves once a stream is ready or the attempt fails.
    /// Does not block; the heavy lifting happens when the returned future
    /// is polled.
    ///
    /// Takes `StreamOptions` rather than `NewStreamOptions`: by the time
    /// the grid calls this, it has already decided whether this pool
    /// should be in the race at all (see `Grid::should_attempt_h3`).
    fn new_stream(&self, origin: &Origin, options: StreamOptions) -> NewStreamFuture;

    /// True once this pool has at least one established connection it
    /// could reuse without connecting again.
    fn has_active_connections(&self) -> bool;

    /// True once the pool has no open connections and no in-flight
    /// attempts; the grid uses this to decide whether it's safe to drop a
    /// pool from its slot entirely.
    fn is_idle(&self) -> bool;

    /// Register a callback the pool invokes every time it transitions
    /// from non-idle to idle. The grid uses this to know when a drained
    /// pool can finally be torn down.
    fn add_idle_callback(&self, callback: IdleCallback);

    /// Ask the pool to stop accepting new streams on its existing
    /// connections, per `behavior`.
    fn drain_connections(&self, behavior: DrainBehavior);
}
