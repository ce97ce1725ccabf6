//! Implementation modules backing the public [`crate::Grid`] type.

mod alt_cache;
mod attempt;
mod builder;
#[allow(clippy::module_inception)]
mod grid;
mod h2_pool;
#[cfg(feature = "http3")]
mod h3_pool;
mod h3_tracker;
mod origin;
mod pool;
mod wrapper;

pub use alt_cache::{AlternateProtocol, AltProtocolCache, StaticAltProtocolCache};
pub use builder::{GridBuilder, DEFAULT_HAPPY_EYEBALLS_DELAY};
pub use grid::Grid;
pub use h2_pool::{H2Encoder, H2Pool};
#[cfg(feature = "http3")]
pub use h3_pool::{H3Encoder, H3Pool};
pub use h3_tracker::{H3StatusTracker, InMemoryH3StatusTracker};
pub use origin::Origin;
pub use pool::{
    CancelPolicy, DrainBehavior, IdleCallback, NewStreamFuture, NewStreamOptions, PoolFailure,
    PoolHandle, Protocol, StreamOptions, StreamReady,
};
pub use wrapper::{NewStreamOutcome, StreamHandle};
