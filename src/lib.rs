//! A happy-eyeballs-style connection pool for a single HTTP origin.
//!
//! A [`Grid`] races an HTTP/3 (QUIC) connection attempt against an HTTP/2
//! (TCP+TLS) attempt and resolves with whichever finishes first, the way a
//! browser races IPv6 against IPv4 during a cold connect. H3 is only put in
//! the race when an [`AltProtocolCache`] says the origin advertises it and
//! an [`H3StatusTracker`] hasn't already marked the origin broken; once
//! started, H2's start is delayed by [`DEFAULT_HAPPY_EYEBALLS_DELAY`] unless
//! H3 failed recently for this origin, in which case both start at once.
//!
//! ```no_run
//! use conn_grid::{Grid, GridBuilder, NewStreamOptions, Origin};
//! use std::sync::Arc;
//!
//! # #[cfg(feature = "http3")]
//! # fn build(tls: rustls::ClientConfig) -> Arc<Grid> {
//! let origin = Origin::new("example.com", 443);
//! GridBuilder::new(origin)
//!     .h2_pool(|_origin| Arc::new(conn_grid::H2Pool::new()))
//!     .h3_pool(move |_origin, grid| Arc::new(conn_grid::H3Pool::new(tls.clone(), None, grid).unwrap()))
//!     .build()
//! # }
//! ```

mod error;
mod grid;

pub use error::{Error, Kind};
pub use grid::{
    AlternateProtocol, AltProtocolCache, CancelPolicy, DrainBehavior, Grid, GridBuilder,
    H2Encoder, H2Pool, H3StatusTracker, IdleCallback, InMemoryH3StatusTracker, NewStreamFuture,
    NewStreamOptions, NewStreamOutcome, Origin, PoolFailure, PoolHandle, Protocol,
    StaticAltProtocolCache, StreamHandle, StreamOptions, StreamReady, DEFAULT_HAPPY_EYEBALLS_DELAY,
};
#[cfg(feature = "http3")]
pub use grid::{H3Encoder, H3Pool};
