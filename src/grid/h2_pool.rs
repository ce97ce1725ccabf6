//! The H2 pool adapter: dials a single origin over TLS and keeps one
//! multiplexed connection alive, handing out cloned `SendRequest` handles.
//!
//! Grounded in the way `connector.rs` builds `hyper_util`'s legacy
//! connect stack; the actual handshake here is done with
//! `hyper::client::conn::http2` directly rather than through
//! `hyper_util::client::legacy::Client`, since the grid needs a bare
//! connection handle to hand back as a `StreamReady`, not something that
//! already knows how to route whole requests.

use std::sync::{Arc, Mutex};

use http::Uri;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::sync::watch;
use tower_service::Service;

use crate::error;
use crate::grid::origin::Origin;
use crate::grid::pool::{
    DrainBehavior, IdleCallback, NewStreamFuture, PoolFailure, PoolHandle, Protocol, StreamOptions,
    StreamReady,
};

#[cfg(feature = "rustls-tls")]
type Connector = hyper_rustls::HttpsConnector<HttpConnector>;
#[cfg(not(feature = "rustls-tls"))]
type Connector = HttpConnector;

/// An established (or establishing) H2 connection, handed out as an
/// `Any`-boxed `StreamReady::encoder`.
pub type H2Encoder = hyper::client::conn::http2::SendRequest<http_body_util::Full<bytes::Bytes>>;

enum Connecting {
    InFlight(watch::Receiver<Option<Result<H2Encoder, String>>>),
    Connected(H2Encoder),
}

struct Inner {
    connector: Connector,
    state: Mutex<Option<Connecting>>,
    idle_callbacks: Mutex<Vec<IdleCallback>>,
}

/// A `PoolHandle` that keeps a single H2 connection to one origin alive.
pub struct H2Pool {
    inner: Arc<Inner>,
}

impl H2Pool {
    /// Builds a pool dialing plain TCP (when the `rustls-tls` feature is
    /// disabled) or TLS via `hyper-rustls`'s default webpki roots.
    pub fn new() -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);

        #[cfg(feature = "rustls-tls")]
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http2()
            .wrap_connector(http);
        #[cfg(not(feature = "rustls-tls"))]
        let connector = http;

        H2Pool {
            inner: Arc::new(Inner {
                connector,
                state: Mutex::new(None),
                idle_callbacks: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl Default for H2Pool {
    fn default() -> Self {
        Self::new()
    }
}

async fn dial(mut connector: Connector, uri: Uri) -> Result<H2Encoder, String> {
    let io = connector
        .call(uri)
        .await
        .map_err(|e| format!("h2 connect failed: {e}"))?;
    let (send_request, connection) = hyper::client::conn::http2::handshake(TokioExecutor::new(), io)
        .await
        .map_err(|e| format!("h2 handshake failed: {e}"))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            log::debug!("h2 connection driver ended: {e}");
        }
    });
    Ok(send_request)
}

impl PoolHandle for H2Pool {
    fn protocol(&self) -> Protocol {
        Protocol::Http2
    }

    fn new_stream(&self, origin: &Origin, _options: StreamOptions) -> NewStreamFuture {
        let inner = self.inner.clone();
        let uri: Uri = origin.to_string().parse().unwrap_or_else(|_| Uri::from_static("/"));

        Box::pin(async move {
            // Fast path: an already-connected, still-healthy handle.
            {
                let mut guard = inner.state.lock().unwrap();
                if let Some(Connecting::Connected(send_request)) = guard.as_mut() {
                    if send_request.is_ready() {
                        return Ok(StreamReady {
                            protocol: Protocol::Http2,
                            encoder: Box::new(send_request.clone()),
                        });
                    }
                    *guard = None;
                }
            }

            // Single-flight: join an in-progress dial instead of starting
            // a second one for the same origin.
            let mut watch_rx = {
                let mut guard = inner.state.lock().unwrap();
                match guard.as_ref() {
                    Some(Connecting::InFlight(rx)) => Some(rx.clone()),
                    _ => {
                        let (tx, rx) = watch::channel(None);
                        *guard = Some(Connecting::InFlight(rx.clone()));
                        drop(guard);

                        let connector = inner.connector.clone();
                        let dial_uri = uri.clone();
                        let inner_for_result = inner.clone();
                        tokio::spawn(async move {
                            let result = dial(connector, dial_uri).await;
                            let mut guard = inner_for_result.state.lock().unwrap();
                            if let Ok(send_request) = &result {
                                *guard = Some(Connecting::Connected(send_request.clone()));
                            } else {
                                *guard = None;
                            }
                            drop(guard);
                            let _ = tx.send(Some(result));
                        });
                        None
                    }
                }
            };

            if let Some(rx) = watch_rx.as_mut() {
                loop {
                    if let Some(result) = rx.borrow().clone() {
                        return result
                            .map(|send_request| StreamReady {
                                protocol: Protocol::Http2,
                                encoder: Box::new(send_request),
                            })
                            .map_err(|reason| PoolFailure {
                                reason: error::request(reason),
                                connection_used: false,
                            });
                    }
                    if rx.changed().await.is_err() {
                        return Err(PoolFailure {
                            reason: error::teardown(),
                            connection_used: false,
                        });
                    }
                }
            }

            let guard = inner.state.lock().unwrap();
            match guard.as_ref() {
                Some(Connecting::Connected(send_request)) => Ok(StreamReady {
                    protocol: Protocol::Http2,
                    encoder: Box::new(send_request.clone()),
                }),
                _ => Err(PoolFailure {
                    reason: error::request("h2 connection dropped before use"),
                    connection_used: false,
                }),
            }
        })
    }

    fn has_active_connections(&self) -> bool {
        matches!(
            self.inner.state.lock().unwrap().as_ref(),
            Some(Connecting::Connected(_))
        )
    }

    fn is_idle(&self) -> bool {
        !self.has_active_connections()
    }

    fn add_idle_callback(&self, callback: IdleCallback) {
        self.inner.idle_callbacks.lock().unwrap().push(callback);
    }

    fn drain_connections(&self, behavior: DrainBehavior) {
        if behavior == DrainBehavior::DrainAndDelete {
            let mut guard = self.inner.state.lock().unwrap();
            *guard = None;
            drop(guard);
            for callback in self.inner.idle_callbacks.lock().unwrap().iter() {
                callback();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_pool_has_no_active_connections() {
        let pool = H2Pool::new();
        assert!(!pool.has_active_connections());
        assert!(pool.is_idle());
    }
}
