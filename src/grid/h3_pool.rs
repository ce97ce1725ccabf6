//! The H3 pool adapter: one QUIC endpoint per origin, single-flighted
//! through a `watch` channel exactly like `h3_client::pool::ConnectingLock`
//! does, so two requests racing a cold origin share one handshake instead
//! of opening two.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use h3_quinn::{Connection as QuinnConnection, OpenStreams};
use tokio::sync::watch;

use crate::error;
use crate::grid::grid::Grid;
use crate::grid::origin::Origin;
use crate::grid::pool::{
    DrainBehavior, IdleCallback, NewStreamFuture, PoolFailure, PoolHandle, Protocol, StreamOptions,
    StreamReady,
};

/// The handle callers get back for an established H3 connection.
pub type H3Encoder = h3::client::SendRequest<OpenStreams, Bytes>;

enum Connecting {
    InFlight(watch::Receiver<Option<Result<H3Encoder, String>>>),
    Connected(H3Encoder),
}

struct Inner {
    endpoint: quinn::Endpoint,
    state: Mutex<Option<Connecting>>,
    idle_callbacks: Mutex<Vec<IdleCallback>>,
    handshake_sink: Weak<Grid>,
}

/// A `PoolHandle` racing QUIC handshakes for a single origin.
///
/// 0-RTT is not attempted here even when `StreamOptions::can_send_early_data`
/// is set: quinn's 0-RTT API needs a per-connection resumption ticket this
/// crate has no cache for yet (see DESIGN.md's Open Question notes). The
/// option is threaded through so a future version can wire it up without
/// another trait change. Because 0-RTT is never attempted, this pool never
/// has a rejection to report and so never calls
/// `Grid::on_zero_rtt_handshake_failed`; that upcall fires once 0-RTT lands.
pub struct H3Pool {
    inner: Arc<Inner>,
}

impl H3Pool {
    /// `handshake_sink` is the grid this pool was built for, as handed to
    /// the factory passed to `GridBuilder::h3_pool`. A completed handshake
    /// reports back through it via `Grid::on_handshake_complete`.
    pub fn new(
        tls: rustls::ClientConfig,
        local_addr: Option<std::net::IpAddr>,
        handshake_sink: Weak<Grid>,
    ) -> std::io::Result<Self> {
        let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let client_config = quinn::ClientConfig::new(Arc::new(quic_tls));

        let bind_addr = match local_addr {
            Some(ip) => SocketAddr::new(ip, 0),
            None => "[::]:0".parse().unwrap(),
        };
        let mut endpoint = quinn::Endpoint::client(bind_addr)?;
        endpoint.set_default_client_config(client_config);

        Ok(H3Pool {
            inner: Arc::new(Inner {
                endpoint,
                state: Mutex::new(None),
                idle_callbacks: Mutex::new(Vec::new()),
                handshake_sink,
            }),
        })
    }
}

async fn resolve(origin: &Origin) -> Result<Vec<SocketAddr>, String> {
    let host_port = format!("{}:{}", origin.sni_host(), origin.port());
    tokio::net::lookup_host(host_port)
        .await
        .map(|addrs| addrs.collect())
        .map_err(|e| format!("h3 dns resolution failed: {e}"))
}

async fn dial(
    endpoint: quinn::Endpoint,
    origin: Origin,
    handshake_sink: Weak<Grid>,
) -> Result<H3Encoder, String> {
    let addrs = resolve(&origin).await?;
    let mut last_err = None;
    for addr in addrs {
        let connecting = match endpoint.connect(addr, origin.sni_host()) {
            Ok(connecting) => connecting,
            Err(e) => {
                last_err = Some(e.to_string());
                continue;
            }
        };
        match connecting.await {
            Ok(quinn_conn) => {
                let quinn_conn = QuinnConnection::new(quinn_conn);
                let (mut driver, send_request) = h3::client::new(quinn_conn)
                    .await
                    .map_err(|e| format!("h3 handshake failed: {e}"))?;
                if let Some(grid) = handshake_sink.upgrade() {
                    grid.on_handshake_complete();
                }
                tokio::spawn(async move {
                    let _ = std::future::poll_fn(|cx| driver.poll_close(cx)).await;
                });
                return Ok(send_request);
            }
            Err(e) => last_err = Some(e.to_string()),
        }
    }
    Err(last_err.unwrap_or_else(|| "no addresses resolved for h3 origin".to_string()))
}

impl PoolHandle for H3Pool {
    fn protocol(&self) -> Protocol {
        Protocol::Http3
    }

    fn new_stream(&self, origin: &Origin, _options: StreamOptions) -> NewStreamFuture {
        let inner = self.inner.clone();
        let origin = origin.clone();

        Box::pin(async move {
            {
                let guard = inner.state.lock().unwrap();
                if let Some(Connecting::Connected(send_request)) = guard.as_ref() {
                    return Ok(StreamReady {
                        protocol: Protocol::Http3,
                        encoder: Box::new(send_request.clone()),
                    });
                }
            }

            let mut watch_rx = {
                let mut guard = inner.state.lock().unwrap();
                match guard.as_ref() {
                    Some(Connecting::InFlight(rx)) => Some(rx.clone()),
                    _ => {
                        let (tx, rx) = watch::channel(None);
                        *guard = Some(Connecting::InFlight(rx.clone()));
                        drop(guard);

                        let endpoint = inner.endpoint.clone();
                        let dial_origin = origin.clone();
                        let handshake_sink = inner.handshake_sink.clone();
                        let inner_for_result = inner.clone();
                        tokio::spawn(async move {
                            let result = dial(endpoint, dial_origin, handshake_sink).await;
                            let mut guard = inner_for_result.state.lock().unwrap();
                            *guard = match &result {
                                Ok(send_request) => Some(Connecting::Connected(send_request.clone())),
                                Err(_) => None,
                            };
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
                                protocol: Protocol::Http3,
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
                    protocol: Protocol::Http3,
                    encoder: Box::new(send_request.clone()),
                }),
                _ => Err(PoolFailure {
                    reason: error::request("h3 connection dropped before use"),
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
