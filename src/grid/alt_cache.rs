//! The per-origin alternative-protocol advertisement cache.
//!
//! This crate only consumes the cache's lookup API (§4.B of the design);
//! populating it, persisting it to disk, and parsing `Alt-Svc` response
//! headers into it are the caller's responsibility, same as Envoy's
//! `HttpServerPropertiesCache` is owned well above `ConnectivityGrid`.

use std::time::Duration;

use crate::grid::origin::Origin;

/// A single advertised alternative protocol entry, as you'd get back from
/// parsing one comma-separated member of an `Alt-Svc` header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlternateProtocol {
    /// The advertised ALPN token, e.g. `"h3"`, `"h3-29"`, `"h2"`.
    pub alpn: String,
    /// Empty unless the advertisement asks the client to switch hosts.
    pub hostname: String,
    pub port: u16,
}

/// Lookup surface the grid needs from the alt-protocol cache.
pub trait AltProtocolCache: Send + Sync {
    /// Alternatives advertised for `origin`, if any have been recorded.
    fn find_alternatives(&self, origin: &Origin) -> Option<Vec<AlternateProtocol>>;

    /// Smoothed round-trip-time estimate for `origin`. Zero means unknown.
    fn smoothed_rtt(&self, origin: &Origin) -> Duration;
}

/// ALPN tokens this crate's H3 pool adapter can actually speak.
///
/// Mirrors the upstream `quic::SpdyUtils::ExtractQuicVersionFromAltSvcEntry`
/// lookup: the real implementation maps each token to a specific QUIC wire
/// version, but the grid only needs the yes/no answer, so we keep this as a
/// flat allow-list instead of building out a version table the grid would
/// never branch on (see DESIGN.md's Open Question notes).
const SUPPORTED_ALPNS: &[&str] = &["h3", "h3-29", "h3-32"];

/// Whether an advertised ALPN token maps to a QUIC version this crate speaks.
pub(crate) fn is_alpn_supported(alpn: &str) -> bool {
    SUPPORTED_ALPNS.contains(&alpn)
}

/// A fixed-answer cache, useful for tests and for callers who just want to
/// hard-code "this origin supports H3" without wiring up the real thing.
#[derive(Clone, Debug, Default)]
pub struct StaticAltProtocolCache {
    entries: std::collections::HashMap<Origin, (Vec<AlternateProtocol>, Duration)>,
}

impl StaticAltProtocolCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        origin: Origin,
        alternatives: Vec<AlternateProtocol>,
        smoothed_rtt: Duration,
    ) {
        self.entries.insert(origin, (alternatives, smoothed_rtt));
    }
}

impl AltProtocolCache for StaticAltProtocolCache {
    fn find_alternatives(&self, origin: &Origin) -> Option<Vec<AlternateProtocol>> {
        self.entries.get(origin).map(|(alts, _)| alts.clone())
    }

    fn smoothed_rtt(&self, origin: &Origin) -> Duration {
        self.entries
            .get(origin)
            .map(|(_, rtt)| *rtt)
            .unwrap_or_default()
    }
}
