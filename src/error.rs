use std::error::Error as StdError;
use std::fmt;

pub(crate) type BoxError = Box<dyn StdError + Send + Sync>;

/// The kinds of failure the grid ever hands back to a caller.
///
/// These mirror the pool failure reasons the underlying H3/H2 pools
/// produce; the grid itself never invents a new kind, it only decides
/// *when* to propagate one (see the crate's module-level docs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// The pool is at capacity and cannot start another stream.
    Overflow,
    /// The connection attempt failed locally (DNS, TLS, or handshake setup).
    LocalConnectionFailure,
    /// The remote endpoint reset or refused the connection.
    RemoteConnectionFailure,
    /// The attempt did not complete before the pool's own timeout elapsed.
    Timeout,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Kind::Overflow => "connection pool overflow",
            Kind::LocalConnectionFailure => "local connection failure",
            Kind::RemoteConnectionFailure => "remote connection failure",
            Kind::Timeout => "connection attempt timed out",
        })
    }
}

/// The error type returned by a failed stream attempt.
pub struct Error {
    kind: Kind,
    transport_reason: Option<String>,
    source: Option<BoxError>,
}

impl Error {
    pub fn new(kind: Kind, source: Option<BoxError>) -> Error {
        Error {
            kind,
            transport_reason: None,
            source,
        }
    }

    pub(crate) fn with_reason(kind: Kind, transport_reason: impl Into<String>) -> Error {
        Error {
            kind,
            transport_reason: Some(transport_reason.into()),
            source: None,
        }
    }

    /// The category of failure.
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Free-text detail from the transport, if the failing pool supplied one.
    pub fn transport_reason(&self) -> &str {
        self.transport_reason.as_deref().unwrap_or("")
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("conn_grid::Error");
        builder.field("kind", &self.kind);
        if let Some(reason) = &self.transport_reason {
            builder.field("transport_reason", reason);
        }
        if let Some(source) = &self.source {
            builder.field("source", source);
        }
        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.transport_reason().is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.transport_reason())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source.as_deref().map(|e| e as _)
    }
}

pub(crate) fn request(e: impl Into<BoxError>) -> Error {
    Error::new(Kind::LocalConnectionFailure, Some(e.into()))
}

pub(crate) fn teardown() -> Error {
    Error::with_reason(Kind::LocalConnectionFailure, "grid teardown")
}

pub(crate) fn cancelled() -> Error {
    Error::with_reason(Kind::LocalConnectionFailure, "cancelled")
}

pub(crate) fn overflow() -> Error {
    Error::with_reason(Kind::Overflow, "grid is draining")
}
