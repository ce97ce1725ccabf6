use std::fmt;

/// Identity key into the alt-protocol cache and the H3 liveness tracker.
///
/// The scheme is fixed to `"https"` for every grid constructed by this
/// crate. The upstream `conn_pool_grid.cc` leaves a `TODO` wondering how a
/// non-https scheme would ever get plumbed in; we preserve that as a
/// construction-time constant rather than a field, since nothing in this
/// crate ever produces an `Origin` with another scheme.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Origin {
    sni_host: String,
    port: u16,
}

impl Origin {
    pub fn new(sni_host: impl Into<String>, port: u16) -> Self {
        Origin {
            sni_host: sni_host.into(),
            port,
        }
    }

    pub fn scheme(&self) -> &'static str {
        "https"
    }

    pub fn sni_host(&self) -> &str {
        &self.sni_host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "https://{}:{}", self.sni_host, self.port)
    }
}
