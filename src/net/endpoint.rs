use crate::{PumpError, Result};
use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// An address-family + IP + port triple
///
/// Orderable so endpoint sets can be deduplicated and reported stably:
/// IPv4 sorts before IPv6, then by address, then by port. Equality,
/// ordering, and hashing all see exactly that triple.
#[derive(Debug, Clone, Copy)]
pub struct Endpoint(SocketAddr);

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.ip() == other.ip() && self.port() == other.port()
    }
}

impl Eq for Endpoint {}

impl std::hash::Hash for Endpoint {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ip().hash(state);
        self.port().hash(state);
    }
}

impl Endpoint {
    pub fn addr(&self) -> SocketAddr {
        self.0
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn is_ipv6(&self) -> bool {
        self.0.is_ipv6()
    }

    /// The same endpoint with another port; used to apply the
    /// configured well-known port to addresses parsed with port 0.
    pub fn with_port(&self, port: u16) -> Self {
        let mut addr = self.0;
        addr.set_port(port);
        Self(addr)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint(addr)
    }
}

impl FromStr for Endpoint {
    type Err = PumpError;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<SocketAddr>()
            .map(Endpoint)
            .map_err(|e| PumpError::Config(format!("invalid endpoint '{s}': {e}")))
    }
}

impl Ord for Endpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.is_ipv6(), self.ip(), self.port()).cmp(&(
            other.is_ipv6(),
            other.ip(),
            other.port(),
        ))
    }
}

impl PartialOrd for Endpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Resolves a `host:port` string to the set of endpoints it names.
///
/// A numeric address yields exactly one endpoint; a name may yield
/// several across families. The result is sorted and deduplicated.
pub async fn resolve(host_port: &str) -> Result<Vec<Endpoint>> {
    let mut endpoints: Vec<Endpoint> = tokio::net::lookup_host(host_port)
        .await
        .map_err(|e| PumpError::Config(format!("cannot resolve '{host_port}': {e}")))?
        .map(Endpoint)
        .collect();
    if endpoints.is_empty() {
        return Err(PumpError::Config(format!(
            "'{host_port}' resolved to no addresses"
        )));
    }
    endpoints.sort();
    endpoints.dedup();
    Ok(endpoints)
}
