//! Addresses for control ports, listeners, and onion service targets.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_with::{DeserializeFromStr, SerializeDisplay};

/// A socket address that the proxy can listen on or connect to.
///
/// This is also the type of the entries in a [`Policy`](crate::Policy)'s
/// deny list, and of the resolved target of an `ADD_ONION` port mapping.
///
/// The string form is `unix:/some/path` for an AF_UNIX socket, and either
/// `tcp:ADDR:PORT` or a bare `ADDR:PORT` for TCP.  `localhost:PORT` is
/// accepted as a spelling of `127.0.0.1:PORT`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, DeserializeFromStr, SerializeDisplay)]
#[non_exhaustive]
pub enum Endpoint {
    /// A TCP socket address.
    Tcp(SocketAddr),
    /// An AF_UNIX socket at a filesystem path.
    Unix(PathBuf),
}

/// An error from parsing an [`Endpoint`].
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EndpointParseError {
    /// A `unix:` address had no path.
    #[error("Empty path in unix socket address")]
    EmptyPath,
    /// A TCP address could not be parsed.
    #[error("Could not parse {0:?} as a socket address")]
    InvalidAddr(String),
    /// We didn't recognize the kind of address at all.
    #[error("Unrecognized address {0:?}: expected unix:PATH or ADDR:PORT")]
    UnrecognizedType(String),
}

impl Endpoint {
    /// Return true if this is an AF_UNIX address.
    pub fn is_unix(&self) -> bool {
        matches!(self, Endpoint::Unix(_))
    }

    /// Return true if `target`, used as an onion service target, would reach
    /// whatever is listening at `self`.
    ///
    /// This is the comparison used for deny lists, so it errs on the side of
    /// reporting a match:
    ///
    ///  * Unix paths match if they have the same components, or if they
    ///    resolve to the same file.
    ///  * TCP addresses need the same port.  Every loopback address is
    ///    treated as equivalent to every other, and an unspecified target
    ///    address (`0.0.0.0`, `::`) counts as loopback, since that's where a
    ///    connection to it ends up.  An unspecified address in `self` covers
    ///    every address on its port.
    pub fn covers(&self, target: &Endpoint) -> bool {
        match (self, target) {
            (Endpoint::Unix(ours), Endpoint::Unix(theirs)) => same_socket_path(ours, theirs),
            (Endpoint::Tcp(ours), Endpoint::Tcp(theirs)) => {
                ours.port() == theirs.port() && ip_covers(ours.ip(), theirs.ip())
            }
            (_, _) => false,
        }
    }
}

/// Return true if a listener bound on `ours` would receive connections made
/// to `theirs` (ignoring the port).
fn ip_covers(ours: IpAddr, theirs: IpAddr) -> bool {
    let ours = ours.to_canonical();
    let theirs = theirs.to_canonical();
    /// Return true if connecting to `ip` reaches this host's loopback interface.
    fn reaches_loopback(ip: IpAddr) -> bool {
        ip.is_loopback() || ip.is_unspecified()
    }

    ours.is_unspecified() || ours == theirs || (ours.is_loopback() && reaches_loopback(theirs))
}

/// Return true if `a` and `b` name the same socket.
///
/// Only paths that are spelled differently reach the filesystem; that costs
/// a `stat` walk per path, which we accept on the filter's synchronous path.
fn same_socket_path(a: &Path, b: &Path) -> bool {
    if a.components().eq(b.components()) {
        return true;
    }
    // Symlinks and `..` can make different spellings reach the same socket.
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        (_, _) => false,
    }
}

/// Parse a TCP socket address, accepting `localhost` as a hostname.
pub(crate) fn parse_tcp_addr(s: &str) -> Result<SocketAddr, EndpointParseError> {
    if let Some(port) = s.strip_prefix("localhost:") {
        let port = port
            .parse()
            .map_err(|_| EndpointParseError::InvalidAddr(s.to_owned()))?;
        return Ok(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port));
    }
    s.parse()
        .map_err(|_| EndpointParseError::InvalidAddr(s.to_owned()))
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        /// Return true if 's' looks like an attempted IPv4 or IPv6 socketaddr.
        fn looks_like_attempted_addr(s: &str) -> bool {
            s.starts_with(|c: char| c.is_ascii_digit())
                || s.starts_with("localhost:")
                || s.strip_prefix('[')
                    .map(|rhs| rhs.starts_with(|c: char| c.is_ascii_hexdigit() || c == ':'))
                    .unwrap_or(false)
        }

        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(EndpointParseError::EmptyPath);
            }
            Ok(Endpoint::Unix(PathBuf::from(path)))
        } else if let Some(addr) = s.strip_prefix("tcp:") {
            Ok(Endpoint::Tcp(parse_tcp_addr(addr)?))
        } else if looks_like_attempted_addr(s) {
            Ok(Endpoint::Tcp(parse_tcp_addr(s)?))
        } else {
            Err(EndpointParseError::UnrecognizedType(s.to_owned()))
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp:{}", addr),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::Tcp(addr)
    }
}
