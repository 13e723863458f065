//! Parsing the `Port=` mappings of an `ADD_ONION` command.
//!
//! Each `Port=VIRTPORT[,TARGET]` argument asks Tor to forward connections on
//! the onion service's `VIRTPORT` to `TARGET`.  The target may be a port
//! number (meaning that port on 127.0.0.1), an `ADDR:PORT` pair, or a
//! `unix:PATH`; if it is missing, it defaults to `VIRTPORT` on 127.0.0.1.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use crate::command::{MalformedCommand, split_args, unquote};
use crate::endpoint::{Endpoint, parse_tcp_addr};

/// One port mapping from an `ADD_ONION` command.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct PortMapping {
    /// The port that the onion service advertises.
    virt_port: u16,
    /// Where Tor would send connections to that port.
    target: Endpoint,
}

/// An error from parsing a [`PortMapping`].
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PortMapError {
    /// The command had no `Port=` argument at all.
    #[error("No Port= argument")]
    NoPorts,
    /// A port number was missing, non-numeric, or out of range.
    #[error("Invalid port {0:?}")]
    InvalidPort(String),
    /// A mapping had more than two comma-separated fields.
    #[error("Too many fields in port mapping {0:?}")]
    TooManyFields(String),
    /// The target was not a port, an address, or a unix path.
    #[error("Unsupported port mapping target {0:?}")]
    InvalidTarget(String),
}

impl PortMapping {
    /// Return the advertised (virtual) port.
    pub fn virt_port(&self) -> u16 {
        self.virt_port
    }

    /// Return the target that Tor would forward connections to.
    pub fn target(&self) -> &Endpoint {
        &self.target
    }
}

/// Parse a port number in the range 1..=65535.
fn parse_port(s: &str) -> Result<u16, PortMapError> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PortMapError::InvalidPort(s.to_owned()));
    }
    match s.parse::<u16>() {
        Ok(0) | Err(_) => Err(PortMapError::InvalidPort(s.to_owned())),
        Ok(port) => Ok(port),
    }
}

/// Return the loopback TCP endpoint for `port`.
fn loopback(port: u16) -> Endpoint {
    Endpoint::Tcp(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port))
}

/// Parse the part of a mapping after the comma.
fn parse_target(s: &str) -> Result<Endpoint, MalformedCommand> {
    let invalid = || PortMapError::InvalidTarget(s.to_owned());
    if let Some(path) = s.strip_prefix("unix:") {
        let path = unquote(path)?;
        if path.is_empty() {
            return Err(invalid().into());
        }
        return Ok(Endpoint::Unix(PathBuf::from(path)));
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(loopback(parse_port(s)?));
    }
    // Tor would resolve a hostname here; we can't know what it would get,
    // so anything but an address (or "localhost") is refused.
    let addr = parse_tcp_addr(s).map_err(|_| invalid())?;
    if addr.port() == 0 {
        return Err(PortMapError::InvalidPort("0".into()).into());
    }
    Ok(Endpoint::Tcp(addr))
}

impl FromStr for PortMapping {
    type Err = MalformedCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.splitn(3, ',');
        let virt = fields.next().unwrap_or("");
        let target = fields.next();
        if fields.next().is_some() {
            return Err(PortMapError::TooManyFields(s.to_owned()).into());
        }

        let virt_port = parse_port(virt)?;
        let target = match target {
            None => loopback(virt_port),
            Some(t) => parse_target(t)?,
        };
        Ok(PortMapping { virt_port, target })
    }
}

/// Parse every `Port=` mapping in the arguments of an `ADD_ONION` command.
///
/// Fails if any mapping is malformed, or if there are none.
pub fn parse_add_onion_ports(args: &str) -> Result<Vec<PortMapping>, MalformedCommand> {
    let mut mappings = Vec::new();
    for token in split_args(args)? {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        if key.eq_ignore_ascii_case("Port") {
            mappings.push(unquote(value)?.parse()?);
        }
    }
    if mappings.is_empty() {
        return Err(PortMapError::NoPorts.into());
    }
    Ok(mappings)
}
