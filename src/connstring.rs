use Result;
use Error::ArgumentError;

use std::fmt;

pub const DEFAULT_PORT: u16 = 27017;

/// Encapsulates the hostname and port of a server. The pair is the identity
/// of a server within a topology.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Host {
    pub host_name: String,
    pub port: u16,
}

impl Host {
    /// Creates a new Host with the given hostname and port.
    pub fn new(host_name: &str, port: u16) -> Host {
        Host {
            host_name: host_name.to_owned(),
            port: port,
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}:{}", self.host_name, self.port)
    }
}

/// Parses a `host` or `host:port` string, as found in seed lists and in the
/// `hosts`, `passives`, `arbiters`, `me` and `primary` fields of a handshake
/// reply.
pub fn parse_host(address: &str) -> Result<Host> {
    if address.is_empty() {
        return Err(ArgumentError("Host address must not be empty.".to_owned()));
    }

    match address.find(':') {
        Some(idx) => {
            let host_name = &address[..idx];
            let port = address[idx + 1..].parse::<u16>().map_err(|_| {
                ArgumentError(format!("Invalid port in host address '{}'.", address))
            })?;
            Ok(Host::new(host_name, port))
        }
        None => Ok(Host::new(address, DEFAULT_PORT)),
    }
}
