//! Peer descriptors: `host:port:protocol` strings identifying a remote indexing server.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Transport a peer descriptor asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    /// TLS-wrapped connection.
    Tls,
    /// Plaintext TCP connection.
    Plain,
}

impl Protocol {
    /// The single-character wire tag for this protocol (`s` or `t`).
    pub fn tag(self) -> char {
        match self {
            Protocol::Tls => 's',
            Protocol::Plain => 't',
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "s" => Ok(Protocol::Tls),
            "t" => Ok(Protocol::Plain),
            other => Err(Error::UnknownProtocol(other.to_string())),
        }
    }
}

/// A peer address, as exchanged in `server.peers.subscribe` results and in configuration:
/// `host:port:protocol`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerDescriptor {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Requested transport.
    pub protocol: Protocol,
}

impl PeerDescriptor {
    /// Construct a descriptor directly.
    pub fn new(host: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            host: host.into(),
            port,
            protocol,
        }
    }
}

impl fmt::Display for PeerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.protocol)
    }
}

impl FromStr for PeerDescriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let host = parts.next().ok_or_else(|| Error::Malformed(s.to_string()))?;
        let port = parts.next().ok_or_else(|| Error::Malformed(s.to_string()))?;
        let protocol = parts.next().ok_or_else(|| Error::Malformed(s.to_string()))?;

        if host.is_empty() {
            return Err(Error::Malformed(s.to_string()));
        }

        let port: u16 = port
            .parse()
            .map_err(|_| Error::InvalidPort(port.to_string()))?;
        let protocol: Protocol = protocol.parse()?;

        Ok(Self {
            host: host.to_string(),
            port,
            protocol,
        })
    }
}

impl Serialize for PeerDescriptor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerDescriptor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Errors parsing a peer descriptor string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The string didn't split into exactly `host:port:protocol`.
    #[error("malformed peer descriptor: {0}")]
    Malformed(String),
    /// The port segment didn't parse as an integer.
    #[error("invalid port in peer descriptor: {0}")]
    InvalidPort(String),
    /// The protocol tag wasn't `s` or `t`.
    #[error("unknown protocol tag: {0}")]
    UnknownProtocol(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_display_parse() {
        let d = PeerDescriptor::new("electrum.example", 50002, Protocol::Tls);
        let s = d.to_string();
        assert_eq!(s, "electrum.example:50002:s");
        assert_eq!(s.parse::<PeerDescriptor>().unwrap(), d);
    }

    #[test]
    fn rejects_bad_port() {
        assert!("host:notaport:s".parse::<PeerDescriptor>().is_err());
    }

    #[test]
    fn rejects_bad_protocol() {
        assert!("host:50001:x".parse::<PeerDescriptor>().is_err());
    }

    #[test]
    fn rejects_missing_fields() {
        assert!("host:50001".parse::<PeerDescriptor>().is_err());
        assert!("".parse::<PeerDescriptor>().is_err());
    }
}
