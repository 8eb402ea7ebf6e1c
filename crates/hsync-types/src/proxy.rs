//! Proxy descriptors: `mode:host:port[:user[:password]]` strings.
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Proxy protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    /// SOCKSv4.
    Socks4,
    /// SOCKSv5.
    Socks5,
    /// Plain HTTP CONNECT proxy.
    Http,
}

impl ProxyMode {
    /// Default port for this mode when none is supplied.
    pub fn default_port(self) -> u16 {
        match self {
            ProxyMode::Socks4 | ProxyMode::Socks5 => 1080,
            ProxyMode::Http => 8080,
        }
    }
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProxyMode::Socks4 => "socks4",
            ProxyMode::Socks5 => "socks5",
            ProxyMode::Http => "http",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ProxyMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "socks4" => Ok(ProxyMode::Socks4),
            "socks5" => Ok(ProxyMode::Socks5),
            "http" => Ok(ProxyMode::Http),
            other => Err(Error::UnknownMode(other.to_string())),
        }
    }
}

/// A proxy descriptor, or its absence. Parsed from/serialized to
/// `mode:host:port[:user[:password]]`, with the literal string `"none"` meaning no proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDescriptor {
    /// Proxy protocol.
    pub mode: ProxyMode,
    /// Proxy host.
    pub host: String,
    /// Proxy port.
    pub port: u16,
    /// Optional credentials.
    pub credentials: Option<(String, Option<String>)>,
}

impl ProxyDescriptor {
    /// Parse a descriptor string, returning `None` for the `"none"` sentinel.
    pub fn parse(s: &str) -> Result<Option<Self>, Error> {
        if s == "none" {
            return Ok(None);
        }

        let mut parts = s.split(':');
        let mode: ProxyMode = parts
            .next()
            .ok_or_else(|| Error::Malformed(s.to_string()))?
            .parse()?;
        let host = parts
            .next()
            .ok_or_else(|| Error::Malformed(s.to_string()))?
            .to_string();
        if host.is_empty() {
            return Err(Error::Malformed(s.to_string()));
        }

        let port = match parts.next() {
            Some(p) if !p.is_empty() => p
                .parse()
                .map_err(|_| Error::InvalidPort(p.to_string()))?,
            _ => mode.default_port(),
        };

        let user = parts.next().map(str::to_string);
        let password = parts.next().map(str::to_string);
        let credentials = user.map(|u| (u, password));

        Ok(Some(Self {
            mode,
            host,
            port,
            credentials,
        }))
    }

    /// Serialize back into `mode:host:port[:user[:password]]`.
    pub fn serialize(this: Option<&Self>) -> String {
        match this {
            None => "none".to_string(),
            Some(p) => {
                let mut s = format!("{}:{}:{}", p.mode, p.host, p.port);
                if let Some((user, password)) = &p.credentials {
                    s.push(':');
                    s.push_str(user);
                    if let Some(password) = password {
                        s.push(':');
                        s.push_str(password);
                    }
                }
                s
            }
        }
    }
}

/// Errors parsing a proxy descriptor string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The string was missing required `mode:host` segments.
    #[error("malformed proxy descriptor: {0}")]
    Malformed(String),
    /// The port segment didn't parse as an integer.
    #[error("invalid port in proxy descriptor: {0}")]
    InvalidPort(String),
    /// The mode segment wasn't one of `socks4`, `socks5`, `http`.
    #[error("unknown proxy mode: {0}")]
    UnknownMode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_sentinel_roundtrips() {
        assert_eq!(ProxyDescriptor::parse("none").unwrap(), None);
        assert_eq!(ProxyDescriptor::serialize(None), "none");
    }

    #[test]
    fn default_port_applied_when_omitted() {
        let p = ProxyDescriptor::parse("socks5:127.0.0.1:").unwrap().unwrap();
        assert_eq!(p.port, 1080);
    }

    #[test]
    fn roundtrip_with_credentials() {
        let s = "socks5:127.0.0.1:9050:alice:hunter2";
        let p = ProxyDescriptor::parse(s).unwrap().unwrap();
        assert_eq!(p.credentials, Some(("alice".into(), Some("hunter2".into()))));
        assert_eq!(ProxyDescriptor::serialize(Some(&p)), s);
    }

    #[test]
    fn roundtrip_without_credentials() {
        let s = "http:proxy.local:8080";
        let p = ProxyDescriptor::parse(s).unwrap().unwrap();
        assert_eq!(p.credentials, None);
        assert_eq!(ProxyDescriptor::serialize(Some(&p)), s);
    }

    #[test]
    fn user_without_password() {
        let s = "socks4:proxy.local:1080:alice";
        let p = ProxyDescriptor::parse(s).unwrap().unwrap();
        assert_eq!(p.credentials, Some(("alice".into(), None)));
        assert_eq!(ProxyDescriptor::serialize(Some(&p)), s);
    }
}
