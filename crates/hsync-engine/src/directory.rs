//! Server directory (distilled spec §4.A): parses the peer list pushed by
//! `server.peers.subscribe`, filters by declared protocol version, and picks random
//! candidates for the supervisor to dial.
use std::collections::HashMap;

use hsync_types::network::NetworkConstants;
use hsync_types::peer::{PeerDescriptor, Protocol};

/// Everything a directory entry declares about itself, beyond host/port.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerFeatures {
    /// Port advertised for TLS, if any.
    pub tls_port: Option<u16>,
    /// Port advertised for plaintext, if any.
    pub plain_port: Option<u16>,
    /// Declared protocol version, if any.
    pub version: Option<String>,
    /// Declared pruning level (`"0"` when unspecified, per distilled spec §4.A).
    pub pruning: String,
}

/// Directory of known servers, keyed by host.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    hosts: HashMap<String, ServerFeatures>,
}

impl Directory {
    /// An empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `server.peers.subscribe` result: each entry is
    /// `(ignored, host, features[])` where a feature matching `[st]\d*` sets the
    /// corresponding protocol's port (empty digits = default for that protocol),
    /// `v...` sets the version, and `p...` sets the pruning level. Hosts with no
    /// protocol-port feature at all are dropped (distilled spec §4.A).
    pub fn parse_servers(entries: &[(String, String, Vec<String>)]) -> Directory {
        let mut hosts = HashMap::new();

        for (_ignored, host, features) in entries {
            let mut entry = ServerFeatures {
                pruning: "0".to_string(),
                ..Default::default()
            };
            let mut saw_port = false;

            for feature in features {
                let mut chars = feature.chars();
                match chars.next() {
                    Some('s') => {
                        saw_port = true;
                        let digits = chars.as_str();
                        entry.tls_port = Some(if digits.is_empty() {
                            50002
                        } else {
                            digits.parse().unwrap_or(50002)
                        });
                    }
                    Some('t') => {
                        saw_port = true;
                        let digits = chars.as_str();
                        entry.plain_port = Some(if digits.is_empty() {
                            50001
                        } else {
                            digits.parse().unwrap_or(50001)
                        });
                    }
                    Some('v') => entry.version = Some(chars.as_str().to_string()),
                    Some('p') => {
                        let digits = chars.as_str();
                        entry.pruning = if digits.is_empty() {
                            "0".to_string()
                        } else {
                            digits.to_string()
                        };
                    }
                    _ => {}
                }
            }

            if saw_port {
                hosts.insert(host.clone(), entry);
            }
        }

        Directory { hosts }
    }

    /// Number of known hosts.
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Whether no hosts are known.
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Look up a host's declared features.
    pub fn features(&self, host: &str) -> Option<&ServerFeatures> {
        self.hosts.get(host)
    }

    /// Retain only hosts whose declared version compares numerically `>= min_version`
    /// component-wise (e.g. `"1.10" >= "1.9"`), matching the original's
    /// `util.normalize_version` tuple compare. A host with no declared version, or one
    /// that fails to parse as dot-separated integers, is dropped: the original's
    /// `is_recent` wraps the whole comparison in `try/except: return False`, so
    /// missing or malformed version data never counts as compatible.
    pub fn filter_version(&self, min_version: &str) -> Directory {
        let hosts = self
            .hosts
            .iter()
            .filter(|(_, features)| {
                features
                    .version
                    .as_deref()
                    .and_then(|v| compare_versions(v, min_version))
                    .unwrap_or(false)
            })
            .map(|(host, features)| (host.clone(), features.clone()))
            .collect();

        Directory { hosts }
    }

    /// Descriptors for every host with a port for `protocol`, excluding `exclude`.
    fn eligible(&self, protocol: Protocol, exclude: &[PeerDescriptor]) -> Vec<PeerDescriptor> {
        self.hosts
            .iter()
            .filter_map(|(host, features)| {
                let port = match protocol {
                    Protocol::Tls => features.tls_port,
                    Protocol::Plain => features.plain_port,
                }?;
                Some(PeerDescriptor::new(host.clone(), port, protocol))
            })
            .filter(|d| !exclude.contains(d))
            .collect()
    }

    /// Pick a uniformly random eligible descriptor for `protocol`, or `None` if none
    /// qualify (distilled spec §4.A).
    pub fn pick_random_server(
        &self,
        protocol: Protocol,
        exclude: &[PeerDescriptor],
    ) -> Option<PeerDescriptor> {
        let candidates = self.eligible(protocol, exclude);
        if candidates.is_empty() {
            return None;
        }
        let idx = fastrand::usize(..candidates.len());
        candidates.into_iter().nth(idx)
    }

    /// Seed servers from the network constants, returned as a fresh owned clone
    /// (SPEC_FULL.md §11: never share the built-in seed table mutably).
    pub fn default_servers(constants: &NetworkConstants) -> Vec<PeerDescriptor> {
        constants.default_servers.clone()
    }
}

/// Parses each dot-separated component as an integer and compares the two versions
/// component-wise; `None` if either side has a non-numeric component, mirroring
/// `normalize_version` raising on malformed input.
fn compare_versions(version: &str, min_version: &str) -> Option<bool> {
    let parse = |s: &str| -> Option<Vec<u64>> { s.split('.').map(|part| part.parse().ok()).collect() };
    let v = parse(version)?;
    let m = parse(min_version)?;
    Some(v >= m)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_drops_hosts_without_a_protocol_port() {
        let entries = vec![(
            "ignored".to_string(),
            "h.example".to_string(),
            vec!["v1.4".to_string()],
        )];
        let dir = Directory::parse_servers(&entries);
        assert!(dir.is_empty());
    }

    #[test]
    fn malformed_feature_list_parses_known_features_and_defaults_pruning() {
        let entries = vec![(
            "ignored".to_string(),
            "h.example".to_string(),
            vec![
                "s50002".to_string(),
                "v1.4".to_string(),
                "p".to_string(),
                "bogus".to_string(),
            ],
        )];
        let dir = Directory::parse_servers(&entries);
        let f = dir.features("h.example").unwrap();
        assert_eq!(f.tls_port, Some(50002));
        assert_eq!(f.version.as_deref(), Some("1.4"));
        assert_eq!(f.pruning, "0");
    }

    #[test]
    fn filter_version_drops_outdated_servers() {
        let entries = vec![(
            "i".to_string(),
            "old.example".to_string(),
            vec!["s50002".to_string(), "v1.0".to_string()],
        )];
        let dir = Directory::parse_servers(&entries);
        let filtered = dir.filter_version("1.4");
        assert!(filtered.is_empty());
    }

    #[test]
    fn filter_version_compares_numerically_not_lexicographically() {
        let entries = vec![(
            "i".to_string(),
            "new.example".to_string(),
            vec!["s50002".to_string(), "v1.10".to_string()],
        )];
        let dir = Directory::parse_servers(&entries);
        // "1.10" < "1.9" lexicographically but 1.10 >= 1.9 numerically.
        let filtered = dir.filter_version("1.9");
        assert!(filtered.features("new.example").is_some());
    }

    #[test]
    fn filter_version_drops_hosts_with_no_declared_version() {
        let entries = vec![(
            "i".to_string(),
            "versionless.example".to_string(),
            vec!["s50002".to_string()],
        )];
        let dir = Directory::parse_servers(&entries);
        let filtered = dir.filter_version("1.4");
        assert!(filtered.is_empty());
    }

    #[test]
    fn pick_random_server_excludes_given_descriptors() {
        let entries = vec![(
            "i".to_string(),
            "only.example".to_string(),
            vec!["s50002".to_string()],
        )];
        let dir = Directory::parse_servers(&entries);
        let only = PeerDescriptor::new("only.example", 50002, Protocol::Tls);
        assert_eq!(dir.pick_random_server(Protocol::Tls, &[only.clone()]), None);
        assert_eq!(dir.pick_random_server(Protocol::Tls, &[]), Some(only));
    }

    #[test]
    fn default_servers_returns_independent_clone() {
        let constants = NetworkConstants::default();
        let mut a = Directory::default_servers(&constants);
        a.push(PeerDescriptor::new("extra.example", 1, Protocol::Plain));
        let b = Directory::default_servers(&constants);
        assert_ne!(a.len(), b.len());
    }
}
