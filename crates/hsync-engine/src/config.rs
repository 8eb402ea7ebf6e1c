//! Engine configuration: the knobs `set_parameters`/`Control` expose, deserialized the
//! way the teacher's `NodeConfig` tree is (`config` crate, TOML source, per-field
//! `#[serde(default = "...")]`).
use serde::{Deserialize, Serialize};

use hsync_types::network::Height;
use hsync_types::peer::PeerDescriptor;
use hsync_types::proxy::ProxyDescriptor;

/// Engine-wide configuration (distilled spec §6 "Config keys").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// The user's chosen default/main server, if any.
    #[serde(default)]
    pub server: Option<PeerDescriptor>,
    /// Proxy to dial through, serialized/parsed via [`hsync_types::proxy`].
    #[serde(default, with = "proxy_serde")]
    pub proxy: Option<ProxyDescriptor>,
    /// Whether the supervisor is allowed to auto-pick a main peer and switch on lag.
    #[serde(default = "default_auto_connect")]
    pub auto_connect: bool,
    /// One-server mode: target peer count drops to 0, only `server` is ever dialed.
    #[serde(default)]
    pub oneserver: bool,
    /// Persisted "current" branch checkpoint (SPEC_FULL.md §11, `Registry::current`).
    #[serde(default)]
    pub blockchain_index: Height,
}

fn default_auto_connect() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server: None,
            proxy: None,
            auto_connect: default_auto_connect(),
            oneserver: false,
            blockchain_index: 0,
        }
    }
}

impl EngineConfig {
    /// Target number of simultaneously connected peers given this config
    /// (distilled spec §4.C: 10, or 0 in one-server mode).
    pub fn target_peer_count(&self) -> usize {
        if self.oneserver {
            0
        } else {
            hsync_types::network::TARGET_PEER_COUNT
        }
    }
}

mod proxy_serde {
    use hsync_types::proxy::ProxyDescriptor;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<ProxyDescriptor>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ProxyDescriptor::serialize(value.as_ref()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<ProxyDescriptor>, D::Error> {
        let s = String::deserialize(deserializer)?;
        ProxyDescriptor::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_peer_count_zero_in_oneserver_mode() {
        let cfg = EngineConfig {
            oneserver: true,
            ..Default::default()
        };
        assert_eq!(cfg.target_peer_count(), 0);
    }

    #[test]
    fn target_peer_count_defaults_to_ten() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.target_peer_count(), hsync_types::network::TARGET_PEER_COUNT);
    }

    #[test]
    fn proxy_roundtrips_through_serde() {
        let cfg = EngineConfig {
            proxy: ProxyDescriptor::parse("socks5:127.0.0.1:9050").unwrap(),
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.proxy, cfg.proxy);
    }
}
