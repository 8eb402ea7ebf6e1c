use serde::Deserialize;

use hsync_types::network::NetworkConstants;
use hsync_types::peer::PeerDescriptor;

/// Deployment-specific overrides for [`NetworkConstants`] (checkpoint count, declared
/// protocol version, seed server list), kept separate from `EngineConfig` since these
/// are build/network-wide rather than per-run knobs.
#[derive(Deserialize)]
pub struct NetworkSection {
    #[serde(default)]
    pub checkpoints: usize,

    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    #[serde(default)]
    pub default_servers: Vec<String>,
}

fn default_protocol_version() -> String {
    "1.4".to_string()
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            checkpoints: 0,
            protocol_version: default_protocol_version(),
            default_servers: Vec::new(),
        }
    }
}

impl NetworkSection {
    /// Build the [`NetworkConstants`] this section describes, falling back to the
    /// built-in seed list when no servers were configured.
    pub fn to_constants(&self) -> eyre::Result<NetworkConstants> {
        let protocol_version: &'static str = Box::leak(self.protocol_version.clone().into_boxed_str());

        let default_servers = if self.default_servers.is_empty() {
            NetworkConstants::default().default_servers
        } else {
            self.default_servers
                .iter()
                .map(|s| s.parse::<PeerDescriptor>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| eyre::eyre!("invalid default server in config: {e}"))?
        };

        Ok(NetworkConstants {
            checkpoints: self.checkpoints,
            protocol_version,
            default_servers,
        })
    }
}
