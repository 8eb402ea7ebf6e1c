use std::path::PathBuf;

use config::Config;
use serde::Deserialize;

mod logger;
pub use logger::LoggerConfig;

mod network;
pub use network::NetworkSection;

mod tls;
pub use tls::TlsConfig;

use hsync_engine::EngineConfig;

/// Top-level configuration tree for `hsyncd`, deserialized the way
/// `apps/node/src/config::NodeConfig` deserializes its own TOML tree.
#[derive(Deserialize)]
pub struct HsyncdConfig {
    #[serde(flatten)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub network: NetworkSection,

    #[serde(default)]
    pub tls: TlsConfig,

    /// Where the recent-servers file and certs directory live.
    pub config_dir: PathBuf,

    #[serde(default)]
    pub shutdown_timeout: Option<u64>,

    #[serde(default)]
    pub logger: LoggerConfig,
}

impl HsyncdConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn from_path(path: PathBuf) -> eyre::Result<Self> {
        let config = Config::builder()
            .add_source(config::File::from(path))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
