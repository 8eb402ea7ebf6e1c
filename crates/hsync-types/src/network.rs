//! Network-wide constants: checkpoints, protocol version, default peer seeds, and the
//! timing constants from distilled spec §6.
use std::time::Duration;

use crate::peer::{PeerDescriptor, Protocol};

/// A block height.
pub type Height = u64;

/// How long an outstanding single-shot request may go unanswered before the peer is
/// considered down (distilled spec §6).
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// How often the maintenance loop ticks.
pub const MAINTENANCE_TICK: Duration = Duration::from_secs(1);

/// Minimum time between clearing `disconnected_servers`.
pub const NODES_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Minimum time between retries of the configured default server when not auto-connecting.
pub const SERVER_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Maximum number of entries kept in the recent-servers file.
pub const RECENT_SERVERS_CAP: usize = 20;

/// Target number of simultaneous peer connections (0 in one-server mode).
pub const TARGET_PEER_COUNT: usize = 10;

/// A local height must lead a peer's tip by more than this many blocks to trigger a
/// lagging-interface switch.
pub const LAGGING_THRESHOLD: u64 = 1;

/// Above this many headers remaining, the synchronizer requests a chunk instead of
/// single headers.
pub const CHUNK_VS_HEADER_THRESHOLD: u64 = 50;

/// Number of headers per retargeting chunk.
pub const CHUNK_SIZE: u64 = 2016;

/// Raw header size on the wire/on disk.
pub const HEADER_SIZE_BYTES: u64 = 80;

/// Network-wide constants a deployment configures once: the list of checkpointed
/// block hashes (one every [`CHUNK_SIZE`] blocks, from genesis), the protocol version
/// this client declares, and the seed peers used when no peers are otherwise known.
#[derive(Debug, Clone)]
pub struct NetworkConstants {
    /// Number of checkpoints baked into this build. The checkpoint height is
    /// `checkpoints * CHUNK_SIZE - 1` for `checkpoints > 0`.
    pub checkpoints: usize,
    /// Protocol version string this client declares in `server.version`.
    pub protocol_version: &'static str,
    /// Seed peers, used when the directory has no other candidates.
    pub default_servers: Vec<PeerDescriptor>,
}

impl NetworkConstants {
    /// The height of the highest checkpoint, or 0 if there are none
    /// (`max(0, checkpoints * CHUNK_SIZE - 1)`, distilled spec §4.E).
    pub fn max_checkpoint(&self) -> Height {
        if self.checkpoints == 0 {
            0
        } else {
            self.checkpoints as u64 * CHUNK_SIZE - 1
        }
    }
}

impl Default for NetworkConstants {
    fn default() -> Self {
        Self {
            checkpoints: 0,
            protocol_version: "1.4",
            default_servers: vec![
                PeerDescriptor::new("seed1.example.org", 50002, Protocol::Tls),
                PeerDescriptor::new("seed2.example.org", 50002, Protocol::Tls),
                PeerDescriptor::new("seed3.example.org", 50001, Protocol::Plain),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_checkpoint_zero_when_no_checkpoints() {
        let nc = NetworkConstants {
            checkpoints: 0,
            ..Default::default()
        };
        assert_eq!(nc.max_checkpoint(), 0);
    }

    #[test]
    fn max_checkpoint_formula() {
        let nc = NetworkConstants {
            checkpoints: 5,
            ..Default::default()
        };
        assert_eq!(nc.max_checkpoint(), 5 * CHUNK_SIZE - 1);
    }
}
