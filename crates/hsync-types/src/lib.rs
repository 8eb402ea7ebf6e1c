//! Shared types for the header-sync engine: peer/proxy descriptors, the JSON wire
//! protocol, and network-wide constants (checkpoints, protocol version, default peers).
#![warn(missing_docs)]

pub mod network;
pub mod peer;
pub mod protocol;
pub mod proxy;

pub use network::{Height, NetworkConstants};
pub use peer::PeerDescriptor;
pub use protocol::{Notification, Request, Response};
pub use proxy::ProxyDescriptor;
