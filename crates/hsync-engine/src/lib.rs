//! The multi-peer header-synchronization engine: dial a pool of remote indexing
//! servers, keep one designated main peer's chain view authoritative, and expose it
//! through a small control API a CLI or UI shell drives.
//!
//! A single [`supervisor::Supervisor`] task owns every piece of mutable state -
//! [`directory::Directory`], [`hsync_chain::Registry`], [`router::Router`], and every
//! live [`session::Session`] - and is the only thing that ever mutates them. Per-peer
//! I/O runs on tasks it spawns, which only ever talk back over a channel.
#![warn(missing_docs)]

pub mod config;
pub mod control;
pub mod directory;
pub mod events;
pub mod persist;
pub mod router;
pub mod session;
pub mod supervisor;
pub mod sync;
pub mod transport;
pub mod wire;

pub use config::EngineConfig;
pub use control::{Command, Control, ControlError, EngineHandle};
pub use events::{EventBus, Topic};
pub use supervisor::Supervisor;
