//! A small typed publish/subscribe bus built on [`flume`] channels.
//!
//! Components register a channel per event type up front, then extract the subset of
//! senders/receivers they need. This keeps producers and consumers decoupled: a module
//! never needs to know who (if anyone) is listening.
mod event_bus;

pub use crate::event_bus::{BusEvent, Error, EventBus};
use std::any::TypeId;

mod macros;
mod receiver;

pub use crate::receiver::Receiver;

pub use event_bus_macros::Event;

/// Wraps retrieving [`std::any::TypeId`] for type T.
///
/// Use the [`typeid`] macro to build a `Vec` of these.
pub fn tid<T: 'static>() -> TypeId {
    TypeId::of::<T>()
}
