use crate::{tid, Receiver};

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt::{Debug, Display, Formatter},
};

use flume as channel;

pub type EventBusResult<T> = Result<T, Error>;

type InnerSender = channel::Sender<Box<dyn BusEvent>>;
type InnerReceiver = channel::Receiver<Box<dyn BusEvent>>;

/// Trait for events that can travel through the event bus. Implement it with the
/// [`event_bus_macros::Event`] derive macro rather than by hand.
///
/// Declares `as_any`, used to downcast the event back to its concrete type inside
/// [`EventBus::subscribe`].
pub trait BusEvent: Send {
    fn as_any(&self) -> &dyn Any;
}

/// Event bus providing named channels between otherwise-decoupled parts of the engine.
///
/// Use [`EventBus::extract`] to hand a component only the subset of channels it needs.
#[derive(Clone, Default, Debug)]
pub struct EventBus {
    txs: HashMap<TypeId, InnerSender>,
    rxs: HashMap<TypeId, InnerReceiver>,
}

impl EventBus {
    /// Register a channel for event type `E`. Unbounded unless `channel_size` is given.
    ///
    /// Returns `true` if a channel was already registered for this type.
    pub fn register<E: BusEvent + Clone + 'static>(&mut self, channel_size: Option<usize>) -> bool {
        if self.txs.contains_key(&tid::<E>()) {
            return true;
        }

        let (tx, rx) = match channel_size {
            Some(size) => channel::bounded::<Box<dyn BusEvent>>(size),
            None => channel::unbounded::<Box<dyn BusEvent>>(),
        };

        self.txs.insert(tid::<E>(), tx);
        self.rxs.insert(tid::<E>(), rx);

        false
    }

    /// Extract a subset of channels from this bus. Errors if a requested type was never
    /// registered.
    pub fn extract(&self, tx_ids: &[TypeId], rx_ids: &[TypeId]) -> EventBusResult<Self> {
        Ok(Self {
            txs: new_hashmap_with::<InnerSender>(&self.txs, tx_ids)?,
            rxs: new_hashmap_with::<InnerReceiver>(&self.rxs, rx_ids)?,
        })
    }

    /// Subscribe to the channel for event type `E`. Panics if it wasn't registered; use
    /// [`EventBus::try_subscribe`] to avoid that.
    pub fn subscribe<E: BusEvent + Clone + 'static>(&self) -> Receiver<E> {
        let rx = self
            .rxs
            .get(&tid::<E>())
            .expect("channel for event must be presented")
            .clone();

        Receiver::new(rx)
    }

    /// Fallible variant of [`EventBus::subscribe`].
    pub fn try_subscribe<E: BusEvent + Clone + 'static>(&self) -> EventBusResult<Receiver<E>> {
        let rx = self
            .rxs
            .get(&tid::<E>())
            .ok_or(Error::ChannelForTypeIdDoesntExist)?
            .clone();

        Ok(Receiver::new(rx))
    }

    /// Send an event. Panics if the channel wasn't registered; use
    /// [`EventBus::try_send`] to avoid that.
    pub async fn send<E: BusEvent + 'static>(&self, event: E) {
        let channel = self
            .txs
            .get(&tid::<E>())
            .expect("channel for event must be presented");

        channel
            .send_async(Box::new(event))
            .await
            .expect("async channel already closed");
    }

    /// Fallible variant of [`EventBus::send`].
    pub async fn try_send<E: BusEvent + 'static>(&self, event: E) -> EventBusResult<()> {
        let channel = self
            .txs
            .get(&tid::<E>())
            .ok_or(Error::ChannelForTypeIdDoesntExist)?;

        channel
            .send_async(Box::new(event))
            .await
            .map_err(Error::ChannelSend)?;

        Ok(())
    }
}

fn new_hashmap_with<Channel: Clone>(
    src: &HashMap<TypeId, Channel>,
    event_ids: &[TypeId],
) -> EventBusResult<HashMap<TypeId, Channel>> {
    let mut extracted_channels: HashMap<TypeId, Channel> = Default::default();

    for event_id in event_ids {
        extracted_channels.insert(
            *event_id,
            src.get(event_id)
                .ok_or(Error::ChannelForTypeIdDoesntExist)?
                .clone(),
        );
    }

    Ok(extracted_channels)
}

#[derive(Debug)]
pub enum Error {
    ChannelSend(channel::SendError<Box<dyn BusEvent>>),
    ChannelForTypeIdDoesntExist,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChannelSend(inner) => {
                write!(f, "failed to send message to channel: {inner}")
            }
            Self::ChannelForTypeIdDoesntExist => {
                write!(f, "channel for event id doesn't exist")
            }
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;
    use event_bus_macros::Event;

    #[derive(Clone, Event)]
    struct Ping(u32);

    #[tokio::test]
    async fn register_send_receive_roundtrip() {
        let mut bus = EventBus::default();
        bus.register::<Ping>(None);

        let scoped = bus
            .extract(&crate::typeid![Ping], &crate::typeid![Ping])
            .unwrap();

        scoped.send(Ping(7)).await;

        let rx = scoped.subscribe::<Ping>();
        let Ping(v) = rx.recv().await.unwrap();
        assert_eq!(v, 7);
    }

    #[tokio::test]
    async fn try_subscribe_unknown_type_errors() {
        let bus = EventBus::default();
        assert!(matches!(
            bus.try_subscribe::<Ping>(),
            Err(Error::ChannelForTypeIdDoesntExist)
        ));
    }
}
