//! Bridges the engine's internal named-topic [`hsync_engine::EventBus`] (component G)
//! onto the typed `event-bus` crate, the way `apps/node/src/cli/node.rs::init_event_bus`
//! registers one channel per message type up front and hands subsystems their own
//! subscriptions. A future RPC layer subscribes to these typed events instead of
//! reaching into the engine's callback table directly.
use event_bus::EventBus as TypedBus;
use event_bus_macros::Event;
use hsync_engine::events::{EventBus, Topic};
use serde_json::Value;

const CHANNEL_SIZE: usize = 256;

/// The main peer's connectivity/mode changed.
#[derive(Clone, Event)]
pub struct StatusChanged(pub Value);

/// The local chain height advanced.
#[derive(Clone, Event)]
pub struct Updated(pub Value);

/// A peer's banner text changed.
#[derive(Clone, Event)]
pub struct BannerChanged(pub Value);

/// A fee estimate refreshed.
#[derive(Clone, Event)]
pub struct FeeChanged(pub Value);

/// The server directory was rebuilt.
#[derive(Clone, Event)]
pub struct ServersChanged(pub Value);

/// The set of connected interfaces changed.
#[derive(Clone, Event)]
pub struct InterfacesChanged(pub Value);

/// Build a typed bus with one channel registered per bridged event type.
pub fn init_bus() -> TypedBus {
    let mut bus = TypedBus::default();
    bus.register::<StatusChanged>(Some(CHANNEL_SIZE));
    bus.register::<Updated>(Some(CHANNEL_SIZE));
    bus.register::<BannerChanged>(Some(CHANNEL_SIZE));
    bus.register::<FeeChanged>(Some(CHANNEL_SIZE));
    bus.register::<ServersChanged>(Some(CHANNEL_SIZE));
    bus.register::<InterfacesChanged>(Some(CHANNEL_SIZE));
    bus
}

/// Register a forwarding callback on every topic of `engine_events`, each one
/// publishing the payload onto `typed` under its corresponding bridged type.
/// `engine_events` fires callbacks synchronously from the supervisor task, so each
/// forward spawns rather than awaiting the typed bus's send directly.
pub fn wire(engine_events: &EventBus, typed: TypedBus) {
    forward(engine_events, Topic::Status, typed.clone(), |v| StatusChanged(v));
    forward(engine_events, Topic::Updated, typed.clone(), |v| Updated(v));
    forward(engine_events, Topic::Banner, typed.clone(), |v| BannerChanged(v));
    forward(engine_events, Topic::Fee, typed.clone(), |v| FeeChanged(v));
    forward(engine_events, Topic::Servers, typed.clone(), |v| ServersChanged(v));
    forward(engine_events, Topic::Interfaces, typed, |v| InterfacesChanged(v));
}

fn forward<E>(
    engine_events: &EventBus,
    topic: Topic,
    typed: TypedBus,
    wrap: impl Fn(Value) -> E + Send + Sync + 'static,
) where
    E: event_bus::BusEvent + Clone + 'static,
{
    engine_events.register_callback(topic, move |payload: &Value| {
        let event = wrap(payload.clone());
        let typed = typed.clone();
        tokio::spawn(async move {
            let _ = typed.try_send(event).await;
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn status_event_reaches_its_typed_subscriber() {
        let engine_events = EventBus::new();
        let typed = init_bus();
        wire(&engine_events, typed.clone());

        let rx = typed.subscribe::<StatusChanged>();
        engine_events.trigger_callback(Topic::Status, &json!({"connected": true}));

        let StatusChanged(payload) = rx.recv().await.unwrap();
        assert_eq!(payload["connected"], true);
    }
}
