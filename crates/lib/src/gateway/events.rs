//! Event subscriptions: fan-out of gateway push events to any number of subscribers.
//!
//! Handlers run synchronously on the connection's reader task, in arrival order. Events that
//! arrive while nobody is subscribed are dropped; there is no buffering or replay.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::de::DeserializeOwned;
use serde_json::Value;

type Handler = Arc<dyn Fn(&str, &Value) + Send + Sync>;

struct Subscriber {
    id: u64,
    /// `None` receives every event.
    event: Option<String>,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

/// Registry of event subscribers keyed by event name. Cheap to clone; clones share subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn add(&self, event: Option<String>, handler: Handler) -> Subscription {
        let mut registry = self.registry();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.subscribers.push(Subscriber { id, event, handler });
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Receive `(event, payload)` for every event named `event`.
    pub fn subscribe<F>(&self, event: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.add(Some(event.into()), Arc::new(handler))
    }

    /// Receive every event regardless of name.
    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.add(None, Arc::new(handler))
    }

    /// Receive the payload of `event` decoded as `T`. Payloads that do not decode are logged and skipped.
    pub fn subscribe_typed<T, F>(&self, event: impl Into<String>, handler: F) -> Subscription
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.subscribe(event, move |name, payload| {
            match T::deserialize(payload) {
                Ok(value) => handler(value),
                Err(e) => log::warn!("event {}: payload did not match subscriber type: {}", name, e),
            }
        })
    }

    /// Deliver one event to every matching subscriber in registration order. Returns how many were called.
    pub fn publish(&self, event: &str, payload: &Value) -> usize {
        // Snapshot so handlers may subscribe or unsubscribe without deadlocking.
        let handlers: Vec<Handler> = self
            .registry()
            .subscribers
            .iter()
            .filter(|s| s.event.as_deref().map_or(true, |e| e == event))
            .map(|s| Arc::clone(&s.handler))
            .collect();
        for handler in &handlers {
            handler(event, payload);
        }
        handlers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry().subscribers.len()
    }
}

/// Handle to one subscription. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}

    /// Keep the subscription for the lifetime of the bus.
    pub fn detach(mut self) {
        self.registry = Weak::new();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.subscribers.retain(|s| s.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn recorder() -> (Arc<Mutex<Vec<(String, Value)>>>, impl Fn(&str, &Value) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |name: &str, payload: &Value| {
            sink.lock().unwrap().push((name.to_string(), payload.clone()));
        })
    }

    #[test]
    fn delivers_in_arrival_order_with_identical_payloads() {
        let bus = EventBus::new();
        let (seen, handler) = recorder();
        let _sub = bus.subscribe("chat.stream", handler);

        bus.publish("chat.stream", &json!({"delta": "a"}));
        bus.publish("chat.stream", &json!({"delta": "b"}));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("chat.stream".to_string(), json!({"delta": "a"})),
                ("chat.stream".to_string(), json!({"delta": "b"})),
            ]
        );
    }

    #[test]
    fn filters_by_name_and_fans_out() {
        let bus = EventBus::new();
        let (chat, chat_handler) = recorder();
        let (all, all_handler) = recorder();
        let _a = bus.subscribe("chat", chat_handler);
        let _b = bus.subscribe_all(all_handler);

        assert_eq!(bus.publish("presence", &json!({})), 1);
        assert_eq!(bus.publish("chat", &json!(1)), 2);

        assert_eq!(chat.lock().unwrap().len(), 1);
        assert_eq!(all.lock().unwrap().len(), 2);
    }

    #[test]
    fn dropping_subscription_cancels_it() {
        let bus = EventBus::new();
        let (seen, handler) = recorder();
        let sub = bus.subscribe("tick", handler);
        bus.publish("tick", &Value::Null);
        sub.unsubscribe();
        bus.publish("tick", &Value::Null);

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn detached_subscription_stays() {
        let bus = EventBus::new();
        bus.subscribe_all(|_, _| {}).detach();
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn typed_subscriber_skips_mismatched_payloads() {
        #[derive(Deserialize)]
        struct Delta {
            delta: String,
        }

        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.subscribe_typed("chat.stream", move |d: Delta| {
            sink.lock().unwrap().push(d.delta);
        });

        bus.publish("chat.stream", &json!({"delta": "a"}));
        bus.publish("chat.stream", &json!(42));
        bus.publish("chat.stream", &json!({"delta": "b"}));

        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn handler_may_unsubscribe_itself_during_publish() {
        let bus = EventBus::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let inner = Arc::clone(&slot);
        let sub = bus.subscribe("once", move |_, _| {
            inner.lock().unwrap().take();
        });
        *slot.lock().unwrap() = Some(sub);

        assert_eq!(bus.publish("once", &Value::Null), 1);
        assert_eq!(bus.publish("once", &Value::Null), 0);
    }
}
