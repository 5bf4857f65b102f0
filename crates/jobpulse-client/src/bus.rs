use crate::lock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// A raw event as it came off the push channel, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

type Listener = (u64, mpsc::UnboundedSender<InboundEvent>);

#[derive(Default)]
struct BusState {
    next_id: u64,
    listeners: HashMap<String, Vec<Listener>>,
}

/// Routes inbound events to per-topic listeners. Listeners only ever see
/// events addressed to the topic they subscribed to.
#[derive(Clone, Default)]
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str) -> (Subscription, mpsc::UnboundedReceiver<InboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = lock(&self.state);
            state.next_id += 1;
            let id = state.next_id;
            state
                .listeners
                .entry(topic.to_string())
                .or_default()
                .push((id, tx));
            id
        };
        let subscription = Subscription {
            bus: self.clone(),
            topic: topic.to_string(),
            id,
        };
        (subscription, rx)
    }

    /// Delivers `event` to every live listener on its topic and returns how
    /// many received it.
    pub fn publish(&self, event: InboundEvent) -> usize {
        let mut state = lock(&self.state);
        let Some(listeners) = state.listeners.get_mut(&event.topic) else {
            debug!(event = "bus_no_listener", topic = %event.topic, name = %event.event);
            return 0;
        };
        listeners.retain(|(_, tx)| !tx.is_closed());
        let mut delivered = 0;
        for (_, tx) in listeners.iter() {
            if tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        if listeners.is_empty() {
            state.listeners.remove(&event.topic);
        }
        delivered
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        lock(&self.state)
            .listeners
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn remove(&self, topic: &str, id: u64) {
        let mut state = lock(&self.state);
        if let Some(listeners) = state.listeners.get_mut(topic) {
            listeners.retain(|(listener_id, _)| *listener_id != id);
            if listeners.is_empty() {
                state.listeners.remove(topic);
            }
        }
    }
}

/// Registration handle; dropping it removes the listener.
pub struct Subscription {
    bus: EventBus,
    topic: String,
    id: u64,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.remove(&self.topic, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(topic: &str, name: &str) -> InboundEvent {
        InboundEvent {
            topic: topic.to_string(),
            event: name.to_string(),
            payload: json!({}),
        }
    }

    #[test]
    fn events_reach_only_their_topic() {
        let bus = EventBus::new();
        let (_sub_a, mut rx_a) = bus.subscribe("job:A");
        let (_sub_b, mut rx_b) = bus.subscribe("job:B");

        assert_eq!(bus.publish(event("job:A", "job-progress")), 1);
        assert_eq!(rx_a.try_recv().expect("a").event, "job-progress");
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn dropping_subscription_unregisters_once() {
        let bus = EventBus::new();
        let (first, _rx1) = bus.subscribe("job:A");
        let (second, _rx2) = bus.subscribe("job:A");
        assert_eq!(bus.listener_count("job:A"), 2);

        drop(first);
        assert_eq!(bus.listener_count("job:A"), 1);
        drop(second);
        assert_eq!(bus.listener_count("job:A"), 0);
        assert_eq!(bus.publish(event("job:A", "job-progress")), 0);
    }

    #[test]
    fn closed_receivers_are_pruned_on_publish() {
        let bus = EventBus::new();
        let (_sub, rx) = bus.subscribe("conversation:c1");
        drop(rx);
        assert_eq!(bus.publish(event("conversation:c1", "message-delta")), 0);
    }
}
