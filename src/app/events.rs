use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub const DEVICE_CONNECTED_EVENT: &str = "device-connected";
pub const DEVICE_DISCONNECTED_EVENT: &str = "device-disconnected";
pub const DEVICES_UPDATE_EVENT: &str = "devices-update";
pub const OPERATION_PROGRESS_EVENT: &str = "operation-progress";
pub const OPERATION_COMPLETE_EVENT: &str = "operation-complete";

#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    pub name: String,
    pub payload: Value,
}

pub type EventCallback = Arc<dyn Fn(&BusEvent) + Send + Sync>;

/// Observer-list event bus for the outward-facing device and operation
/// events. Transports subscribe at startup and must unsubscribe when
/// their client goes away; subscriber ids never repeat within a process.
pub struct EventBus {
    subscribers: Mutex<HashMap<u64, EventCallback>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, callback: EventCallback) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut guard) = self.subscribers.lock() {
            guard.insert(id, callback);
        }
        id
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        match self.subscribers.lock() {
            Ok(mut guard) => guard.remove(&id).is_some(),
            Err(_) => false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    /// Delivers to every current subscriber. Callbacks run outside the
    /// subscriber lock, so a callback may subscribe/unsubscribe freely.
    pub fn emit(&self, name: &str, payload: Value) {
        let callbacks: Vec<EventCallback> = match self.subscribers.lock() {
            Ok(guard) => guard.values().cloned().collect(),
            Err(_) => return,
        };
        let event = BusEvent {
            name: name.to_string(),
            payload,
        };
        for callback in callbacks {
            callback(&event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn delivers_to_subscribers() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        bus.subscribe(Arc::new(move |event| {
            seen_cb
                .lock()
                .unwrap()
                .push((event.name.clone(), event.payload.clone()));
        }));

        bus.emit(DEVICE_CONNECTED_EVENT, serde_json::json!({"serial": "A"}));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, DEVICE_CONNECTED_EVENT);
        assert_eq!(seen[0].1["serial"], "A");
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_cb = Arc::clone(&count);
        let id = bus.subscribe(Arc::new(move |_| {
            count_cb.fetch_add(1, Ordering::SeqCst);
        }));

        bus.emit("test-event", Value::Null);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit("test-event", Value::Null);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn emit_without_subscribers_is_a_noop() {
        let bus = EventBus::new();
        bus.emit("test-event", Value::Null);
    }
}
