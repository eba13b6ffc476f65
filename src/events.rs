//! Typed event bus with bounded history.
//!
//! Producers (pool, adapters, facade, discovery) emit [`Event`]s; observers
//! subscribe per event kind or globally. Each subscription gets its own
//! dispatch queue: handlers run concurrently with respect to each other (no
//! cross-handler ordering for a given event), but a single handler sees
//! events in emission order. A failing handler is logged and discarded,
//! never re-emitted as an event and never visible to the emitter or to
//! other handlers.
//!
//! The history ring buffer preserves emission order.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;

use crate::core::error::{GatewayError, Result};
use crate::core::state::ConnectionState;

/// Default number of events retained in history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Kinds of events the gateway emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A transport changed connection state.
    ConnectionStateChanged,
    /// A tag value was read successfully.
    DataReceived,
    /// An operation failed.
    ErrorOccurred,
    /// Discovery found a device.
    DeviceDiscovered,
    /// A pool health probe failed.
    HealthCheckFailed,
}

/// A single gateway event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event kind.
    #[serde(rename = "event_type")]
    pub kind: EventKind,

    /// Wall-clock time at emission (ISO-8601 on serialization).
    pub timestamp: DateTime<Utc>,

    /// Producer identifier, e.g. `"modbus_tcp:192.168.1.100:502/1"`.
    pub source: String,

    /// Kind-specific payload.
    pub data: serde_json::Value,
}

impl Event {
    /// Create an event with the current timestamp.
    pub fn new(kind: EventKind, source: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            source: source.into(),
            data,
        }
    }

    /// Connection state transition.
    pub fn state_changed(source: &str, old: ConnectionState, new: ConnectionState) -> Self {
        Self::new(
            EventKind::ConnectionStateChanged,
            source,
            json!({ "old_state": old.as_str(), "new_state": new.as_str() }),
        )
    }

    /// Successful tag read.
    pub fn data_received(
        source: &str,
        address: &str,
        value: serde_json::Value,
        data_type: &str,
    ) -> Self {
        Self::new(
            EventKind::DataReceived,
            source,
            json!({ "address": address, "value": value, "data_type": data_type }),
        )
    }

    /// Operation failure.
    pub fn error(source: &str, error: &GatewayError, context: serde_json::Value) -> Self {
        Self::new(
            EventKind::ErrorOccurred,
            source,
            json!({
                "error": error.to_string(),
                "exit_code": error.exit_code(),
                "context": context,
            }),
        )
    }

    /// Discovery result. `path` is `"fast"` or `"slow"`.
    pub fn device_discovered(source: &str, device: serde_json::Value, path: &str) -> Self {
        Self::new(
            EventKind::DeviceDiscovered,
            source,
            json!({ "device": device, "path": path }),
        )
    }

    /// Health probe failure on a pooled entry.
    pub fn health_check_failed(source: &str, reason: &str) -> Self {
        Self::new(
            EventKind::HealthCheckFailed,
            source,
            json!({ "reason": reason }),
        )
    }
}

/// Identifies one subscription for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Asynchronous event observer.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event. Errors are logged and discarded by the bus.
    async fn handle(&self, event: Event) -> Result<()>;
}

/// Adapter turning a plain closure into an [`EventHandler`].
struct FnHandler<F>(F);

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(Event) + Send + Sync,
{
    async fn handle(&self, event: Event) -> Result<()> {
        (self.0)(event);
        Ok(())
    }
}

/// One registered handler with its ordered dispatch queue.
struct Subscription {
    id: u64,
    tx: mpsc::UnboundedSender<Event>,
}

struct BusInner {
    next_id: u64,
    by_kind: HashMap<EventKind, Vec<Subscription>>,
    global: Vec<Subscription>,
    history: VecDeque<Event>,
    capacity: usize,
}

/// Typed pub/sub bus with bounded in-memory history.
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with the default history capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// Create a bus retaining at most `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                next_id: 0,
                by_kind: HashMap::new(),
                global: Vec::new(),
                history: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY)),
                capacity,
            }),
        }
    }

    /// The process-wide default bus.
    ///
    /// All components also accept an explicit instance; the default exists
    /// for embedders that want one shared stream of events.
    pub fn global() -> Arc<EventBus> {
        static GLOBAL: Lazy<Arc<EventBus>> = Lazy::new(|| Arc::new(EventBus::new()));
        GLOBAL.clone()
    }

    /// Spawn the dispatch worker for one subscription.
    ///
    /// Events queue per subscription, so a single handler observes them in
    /// emission order. Handler errors are logged and dropped here; emitting
    /// an error event for a failing handler would recurse.
    fn spawn_worker(handler: Arc<dyn EventHandler>) -> mpsc::UnboundedSender<Event> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    while let Some(event) = rx.recv().await {
                        if let Err(err) = handler.handle(event).await {
                            tracing::warn!(error = %err, "event handler failed");
                        }
                    }
                });
            }
            Err(_) => {
                tracing::warn!("no async runtime, subscribed handler will not receive events");
            }
        }
        tx
    }

    /// Subscribe a handler to one event kind.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let tx = Self::spawn_worker(handler);
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .by_kind
            .entry(kind)
            .or_default()
            .push(Subscription { id, tx });
        SubscriptionId(id)
    }

    /// Subscribe a handler to every event kind.
    pub fn subscribe_all(&self, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let tx = Self::spawn_worker(handler);
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.global.push(Subscription { id, tx });
        SubscriptionId(id)
    }

    /// Subscribe a plain closure to one event kind.
    pub fn subscribe_fn<F>(&self, kind: EventKind, f: F) -> SubscriptionId
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.subscribe(kind, Arc::new(FnHandler(f)))
    }

    /// Remove a subscription.
    ///
    /// Removal affects subsequent events only: invocations already queued or
    /// running complete.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        let before = inner.global.len();
        inner.global.retain(|s| s.id != id.0);
        if inner.global.len() != before {
            return true;
        }
        for subscriptions in inner.by_kind.values_mut() {
            let before = subscriptions.len();
            subscriptions.retain(|s| s.id != id.0);
            if subscriptions.len() != before {
                return true;
            }
        }
        false
    }

    /// Emit an event.
    ///
    /// The event is appended to history under the lock (emission order is
    /// the history order) and queued to every matching subscription.
    pub fn emit(&self, event: Event) {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        if inner.history.len() >= inner.capacity {
            inner.history.pop_front();
        }
        inner.history.push_back(event.clone());

        let mut stale = false;
        for subscription in inner
            .by_kind
            .get(&event.kind)
            .into_iter()
            .flatten()
            .chain(inner.global.iter())
        {
            if subscription.tx.send(event.clone()).is_err() {
                stale = true;
            }
        }
        if stale {
            // Workers are gone (runtime shut down); drop their queues.
            for subscriptions in inner.by_kind.values_mut() {
                subscriptions.retain(|s| !s.tx.is_closed());
            }
            inner.global.retain(|s| !s.tx.is_closed());
        }
    }

    /// Most recent events, newest last, optionally filtered by kind.
    pub fn recent(&self, count: usize, kind: Option<EventKind>) -> Vec<Event> {
        let inner = self.inner.lock().expect("event bus lock poisoned");
        let matching: Vec<&Event> = inner
            .history
            .iter()
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .collect();
        matching
            .into_iter()
            .rev()
            .take(count)
            .rev()
            .cloned()
            .collect()
    }

    /// Number of events currently retained.
    pub fn history_len(&self) -> usize {
        self.inner
            .lock()
            .expect("event bus lock poisoned")
            .history
            .len()
    }

    /// Drop all retained events.
    pub fn clear_history(&self) {
        self.inner
            .lock()
            .expect("event bus lock poisoned")
            .history
            .clear();
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("history_len", &self.history_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ev(source: &str, n: u64) -> Event {
        Event::new(EventKind::DataReceived, source, json!({ "n": n }))
    }

    #[test]
    fn test_history_preserves_emission_order() {
        let bus = EventBus::new();
        bus.emit(ev("a", 1));
        bus.emit(ev("a", 2));
        bus.emit(ev("a", 3));

        let recent = bus.recent(10, None);
        let ns: Vec<u64> = recent.iter().map(|e| e.data["n"].as_u64().unwrap()).collect();
        assert_eq!(ns, vec![1, 2, 3]);
    }

    #[test]
    fn test_history_fifo_eviction() {
        let bus = EventBus::with_capacity(2);
        bus.emit(ev("a", 1));
        bus.emit(ev("a", 2));
        bus.emit(ev("a", 3));

        assert_eq!(bus.history_len(), 2);
        let recent = bus.recent(10, None);
        assert_eq!(recent[0].data["n"], 2);
        assert_eq!(recent[1].data["n"], 3);
    }

    #[test]
    fn test_recent_filters_by_kind() {
        let bus = EventBus::new();
        bus.emit(ev("a", 1));
        bus.emit(Event::health_check_failed("pool", "boom"));

        assert_eq!(bus.recent(10, Some(EventKind::HealthCheckFailed)).len(), 1);
        assert_eq!(bus.recent(10, Some(EventKind::DataReceived)).len(), 1);
        assert_eq!(bus.recent(10, Some(EventKind::DeviceDiscovered)).len(), 0);
    }

    #[tokio::test]
    async fn test_typed_subscription_receives_matching_events() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        bus.subscribe_fn(EventKind::DataReceived, move |event| {
            tx.send(event.data["n"].as_u64().unwrap()).unwrap();
        });

        bus.emit(ev("a", 7));
        bus.emit(Event::health_check_failed("pool", "ignored"));

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, 7);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handler_sees_events_in_emission_order() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        bus.subscribe_fn(EventKind::DataReceived, move |event| {
            tx.send(event.data["n"].as_u64().unwrap()).unwrap();
        });

        for n in 0..100 {
            bus.emit(ev("same-source", n));
        }

        let mut seen = Vec::new();
        while seen.len() < 100 {
            let n = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(n);
        }
        assert_eq!(seen, (0..100).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_failing_handler_is_isolated() {
        struct Failing;
        #[async_trait]
        impl EventHandler for Failing {
            async fn handle(&self, _event: Event) -> Result<()> {
                Err(GatewayError::internal("handler bug"))
            }
        }

        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        bus.subscribe(EventKind::DataReceived, Arc::new(Failing));
        bus.subscribe_fn(EventKind::DataReceived, move |event| {
            tx.send(event.data["n"].as_u64().unwrap()).unwrap();
        });

        bus.emit(ev("a", 9));

        // The healthy handler still runs, and no ErrorOccurred was emitted
        // for the failing one.
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, 9);
        assert_eq!(bus.recent(10, Some(EventKind::ErrorOccurred)).len(), 0);
    }

    #[tokio::test]
    async fn test_global_subscription_sees_all_kinds() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        struct Forward(mpsc::UnboundedSender<EventKind>);
        #[async_trait]
        impl EventHandler for Forward {
            async fn handle(&self, event: Event) -> Result<()> {
                self.0.send(event.kind).ok();
                Ok(())
            }
        }
        bus.subscribe_all(Arc::new(Forward(tx)));

        bus.emit(ev("a", 1));
        bus.emit(Event::health_check_failed("pool", "x"));

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, EventKind::DataReceived);
        assert_eq!(second, EventKind::HealthCheckFailed);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_subsequent_events() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let id = bus.subscribe_fn(EventKind::DataReceived, move |event| {
            tx.send(event.data["n"].as_u64().unwrap()).unwrap();
        });

        bus.emit(ev("a", 1));
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, 1);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(ev("a", 2));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_payload_field_names_are_stable() {
        let event = Event::state_changed(
            "modbus_tcp:10.0.0.1:502/1",
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "connection_state_changed");
        assert!(json["timestamp"].is_string());
        assert_eq!(json["source"], "modbus_tcp:10.0.0.1:502/1");
        assert_eq!(json["data"]["old_state"], "disconnected");
        assert_eq!(json["data"]["new_state"], "connecting");
    }
}
