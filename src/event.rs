//! High-level events and the per-client event bus.
//!
//! Every [`RespokeClient`](crate::RespokeClient) owns one [`EventBus`]. Callbacks
//! registered with [`EventBus::on`] run synchronously, in registration order,
//! on the client's session task. For async consumers, [`EventBus::subscribe`]
//! returns a bounded receiver of every event.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RespokeError;

/// Default capacity of a [`EventBus::subscribe`] stream.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

// ── Events ──────────────────────────────────────────────────────────

/// An event published to library consumers.
#[derive(Debug, Clone)]
pub enum RespokeEvent {
    /// The realtime session is registered and usable.
    Connect,
    /// The realtime channel went away.
    Disconnect,
    /// The transport re-established itself.
    Reconnect { attempt: u32 },
    /// The transport is trying to re-establish itself.
    Reconnecting { attempt: u32 },
    /// A connection-lifecycle or transport error.
    Error(Arc<RespokeError>),
    /// The channel handshake failed.
    ConnectError { reason: String },
    /// The channel handshake timed out.
    ConnectTimeout,
    /// A direct message.
    Message(Value),
    /// A presence update.
    Presence(Value),
    /// An endpoint joined a group. The header carries `groupId`.
    Join(Value),
    /// An endpoint left a group. The header carries `groupId`.
    Leave(Value),
    /// A group publication. The header carries `groupId`.
    Pubsub(Value),
}

impl RespokeEvent {
    /// The kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            RespokeEvent::Connect => EventKind::Connect,
            RespokeEvent::Disconnect => EventKind::Disconnect,
            RespokeEvent::Reconnect { .. } => EventKind::Reconnect,
            RespokeEvent::Reconnecting { .. } => EventKind::Reconnecting,
            RespokeEvent::Error(_) => EventKind::Error,
            RespokeEvent::ConnectError { .. } => EventKind::ConnectError,
            RespokeEvent::ConnectTimeout => EventKind::ConnectTimeout,
            RespokeEvent::Message(_) => EventKind::Message,
            RespokeEvent::Presence(_) => EventKind::Presence,
            RespokeEvent::Join(_) => EventKind::Join,
            RespokeEvent::Leave(_) => EventKind::Leave,
            RespokeEvent::Pubsub(_) => EventKind::Pubsub,
        }
    }

    pub(crate) fn error(err: RespokeError) -> Self {
        RespokeEvent::Error(Arc::new(err))
    }
}

/// Discriminant of [`RespokeEvent`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    Reconnect,
    Reconnecting,
    Error,
    ConnectError,
    ConnectTimeout,
    Message,
    Presence,
    Join,
    Leave,
    Pubsub,
}

// ── Header normalization ────────────────────────────────────────────

/// Rename the transport's `channel` header field to `groupId`.
///
/// Works on a copy of `raw`. The resulting header always has a `groupId` key
/// (`null` if the transport sent no channel) and never a `channel` key.
pub fn normalize_group_header(raw: &Value) -> Value {
    let mut event = match raw {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = Map::new();
            map.insert("body".into(), other.clone());
            map
        }
    };

    let mut header = match event.remove("header") {
        Some(Value::Object(header)) => header,
        _ => Map::new(),
    };
    let group_id = header.remove("channel").unwrap_or(Value::Null);
    header.insert("groupId".into(), group_id);
    event.insert("header".into(), Value::Object(header));

    Value::Object(event)
}

// ── Event bus ───────────────────────────────────────────────────────

/// Identifier returned by [`EventBus::on`], used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

type Callback = Arc<dyn Fn(&RespokeEvent) + Send + Sync>;

struct Listener {
    id: ListenerId,
    once: bool,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    listeners: HashMap<EventKind, Vec<Listener>>,
    subscribers: Vec<mpsc::Sender<RespokeEvent>>,
}

/// Event name → ordered subscriber list, owned by one client.
#[derive(Clone)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus whose [`subscribe`](Self::subscribe) streams hold up to
    /// `capacity` undelivered events. Values below 1 are clamped to 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Arc::default(),
            capacity: capacity.max(1),
        }
    }

    /// Call `callback` for every event of `kind`.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&RespokeEvent) + Send + Sync + 'static,
    {
        self.add(kind, false, Arc::new(callback))
    }

    /// Call `callback` for the next event of `kind` only.
    pub fn once<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&RespokeEvent) + Send + Sync + 'static,
    {
        self.add(kind, true, Arc::new(callback))
    }

    /// Remove a listener. Returns `false` if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        let Ok(mut registry) = self.registry.lock() else {
            return false;
        };
        let mut removed = false;
        for list in registry.listeners.values_mut() {
            let before = list.len();
            list.retain(|l| l.id != id);
            removed |= list.len() != before;
        }
        removed
    }

    /// Number of listeners registered for `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.registry
            .lock()
            .map(|r| r.listeners.get(&kind).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Receive every event on a bounded channel.
    ///
    /// When the consumer falls behind, events are dropped with a warning so the
    /// session task never blocks.
    pub fn subscribe(&self) -> mpsc::Receiver<RespokeEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        if let Ok(mut registry) = self.registry.lock() {
            registry.subscribers.push(tx);
        }
        rx
    }

    /// Deliver `event` to every listener of its kind, then to every subscriber.
    pub fn emit(&self, event: RespokeEvent) {
        let kind = event.kind();
        let (callbacks, subscribers) = {
            let Ok(mut registry) = self.registry.lock() else {
                warn!("event registry poisoned, dropping {kind:?}");
                return;
            };
            let callbacks: Vec<Callback> = match registry.listeners.get_mut(&kind) {
                Some(list) => {
                    let callbacks = list.iter().map(|l| Arc::clone(&l.callback)).collect();
                    list.retain(|l| !l.once);
                    callbacks
                }
                None => Vec::new(),
            };
            registry.subscribers.retain(|tx| !tx.is_closed());
            (callbacks, registry.subscribers.clone())
        };

        if kind == EventKind::Error && callbacks.is_empty() && subscribers.is_empty() {
            if let RespokeEvent::Error(err) = &event {
                warn!("unhandled error event: {err}");
            }
        }

        // The lock is released so callbacks may register or remove listeners.
        for callback in callbacks {
            callback(&event);
        }

        for tx in subscribers {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(dropped)) => {
                    warn!("event channel full, dropping event: {:?}", dropped.kind());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("event channel closed, receiver dropped");
                }
            }
        }
    }

    fn add(&self, kind: EventKind, once: bool, callback: Callback) -> ListenerId {
        let id = ListenerId(Uuid::new_v4());
        if let Ok(mut registry) = self.registry.lock() {
            registry.listeners.entry(kind).or_default().push(Listener {
                id,
                once,
                callback,
            });
        }
        id
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn join_header_channel_becomes_group_id() {
        let raw = json!({ "header": { "channel": "lobby", "from": "bob" }, "body": "hi" });
        let out = normalize_group_header(&raw);
        assert_eq!(out["header"]["groupId"], "lobby");
        assert!(out["header"].get("channel").is_none());
        assert_eq!(out["header"]["from"], "bob");
        assert_eq!(out["body"], "hi");
        // The input is untouched.
        assert_eq!(raw["header"]["channel"], "lobby");
    }

    #[test]
    fn missing_header_still_gets_group_id() {
        let out = normalize_group_header(&json!({ "body": 1 }));
        assert!(out["header"].get("groupId").unwrap().is_null());
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let bus = EventBus::new(8);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            bus.on(EventKind::Connect, move |_| order.lock().unwrap().push(i));
        }
        bus.emit(RespokeEvent::Connect);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn once_listener_fires_once() {
        let bus = EventBus::new(8);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        bus.once(EventKind::Disconnect, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(RespokeEvent::Disconnect);
        bus.emit(RespokeEvent::Disconnect);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(EventKind::Disconnect), 0);
    }

    #[test]
    fn off_removes_listener() {
        let bus = EventBus::new(8);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let id = bus.on(EventKind::Connect, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(bus.off(id));
        assert!(!bus.off(id));
        bus.emit(RespokeEvent::Connect);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn listeners_only_see_their_kind() {
        let bus = EventBus::new(8);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        bus.on(EventKind::Message, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(RespokeEvent::Connect);
        bus.emit(RespokeEvent::Message(json!({})));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscribers_receive_all_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(RespokeEvent::Connect);
        bus.emit(RespokeEvent::Reconnecting { attempt: 2 });
        assert!(matches!(rx.recv().await, Some(RespokeEvent::Connect)));
        assert!(matches!(
            rx.recv().await,
            Some(RespokeEvent::Reconnecting { attempt: 2 })
        ));
    }

    #[tokio::test]
    async fn full_subscriber_drops_instead_of_blocking() {
        let bus = EventBus::new(1);
        let mut rx = bus.subscribe();
        bus.emit(RespokeEvent::Connect);
        bus.emit(RespokeEvent::Disconnect);
        assert!(matches!(rx.recv().await, Some(RespokeEvent::Connect)));
        assert!(rx.try_recv().is_err());
    }
}
