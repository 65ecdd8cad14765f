#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for Respoke client integration tests.
//!
//! Provides an in-memory [`FakeConnector`] / [`FakeChannel`] pair and helpers
//! for waiting on client events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use respoke_client::channel::{
    ChannelEvent, ChannelEventKind, ChannelHandler, ConnectParams, Connector, RealtimeChannel,
    Verb,
};
use respoke_client::{EventKind, RespokeError, RespokeEvent};
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// How long a test waits for an event before failing.
pub const EVENT_WAIT: Duration = Duration::from_secs(600);

/// Initialise a tracing subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── FakeChannel ─────────────────────────────────────────────────────

type Responder = dyn Fn(Verb, &Value) -> String + Send + Sync;

/// In-memory realtime channel.
///
/// Records handler registrations and emitted calls, holds events fired before
/// a handler exists, and answers calls through a responder.
pub struct FakeChannel {
    pub url: String,
    pub params: ConnectParams,
    handlers: StdMutex<HashMap<ChannelEventKind, Vec<ChannelHandler>>>,
    held: StdMutex<Vec<ChannelEvent>>,
    registrations: StdMutex<Vec<ChannelEventKind>>,
    calls: StdMutex<Vec<(Verb, Value)>>,
    responder: Arc<Responder>,
    pub disconnected: AtomicBool,
}

impl FakeChannel {
    fn new(url: &str, params: &ConnectParams, responder: Arc<Responder>) -> Self {
        Self {
            url: url.to_string(),
            params: params.clone(),
            handlers: StdMutex::new(HashMap::new()),
            held: StdMutex::new(Vec::new()),
            registrations: StdMutex::new(Vec::new()),
            calls: StdMutex::new(Vec::new()),
            responder,
            disconnected: AtomicBool::new(false),
        }
    }

    /// Deliver `event` to its handlers, or hold it until one registers.
    pub fn fire(&self, event: ChannelEvent) {
        let handlers = self
            .handlers
            .lock()
            .unwrap()
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            self.held.lock().unwrap().push(event);
            return;
        }
        for handler in handlers {
            handler(event.clone());
        }
    }

    /// Kinds passed to `on`, in call order.
    pub fn registrations(&self) -> Vec<ChannelEventKind> {
        self.registrations.lock().unwrap().clone()
    }

    /// Calls emitted so far as `(verb, envelope)`.
    pub fn calls(&self) -> Vec<(Verb, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RealtimeChannel for FakeChannel {
    fn on(&self, kind: ChannelEventKind, handler: ChannelHandler) {
        self.registrations.lock().unwrap().push(kind);
        self.handlers
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push(Arc::clone(&handler));

        let ready: Vec<ChannelEvent> = {
            let mut held = self.held.lock().unwrap();
            let (ready, rest) = held.drain(..).partition(|e| e.kind() == kind);
            *held = rest;
            ready
        };
        for event in ready {
            handler(event);
        }
    }

    async fn emit(&self, verb: Verb, payload: String) -> Result<String, RespokeError> {
        let envelope: Value = serde_json::from_str(&payload).unwrap();
        let reply = (self.responder)(verb, &envelope);
        self.calls.lock().unwrap().push((verb, envelope));
        Ok(reply)
    }

    async fn disconnect(&self) -> Result<(), RespokeError> {
        if !self.disconnected.swap(true, Ordering::SeqCst) {
            self.fire(ChannelEvent::Disconnect);
        }
        Ok(())
    }
}

/// Default responder: registration succeeds, every other call echoes its data.
pub fn registration_ok(_verb: Verb, envelope: &Value) -> String {
    let url = envelope["url"].as_str().unwrap_or_default();
    if url.ends_with("/connections") {
        let endpoint_id = envelope["data"]["endpointId"]
            .as_str()
            .unwrap_or("token-endpoint");
        json!({ "id": "conn-1", "endpointId": endpoint_id }).to_string()
    } else {
        json!({ "echo": envelope["data"] }).to_string()
    }
}

// ── FakeConnector ───────────────────────────────────────────────────

/// Connector that hands out [`FakeChannel`]s.
pub struct FakeConnector {
    channels: StdMutex<Vec<Arc<FakeChannel>>>,
    responder: Arc<Responder>,
    auto_connect: bool,
    failures_left: AtomicUsize,
    timeouts_left: AtomicUsize,
    refusals_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl FakeConnector {
    /// Channels fire `connect` as soon as they open.
    pub fn auto_connect() -> Arc<Self> {
        Self::build(true, Arc::new(registration_ok))
    }

    /// Channels stay silent until the test fires events.
    pub fn manual() -> Arc<Self> {
        Self::build(false, Arc::new(registration_ok))
    }

    /// Auto-connecting channels answering calls with `responder`.
    pub fn with_responder<F>(responder: F) -> Arc<Self>
    where
        F: Fn(Verb, &Value) -> String + Send + Sync + 'static,
    {
        Self::build(true, Arc::new(responder))
    }

    fn build(auto_connect: bool, responder: Arc<Responder>) -> Arc<Self> {
        Arc::new(Self {
            channels: StdMutex::new(Vec::new()),
            responder,
            auto_connect,
            failures_left: AtomicUsize::new(0),
            timeouts_left: AtomicUsize::new(0),
            refusals_left: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        })
    }

    /// Make the next `n` connects fail.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` connects fail with [`RespokeError::Timeout`].
    pub fn time_out_next(&self, n: usize) {
        self.timeouts_left.store(n, Ordering::SeqCst);
    }

    /// The next `n` channels open, then fire `connect_error` instead of
    /// `connect`, as a server closing before the handshake completes.
    pub fn refuse_next(&self, n: usize) {
        self.refusals_left.store(n, Ordering::SeqCst);
    }

    /// Number of `connect` calls, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Channels opened so far.
    pub fn channels(&self) -> Vec<Arc<FakeChannel>> {
        self.channels.lock().unwrap().clone()
    }

    /// The most recently opened channel.
    pub fn latest(&self) -> Arc<FakeChannel> {
        self.channels
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no channel opened yet")
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        url: &str,
        params: &ConnectParams,
    ) -> Result<Arc<dyn RealtimeChannel>, RespokeError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.timeouts_left) {
            return Err(RespokeError::Timeout);
        }
        if take_one(&self.failures_left) {
            return Err(RespokeError::Transport("connection refused".into()));
        }

        let channel = Arc::new(FakeChannel::new(url, params, Arc::clone(&self.responder)));
        if take_one(&self.refusals_left) {
            channel.fire(ChannelEvent::ConnectError("closed before connect".into()));
        } else if self.auto_connect {
            channel.fire(ChannelEvent::Connect);
        }
        self.channels.lock().unwrap().push(Arc::clone(&channel));
        Ok(channel)
    }
}

/// Decrement `counter` if it is positive; true if it was.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// ── Event helpers ───────────────────────────────────────────────────

/// Receive events until one of `kind` arrives.
pub async fn next_of(rx: &mut mpsc::Receiver<RespokeEvent>, kind: EventKind) -> RespokeEvent {
    tokio::time::timeout(EVENT_WAIT, async {
        loop {
            let event = rx.recv().await.expect("event stream ended");
            if event.kind() == kind {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {kind:?}"))
}

/// Receive the next error event and return its error.
pub async fn next_error(rx: &mut mpsc::Receiver<RespokeEvent>) -> Arc<RespokeError> {
    match next_of(rx, EventKind::Error).await {
        RespokeEvent::Error(err) => err,
        other => panic!("expected an error event, got {other:?}"),
    }
}

/// Drain every event already queued on `rx`.
pub fn drain(rx: &mut mpsc::Receiver<RespokeEvent>) -> Vec<RespokeEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
