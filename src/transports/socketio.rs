//! socket.io (protocol revision 1) channel over WebSocket, using `tokio-tungstenite`.
//!
//! Opening a channel takes two steps. An HTTP handshake
//! (`GET /socket.io/1/?<credential>`) returns a session id and the heartbeat
//! timeout. A WebSocket to `/socket.io/1/websocket/<sid>` then carries
//! text packets of the form `type:id:endpoint:data`.
//!
//! Both `ws://` and `wss://` are supported; TLS is handled by
//! [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream).
//!
//! # Feature gate
//!
//! Only available with the `transport-websocket` feature (on by default).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::channel::{
    ChannelEvent, ChannelEventKind, ChannelHandler, ConnectParams, Connector, RealtimeChannel,
    Verb,
};
use crate::error::{RespokeError, Result};

/// Path prefix of every socket.io request.
const SOCKET_IO_PATH: &str = "/socket.io/1";

/// Idle limit used when the server announces no heartbeat.
const NO_HEARTBEAT_IDLE: Duration = Duration::from_secs(24 * 60 * 60);

// ── Packets ─────────────────────────────────────────────────────────

/// One socket.io packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Disconnect,
    Connect,
    Heartbeat,
    /// Plain text message.
    Message(String),
    /// JSON message.
    Json(Value),
    /// Named event. `id` is set when the sender wants an acknowledgement.
    Event {
        id: Option<u64>,
        name: String,
        args: Vec<Value>,
    },
    /// Acknowledgement of event `id`.
    Ack { id: u64, args: Vec<Value> },
    Error {
        reason: String,
        advice: Option<String>,
    },
    Noop,
}

#[derive(Serialize, Deserialize)]
struct EventData {
    name: String,
    #[serde(default)]
    args: Vec<Value>,
}

fn malformed(what: &str, raw: &str) -> RespokeError {
    RespokeError::Transport(format!("malformed socket.io {what}: {raw:?}"))
}

impl Packet {
    /// Parse a packet from its wire text.
    ///
    /// # Errors
    ///
    /// Returns [`RespokeError::Transport`] for unknown packet types or
    /// malformed ids, and [`RespokeError::Serialization`] for bad JSON payloads.
    pub fn decode(raw: &str) -> Result<Packet> {
        let mut parts = raw.splitn(4, ':');
        let kind = parts.next().unwrap_or_default();
        let id = parts.next().unwrap_or_default();
        let _endpoint = parts.next();
        let data = parts.next().unwrap_or_default();

        match kind {
            "0" => Ok(Packet::Disconnect),
            "1" => Ok(Packet::Connect),
            "2" => Ok(Packet::Heartbeat),
            "3" => Ok(Packet::Message(data.to_string())),
            "4" => Ok(Packet::Json(serde_json::from_str(data)?)),
            "5" => {
                let id = match id.trim_end_matches('+') {
                    "" => None,
                    digits => Some(digits.parse().map_err(|_| malformed("event id", raw))?),
                };
                let event: EventData = serde_json::from_str(data)?;
                Ok(Packet::Event {
                    id,
                    name: event.name,
                    args: event.args,
                })
            }
            "6" => {
                let (id, args) = match data.split_once('+') {
                    Some((id, args)) => (id, serde_json::from_str(args)?),
                    None => (data, Vec::new()),
                };
                let id = id.parse().map_err(|_| malformed("ack id", raw))?;
                Ok(Packet::Ack { id, args })
            }
            "7" => {
                let (reason, advice) = match data.split_once('+') {
                    Some((reason, advice)) => (reason, Some(advice.to_string())),
                    None => (data, None),
                };
                Ok(Packet::Error {
                    reason: reason.to_string(),
                    advice,
                })
            }
            "8" => Ok(Packet::Noop),
            _ => Err(malformed("packet type", raw)),
        }
    }

    /// Wire text of this packet.
    ///
    /// # Errors
    ///
    /// Returns [`RespokeError::Serialization`] if a payload cannot be encoded.
    pub fn encode(&self) -> Result<String> {
        Ok(match self {
            Packet::Disconnect => "0::".to_string(),
            Packet::Connect => "1::".to_string(),
            Packet::Heartbeat => "2::".to_string(),
            Packet::Message(text) => format!("3:::{text}"),
            Packet::Json(value) => format!("4:::{}", serde_json::to_string(value)?),
            Packet::Event { id, name, args } => {
                let data = serde_json::to_string(&EventData {
                    name: name.clone(),
                    args: args.clone(),
                })?;
                match id {
                    Some(id) => format!("5:{id}+::{data}"),
                    None => format!("5:::{data}"),
                }
            }
            Packet::Ack { id, args } if args.is_empty() => format!("6:::{id}"),
            Packet::Ack { id, args } => format!("6:::{id}+{}", serde_json::to_string(args)?),
            Packet::Error { reason, advice } => match advice {
                Some(advice) => format!("7:::{reason}+{advice}"),
                None => format!("7:::{reason}"),
            },
            Packet::Noop => "8::".to_string(),
        })
    }
}

// ── Handshake ───────────────────────────────────────────────────────

/// Result of the HTTP handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub sid: String,
    /// Silence after which the connection is considered dead.
    pub heartbeat_timeout: Option<Duration>,
    pub close_timeout: Option<Duration>,
    pub transports: Vec<String>,
}

impl Handshake {
    /// Parse `sid:heartbeat:close:transports`.
    ///
    /// # Errors
    ///
    /// Returns [`RespokeError::Transport`] if the session id is missing.
    pub fn parse(body: &str) -> Result<Handshake> {
        let mut parts = body.trim().splitn(4, ':');
        let sid = parts.next().unwrap_or_default();
        if sid.is_empty() {
            return Err(malformed("handshake", body));
        }
        let seconds = |s: Option<&str>| {
            s.and_then(|s| s.parse::<u64>().ok())
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
        };
        let heartbeat_timeout = seconds(parts.next());
        let close_timeout = seconds(parts.next());
        let transports = parts
            .next()
            .unwrap_or_default()
            .split(',')
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Handshake {
            sid: sid.to_string(),
            heartbeat_timeout,
            close_timeout,
            transports,
        })
    }

    fn supports_websocket(&self) -> bool {
        self.transports.iter().any(|t| t == "websocket")
    }
}

fn handshake_url(url: &Url) -> Url {
    let mut handshake = url.clone();
    handshake.set_path(&format!("{SOCKET_IO_PATH}/"));
    handshake
}

fn websocket_url(url: &Url, sid: &str) -> Result<Url> {
    let mut ws = url.clone();
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    ws.set_scheme(scheme)
        .map_err(|()| RespokeError::Transport(format!("cannot use {scheme} for {url}")))?;
    ws.set_path(&format!("{SOCKET_IO_PATH}/websocket/{sid}"));
    Ok(ws)
}

// ── Connector ───────────────────────────────────────────────────────

/// [`Connector`] that opens socket.io channels over WebSocket.
#[derive(Debug, Clone, Default)]
pub struct SocketIoConnector {
    http: reqwest::Client,
}

impl SocketIoConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `http` for the handshake request.
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn handshake(&self, url: &Url) -> Result<Handshake> {
        let response = self.http.get(handshake_url(url)).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(RespokeError::UnexpectedServerResponse {
                status: status.as_u16(),
                body,
            });
        }
        Handshake::parse(&body)
    }

    async fn open(&self, url: &str, params: &ConnectParams) -> Result<SocketIoChannel> {
        let url = Url::parse(url)?;
        debug!(host = ?url.host_str(), force_new = params.force_new_connection, "socket.io handshake");

        let handshake = self.handshake(&url).await?;
        if !handshake.supports_websocket() {
            return Err(RespokeError::Transport(format!(
                "server offers no websocket transport: {:?}",
                handshake.transports
            )));
        }

        let ws_url = websocket_url(&url, &handshake.sid)?;
        let (stream, _response) = tokio_tungstenite::connect_async(ws_url.as_str())
            .await
            .map_err(|e| {
                let kind = match &e {
                    tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
                    _ => std::io::ErrorKind::Other,
                };
                RespokeError::Io(std::io::Error::new(kind, e))
            })?;
        info!(sid = %handshake.sid, "socket.io WebSocket established");

        Ok(SocketIoChannel::spawn(
            stream,
            handshake.heartbeat_timeout,
            params.connect_timeout,
        ))
    }
}

#[async_trait]
impl Connector for SocketIoConnector {
    async fn connect(
        &self,
        url: &str,
        params: &ConnectParams,
    ) -> Result<Arc<dyn RealtimeChannel>> {
        let channel = tokio::time::timeout(params.connect_timeout, self.open(url, params))
            .await
            .map_err(|_| RespokeError::Timeout)??;
        Ok(Arc::new(channel))
    }
}

// ── Channel ─────────────────────────────────────────────────────────

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What the connection task should do after a packet.
#[derive(Debug, PartialEq)]
enum Step {
    Continue,
    Reply(Packet),
    Stop(Option<String>),
}

/// State shared between the channel handle and its connection task.
#[derive(Default)]
struct Shared {
    handlers: Mutex<HashMap<ChannelEventKind, Vec<ChannelHandler>>>,
    held: Mutex<Vec<ChannelEvent>>,
    acks: Mutex<HashMap<u64, oneshot::Sender<String>>>,
    next_id: AtomicU64,
    connected: AtomicBool,
    /// A connect failure was reported; at most one per channel.
    connect_failed: AtomicBool,
    closing: AtomicBool,
    closed: AtomicBool,
}

impl Shared {
    /// Deliver `event`, or hold it until a handler of its kind exists.
    fn fire(&self, event: ChannelEvent) {
        let handlers = {
            let handlers = lock(&self.handlers);
            match handlers.get(&event.kind()) {
                Some(list) if !list.is_empty() => list.clone(),
                _ => {
                    debug!("holding {} until a handler is registered", event.kind());
                    lock(&self.held).push(event);
                    return;
                }
            }
        };
        for handler in handlers {
            handler(event.clone());
        }
    }

    fn register(&self, kind: ChannelEventKind, handler: ChannelHandler) {
        lock(&self.handlers)
            .entry(kind)
            .or_default()
            .push(Arc::clone(&handler));

        let ready: Vec<ChannelEvent> = {
            let mut held = lock(&self.held);
            let (ready, rest) = held.drain(..).partition(|e| e.kind() == kind);
            *held = rest;
            ready
        };
        for event in ready {
            handler(event);
        }
    }

    fn on_packet(&self, packet: Packet) -> Step {
        match packet {
            Packet::Connect => {
                if !self.connected.swap(true, Ordering::AcqRel) {
                    self.fire(ChannelEvent::Connect);
                }
                Step::Continue
            }
            Packet::Disconnect => Step::Stop(None),
            Packet::Heartbeat => Step::Reply(Packet::Heartbeat),
            Packet::Message(text) => {
                self.fire(ChannelEvent::Message(Value::String(text)));
                Step::Continue
            }
            Packet::Json(value) => {
                self.fire(ChannelEvent::Message(value));
                Step::Continue
            }
            Packet::Event { id, name, args } => {
                let payload = args.into_iter().next().unwrap_or(Value::Null);
                match ChannelEvent::content(&name, payload) {
                    Some(event) => self.fire(event),
                    None => debug!(name = %name, "ignoring unknown socket.io event"),
                }
                match id {
                    Some(id) => Step::Reply(Packet::Ack {
                        id,
                        args: Vec::new(),
                    }),
                    None => Step::Continue,
                }
            }
            Packet::Ack { id, args } => {
                let Some(tx) = lock(&self.acks).remove(&id) else {
                    debug!(id, "ack for unknown call");
                    return Step::Continue;
                };
                let text = match args.into_iter().next() {
                    Some(Value::String(text)) => text,
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                let _ = tx.send(text);
                Step::Continue
            }
            Packet::Error { reason, advice } => {
                warn!(advice = ?advice, "socket.io error: {reason}");
                if self.connected.load(Ordering::Acquire) {
                    self.fire(ChannelEvent::Error(reason));
                    Step::Continue
                } else {
                    self.fail_connect(ChannelEvent::ConnectError(reason));
                    Step::Stop(None)
                }
            }
            Packet::Noop => Step::Continue,
        }
    }

    /// Report a failed handshake unless one was already reported.
    fn fail_connect(&self, event: ChannelEvent) {
        if !self.connect_failed.swap(true, Ordering::AcqRel) {
            self.fire(event);
        }
    }

    /// Park the sender of call `id` until its ack arrives.
    ///
    /// Fails if the channel is closed, including when it closes while the
    /// sender is being stored.
    fn track_ack(&self, id: u64, tx: oneshot::Sender<String>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RespokeError::Transport("channel closed".into()));
        }
        lock(&self.acks).insert(id, tx);
        // `finish` sets `closed` before it drains `acks`.
        if self.closed.load(Ordering::Acquire) {
            lock(&self.acks).remove(&id);
            return Err(RespokeError::Transport("channel closed".into()));
        }
        Ok(())
    }

    /// Release pending calls and report the end of the channel, once.
    ///
    /// A channel that never connected reports a `connect_error` unless the
    /// close was requested locally.
    fn finish(&self, failure: Option<String>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        lock(&self.acks).clear();
        let closing = self.closing.load(Ordering::Acquire);
        if self.connected.swap(false, Ordering::AcqRel) {
            if let Some(reason) = failure {
                if !closing {
                    self.fire(ChannelEvent::Error(reason));
                }
            }
            self.fire(ChannelEvent::Disconnect);
        } else if !closing {
            let reason = failure.unwrap_or_else(|| "closed before connect".to_string());
            self.fail_connect(ChannelEvent::ConnectError(reason));
        }
    }
}

enum Outgoing {
    Packet(String),
    Close,
}

/// A live socket.io channel.
pub struct SocketIoChannel {
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SocketIoChannel {
    fn spawn<S>(stream: S, heartbeat: Option<Duration>, connect_timeout: Duration) -> Self
    where
        S: futures_util::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Send
            + Unpin
            + 'static,
    {
        let shared = Arc::new(Shared::default());
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(
            stream,
            outgoing_rx,
            Arc::clone(&shared),
            heartbeat,
            connect_timeout,
        ));
        Self {
            shared,
            outgoing,
            task: Mutex::new(Some(task)),
        }
    }
}

#[async_trait]
impl RealtimeChannel for SocketIoChannel {
    fn on(&self, kind: ChannelEventKind, handler: ChannelHandler) {
        self.shared.register(kind, handler);
    }

    async fn emit(&self, verb: Verb, payload: String) -> Result<String> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let packet = Packet::Event {
            id: Some(id),
            name: verb.as_str().to_string(),
            args: vec![Value::String(payload)],
        }
        .encode()?;

        let (tx, rx) = oneshot::channel();
        self.shared.track_ack(id, tx)?;
        if self.outgoing.send(Outgoing::Packet(packet)).is_err() {
            lock(&self.shared.acks).remove(&id);
            return Err(RespokeError::Transport("channel closed".into()));
        }
        rx.await
            .map_err(|_| RespokeError::Transport("channel closed before acknowledgement".into()))
    }

    async fn disconnect(&self) -> Result<()> {
        self.shared.closing.store(true, Ordering::Release);
        let _ = self.outgoing.send(Outgoing::Packet("0::".into()));
        let _ = self.outgoing.send(Outgoing::Close);
        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                debug!("socket.io task ended abnormally: {e}");
            }
        }
        self.shared.finish(None);
        Ok(())
    }
}

impl fmt::Debug for SocketIoChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketIoChannel")
            .field("connected", &self.shared.connected.load(Ordering::Acquire))
            .field("closed", &self.shared.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Drop for SocketIoChannel {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

/// Connection task: writes queued packets and dispatches incoming ones.
async fn run<S>(
    stream: S,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    shared: Arc<Shared>,
    heartbeat: Option<Duration>,
    connect_timeout: Duration,
) where
    S: futures_util::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut sink, mut stream) = stream.split();
    let idle = heartbeat.unwrap_or(NO_HEARTBEAT_IDLE);
    let connect_deadline = tokio::time::sleep(connect_timeout);
    tokio::pin!(connect_deadline);

    let failure = loop {
        tokio::select! {
            out = outgoing.recv() => match out {
                Some(Outgoing::Packet(text)) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        break Some(e.to_string());
                    }
                }
                Some(Outgoing::Close) | None => {
                    if let Err(e) = sink.close().await {
                        debug!("WebSocket close failed: {e}");
                    }
                    break None;
                }
            },

            frame = tokio::time::timeout(idle, stream.next()) => match frame {
                Err(_) => break Some("heartbeat timeout".to_string()),
                Ok(None) => break None,
                Ok(Some(Err(e))) => break Some(e.to_string()),
                Ok(Some(Ok(Message::Text(text)))) => {
                    let packet = match Packet::decode(&text) {
                        Ok(packet) => packet,
                        Err(e) => {
                            warn!("dropping socket.io packet: {e}");
                            continue;
                        }
                    };
                    match shared.on_packet(packet) {
                        Step::Continue => {}
                        Step::Reply(reply) => {
                            let sent = match reply.encode() {
                                Ok(text) => sink.send(Message::Text(text.into())).await,
                                Err(e) => {
                                    warn!("cannot encode reply: {e}");
                                    Ok(())
                                }
                            };
                            if let Err(e) = sent {
                                break Some(e.to_string());
                            }
                        }
                        Step::Stop(reason) => {
                            let _ = sink.close().await;
                            break reason;
                        }
                    }
                }
                Ok(Some(Ok(Message::Close(frame)))) => {
                    debug!(?frame, "received WebSocket close frame");
                    break None;
                }
                Ok(Some(Ok(_))) => {
                    // Ping/pong are answered by tungstenite; binary is not used.
                }
            },

            () = &mut connect_deadline, if !shared.connected.load(Ordering::Acquire) => {
                warn!("socket.io connect timed out");
                shared.fail_connect(ChannelEvent::ConnectTimeout);
                let _ = sink.close().await;
                break None;
            }
        }
    };

    shared.finish(failure);
    debug!("socket.io connection task exited");
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn recorder() -> (ChannelHandler, Arc<Mutex<Vec<ChannelEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: ChannelHandler = Arc::new(move |e| sink.lock().unwrap().push(e));
        (handler, seen)
    }

    // ── Codec ────────────────────────────────────────────────────────

    #[test]
    fn decodes_control_packets() {
        assert_eq!(Packet::decode("0::").unwrap(), Packet::Disconnect);
        assert_eq!(Packet::decode("1::").unwrap(), Packet::Connect);
        assert_eq!(Packet::decode("2::").unwrap(), Packet::Heartbeat);
        assert_eq!(Packet::decode("8::").unwrap(), Packet::Noop);
    }

    #[test]
    fn decodes_event_with_colons_in_payload() {
        let packet =
            Packet::decode(r#"5:::{"name":"pubsub","args":[{"url":"http://x:1"}]}"#).unwrap();
        assert_eq!(
            packet,
            Packet::Event {
                id: None,
                name: "pubsub".into(),
                args: vec![json!({ "url": "http://x:1" })],
            }
        );
    }

    #[test]
    fn decodes_ack_with_and_without_args() {
        assert_eq!(
            Packet::decode(r#"6:::4+["{\"id\":1}"]"#).unwrap(),
            Packet::Ack {
                id: 4,
                args: vec![json!("{\"id\":1}")],
            }
        );
        assert_eq!(
            Packet::decode("6:::9").unwrap(),
            Packet::Ack { id: 9, args: vec![] }
        );
    }

    #[test]
    fn decodes_error_with_advice() {
        assert_eq!(
            Packet::decode("7:::unauthorized+reconnect").unwrap(),
            Packet::Error {
                reason: "unauthorized".into(),
                advice: Some("reconnect".into()),
            }
        );
    }

    #[test]
    fn rejects_unknown_type_and_bad_ids() {
        assert!(Packet::decode("9::").is_err());
        assert!(Packet::decode("").is_err());
        assert!(Packet::decode("6:::x").is_err());
        assert!(Packet::decode(r#"5:abc+::{"name":"get"}"#).is_err());
    }

    #[test]
    fn encodes_event_requesting_ack() {
        let packet = Packet::Event {
            id: Some(3),
            name: "post".into(),
            args: vec![json!("{}")],
        };
        assert_eq!(
            packet.encode().unwrap(),
            r#"5:3+::{"name":"post","args":["{}"]}"#
        );
    }

    #[test]
    fn parses_handshake() {
        let hs = Handshake::parse("abc123:60:60:websocket,xhr-polling\n").unwrap();
        assert_eq!(hs.sid, "abc123");
        assert_eq!(hs.heartbeat_timeout, Some(Duration::from_secs(60)));
        assert!(hs.supports_websocket());

        let hs = Handshake::parse("abc:::xhr-polling").unwrap();
        assert_eq!(hs.heartbeat_timeout, None);
        assert!(!hs.supports_websocket());

        assert!(Handshake::parse("").is_err());
    }

    #[test]
    fn builds_socket_io_urls() {
        let url = Url::parse("https://api.respoke.io/?app-secret=s").unwrap();
        assert_eq!(
            handshake_url(&url).as_str(),
            "https://api.respoke.io/socket.io/1/?app-secret=s"
        );
        assert_eq!(
            websocket_url(&url, "sid1").unwrap().as_str(),
            "wss://api.respoke.io/socket.io/1/websocket/sid1?app-secret=s"
        );
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    #[test]
    fn events_are_held_until_a_handler_registers() {
        let shared = Shared::default();
        assert_eq!(shared.on_packet(Packet::Connect), Step::Continue);

        let (handler, seen) = recorder();
        shared.register(ChannelEventKind::Connect, handler);
        assert_eq!(*seen.lock().unwrap(), vec![ChannelEvent::Connect]);
        assert!(shared.held.lock().unwrap().is_empty());
    }

    #[test]
    fn server_error_before_connect_is_a_connect_error() {
        let shared = Shared::default();
        let (handler, seen) = recorder();
        shared.register(ChannelEventKind::ConnectError, handler);

        let step = shared.on_packet(Packet::Error {
            reason: "handshake unauthorized".into(),
            advice: None,
        });
        assert_eq!(step, Step::Stop(None));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ChannelEvent::ConnectError("handshake unauthorized".into())]
        );
    }

    #[test]
    fn finish_reports_disconnect_once_and_only_after_connect() {
        let shared = Shared::default();
        let (handler, seen) = recorder();
        shared.register(ChannelEventKind::Disconnect, handler);

        shared.finish(None);
        assert!(seen.lock().unwrap().is_empty());

        let shared = Shared::default();
        let (handler, seen) = recorder();
        shared.register(ChannelEventKind::Disconnect, handler);
        shared.on_packet(Packet::Connect);
        shared.finish(None);
        shared.finish(None);
        assert_eq!(*seen.lock().unwrap(), vec![ChannelEvent::Disconnect]);
    }

    #[test]
    fn finish_before_connect_reports_one_connect_error() {
        let shared = Shared::default();
        let (handler, seen) = recorder();
        shared.register(ChannelEventKind::ConnectError, handler);
        let (handler, disconnects) = recorder();
        shared.register(ChannelEventKind::Disconnect, handler);

        shared.finish(None);
        shared.finish(Some("again".into()));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ChannelEvent::ConnectError("closed before connect".into())]
        );
        assert!(disconnects.lock().unwrap().is_empty());
    }

    #[test]
    fn connect_timeout_is_not_followed_by_connect_error() {
        let shared = Shared::default();
        let (handler, seen) = recorder();
        shared.register(ChannelEventKind::ConnectTimeout, handler.clone());
        shared.register(ChannelEventKind::ConnectError, handler);

        shared.fail_connect(ChannelEvent::ConnectTimeout);
        shared.finish(None);
        assert_eq!(*seen.lock().unwrap(), vec![ChannelEvent::ConnectTimeout]);
    }

    #[test]
    fn local_close_before_connect_reports_nothing() {
        let shared = Shared::default();
        let (handler, seen) = recorder();
        shared.register(ChannelEventKind::ConnectError, handler);
        shared.closing.store(true, Ordering::Release);
        shared.finish(None);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn ack_tracking_fails_once_the_channel_closed() {
        let shared = Shared::default();
        let (tx, mut rx) = oneshot::channel();
        shared.track_ack(1, tx).unwrap();
        shared.finish(None);
        assert!(rx.try_recv().is_err());
        assert!(shared.acks.lock().unwrap().is_empty());

        let (tx, _rx) = oneshot::channel();
        assert!(matches!(
            shared.track_ack(2, tx),
            Err(RespokeError::Transport(_))
        ));
        assert!(shared.acks.lock().unwrap().is_empty());
    }

    #[test]
    fn heartbeat_is_answered() {
        let shared = Shared::default();
        assert_eq!(
            shared.on_packet(Packet::Heartbeat),
            Step::Reply(Packet::Heartbeat)
        );
    }

    // ── Mock-server helpers ──────────────────────────────────────────

    /// Serve one HTTP handshake then one WebSocket on the same port, running
    /// `handler` on the WebSocket. Returns the base URL to connect to.
    async fn start_mock_server<F, Fut>(handshake: &'static str, handler: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut tcp, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = tcp.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{handshake}",
                handshake.len()
            );
            tcp.write_all(response.as_bytes()).await.unwrap();
            tcp.shutdown().await.unwrap();

            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });

        format!("http://{addr}/?app-secret=s")
    }

    async fn next_text(
        ws: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    ) -> String {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return text.to_string(),
                _ => continue,
            }
        }
    }

    // ── Mock-server tests ────────────────────────────────────────────

    async fn connect_err(url: &str) -> RespokeError {
        match SocketIoConnector::new()
            .connect(url, &ConnectParams::default())
            .await
        {
            Ok(_) => panic!("connect to {url} unexpectedly succeeded"),
            Err(e) => e,
        }
    }

    #[tokio::test]
    async fn connect_fails_with_unreachable_host() {
        let err = connect_err("http://127.0.0.1:1/?app-token=t").await;
        assert!(matches!(err, RespokeError::Http(_)));
    }

    #[tokio::test]
    async fn connect_rejects_server_without_websocket() {
        let url = start_mock_server("sid:60:60:xhr-polling", |_ws| async {}).await;
        let err = connect_err(&url).await;
        assert!(matches!(err, RespokeError::Transport(_)));
    }

    #[tokio::test]
    async fn close_before_connect_packet_is_a_connect_error() {
        let url = start_mock_server("sid0:60:60:websocket", |mut ws| async move {
            let _ = ws.close(None).await;
        })
        .await;

        let channel = SocketIoConnector::new()
            .connect(&url, &ConnectParams::default())
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        for kind in ChannelEventKind::ALL {
            let tx = tx.clone();
            channel.on(
                kind,
                Arc::new(move |e| {
                    let _ = tx.send(e);
                }),
            );
        }

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no event after the server closed")
            .unwrap();
        assert!(
            matches!(event, ChannelEvent::ConnectError(_)),
            "got {event:?}"
        );
        channel.disconnect().await.unwrap();
        assert!(rx.try_recv().is_err(), "more than one failure reported");
    }

    #[tokio::test]
    async fn connect_event_and_emit_ack_round_trip() {
        let url = start_mock_server("sid1:60:60:websocket", |mut ws| async move {
            ws.send(Message::Text("1::".into())).await.unwrap();
            let call = next_text(&mut ws).await;
            let packet = Packet::decode(&call).unwrap();
            let Packet::Event { id: Some(id), name, args } = packet else {
                panic!("expected an event with ack id, got {call}");
            };
            assert_eq!(name, "post");
            let envelope: Value = serde_json::from_str(args[0].as_str().unwrap()).unwrap();
            assert_eq!(envelope["url"], "https://api.example/v1/connections");
            let ack = Packet::Ack {
                id,
                args: vec![json!(r#"{"id":"conn-1","endpointId":"alice"}"#)],
            };
            ws.send(Message::Text(ack.encode().unwrap().into()))
                .await
                .unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let channel = SocketIoConnector::new()
            .connect(&url, &ConnectParams::default())
            .await
            .unwrap();
        let (handler, seen) = recorder();
        channel.on(ChannelEventKind::Connect, handler);

        let reply = crate::channel::call(
            &*channel,
            "https://api.example/v1",
            vec![("App-Secret", "s".into())],
            Verb::Post,
            "/connections",
            &json!({ "endpointId": "alice" }),
        )
        .await
        .unwrap();
        assert_eq!(reply["id"], "conn-1");
        assert_eq!(*seen.lock().unwrap(), vec![ChannelEvent::Connect]);

        channel.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn content_events_are_delivered() {
        let url = start_mock_server("sid2:60:60:websocket", |mut ws| async move {
            ws.send(Message::Text("1::".into())).await.unwrap();
            ws.send(Message::Text(
                r#"5:::{"name":"join","args":[{"header":{"channel":"lobby"}}]}"#.into(),
            ))
            .await
            .unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let channel = SocketIoConnector::new()
            .connect(&url, &ConnectParams::default())
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.on(
            ChannelEventKind::Join,
            Arc::new(move |e| {
                let _ = tx.send(e);
            }),
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            ChannelEvent::Join(json!({ "header": { "channel": "lobby" } }))
        );
        channel.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn server_disconnect_fires_disconnect_and_fails_pending_calls() {
        let url = start_mock_server("sid3:60:60:websocket", |mut ws| async move {
            ws.send(Message::Text("1::".into())).await.unwrap();
            let _call = next_text(&mut ws).await;
            ws.send(Message::Text("0::".into())).await.unwrap();
            let _ = ws.close(None).await;
        })
        .await;

        let channel = SocketIoConnector::new()
            .connect(&url, &ConnectParams::default())
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.on(
            ChannelEventKind::Disconnect,
            Arc::new(move |e| {
                let _ = tx.send(e);
            }),
        );

        let err = channel
            .emit(Verb::Get, "{}".into())
            .await
            .unwrap_err();
        assert!(matches!(err, RespokeError::Transport(_)));
        assert_eq!(rx.recv().await.unwrap(), ChannelEvent::Disconnect);

        let err = channel.emit(Verb::Get, "{}".into()).await.unwrap_err();
        assert!(matches!(err, RespokeError::Transport(_)));
    }

    #[tokio::test]
    async fn server_heartbeat_gets_a_reply() {
        let (tx, rx) = oneshot::channel();
        let url = start_mock_server("sid4:60:60:websocket", |mut ws| async move {
            ws.send(Message::Text("1::".into())).await.unwrap();
            ws.send(Message::Text("2::".into())).await.unwrap();
            let reply = next_text(&mut ws).await;
            let _ = tx.send(reply);
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let channel = SocketIoConnector::new()
            .connect(&url, &ConnectParams::default())
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap(), "2::");
        channel.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn double_disconnect_is_idempotent() {
        let url = start_mock_server("sid5:60:60:websocket", |mut ws| async move {
            ws.send(Message::Text("1::".into())).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let channel = SocketIoConnector::new()
            .connect(&url, &ConnectParams::default())
            .await
            .unwrap();
        channel.disconnect().await.unwrap();
        channel.disconnect().await.unwrap();
    }
}
