//! Realtime channel abstraction.
//!
//! The realtime side of Respoke runs over a socket-like bidirectional channel
//! that supports named events, emit-with-acknowledgement, and event
//! subscription. The [`RealtimeChannel`] trait captures exactly that surface;
//! a [`Connector`] opens one channel per connection attempt.
//!
//! The default implementation speaks socket.io over WebSocket (see
//! [`transports`](crate::transports)), but any implementation works. Tests use
//! an in-memory fake.
//!
//! # Implementing a Custom Channel
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use respoke_client::channel::{
//!     ChannelEventKind, ChannelHandler, ConnectParams, Connector, RealtimeChannel, Verb,
//! };
//! use respoke_client::RespokeError;
//!
//! struct MyChannel;
//!
//! #[async_trait]
//! impl RealtimeChannel for MyChannel {
//!     fn on(&self, kind: ChannelEventKind, handler: ChannelHandler) {
//!         // Remember the handler and call it whenever `kind` fires
//!         todo!()
//!     }
//!
//!     async fn emit(&self, verb: Verb, payload: String) -> Result<String, RespokeError> {
//!         // Send the envelope and wait for the server's acknowledgement
//!         todo!()
//!     }
//!
//!     async fn disconnect(&self) -> Result<(), RespokeError> {
//!         todo!()
//!     }
//! }
//!
//! struct MyConnector;
//!
//! #[async_trait]
//! impl Connector for MyConnector {
//!     async fn connect(
//!         &self,
//!         url: &str,
//!         params: &ConnectParams,
//!     ) -> Result<Arc<dyn RealtimeChannel>, RespokeError> {
//!         Ok(Arc::new(MyChannel))
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{RespokeError, Result};

/// Default time allowed for the channel handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(2000);

// ── Event kinds ─────────────────────────────────────────────────────

/// Low-level events a [`RealtimeChannel`] can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelEventKind {
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

impl ChannelEventKind {
    /// Every kind the session manager subscribes to, in registration order.
    pub const ALL: [ChannelEventKind; 12] = [
        ChannelEventKind::Connect,
        ChannelEventKind::Disconnect,
        ChannelEventKind::Reconnect,
        ChannelEventKind::Reconnecting,
        ChannelEventKind::Error,
        ChannelEventKind::ConnectError,
        ChannelEventKind::ConnectTimeout,
        ChannelEventKind::Message,
        ChannelEventKind::Presence,
        ChannelEventKind::Join,
        ChannelEventKind::Leave,
        ChannelEventKind::Pubsub,
    ];

    /// Wire name of the event.
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelEventKind::Connect => "connect",
            ChannelEventKind::Disconnect => "disconnect",
            ChannelEventKind::Reconnect => "reconnect",
            ChannelEventKind::Reconnecting => "reconnecting",
            ChannelEventKind::Error => "error",
            ChannelEventKind::ConnectError => "connect_error",
            ChannelEventKind::ConnectTimeout => "connect_timeout",
            ChannelEventKind::Message => "message",
            ChannelEventKind::Presence => "presence",
            ChannelEventKind::Join => "join",
            ChannelEventKind::Leave => "leave",
            ChannelEventKind::Pubsub => "pubsub",
        }
    }

    /// Parse a wire event name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

impl fmt::Display for ChannelEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A low-level event delivered by a [`RealtimeChannel`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The transport session is up.
    Connect,
    /// The transport session is gone.
    Disconnect,
    /// The transport re-established itself after `attempt` tries.
    Reconnect(u32),
    /// The transport is about to try reconnecting for the `attempt`-th time.
    Reconnecting(u32),
    /// Generic transport failure.
    Error(String),
    /// The handshake failed.
    ConnectError(String),
    /// The handshake did not complete in time.
    ConnectTimeout,
    Message(Value),
    Presence(Value),
    Join(Value),
    Leave(Value),
    Pubsub(Value),
}

impl ChannelEvent {
    /// The kind of this event.
    pub fn kind(&self) -> ChannelEventKind {
        match self {
            ChannelEvent::Connect => ChannelEventKind::Connect,
            ChannelEvent::Disconnect => ChannelEventKind::Disconnect,
            ChannelEvent::Reconnect(_) => ChannelEventKind::Reconnect,
            ChannelEvent::Reconnecting(_) => ChannelEventKind::Reconnecting,
            ChannelEvent::Error(_) => ChannelEventKind::Error,
            ChannelEvent::ConnectError(_) => ChannelEventKind::ConnectError,
            ChannelEvent::ConnectTimeout => ChannelEventKind::ConnectTimeout,
            ChannelEvent::Message(_) => ChannelEventKind::Message,
            ChannelEvent::Presence(_) => ChannelEventKind::Presence,
            ChannelEvent::Join(_) => ChannelEventKind::Join,
            ChannelEvent::Leave(_) => ChannelEventKind::Leave,
            ChannelEvent::Pubsub(_) => ChannelEventKind::Pubsub,
        }
    }

    /// Build a content event from its wire name and payload.
    ///
    /// Returns `None` for names that are not content events.
    pub fn content(name: &str, payload: Value) -> Option<Self> {
        match ChannelEventKind::from_name(name)? {
            ChannelEventKind::Message => Some(ChannelEvent::Message(payload)),
            ChannelEventKind::Presence => Some(ChannelEvent::Presence(payload)),
            ChannelEventKind::Join => Some(ChannelEvent::Join(payload)),
            ChannelEventKind::Leave => Some(ChannelEvent::Leave(payload)),
            ChannelEventKind::Pubsub => Some(ChannelEvent::Pubsub(payload)),
            _ => None,
        }
    }
}

/// Callback registered with [`RealtimeChannel::on`].
pub type ChannelHandler = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

// ── Verbs ───────────────────────────────────────────────────────────

/// HTTP-like verb used as the event name of a realtime call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Post,
    Put,
    Delete,
}

impl Verb {
    /// Lowercase event name sent over the channel.
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::Post => "post",
            Verb::Put => "put",
            Verb::Delete => "delete",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Connect parameters ──────────────────────────────────────────────

/// Socket-level parameters for opening a channel.
///
/// The first set used by a successful `connect()` is kept and replayed for
/// every autoreconnect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    /// Time allowed for the handshake.
    pub connect_timeout: Duration,
    /// Never reuse a previous transport session.
    pub force_new_connection: bool,
    /// Disconnect synchronously when the host is shutting down.
    pub sync_disconnect_on_unload: bool,
}

impl Default for ConnectParams {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            force_new_connection: true,
            sync_disconnect_on_unload: true,
        }
    }
}

impl ConnectParams {
    /// Set the handshake timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

// ── Traits ──────────────────────────────────────────────────────────

/// An open realtime channel.
///
/// # Handler delivery
///
/// Handlers must not block. Events that arrive before any handler of their
/// kind is registered are held and delivered on registration, so no `connect`
/// is lost between opening the channel and registering handlers.
#[async_trait]
pub trait RealtimeChannel: Send + Sync + 'static {
    /// Register `handler` for events of `kind`.
    fn on(&self, kind: ChannelEventKind, handler: ChannelHandler);

    /// Emit `payload` under the event name `verb` and wait for the server's
    /// acknowledgement, returned as raw text.
    ///
    /// # Errors
    ///
    /// Returns [`RespokeError::Transport`] if the channel cannot deliver the
    /// call or is closed before the acknowledgement arrives.
    async fn emit(&self, verb: Verb, payload: String) -> Result<String>;

    /// Close the channel. A `disconnect` event follows.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails. Resources are released
    /// regardless.
    async fn disconnect(&self) -> Result<()>;
}

/// Opens [`RealtimeChannel`]s.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a channel to `url`, which already carries the credential query.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel cannot be opened. Return
    /// [`RespokeError::Timeout`] when opening exceeds
    /// `params.connect_timeout`; the session reports it as a
    /// `connect_timeout` event rather than an `error`.
    async fn connect(&self, url: &str, params: &ConnectParams)
        -> Result<Arc<dyn RealtimeChannel>>;
}

// ── Realtime calls ──────────────────────────────────────────────────

/// Envelope of a realtime call.
#[derive(Debug, Serialize)]
struct CallEnvelope<'a> {
    url: String,
    headers: serde_json::Map<String, Value>,
    data: &'a Value,
}

/// Perform an HTTP-like call over the channel.
///
/// `headers` are the credential headers to send along. The acknowledgement
/// must be JSON; an object with a truthy `error` field is treated as a failure.
///
/// # Errors
///
/// - [`RespokeError::UnparseableResponse`] if the ack is not JSON
/// - [`RespokeError::SocketErrorResponseFromServer`] if the ack is an error envelope
/// - any error returned by [`RealtimeChannel::emit`]
pub async fn call(
    channel: &dyn RealtimeChannel,
    base_url: &str,
    headers: Vec<(&'static str, String)>,
    verb: Verb,
    path: &str,
    data: &Value,
) -> Result<Value> {
    let envelope = CallEnvelope {
        url: format!("{base_url}{path}"),
        headers: headers
            .into_iter()
            .map(|(name, value)| (name.to_string(), Value::String(value)))
            .collect(),
        data,
    };
    let payload = serde_json::to_string(&envelope)?;
    debug!(verb = %verb, path, "socket send");

    let ack = channel.emit(verb, payload).await?;
    let response: Value = serde_json::from_str(&ack).map_err(|e| {
        debug!(verb = %verb, path, "socket response could not be parsed: {e}");
        RespokeError::UnparseableResponse
    })?;

    if is_error_envelope(&response) {
        debug!(verb = %verb, path, ?response, "socket response error");
        return Err(RespokeError::SocketErrorResponseFromServer {
            verb: verb.as_str().to_string(),
            path: path.to_string(),
            response,
        });
    }

    debug!(verb = %verb, path, "socket response ok");
    Ok(response)
}

fn is_error_envelope(response: &Value) -> bool {
    match response.get("error") {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
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
    use std::sync::Mutex as StdMutex;

    /// Channel that acknowledges every emit with a fixed reply.
    struct ReplyChannel {
        reply: String,
        sent: StdMutex<Vec<(Verb, String)>>,
    }

    #[async_trait]
    impl RealtimeChannel for ReplyChannel {
        fn on(&self, _kind: ChannelEventKind, _handler: ChannelHandler) {}

        async fn emit(&self, verb: Verb, payload: String) -> Result<String> {
            self.sent.lock().unwrap().push((verb, payload));
            Ok(self.reply.clone())
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
    }

    fn reply(text: &str) -> ReplyChannel {
        ReplyChannel {
            reply: text.into(),
            sent: StdMutex::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn call_sends_envelope_under_verb() {
        let channel = reply(r#"{"id":"c1"}"#);
        let data = serde_json::json!({ "endpointId": "alice" });
        let out = call(
            &channel,
            "https://api.example/v1",
            vec![("App-Token", "tok".into())],
            Verb::Post,
            "/connections",
            &data,
        )
        .await
        .unwrap();
        assert_eq!(out["id"], "c1");

        let sent = channel.sent.lock().unwrap();
        let (verb, payload) = &sent[0];
        assert_eq!(*verb, Verb::Post);
        let envelope: Value = serde_json::from_str(payload).unwrap();
        assert_eq!(envelope["url"], "https://api.example/v1/connections");
        assert_eq!(envelope["headers"]["App-Token"], "tok");
        assert_eq!(envelope["data"]["endpointId"], "alice");
    }

    #[tokio::test]
    async fn call_rejects_unparseable_ack() {
        let channel = reply("<html>");
        let err = call(&channel, "", vec![], Verb::Get, "/x", &Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, RespokeError::UnparseableResponse));
    }

    #[tokio::test]
    async fn call_rejects_error_envelope() {
        let channel = reply(r#"{"error":"nope"}"#);
        let err = call(&channel, "", vec![], Verb::Delete, "/x", &Value::Null)
            .await
            .unwrap_err();
        match err {
            RespokeError::SocketErrorResponseFromServer { verb, path, response } => {
                assert_eq!(verb, "delete");
                assert_eq!(path, "/x");
                assert_eq!(response["error"], "nope");
            }
            other => panic!("expected SocketErrorResponseFromServer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn falsy_error_field_is_not_an_error() {
        let channel = reply(r#"{"error":null,"ok":true}"#);
        let out = call(&channel, "", vec![], Verb::Get, "/x", &Value::Null)
            .await
            .unwrap();
        assert_eq!(out["ok"], true);
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in ChannelEventKind::ALL {
            assert_eq!(ChannelEventKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(ChannelEventKind::from_name("bogus"), None);
    }

    #[test]
    fn content_only_builds_content_events() {
        let v = serde_json::json!({});
        assert!(matches!(
            ChannelEvent::content("pubsub", v.clone()),
            Some(ChannelEvent::Pubsub(_))
        ));
        assert!(ChannelEvent::content("connect", v).is_none());
    }
}
