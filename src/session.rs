//! Connection session manager.
//!
//! One background task per client owns the realtime session: the open
//! channel, the endpoint and connection ids, the stored connect parameters and
//! the [`ReconnectController`]. It reacts to one input at a time (a command
//! from the client handle, a channel event, a finished handshake, or the
//! reconnect timer) and runs each to completion before the next, so no two
//! state transitions ever interleave. Network I/O runs in spawned tasks that
//! post their results back.
//!
//! ```text
//! Idle ──connect()──▶ Connecting ──registered──▶ Connected
//!                        │  ▲                        │
//!         registration   │  │ timer (autoreconnect)  │ disconnect
//!              failure   ▼  │                        ▼
//!                      Disconnected ◀────────────────┘
//!
//! any ──close()──▶ Closed
//! ```

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::channel::{
    self, ChannelEvent, ChannelEventKind, ConnectParams, Connector, RealtimeChannel, Verb,
};
use crate::credentials::{Credential, Credentials, TokenKind};
use crate::error::{RespokeError, Result};
use crate::event::{normalize_group_header, EventBus, RespokeEvent};
use crate::reconnect::{ReconnectController, ReconnectPolicy, ReconnectStatus};

// ── Public state ────────────────────────────────────────────────────

/// Lifecycle phase of the realtime session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// `connect()` has never been called.
    #[default]
    Idle,
    /// A channel is being opened or registered.
    Connecting,
    /// Registered; `connection_id` is valid.
    Connected,
    /// The channel went away or registration failed.
    Disconnected,
    /// `close()` was called. Only an explicit `connect()` leaves this phase.
    Closed,
}

/// Point-in-time copy of the session state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    /// Endpoint id confirmed by the registration handshake.
    pub endpoint_id: Option<String>,
    /// Connection id assigned by the registration handshake.
    pub connection_id: Option<String>,
    pub reconnect: Option<ReconnectStatus>,
}

/// What the session task publishes for the client handle.
#[derive(Clone, Default)]
pub(crate) struct SessionView {
    pub snapshot: SessionSnapshot,
    pub channel: Option<Arc<dyn RealtimeChannel>>,
}

// ── Task inputs ─────────────────────────────────────────────────────

/// Options of one `connect()` call.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Credentials that override the client's for this connection.
    pub credentials: Credentials,
    /// Endpoint to connect as. Required for Admin-Token and App-Secret.
    pub endpoint_id: Option<String>,
    /// Free-form client type tag sent with the registration.
    pub client_type: Option<String>,
    /// Socket parameters. Only the first set used is kept for reconnects.
    pub connect_params: Option<ConnectParams>,
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    #[must_use]
    pub fn with_endpoint_id(mut self, endpoint_id: impl Into<String>) -> Self {
        self.endpoint_id = Some(endpoint_id.into());
        self
    }

    #[must_use]
    pub fn with_client_type(mut self, client_type: impl Into<String>) -> Self {
        self.client_type = Some(client_type.into());
        self
    }

    #[must_use]
    pub fn with_connect_params(mut self, params: ConnectParams) -> Self {
        self.connect_params = Some(params);
        self
    }
}

/// Commands sent by the client handle.
pub(crate) enum Command {
    Connect(ConnectOptions),
    AttemptReconnect,
    SetAutoreconnect(bool),
    Close(oneshot::Sender<()>),
}

/// Completions posted back by channel handlers and spawned I/O.
pub(crate) enum Input {
    Opened {
        generation: u64,
        result: Result<Arc<dyn RealtimeChannel>>,
    },
    Channel {
        generation: u64,
        event: ChannelEvent,
    },
    Registered {
        generation: u64,
        result: Result<Value>,
    },
}

/// Static configuration of the session task.
pub(crate) struct SessionSettings {
    pub base_url: String,
    pub default_endpoint_id: Option<String>,
    pub autoreconnect: bool,
    pub reconnect_policy: ReconnectPolicy,
    pub connector: Arc<dyn Connector>,
    pub credentials: Arc<RwLock<Credentials>>,
    pub events: EventBus,
}

/// What a connection attempt was asked to do, kept for reconnects.
#[derive(Debug, Clone, Default)]
struct ConnectRequest {
    credentials: Credentials,
    endpoint_id: Option<String>,
    client_type: Option<String>,
    connect_params: ConnectParams,
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Realtime URL for `base_url`: the path is dropped and `credential` becomes
/// the only query parameter.
///
/// # Errors
///
/// Returns [`RespokeError::InvalidUrl`] if `base_url` is not an absolute URL.
pub fn connection_url(base_url: &str, credential: &Credential) -> Result<String> {
    let mut url = Url::parse(base_url)?;
    url.set_path("");
    url.set_query(None);
    url.set_fragment(None);
    url.query_pairs_mut()
        .append_pair(credential.kind.query_name(), &credential.value);
    Ok(url.to_string())
}

/// Body of the registration call.
fn registration_body(request: &ConnectRequest) -> Value {
    let mut body = Map::new();
    if let Some(endpoint_id) = &request.endpoint_id {
        body.insert("endpointId".into(), Value::String(endpoint_id.clone()));
    }
    if let Some(client_type) = &request.client_type {
        body.insert("clientType".into(), Value::String(client_type.clone()));
    }
    Value::Object(body)
}

fn string_field(data: &Value, field: &str) -> Option<String> {
    data.get(field).and_then(Value::as_str).map(str::to_string)
}

// ── Session ─────────────────────────────────────────────────────────

pub(crate) struct Session {
    settings: SessionSettings,
    input_tx: mpsc::UnboundedSender<Input>,
    published: watch::Sender<SessionView>,
    reconnect: ReconnectController,
    phase: SessionPhase,
    generation: u64,
    channel: Option<Arc<dyn RealtimeChannel>>,
    endpoint_id: Option<String>,
    connection_id: Option<String>,
    /// Endpoint to resume as after an unexpected disconnect.
    resume_endpoint_id: Option<String>,
    connect_params: Option<ConnectParams>,
    last_request: Option<ConnectRequest>,
}

impl Session {
    pub(crate) fn new(
        settings: SessionSettings,
        input_tx: mpsc::UnboundedSender<Input>,
        published: watch::Sender<SessionView>,
    ) -> Self {
        let reconnect = ReconnectController::new(settings.autoreconnect, settings.reconnect_policy);
        let session = Self {
            settings,
            input_tx,
            published,
            reconnect,
            phase: SessionPhase::Idle,
            generation: 0,
            channel: None,
            endpoint_id: None,
            connection_id: None,
            resume_endpoint_id: None,
            connect_params: None,
            last_request: None,
        };
        session.publish();
        session
    }

    fn publish(&self) {
        self.published.send_replace(SessionView {
            snapshot: SessionSnapshot {
                phase: self.phase,
                endpoint_id: self.endpoint_id.clone(),
                connection_id: self.connection_id.clone(),
                reconnect: Some(self.reconnect.status()),
            },
            channel: self.channel.clone(),
        });
    }

    fn emit(&self, event: RespokeEvent) {
        self.settings.events.emit(event);
    }

    // ── Commands ────────────────────────────────────────────────────

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(options) => {
                debug!(endpoint_id = ?options.endpoint_id, "auth connect");
                // A deliberate connect starts the reconnect tracking over.
                self.reconnect.abandon_attempt();
                self.reconnect.reset();
                if self.phase == SessionPhase::Closed {
                    self.reconnect.set_enabled(self.settings.autoreconnect);
                }
                let stored = self.settings.credentials.read().await.clone();
                let credentials = stored.merged_with(&options.credentials);
                self.open(options, credentials);
            }
            Command::AttemptReconnect => self.attempt().await,
            Command::SetAutoreconnect(enabled) => {
                info!(enabled, "autoreconnect toggled");
                self.settings.autoreconnect = enabled;
                self.reconnect.set_enabled(enabled);
            }
            Command::Close(reply) => {
                self.close().await;
                self.publish();
                let _ = reply.send(());
            }
        }
    }

    /// Validate `options` and start opening a channel.
    fn open(&mut self, options: ConnectOptions, credentials: Credentials) {
        let credential = match credentials.get_strongest() {
            Ok(credential) => credential,
            Err(e) => return self.connect_failed(e),
        };

        let endpoint_id = options
            .endpoint_id
            .or_else(|| self.settings.default_endpoint_id.clone());
        if credential.kind.requires_endpoint_id() && endpoint_id.is_none() {
            return self.connect_failed(RespokeError::MissingEndpointIdAsAdmin);
        }

        let url = match connection_url(&self.settings.base_url, &credential) {
            Ok(url) => url,
            Err(e) => return self.connect_failed(e),
        };

        let params = options
            .connect_params
            .or_else(|| self.connect_params.clone())
            .unwrap_or_default();

        self.last_request = Some(ConnectRequest {
            credentials,
            endpoint_id,
            client_type: options.client_type,
            connect_params: params.clone(),
        });

        self.retire_channel();
        self.generation = self.generation.wrapping_add(1);
        self.phase = SessionPhase::Connecting;
        info!(kind = %credential.kind, generation = self.generation, "web socket connecting");

        let generation = self.generation;
        let connector = Arc::clone(&self.settings.connector);
        let input_tx = self.input_tx.clone();
        tokio::spawn(async move {
            let result = connector.connect(&url, &params).await;
            let _ = input_tx.send(Input::Opened { generation, result });
        });
    }

    /// A connection attempt failed before a channel existed.
    fn connect_failed(&mut self, err: RespokeError) {
        warn!("connect failed: {err}");
        self.emit(RespokeEvent::error(err));
        if let Some(delay) = self.reconnect.attempt_failed() {
            debug!(delay_ms = delay.as_millis() as u64, "autoreconnect attempt failed");
        }
    }

    /// Drop the current channel; events it still delivers are ignored.
    fn retire_channel(&mut self) {
        self.endpoint_id = None;
        self.connection_id = None;
        if let Some(old) = self.channel.take() {
            debug!("replacing existing channel");
            tokio::spawn(async move {
                if let Err(e) = old.disconnect().await {
                    debug!("old channel disconnect failed: {e}");
                }
            });
        }
    }

    async fn close(&mut self) {
        info!(endpoint_id = ?self.endpoint_id, "closing");
        // Autoreconnect goes off before the channel is told to disconnect, so
        // the resulting disconnect event cannot schedule anything.
        self.reconnect.set_enabled(false);
        self.phase = SessionPhase::Closed;
        self.endpoint_id = None;
        self.connection_id = None;
        self.resume_endpoint_id = None;
        self.last_request = None;
        self.settings.credentials.write().await.clear();
        debug!("credentials cleared");
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.disconnect().await {
                warn!("channel disconnect failed: {e}");
            }
        }
    }

    // ── Autoreconnect ───────────────────────────────────────────────

    async fn durable_secret(&self) -> Option<String> {
        let from_request = self
            .last_request
            .as_ref()
            .and_then(|r| r.credentials.get(TokenKind::AppSecret))
            .map(str::to_string);
        match from_request {
            Some(secret) => Some(secret),
            None => self
                .settings
                .credentials
                .read()
                .await
                .get(TokenKind::AppSecret)
                .map(str::to_string),
        }
    }

    /// Reconnect with the stored parameters and the App-Secret.
    async fn attempt(&mut self) {
        let attempt = self.reconnect.begin_attempt();
        info!(attempt, endpoint_id = ?self.resume_endpoint_id, "autoreconnect attempt");

        let Some(secret) = self.durable_secret().await else {
            self.reconnect.abandon_attempt();
            self.emit(RespokeEvent::error(
                RespokeError::MissingAppSecretDuringAutoreconnect,
            ));
            return;
        };

        let request = self.last_request.clone().unwrap_or_default();
        let options = ConnectOptions {
            credentials: Credentials::new().with_app_secret(secret.clone()),
            endpoint_id: self.resume_endpoint_id.clone().or(request.endpoint_id),
            client_type: request.client_type,
            connect_params: self
                .connect_params
                .clone()
                .or(Some(request.connect_params)),
        };
        self.open(options, Credentials::new().with_app_secret(secret));
    }

    // ── Inputs ──────────────────────────────────────────────────────

    async fn handle_input(&mut self, input: Input) {
        match input {
            Input::Opened { generation, result } => self.on_opened(generation, result),
            Input::Channel { generation, event } => {
                if generation != self.generation {
                    debug!(generation, "ignoring {} from a retired channel", event.kind());
                    return;
                }
                self.on_channel_event(event).await;
            }
            Input::Registered { generation, result } => {
                if generation != self.generation {
                    debug!(generation, "ignoring registration of a retired channel");
                    return;
                }
                self.on_registered(result);
            }
        }
    }

    fn on_opened(&mut self, generation: u64, result: Result<Arc<dyn RealtimeChannel>>) {
        if generation != self.generation || self.phase == SessionPhase::Closed {
            if let Ok(channel) = result {
                debug!(generation, "closing channel opened for a retired attempt");
                tokio::spawn(async move {
                    let _ = channel.disconnect().await;
                });
            }
            return;
        }

        match result {
            Ok(channel) => {
                // This runs on a later turn of the task than the `connect()`
                // call, so the caller had a chance to attach its own listeners.
                for kind in ChannelEventKind::ALL {
                    let input_tx = self.input_tx.clone();
                    channel.on(
                        kind,
                        Arc::new(move |event| {
                            let _ = input_tx.send(Input::Channel { generation, event });
                        }),
                    );
                }
                debug!(generation, "channel handlers registered");
                self.channel = Some(channel);
            }
            Err(RespokeError::Timeout) => {
                error!("web socket connect timed out");
                self.phase = SessionPhase::Disconnected;
                self.emit(RespokeEvent::ConnectTimeout);
                self.reconnect.attempt_failed();
            }
            Err(e) => {
                error!("web socket connect failed: {e}");
                self.phase = SessionPhase::Disconnected;
                self.connect_failed(e);
            }
        }
    }

    async fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connect => self.register(),
            ChannelEvent::Disconnect => self.on_disconnect().await,
            ChannelEvent::Reconnect(attempt) => {
                debug!(endpoint_id = ?self.endpoint_id, attempt, "event reconnect");
                self.reconnect.succeeded();
                self.emit(RespokeEvent::Reconnect { attempt });
            }
            ChannelEvent::Reconnecting(attempt) => {
                debug!(endpoint_id = ?self.endpoint_id, attempt, "event reconnecting");
                self.emit(RespokeEvent::Reconnecting { attempt });
            }
            ChannelEvent::Error(reason) => {
                debug!(endpoint_id = ?self.endpoint_id, "event error: {reason}");
                self.emit(RespokeEvent::error(RespokeError::Transport(reason)));
                self.handshake_failed();
            }
            ChannelEvent::ConnectError(reason) => {
                debug!(endpoint_id = ?self.endpoint_id, "event connect_error: {reason}");
                self.emit(RespokeEvent::ConnectError { reason });
                self.handshake_failed();
            }
            ChannelEvent::ConnectTimeout => {
                debug!(endpoint_id = ?self.endpoint_id, "event connect_timeout");
                self.emit(RespokeEvent::ConnectTimeout);
                self.handshake_failed();
            }
            ChannelEvent::Message(msg) => self.emit(RespokeEvent::Message(msg)),
            ChannelEvent::Presence(res) => self.emit(RespokeEvent::Presence(res)),
            ChannelEvent::Join(res) => self.emit(RespokeEvent::Join(normalize_group_header(&res))),
            ChannelEvent::Leave(res) => {
                self.emit(RespokeEvent::Leave(normalize_group_header(&res)));
            }
            ChannelEvent::Pubsub(res) => {
                self.emit(RespokeEvent::Pubsub(normalize_group_header(&res)));
            }
        }
    }

    /// A channel failure. Before registration completes it ends the attempt:
    /// the channel is retired and later events from it are ignored.
    fn handshake_failed(&mut self) {
        if self.phase == SessionPhase::Connecting {
            self.retire_channel();
            self.generation = self.generation.wrapping_add(1);
            self.phase = SessionPhase::Disconnected;
        }
        if let Some(delay) = self.reconnect.attempt_failed() {
            debug!(delay_ms = delay.as_millis() as u64, "autoreconnect attempt failed");
        }
    }

    /// Bind the transport session to an endpoint with `post /connections`.
    fn register(&mut self) {
        let Some(channel) = self.channel.clone() else {
            warn!("connect event without a channel");
            return;
        };
        let request = self.last_request.clone().unwrap_or_default();
        debug!(endpoint_id = ?request.endpoint_id, "event connect, registering");

        let generation = self.generation;
        let base_url = self.settings.base_url.clone();
        let headers = request.credentials.realtime_headers();
        let body = registration_body(&request);
        let input_tx = self.input_tx.clone();
        tokio::spawn(async move {
            let result =
                channel::call(&*channel, &base_url, headers, Verb::Post, "/connections", &body)
                    .await;
            let _ = input_tx.send(Input::Registered { generation, result });
        });
    }

    fn on_registered(&mut self, result: Result<Value>) {
        match result {
            Ok(data) => {
                let requested = self.last_request.as_ref().and_then(|r| r.endpoint_id.clone());
                self.endpoint_id = string_field(&data, "endpointId").or(requested);
                self.connection_id = string_field(&data, "id");
                self.resume_endpoint_id = self.endpoint_id.clone();
                if self.connect_params.is_none() {
                    self.connect_params =
                        self.last_request.as_ref().map(|r| r.connect_params.clone());
                }
                self.phase = SessionPhase::Connected;
                if self.reconnect.is_in_flight() {
                    info!(endpoint_id = ?self.endpoint_id, "autoreconnect succeeded");
                }
                self.reconnect.succeeded();
                info!(
                    endpoint_id = ?self.endpoint_id,
                    connection_id = ?self.connection_id,
                    "connected"
                );
                self.emit(RespokeEvent::Connect);
            }
            Err(e) => {
                // Surfaced, not retried, unless an autoreconnect attempt is in flight.
                error!("connection registration failed: {e}");
                self.phase = SessionPhase::Disconnected;
                self.emit(RespokeEvent::error(e));
                self.reconnect.attempt_failed();
            }
        }
    }

    async fn on_disconnect(&mut self) {
        debug!(endpoint_id = ?self.endpoint_id, "event disconnect");
        self.reconnect.clear_timeout();
        self.reconnect.abandon_attempt();
        if let Some(endpoint_id) = self.endpoint_id.take() {
            self.resume_endpoint_id = Some(endpoint_id);
        }
        self.connection_id = None;
        self.channel = None;
        if self.phase != SessionPhase::Closed {
            self.phase = SessionPhase::Disconnected;
        }
        self.emit(RespokeEvent::Disconnect);

        if !self.reconnect.is_enabled() {
            return;
        }
        if self.durable_secret().await.is_none() {
            warn!("autoreconnect enabled without an App-Secret");
            self.emit(RespokeEvent::error(
                RespokeError::MissingAppSecretDuringAutoreconnect,
            ));
            return;
        }
        let delay = self.reconnect.schedule_retry();
        info!(delay_ms = delay.as_millis() as u64, "autoreconnect scheduled after disconnect");
    }
}

// ── Task loop ───────────────────────────────────────────────────────

/// Background task driving one [`Session`].
///
/// Exits when the command channel closes (client handle dropped) or the
/// shutdown signal fires; both close the session first.
pub(crate) async fn session_loop(
    mut session: Session,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    mut input_rx: mpsc::UnboundedReceiver<Input>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    debug!("session loop started");

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => session.handle_command(cmd).await,
                None => {
                    debug!("command channel closed, shutting down session loop");
                    session.close().await;
                    break;
                }
            },

            Some(input) = input_rx.recv() => session.handle_input(input).await,

            () = session.reconnect.expired() => {
                debug!("autoreconnect timer fired");
                session.attempt().await;
            }

            _ = &mut shutdown_rx => {
                debug!("shutdown signal received");
                session.close().await;
                break;
            }
        }
        session.publish();
    }

    session.publish();
    debug!("session loop exited");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn connection_url_drops_path_and_adds_query() {
        let credential = Credential {
            kind: TokenKind::AppSecret,
            value: "s3cr3t".into(),
        };
        let url = connection_url("https://api.respoke.io/v1", &credential).unwrap();
        assert_eq!(url, "https://api.respoke.io/?app-secret=s3cr3t");
    }

    #[test]
    fn connection_url_encodes_token() {
        let credential = Credential {
            kind: TokenKind::AppToken,
            value: "a b&c".into(),
        };
        let url = connection_url("http://localhost:2000/v1?x=1", &credential).unwrap();
        assert_eq!(url, "http://localhost:2000/?app-token=a+b%26c");
    }

    #[test]
    fn connection_url_rejects_relative_base() {
        let credential = Credential {
            kind: TokenKind::AdminToken,
            value: "t".into(),
        };
        assert!(matches!(
            connection_url("/v1", &credential),
            Err(RespokeError::InvalidUrl(_))
        ));
    }

    #[test]
    fn registration_body_only_has_present_fields() {
        let request = ConnectRequest {
            endpoint_id: Some("alice".into()),
            ..Default::default()
        };
        assert_eq!(
            registration_body(&request),
            serde_json::json!({ "endpointId": "alice" })
        );
        assert_eq!(
            registration_body(&ConnectRequest::default()),
            serde_json::json!({})
        );
    }
}
