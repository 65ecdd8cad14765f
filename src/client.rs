//! Async client for the Respoke messaging service.
//!
//! [`RespokeClient`] is a thin handle. REST calls go straight through the
//! embedded [`RestGateway`]; everything that touches the realtime session is
//! sent to a background session task over an unbounded MPSC channel (see
//! [`session`](crate::session)). Events reach the application through the
//! client's [`EventBus`], either as callbacks or as a bounded receiver.
//!
//! # Example
//!
//! ```rust,ignore
//! let client = RespokeClient::new(
//!     RespokeConfig::new()
//!         .with_app_secret("secret")
//!         .with_autoreconnect(true),
//! );
//! let mut events = client.subscribe();
//!
//! client.connect(ConnectOptions::new().with_endpoint_id("alice"))?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         RespokeEvent::Connect => { /* registered */ }
//!         RespokeEvent::Message(msg) => { /* … */ }
//!         _ => {}
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tracing::{debug, warn};

use crate::channel::{self, Connector, RealtimeChannel, Verb};
use crate::credentials::{Credentials, TokenKind};
use crate::error::{RespokeError, Result};
use crate::event::{EventBus, EventKind, ListenerId, RespokeEvent, DEFAULT_SUBSCRIBER_CAPACITY};
use crate::realtime::{Groups, Messages, Presence};
use crate::reconnect::{ReconnectPolicy, ReconnectStatus};
use crate::rest::{Apps, Auth, RestGateway, Roles};
use crate::session::{
    session_loop, Command, ConnectOptions, Session, SessionPhase, SessionSettings, SessionSnapshot,
    SessionView,
};

/// Production API root.
pub const DEFAULT_BASE_URL: &str = "https://api.respoke.io/v1";

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`RespokeClient`].
///
/// Every field is optional. Credentials can also be supplied later, either per
/// `connect()` call or by the REST auth calls that store the tokens they obtain.
///
/// ```
/// use respoke_client::client::RespokeConfig;
/// use std::time::Duration;
///
/// let config = RespokeConfig::new()
///     .with_app_id("app-1")
///     .with_app_secret("secret")
///     .with_autoreconnect(true)
///     .with_shutdown_timeout(Duration::from_secs(5));
/// assert_eq!(config.base_url, "https://api.respoke.io/v1");
/// assert!(config.autoreconnect);
/// ```
#[derive(Clone)]
pub struct RespokeConfig {
    /// API root including the version segment.
    pub base_url: String,
    /// App used by calls that need one and were not given one.
    pub app_id: Option<String>,
    /// Initial credential store.
    pub credentials: Credentials,
    /// Endpoint id used by `connect()` when the call does not name one.
    pub endpoint_id: Option<String>,
    /// Restore the realtime session after unexpected disconnects.
    ///
    /// Requires an App-Secret. Defaults to `false`.
    pub autoreconnect: bool,
    /// Backoff bounds for autoreconnect.
    pub reconnect_policy: ReconnectPolicy,
    /// Opens realtime channels. `None` selects the built-in socket.io
    /// connector when the `transport-websocket` feature is enabled.
    pub connector: Option<Arc<dyn Connector>>,
    /// Capacity of each receiver returned by [`RespokeClient::subscribe`].
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// Time [`RespokeClient::shutdown`] waits for the session task.
    ///
    /// Defaults to **1 second**.
    pub shutdown_timeout: Duration,
}

impl Default for RespokeConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            app_id: None,
            credentials: Credentials::new(),
            endpoint_id: None,
            autoreconnect: false,
            reconnect_policy: ReconnectPolicy::default(),
            connector: None,
            event_channel_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl RespokeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    #[must_use]
    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    #[must_use]
    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.credentials = self.credentials.with_admin_token(token);
        self
    }

    #[must_use]
    pub fn with_app_secret(mut self, secret: impl Into<String>) -> Self {
        self.credentials = self.credentials.with_app_secret(secret);
        self
    }

    #[must_use]
    pub fn with_app_token(mut self, token: impl Into<String>) -> Self {
        self.credentials = self.credentials.with_app_token(token);
        self
    }

    #[must_use]
    pub fn with_endpoint_id(mut self, endpoint_id: impl Into<String>) -> Self {
        self.endpoint_id = Some(endpoint_id.into());
        self
    }

    #[must_use]
    pub fn with_autoreconnect(mut self, enabled: bool) -> Self {
        self.autoreconnect = enabled;
        self
    }

    #[must_use]
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    /// Use `connector` to open realtime channels.
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl fmt::Debug for RespokeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RespokeConfig")
            .field("base_url", &self.base_url)
            .field("app_id", &self.app_id)
            .field("credentials", &self.credentials)
            .field("endpoint_id", &self.endpoint_id)
            .field("autoreconnect", &self.autoreconnect)
            .field("reconnect_policy", &self.reconnect_policy)
            .field("has_connector", &self.connector.is_some())
            .field("event_channel_capacity", &self.event_channel_capacity)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

/// Stand-in used when no realtime transport is compiled in.
#[cfg(not(feature = "transport-websocket"))]
mod no_transport {
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::channel::{ConnectParams, Connector, RealtimeChannel};
    use crate::error::{RespokeError, Result};

    pub(super) struct NoConnector;

    #[async_trait]
    impl Connector for NoConnector {
        async fn connect(
            &self,
            _url: &str,
            _params: &ConnectParams,
        ) -> Result<Arc<dyn RealtimeChannel>> {
            Err(RespokeError::Transport(
                "no realtime connector configured".into(),
            ))
        }
    }
}

fn default_connector() -> Arc<dyn Connector> {
    #[cfg(feature = "transport-websocket")]
    {
        Arc::new(crate::transports::SocketIoConnector::new())
    }
    #[cfg(not(feature = "transport-websocket"))]
    {
        Arc::new(no_transport::NoConnector)
    }
}

// ── Client handle ───────────────────────────────────────────────────

/// Handle to one Respoke client.
///
/// Created with [`RespokeClient::new`], which spawns the background session
/// task; it must therefore be called inside a Tokio runtime. Session methods
/// return as soon as the command is queued. Their outcome arrives as events.
pub struct RespokeClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<SessionView>,
    events: EventBus,
    rest: RestGateway,
    credentials: Arc<RwLock<Credentials>>,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl RespokeClient {
    /// Create a client and start its session task.
    ///
    /// No network activity happens until [`connect`](Self::connect) or a REST
    /// call.
    pub fn new(config: RespokeConfig) -> Self {
        let credentials = Arc::new(RwLock::new(config.credentials));
        let events = EventBus::new(config.event_channel_capacity.max(1));
        let rest = RestGateway::new(
            config.base_url.clone(),
            config.app_id,
            Arc::clone(&credentials),
        );

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (view_tx, view) = watch::channel(SessionView::default());

        let settings = SessionSettings {
            base_url: rest.base_url().to_string(),
            default_endpoint_id: config.endpoint_id,
            autoreconnect: config.autoreconnect,
            reconnect_policy: config.reconnect_policy,
            connector: config.connector.unwrap_or_else(default_connector),
            credentials: Arc::clone(&credentials),
            events: events.clone(),
        };
        let session = Session::new(settings, input_tx, view_tx);
        let task = tokio::spawn(session_loop(session, cmd_rx, input_rx, shutdown_rx));

        Self {
            cmd_tx,
            view,
            events,
            rest,
            credentials,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    // ── Events ──────────────────────────────────────────────────────

    /// The client's event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Call `callback` for every event of `kind`.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&RespokeEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, callback)
    }

    /// Call `callback` for the next event of `kind` only.
    pub fn once<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&RespokeEvent) + Send + Sync + 'static,
    {
        self.events.once(kind, callback)
    }

    /// Remove a listener. Returns `false` if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    /// A receiver of every event emitted from now on.
    pub fn subscribe(&self) -> mpsc::Receiver<RespokeEvent> {
        self.events.subscribe()
    }

    // ── Session ─────────────────────────────────────────────────────

    /// Open the realtime session.
    ///
    /// Handlers on the new channel are registered by the session task after
    /// this call returns, so listeners attached right after `connect()` still
    /// observe the `Connect` event. Failures (no credentials, missing endpoint
    /// id, transport or registration errors) are emitted as
    /// [`RespokeEvent::Error`].
    ///
    /// # Errors
    ///
    /// Returns [`RespokeError::NotConnected`] if the session task has stopped.
    pub fn connect(&self, options: ConnectOptions) -> Result<()> {
        self.send(Command::Connect(options))
    }

    /// Disable autoreconnect, cancel any pending retry and disconnect.
    ///
    /// A later [`connect`](Self::connect) starts a fresh session with the
    /// configured autoreconnect setting.
    ///
    /// # Errors
    ///
    /// Returns [`RespokeError::NotConnected`] if the session task has stopped.
    pub async fn close(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Close(reply_tx))?;
        reply_rx.await.map_err(|_| RespokeError::NotConnected)
    }

    /// Run one autoreconnect attempt now, as if the retry timer had fired.
    ///
    /// # Errors
    ///
    /// Returns [`RespokeError::NotConnected`] if the session task has stopped.
    pub fn attempt_reconnect(&self) -> Result<()> {
        self.send(Command::AttemptReconnect)
    }

    /// Turn autoreconnect on or off. Turning it off cancels a pending retry.
    ///
    /// # Errors
    ///
    /// Returns [`RespokeError::NotConnected`] if the session task has stopped.
    pub fn set_autoreconnect(&self, enabled: bool) -> Result<()> {
        self.send(Command::SetAutoreconnect(enabled))
    }

    /// Gracefully stop the session task.
    ///
    /// The task closes the session (which disconnects the channel) and exits.
    /// If it does not finish within the configured shutdown timeout it is
    /// aborted. Further session commands fail with
    /// [`RespokeError::NotConnected`].
    pub async fn shutdown(&mut self) {
        debug!("RespokeClient: shutdown requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("session loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("session loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("session loop aborted: {join_err}");
                    }
                }
            }
        }
    }

    // ── State accessors ─────────────────────────────────────────────

    /// Current session state.
    pub fn session(&self) -> SessionSnapshot {
        self.view.borrow().snapshot.clone()
    }

    pub fn phase(&self) -> SessionPhase {
        self.view.borrow().snapshot.phase
    }

    /// Returns `true` once the registration handshake has completed.
    pub fn is_connected(&self) -> bool {
        self.phase() == SessionPhase::Connected
    }

    /// Endpoint id confirmed by the server, while connected.
    pub fn endpoint_id(&self) -> Option<String> {
        self.view.borrow().snapshot.endpoint_id.clone()
    }

    /// Connection id assigned by the server, while connected.
    pub fn connection_id(&self) -> Option<String> {
        self.view.borrow().snapshot.connection_id.clone()
    }

    /// Autoreconnect state as of the last processed input.
    pub fn reconnect_status(&self) -> Option<ReconnectStatus> {
        self.view.borrow().snapshot.reconnect
    }

    /// Wait until the session satisfies `predicate` and return that snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`RespokeError::NotConnected`] if the session task stops first.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<SessionSnapshot>
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let mut view = self.view.clone();
        let found = view
            .wait_for(|v| predicate(&v.snapshot))
            .await
            .map_err(|_| RespokeError::NotConnected)?;
        Ok(found.snapshot.clone())
    }

    // ── Credentials ─────────────────────────────────────────────────

    /// A copy of the credential store.
    pub async fn credentials(&self) -> Credentials {
        self.credentials.read().await.clone()
    }

    /// Assign or clear one stored credential.
    pub async fn set_token(&self, kind: TokenKind, value: Option<String>) {
        self.credentials.write().await.set_token(kind, value);
    }

    // ── REST ────────────────────────────────────────────────────────

    /// The REST gateway sharing this client's credentials.
    pub fn rest(&self) -> &RestGateway {
        &self.rest
    }

    pub fn auth(&self) -> Auth<'_> {
        self.rest.auth()
    }

    pub fn apps(&self) -> Apps<'_> {
        self.rest.apps()
    }

    pub fn roles(&self) -> Roles<'_> {
        self.rest.roles()
    }

    // ── Realtime calls ──────────────────────────────────────────────

    pub fn messages(&self) -> Messages<'_> {
        Messages::new(self)
    }

    pub fn presence(&self) -> Presence<'_> {
        Presence::new(self)
    }

    pub fn groups(&self) -> Groups<'_> {
        Groups::new(self)
    }

    /// Perform an HTTP-like call over the open realtime channel.
    ///
    /// # Errors
    ///
    /// - [`RespokeError::NotConnected`] if no channel is open
    /// - [`RespokeError::UnparseableResponse`] if the reply is not JSON
    /// - [`RespokeError::SocketErrorResponseFromServer`] if the reply carries an error
    pub async fn ws_call(&self, verb: Verb, path: &str, data: Value) -> Result<Value> {
        let channel = self.channel().ok_or(RespokeError::NotConnected)?;
        let headers = self.credentials.read().await.realtime_headers();
        channel::call(&*channel, self.rest.base_url(), headers, verb, path, &data).await
    }

    fn channel(&self) -> Option<Arc<dyn RealtimeChannel>> {
        self.view.borrow().channel.clone()
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| RespokeError::NotConnected)
    }
}

impl fmt::Debug for RespokeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RespokeClient")
            .field("base_url", &self.rest.base_url())
            .field("session", &self.session())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for RespokeClient {
    fn drop(&mut self) {
        // No executor is available to drive a graceful close here.
        if let Some(task) = self.task.take() {
            task.abort();
        }
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
    use crate::channel::ConnectParams;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Connector whose every attempt fails.
    struct FailingConnector {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Connector for FailingConnector {
        async fn connect(
            &self,
            _url: &str,
            _params: &ConnectParams,
        ) -> Result<Arc<dyn RealtimeChannel>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(RespokeError::Transport("refused".into()))
        }
    }

    fn failing() -> Arc<FailingConnector> {
        Arc::new(FailingConnector {
            calls: AtomicUsize::new(0),
        })
    }

    async fn next_error(rx: &mut mpsc::Receiver<RespokeEvent>) -> Arc<RespokeError> {
        loop {
            match rx.recv().await.expect("event stream ended") {
                RespokeEvent::Error(err) => return err,
                _ => continue,
            }
        }
    }

    #[test]
    fn config_defaults() {
        let config = RespokeConfig::new();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert!(!config.autoreconnect);
        assert!(config.credentials.is_empty());
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
    }

    #[test]
    fn config_clamps_capacity() {
        let config = RespokeConfig::new().with_event_channel_capacity(0);
        assert_eq!(config.event_channel_capacity, 1);
    }

    #[test]
    fn config_debug_hides_secrets() {
        let config = RespokeConfig::new().with_app_secret("hunter2");
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[tokio::test]
    async fn connect_without_tokens_emits_error() {
        let connector = failing();
        let client = RespokeClient::new(RespokeConfig::new().with_connector(connector.clone()));
        let mut rx = client.subscribe();

        client.connect(ConnectOptions::new()).unwrap();
        let err = next_error(&mut rx).await;
        assert!(matches!(*err, RespokeError::NoAuthenticationTokens));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn connect_as_admin_without_endpoint_emits_error() {
        let connector = failing();
        let client = RespokeClient::new(
            RespokeConfig::new()
                .with_admin_token("admin")
                .with_connector(connector.clone()),
        );
        let mut rx = client.subscribe();

        client.connect(ConnectOptions::new()).unwrap();
        let err = next_error(&mut rx).await;
        assert!(matches!(*err, RespokeError::MissingEndpointIdAsAdmin));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transport_failure_is_emitted() {
        let connector = failing();
        let client = RespokeClient::new(
            RespokeConfig::new()
                .with_app_token("tok")
                .with_connector(connector.clone()),
        );
        let mut rx = client.subscribe();

        client.connect(ConnectOptions::new()).unwrap();
        let err = next_error(&mut rx).await;
        assert!(matches!(*err, RespokeError::Transport(_)));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
        let snapshot = client
            .wait_for(|s| s.phase == SessionPhase::Disconnected)
            .await
            .unwrap();
        assert!(snapshot.connection_id.is_none());
    }

    #[tokio::test]
    async fn ws_call_without_channel_is_not_connected() {
        let client = RespokeClient::new(RespokeConfig::new().with_connector(failing()));
        let err = client
            .ws_call(Verb::Get, "/anything", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, RespokeError::NotConnected));
    }

    #[tokio::test]
    async fn commands_after_shutdown_fail() {
        let mut client = RespokeClient::new(RespokeConfig::new().with_connector(failing()));
        client.shutdown().await;
        assert!(matches!(
            client.connect(ConnectOptions::new()),
            Err(RespokeError::NotConnected)
        ));
        assert!(matches!(client.close().await, Err(RespokeError::NotConnected)));
    }

    #[tokio::test]
    async fn set_token_updates_shared_store() {
        let client = RespokeClient::new(RespokeConfig::new().with_connector(failing()));
        client
            .set_token(TokenKind::AppToken, Some("tok".into()))
            .await;
        assert_eq!(
            client.credentials().await.get(TokenKind::AppToken),
            Some("tok")
        );
    }
}
