//! # Respoke Client
//!
//! Async Rust client for the Respoke cloud messaging service.
//!
//! The crate covers two surfaces that share one credential store:
//!
//! - **REST administration**: admin login, endpoint token brokering, session
//!   token exchange, app lookup and role management ([`rest`])
//! - **Realtime session**: a socket-like channel carrying HTTP-like calls and
//!   server-pushed events (`message`, `presence`, `join`, `leave`, `pubsub`),
//!   with optional autoreconnect and exponential backoff ([`session`])
//!
//! ## Features
//!
//! - **Channel-agnostic**: implement [`Connector`] and [`RealtimeChannel`] for
//!   any socket-like backend
//! - **socket.io built-in**: the default `transport-websocket` feature provides
//!   [`SocketIoConnector`]
//! - **Event-driven**: attach callbacks or receive typed [`RespokeEvent`]s on a
//!   channel
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use respoke_client::{ConnectOptions, RespokeClient, RespokeConfig, RespokeEvent};
//!
//! # async fn run() -> Result<(), respoke_client::RespokeError> {
//! let client = RespokeClient::new(
//!     RespokeConfig::new()
//!         .with_app_secret("my-app-secret")
//!         .with_autoreconnect(true),
//! );
//! let mut events = client.subscribe();
//! client.connect(ConnectOptions::new().with_endpoint_id("alice"))?;
//!
//! while let Some(event) = events.recv().await {
//!     if let RespokeEvent::Connect = event {
//!         client.groups().join("lobby").await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod client;
pub mod credentials;
pub mod error;
pub mod event;
pub mod realtime;
pub mod reconnect;
pub mod rest;
pub mod session;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use channel::{
    ChannelEvent, ChannelEventKind, ConnectParams, Connector, RealtimeChannel, Verb,
};
pub use client::{RespokeClient, RespokeConfig};
pub use credentials::{Credentials, TokenKind};
pub use error::RespokeError;
pub use event::{EventBus, EventKind, ListenerId, RespokeEvent};
pub use realtime::{OutgoingMessage, PresenceUpdate};
pub use reconnect::{ReconnectPolicy, ReconnectStatus};
pub use rest::{EndpointAuthParams, RestGateway, Role};
pub use session::{ConnectOptions, SessionPhase, SessionSnapshot};

#[cfg(feature = "transport-websocket")]
pub use transports::SocketIoConnector;
