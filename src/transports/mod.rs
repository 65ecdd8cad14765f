//! Realtime channel implementations behind feature gates.
//!
//! | Feature                | Connector              |
//! |------------------------|------------------------|
//! | `transport-websocket`  | [`SocketIoConnector`]  |
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use respoke_client::{RespokeClient, RespokeConfig, SocketIoConnector};
//!
//! let connector = SocketIoConnector::with_client(reqwest::Client::new());
//! let client = RespokeClient::new(
//!     RespokeConfig::new().with_connector(Arc::new(connector)),
//! );
//! ```

#[cfg(feature = "transport-websocket")]
pub mod socketio;

#[cfg(feature = "transport-websocket")]
pub use socketio::{Handshake, Packet, SocketIoChannel, SocketIoConnector};
