//! Calls carried over the open realtime channel.
//!
//! Each group mirrors a REST resource but travels as a
//! [`ws_call`](crate::RespokeClient::ws_call), so it needs a connected
//! session and authenticates with the session's credentials.

use serde::Serialize;
use serde_json::{json, Value};
use url::Url;

use crate::channel::Verb;
use crate::client::RespokeClient;
use crate::error::{RespokeError, Result};

/// An outgoing direct message.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    /// Recipient endpoint.
    pub endpoint_id: String,
    /// Restrict delivery to one connection of the recipient.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    pub message: String,
    /// Message type. Defaults to `"message"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Also deliver to the sender's other connections. Defaults to `true`.
    pub cc_self: bool,
}

impl OutgoingMessage {
    pub fn new(endpoint_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            connection_id: None,
            message: message.into(),
            kind: "message".into(),
            cc_self: true,
        }
    }

    #[must_use]
    pub fn with_connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    #[must_use]
    pub fn with_cc_self(mut self, cc_self: bool) -> Self {
        self.cc_self = cc_self;
        self
    }
}

/// Presence to advertise for this connection.
#[derive(Debug, Clone, Serialize)]
pub struct PresenceUpdate {
    pub show: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Presence value, `"available"` unless set.
    #[serde(rename = "type")]
    pub presence: String,
}

impl Default for PresenceUpdate {
    fn default() -> Self {
        Self {
            show: true,
            status: None,
            presence: "available".into(),
        }
    }
}

impl PresenceUpdate {
    pub fn new(presence: impl Into<String>) -> Self {
        Self {
            presence: presence.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    #[must_use]
    pub fn with_show(mut self, show: bool) -> Self {
        self.show = show;
        self
    }
}

/// `/channels/{group_id}/{tail}` with the group id percent-encoded.
fn group_path(group_id: &str, tail: &str) -> Result<String> {
    if group_id.is_empty() {
        return Err(RespokeError::missing("groupId", "address a group"));
    }
    let mut url = Url::parse("http://localhost/channels")?;
    url.path_segments_mut()
        .map_err(|()| RespokeError::Transport("cannot build group path".into()))?
        .push(group_id)
        .push(tail);
    Ok(url.path().to_string())
}

/// Direct messaging.
#[derive(Debug, Clone, Copy)]
pub struct Messages<'a> {
    client: &'a RespokeClient,
}

impl<'a> Messages<'a> {
    pub(crate) fn new(client: &'a RespokeClient) -> Self {
        Self { client }
    }

    /// Send a message to another endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`RespokeError::Validation`] if `endpoint_id` is empty, or any
    /// error of [`RespokeClient::ws_call`].
    pub async fn send(&self, message: OutgoingMessage) -> Result<Value> {
        if message.endpoint_id.is_empty() {
            return Err(RespokeError::missing("endpointId", "send a message"));
        }
        let data = serde_json::to_value(&message)?;
        self.client.ws_call(Verb::Post, "/messages", data).await
    }
}

/// Presence of this connection and of others.
#[derive(Debug, Clone, Copy)]
pub struct Presence<'a> {
    client: &'a RespokeClient,
}

impl<'a> Presence<'a> {
    pub(crate) fn new(client: &'a RespokeClient) -> Self {
        Self { client }
    }

    /// Advertise this connection's presence.
    ///
    /// # Errors
    ///
    /// Any error of [`RespokeClient::ws_call`].
    pub async fn set(&self, update: PresenceUpdate) -> Result<Value> {
        let data = json!({ "presence": update });
        self.client.ws_call(Verb::Post, "/presence", data).await
    }

    /// Receive presence events for `endpoint_ids`.
    ///
    /// # Errors
    ///
    /// Returns [`RespokeError::Validation`] if the list is empty, or any error
    /// of [`RespokeClient::ws_call`].
    pub async fn observe(&self, endpoint_ids: &[&str]) -> Result<Value> {
        if endpoint_ids.is_empty() {
            return Err(RespokeError::missing("endpointList", "observe presence"));
        }
        let data = json!({ "endpointList": endpoint_ids });
        self.client
            .ws_call(Verb::Post, "/presence-observers", data)
            .await
    }
}

/// Group membership and publishing.
#[derive(Debug, Clone, Copy)]
pub struct Groups<'a> {
    client: &'a RespokeClient,
}

impl<'a> Groups<'a> {
    pub(crate) fn new(client: &'a RespokeClient) -> Self {
        Self { client }
    }

    /// Join a group. Members receive its `pubsub`, `join` and `leave` events.
    ///
    /// # Errors
    ///
    /// Returns [`RespokeError::Validation`] if `group_id` is empty, or any error
    /// of [`RespokeClient::ws_call`].
    pub async fn join(&self, group_id: &str) -> Result<Value> {
        let path = group_path(group_id, "subscribers")?;
        let data = json!({
            "endpointId": self.client.endpoint_id(),
            "connectionId": self.client.connection_id(),
        });
        self.client.ws_call(Verb::Post, &path, data).await
    }

    /// Leave a group.
    ///
    /// # Errors
    ///
    /// Returns [`RespokeError::Validation`] if `group_id` is empty, or any error
    /// of [`RespokeClient::ws_call`].
    pub async fn leave(&self, group_id: &str) -> Result<Value> {
        let path = group_path(group_id, "subscribers")?;
        let data = json!({
            "endpointId": self.client.endpoint_id(),
            "connectionId": self.client.connection_id(),
        });
        self.client.ws_call(Verb::Delete, &path, data).await
    }

    /// Publish `message` to every member of a group.
    ///
    /// # Errors
    ///
    /// Returns [`RespokeError::Validation`] if `group_id` is empty, or any error
    /// of [`RespokeClient::ws_call`].
    pub async fn publish(&self, group_id: &str, message: &str) -> Result<Value> {
        let path = group_path(group_id, "publish")?;
        let data = json!({
            "endpointId": self.client.endpoint_id(),
            "message": message,
        });
        self.client.ws_call(Verb::Post, &path, data).await
    }

    /// Current members of a group.
    ///
    /// # Errors
    ///
    /// Returns [`RespokeError::Validation`] if `group_id` is empty, or any error
    /// of [`RespokeClient::ws_call`].
    pub async fn subscribers(&self, group_id: &str) -> Result<Value> {
        let path = group_path(group_id, "subscribers")?;
        self.client.ws_call(Verb::Get, &path, Value::Null).await
    }
}
