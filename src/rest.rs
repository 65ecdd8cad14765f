//! REST gateway for administrative calls.
//!
//! Every call validates its required fields before touching the network and
//! maps non-2xx responses to [`RespokeError::UnexpectedServerResponse`].
//! Successful authentication calls store the returned token in the shared
//! [`Credentials`].

use std::sync::Arc;

use reqwest::{Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::credentials::{Credentials, TokenKind};
use crate::error::{RespokeError, Result};

/// Default lifetime, in seconds, of a brokered endpoint token.
pub const DEFAULT_ENDPOINT_TOKEN_TTL: u64 = 84_600;

// ── Request and response types ──────────────────────────────────────

/// Token returned by `POST /adminsessions` and `POST /session-tokens`.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionToken {
    /// The token value, stored in the credential set.
    pub token: String,
    /// Every other field of the response.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Brokered token returned by `POST /tokens`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokeredToken {
    /// Single-use id to exchange for a session token.
    pub token_id: String,
    /// Every other field of the response.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Parameters of [`Auth::endpoint`].
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointAuthParams {
    /// App to issue the token for. Defaults to the client's app id.
    pub app_id: Option<String>,
    /// Endpoint the token will be bound to.
    pub endpoint_id: Option<String>,
    /// Role granting the endpoint's permissions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_id: Option<String>,
    /// Lifetime in seconds. Defaults to [`DEFAULT_ENDPOINT_TOKEN_TTL`].
    pub ttl: Option<u64>,
    /// Credentials for this call only, layered over the stored ones.
    #[serde(skip)]
    pub credentials: Credentials,
}

impl EndpointAuthParams {
    /// Parameters for `endpoint_id` with every other field defaulted.
    pub fn new(endpoint_id: impl Into<String>) -> Self {
        Self {
            endpoint_id: Some(endpoint_id.into()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    #[must_use]
    pub fn with_role_id(mut self, role_id: impl Into<String>) -> Self {
        self.role_id = Some(role_id.into());
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }
}

/// A security role to create.
///
/// Permission sections (`events`, `groups`, `mediaRelay`, ...) are passed
/// through untouched in `permissions`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub app_id: Option<String>,
    pub name: Option<String>,
    #[serde(flatten)]
    pub permissions: Map<String, Value>,
}

impl Role {
    pub fn new(app_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            app_id: Some(app_id.into()),
            name: Some(name.into()),
            permissions: Map::new(),
        }
    }

    /// Add one permission section.
    #[must_use]
    pub fn with_permission(mut self, key: impl Into<String>, value: Value) -> Self {
        self.permissions.insert(key.into(), value);
        self
    }
}

// ── Gateway ─────────────────────────────────────────────────────────

/// Executes authenticated HTTP calls against the Respoke API.
#[derive(Debug, Clone)]
pub struct RestGateway {
    http: reqwest::Client,
    base_url: String,
    app_id: Option<String>,
    credentials: Arc<RwLock<Credentials>>,
}

impl RestGateway {
    /// Create a gateway for `base_url` (API version included, no trailing `/`).
    pub fn new(
        base_url: impl Into<String>,
        app_id: Option<String>,
        credentials: Arc<RwLock<Credentials>>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            app_id,
            credentials,
        }
    }

    /// The API root every path is appended to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Authentication calls.
    pub fn auth(&self) -> Auth<'_> {
        Auth { gateway: self }
    }

    /// App lookups.
    pub fn apps(&self) -> Apps<'_> {
        Apps { gateway: self }
    }

    /// Role management.
    pub fn roles(&self) -> Roles<'_> {
        Roles { gateway: self }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .header(reqwest::header::ACCEPT, "application/json")
    }

    async fn authorized(&self, method: Method, path: &str) -> RequestBuilder {
        self.authorized_with(method, path, &Credentials::default())
            .await
    }

    /// Like `authorized`, with `overrides` replacing stored credentials.
    async fn authorized_with(
        &self,
        method: Method,
        path: &str,
        overrides: &Credentials,
    ) -> RequestBuilder {
        let headers = self.credentials.read().await.merged_with(overrides).headers();
        headers
            .into_iter()
            .fold(self.request(method, path), |req, (name, value)| {
                req.header(name, value)
            })
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        debug!(status = status.as_u16(), "rest response");

        if !status.is_success() {
            warn!(status = status.as_u16(), "unexpected server response");
            return Err(RespokeError::UnexpectedServerResponse {
                status: status.as_u16(),
                body,
            });
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        // Some endpoints answer with plain text.
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }

    async fn store_token(&self, kind: TokenKind, token: &str) {
        self.credentials
            .write()
            .await
            .set_token(kind, Some(token.to_string()));
        info!(kind = %kind, "credential stored");
    }
}

fn require<'a>(value: Option<&'a str>, field: &'static str, action: &str) -> Result<&'a str> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(RespokeError::missing(field, action)),
    }
}

// ── Auth ────────────────────────────────────────────────────────────

/// Authentication calls. See [`RestGateway::auth`].
#[derive(Debug, Clone, Copy)]
pub struct Auth<'a> {
    gateway: &'a RestGateway,
}

impl Auth<'_> {
    /// Log in as an account administrator and store the Admin-Token.
    ///
    /// # Errors
    ///
    /// [`RespokeError::Validation`] for an empty username or password, or any
    /// REST error.
    pub async fn admin(&self, username: &str, password: &str) -> Result<SessionToken> {
        let username = require(Some(username), "username", "authenticate")?;
        let password = require(Some(password), "password", "authenticate")?;

        let request = self
            .gateway
            .request(Method::POST, "/adminsessions")
            .json(&serde_json::json!({ "username": username, "password": password }));
        let body = self.gateway.send(request).await?;
        let session: SessionToken = serde_json::from_value(body)?;
        debug!("admin session token received");

        self.gateway
            .store_token(TokenKind::AdminToken, &session.token)
            .await;
        Ok(session)
    }

    /// Broker a token for an end-user endpoint. Requires Admin-Token or App-Secret.
    ///
    /// # Errors
    ///
    /// [`RespokeError::Validation`] when `appId` (and no default) or
    /// `endpointId` is missing, or any REST error.
    pub async fn endpoint(&self, params: EndpointAuthParams) -> Result<BrokeredToken> {
        let params = EndpointAuthParams {
            app_id: params.app_id.or_else(|| self.gateway.app_id.clone()),
            ttl: Some(params.ttl.unwrap_or(DEFAULT_ENDPOINT_TOKEN_TTL)),
            ..params
        };
        require(params.app_id.as_deref(), "appId", "authenticate an endpoint")?;
        require(
            params.endpoint_id.as_deref(),
            "endpointId",
            "authenticate an endpoint",
        )?;

        let request = self
            .gateway
            .authorized_with(Method::POST, "/tokens", &params.credentials)
            .await
            .json(&params);
        let body = self.gateway.send(request).await?;
        Ok(serde_json::from_value(body)?)
    }

    /// Exchange a brokered token id for a session token and store the App-Token.
    ///
    /// No credential headers are sent.
    ///
    /// # Errors
    ///
    /// [`RespokeError::Validation`] for an empty token id, or any REST error.
    pub async fn session_token(&self, token_id: &str) -> Result<SessionToken> {
        let token_id = require(Some(token_id), "tokenId", "request a session token")?;

        let request = self
            .gateway
            .request(Method::POST, "/session-tokens")
            .json(&serde_json::json!({ "tokenId": token_id }));
        let body = self.gateway.send(request).await?;
        let session: SessionToken = serde_json::from_value(body)?;

        self.gateway
            .store_token(TokenKind::AppToken, &session.token)
            .await;
        Ok(session)
    }
}

// ── Apps ────────────────────────────────────────────────────────────

/// App lookups. See [`RestGateway::apps`].
#[derive(Debug, Clone, Copy)]
pub struct Apps<'a> {
    gateway: &'a RestGateway,
}

impl Apps<'_> {
    /// One app when `app_id` is given, every app otherwise.
    ///
    /// # Errors
    ///
    /// Any REST error.
    pub async fn get(&self, app_id: Option<&str>) -> Result<Value> {
        let path = match app_id.filter(|id| !id.is_empty()) {
            Some(id) => format!("/apps/{id}"),
            None => "/apps".to_string(),
        };
        let request = self.gateway.authorized(Method::GET, &path).await;
        self.gateway.send(request).await
    }
}

// ── Roles ───────────────────────────────────────────────────────────

/// Role management. See [`RestGateway::roles`].
#[derive(Debug, Clone, Copy)]
pub struct Roles<'a> {
    gateway: &'a RestGateway,
}

impl Roles<'_> {
    /// One role when `role_id` is given, every role of the app otherwise.
    ///
    /// # Errors
    ///
    /// [`RespokeError::Validation`] without an app id, or any REST error.
    pub async fn get(&self, app_id: Option<&str>, role_id: Option<&str>) -> Result<Value> {
        let app_id = require(app_id, "appId", "retrieve roles")?;
        let path = match role_id.filter(|id| !id.is_empty()) {
            Some(role_id) => format!("/roles/{role_id}"),
            None => "/roles".to_string(),
        };
        let request = self
            .gateway
            .authorized(Method::GET, &path)
            .await
            .query(&[("appId", app_id)]);
        self.gateway.send(request).await
    }

    /// Create a role. The response carries the new role's `id`.
    ///
    /// # Errors
    ///
    /// [`RespokeError::Validation`] without an app id or name, or any REST error.
    pub async fn create(&self, role: Role) -> Result<Value> {
        require(role.app_id.as_deref(), "appId", "create a role")?;
        require(role.name.as_deref(), "name", "create a role")?;

        let request = self
            .gateway
            .authorized(Method::POST, "/roles")
            .await
            .json(&role);
        self.gateway.send(request).await
    }

    /// Delete a role.
    ///
    /// # Errors
    ///
    /// [`RespokeError::Validation`] without a role id, or any REST error.
    pub async fn delete(&self, role_id: Option<&str>) -> Result<Value> {
        let role_id = require(role_id, "roleId", "delete a role")?;
        let request = self
            .gateway
            .authorized(Method::DELETE, &format!("/roles/{role_id}"))
            .await;
        self.gateway.send(request).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn gateway() -> RestGateway {
        RestGateway::new(
            "http://127.0.0.1:9/v1/",
            None,
            Arc::new(RwLock::new(Credentials::new())),
        )
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        assert_eq!(gateway().base_url(), "http://127.0.0.1:9/v1");
    }

    #[tokio::test]
    async fn endpoint_without_app_id_fails_validation() {
        let err = gateway()
            .auth()
            .endpoint(EndpointAuthParams::new("alice"))
            .await
            .unwrap_err();
        match err {
            RespokeError::Validation { field, .. } => assert_eq!(field, "appId"),
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_without_role_id_fails_validation() {
        let err = gateway().roles().delete(None).await.unwrap_err();
        assert!(err.to_string().contains("roleId"));
    }

    #[test]
    fn role_serializes_camel_case_with_permissions() {
        let role = Role::new("app-1", "agents")
            .with_permission("mediaRelay", Value::Bool(false));
        let json = serde_json::to_value(&role).unwrap();
        assert_eq!(json["appId"], "app-1");
        assert_eq!(json["name"], "agents");
        assert_eq!(json["mediaRelay"], false);
    }
}
