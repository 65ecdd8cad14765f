//! Three-tier credential store.
//!
//! Respoke recognizes three credentials, from most to least privileged:
//!
//! 1. `Admin-Token`: full account administrator
//! 2. `App-Secret`: app-level administration, reusable indefinitely
//! 3. `App-Token`: a single end-user (endpoint) session
//!
//! The same names are used as HTTP header names on REST calls and, lowercased,
//! as query parameters when opening the realtime channel.

use std::fmt;

use crate::error::{RespokeError, Result};

/// One of the three credential tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// Account administrator session token.
    AdminToken,
    /// App secret. The only durable credential.
    AppSecret,
    /// End-user session token bound to an endpoint on the server.
    AppToken,
}

impl TokenKind {
    /// All kinds in precedence order, strongest first.
    pub const PRECEDENCE: [TokenKind; 3] =
        [TokenKind::AdminToken, TokenKind::AppSecret, TokenKind::AppToken];

    /// HTTP header name for this credential.
    pub fn header_name(self) -> &'static str {
        match self {
            TokenKind::AdminToken => "Admin-Token",
            TokenKind::AppSecret => "App-Secret",
            TokenKind::AppToken => "App-Token",
        }
    }

    /// Query parameter name used when opening the realtime channel.
    pub fn query_name(self) -> &'static str {
        match self {
            TokenKind::AdminToken => "admin-token",
            TokenKind::AppSecret => "app-secret",
            TokenKind::AppToken => "app-token",
        }
    }

    /// Whether connecting with this credential requires an explicit endpoint id.
    ///
    /// App-Tokens already carry an endpoint identity bound server-side.
    pub fn requires_endpoint_id(self) -> bool {
        matches!(self, TokenKind::AdminToken | TokenKind::AppSecret)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.header_name())
    }
}

/// The credential selected for a connection attempt.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Tier of the credential.
    pub kind: TokenKind,
    /// Opaque token value.
    pub value: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("kind", &self.kind)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// In-memory set of the three credentials.
///
/// Empty strings are treated the same as unset values.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    admin_token: Option<String>,
    app_secret: Option<String>,
    app_token: Option<String>,
}

impl Credentials {
    /// Create an empty credential set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the Admin-Token.
    #[must_use]
    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.set_token(TokenKind::AdminToken, Some(token.into()));
        self
    }

    /// Set the App-Secret.
    #[must_use]
    pub fn with_app_secret(mut self, secret: impl Into<String>) -> Self {
        self.set_token(TokenKind::AppSecret, Some(secret.into()));
        self
    }

    /// Set the App-Token.
    #[must_use]
    pub fn with_app_token(mut self, token: impl Into<String>) -> Self {
        self.set_token(TokenKind::AppToken, Some(token.into()));
        self
    }

    /// Assign or clear one credential.
    pub fn set_token(&mut self, kind: TokenKind, value: Option<String>) {
        let value = value.filter(|v| !v.is_empty());
        *self.slot_mut(kind) = value;
    }

    /// The value stored for `kind`, if any.
    pub fn get(&self, kind: TokenKind) -> Option<&str> {
        match kind {
            TokenKind::AdminToken => self.admin_token.as_deref(),
            TokenKind::AppSecret => self.app_secret.as_deref(),
            TokenKind::AppToken => self.app_token.as_deref(),
        }
    }

    /// Returns `true` if no credential is set.
    pub fn is_empty(&self) -> bool {
        TokenKind::PRECEDENCE.iter().all(|k| self.get(*k).is_none())
    }

    /// Drop every credential.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// The highest-precedence credential that is set.
    ///
    /// # Errors
    ///
    /// Returns [`RespokeError::NoAuthenticationTokens`] if all three are unset.
    pub fn get_strongest(&self) -> Result<Credential> {
        TokenKind::PRECEDENCE
            .iter()
            .find_map(|kind| {
                self.get(*kind).map(|value| Credential {
                    kind: *kind,
                    value: value.to_string(),
                })
            })
            .ok_or(RespokeError::NoAuthenticationTokens)
    }

    /// A copy of `self` where every credential set in `overrides` replaces ours.
    pub fn merged_with(&self, overrides: &Credentials) -> Credentials {
        let mut merged = self.clone();
        for kind in TokenKind::PRECEDENCE {
            if let Some(value) = overrides.get(kind) {
                merged.set_token(kind, Some(value.to_string()));
            }
        }
        merged
    }

    /// Header name/value pairs for every credential that is set.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        TokenKind::PRECEDENCE
            .iter()
            .filter_map(|kind| self.get(*kind).map(|v| (kind.header_name(), v.to_string())))
            .collect()
    }

    /// Headers sent inside a realtime call envelope.
    ///
    /// An App-Token identifies the endpoint by itself and is sent alone;
    /// otherwise every credential that is set goes along.
    pub fn realtime_headers(&self) -> Vec<(&'static str, String)> {
        match self.get(TokenKind::AppToken) {
            Some(token) => vec![(TokenKind::AppToken.header_name(), token.to_string())],
            None => self.headers(),
        }
    }

    fn slot_mut(&mut self, kind: TokenKind) -> &mut Option<String> {
        match kind {
            TokenKind::AdminToken => &mut self.admin_token,
            TokenKind::AppSecret => &mut self.app_secret,
            TokenKind::AppToken => &mut self.app_token,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("admin_token", &self.admin_token.is_some())
            .field("app_secret", &self.app_secret.is_some())
            .field("app_token", &self.app_token.is_some())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn strongest_follows_precedence() {
        let creds = Credentials::new()
            .with_app_token("tok")
            .with_app_secret("secret");
        let strongest = creds.get_strongest().unwrap();
        assert_eq!(strongest.kind, TokenKind::AppSecret);
        assert_eq!(strongest.value, "secret");

        let creds = creds.with_admin_token("admin");
        assert_eq!(creds.get_strongest().unwrap().kind, TokenKind::AdminToken);
    }

    #[test]
    fn empty_set_has_no_strongest() {
        let err = Credentials::new().get_strongest().unwrap_err();
        assert!(matches!(err, RespokeError::NoAuthenticationTokens));
    }

    #[test]
    fn empty_strings_count_as_unset() {
        let creds = Credentials::new().with_app_secret("");
        assert!(creds.is_empty());
        assert!(creds.get_strongest().is_err());
    }

    #[test]
    fn overrides_replace_only_what_they_set() {
        let base = Credentials::new().with_app_secret("s1").with_app_token("t1");
        let merged = base.merged_with(&Credentials::new().with_app_token("t2"));
        assert_eq!(merged.get(TokenKind::AppSecret), Some("s1"));
        assert_eq!(merged.get(TokenKind::AppToken), Some("t2"));
    }

    #[test]
    fn headers_use_wire_names() {
        let creds = Credentials::new().with_admin_token("a").with_app_token("t");
        assert_eq!(
            creds.headers(),
            vec![("Admin-Token", "a".to_string()), ("App-Token", "t".to_string())]
        );
    }

    #[test]
    fn realtime_headers_prefer_app_token_alone() {
        let creds = Credentials::new().with_app_secret("s").with_app_token("t");
        assert_eq!(creds.realtime_headers(), vec![("App-Token", "t".to_string())]);

        let creds = Credentials::new().with_admin_token("a").with_app_secret("s");
        assert_eq!(creds.realtime_headers(), creds.headers());
    }

    #[test]
    fn debug_output_hides_values() {
        let creds = Credentials::new().with_app_secret("super-secret");
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("super-secret"));
    }

    #[test]
    fn only_app_token_carries_identity() {
        assert!(TokenKind::AdminToken.requires_endpoint_id());
        assert!(TokenKind::AppSecret.requires_endpoint_id());
        assert!(!TokenKind::AppToken.requires_endpoint_id());
    }
}
