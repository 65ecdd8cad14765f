//! Error types for the Respoke client.

use thiserror::Error;

/// Errors that can occur when using the Respoke client.
#[derive(Debug, Error)]
pub enum RespokeError {
    /// A required parameter of a call was missing. Raised before any I/O.
    #[error("validation error: {message}")]
    Validation {
        /// Name of the missing or invalid field, as it appears on the wire.
        field: &'static str,
        /// Human-readable explanation.
        message: String,
    },

    /// A REST call returned a non-2xx status.
    #[error("unexpected server response: HTTP {status}")]
    UnexpectedServerResponse {
        /// HTTP status code.
        status: u16,
        /// Raw response body.
        body: String,
    },

    /// A connection was attempted with no credentials at all.
    #[error("no authentication tokens available to connect")]
    NoAuthenticationTokens,

    /// An Admin-Token or App-Secret connection was attempted without an endpoint id.
    #[error("an endpointId is required when connecting with Admin-Token or App-Secret")]
    MissingEndpointIdAsAdmin,

    /// Autoreconnect is enabled but there is no App-Secret to re-authenticate with.
    #[error("autoreconnect requires an App-Secret, but none is set")]
    MissingAppSecretDuringAutoreconnect,

    /// The realtime channel acknowledged a call with a payload that is not JSON.
    #[error("realtime response could not be parsed as JSON")]
    UnparseableResponse,

    /// The realtime channel acknowledged a call with an error envelope.
    #[error("server returned an error for {verb} {path}: {response}")]
    SocketErrorResponseFromServer {
        /// Verb the call was made with (`post`, `get`, `delete`, ...).
        verb: String,
        /// API path relative to the base URL.
        path: String,
        /// The error envelope as received.
        response: serde_json::Value,
    },

    /// The realtime channel reported a failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Attempted a realtime call while no channel is open.
    #[error("not connected to server")]
    NotConnected,

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An HTTP request failed before a status was received.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Failed to serialize or deserialize JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The configured base URL could not be parsed or rewritten.
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RespokeError {
    pub(crate) fn missing(field: &'static str, action: &str) -> Self {
        Self::Validation {
            field,
            message: format!("{field} is required to {action}"),
        }
    }
}

/// A specialized [`Result`] type for Respoke client operations.
pub type Result<T> = std::result::Result<T, RespokeError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn missing_field_message_names_the_field() {
        let err = RespokeError::missing("appId", "create a role");
        assert_eq!(
            err.to_string(),
            "validation error: appId is required to create a role"
        );
        match err {
            RespokeError::Validation { field, .. } => assert_eq!(field, "appId"),
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn server_response_error_shows_status() {
        let err = RespokeError::UnexpectedServerResponse {
            status: 503,
            body: "down".into(),
        };
        assert_eq!(err.to_string(), "unexpected server response: HTTP 503");
    }
}
