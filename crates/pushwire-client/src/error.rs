//! Error handling for the client.

use std::time::Duration;

use pushwire_core::ProtocolVersion;
use thiserror::Error;

/// The result type used throughout the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors raised by a connection and its collaborators.
///
/// Errors are `Clone` because a single start failure is observed by every
/// holder of the start handle and by the error event.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    /// Network failure or malformed handshake response.
    #[error("negotiation failed: {message}")]
    Negotiation { message: String },

    /// Handshake succeeded but the server speaks another protocol version.
    #[error(
        "incompatible protocol version: expected {expected}, server offered {}",
        .found.as_deref().unwrap_or("none")
    )]
    ProtocolIncompatible {
        expected: ProtocolVersion,
        found: Option<String>,
    },

    /// Transport failure (start, send, or steady state).
    #[error("transport error: {message}")]
    Transport { message: String },

    /// The call is not allowed in the current connection state.
    #[error("invalid operation: {message}")]
    InvalidOperation { message: String },

    /// A received-message callback returned an error or panicked.
    #[error("receive callback failed: {message}")]
    Callback { message: String },

    /// The receive queue no longer admits work.
    #[error("receive queue has been drained")]
    QueueDrained,

    /// The start attempt was cancelled by stop or disconnect.
    #[error("start attempt was cancelled")]
    Cancelled,

    #[error("operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("invalid url: {message}")]
    InvalidUrl { message: String },

    #[error("serialization error: {message}")]
    Serialization { message: String },
}

impl ClientError {
    /// Create a negotiation error.
    pub fn negotiation(message: impl Into<String>) -> Self {
        Self::Negotiation {
            message: message.into(),
        }
    }

    /// Create a protocol mismatch error for the offered version.
    pub fn protocol_incompatible(found: Option<&str>) -> Self {
        Self::ProtocolIncompatible {
            expected: ProtocolVersion::SUPPORTED,
            found: found.map(str::to_string),
        }
    }

    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create an invalid-operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Create a callback error.
    pub fn callback(message: impl Into<String>) -> Self {
        Self::Callback {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create an invalid url error.
    pub fn invalid_url(message: impl Into<String>) -> Self {
        Self::InvalidUrl {
            message: message.into(),
        }
    }

    /// Whether the error aborted a start attempt during the handshake.
    pub fn is_handshake_failure(&self) -> bool {
        matches!(
            self,
            Self::Negotiation { .. } | Self::ProtocolIncompatible { .. }
        )
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}

impl From<url::ParseError> for ClientError {
    fn from(e: url::ParseError) -> Self {
        Self::invalid_url(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = ClientError::negotiation("connection refused");
        assert!(matches!(err, ClientError::Negotiation { .. }));
        assert!(err.is_handshake_failure());

        let err = ClientError::timeout(Duration::from_secs(5));
        assert!(matches!(err, ClientError::Timeout { .. }));
        assert!(!err.is_handshake_failure());
    }

    #[test]
    fn protocol_mismatch_message() {
        let err = ClientError::protocol_incompatible(Some("2.0"));
        assert_eq!(
            err.to_string(),
            "incompatible protocol version: expected 1.2, server offered 2.0"
        );

        let err = ClientError::protocol_incompatible(None);
        assert!(err.to_string().ends_with("server offered none"));
        assert!(err.is_handshake_failure());
    }

    #[test]
    fn serde_errors_convert() {
        let err: ClientError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, ClientError::Serialization { .. }));
    }
}
