//! Error types for the relay.

use thiserror::Error;

use crate::types::{Identity, RecipientStatus};

/// Relay errors.
///
/// Only validation and persistence failures are reported back to the
/// originating connection (see [`RelayError::is_reported`]). Transport errors
/// end one connection; protocol errors are logged and otherwise ignored.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Read or write failure on one connection's transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// Inbound frame exceeded the configured size cap
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Malformed or unsupported envelope
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The conversation does not exist
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    /// The sender is not allowed to act on the conversation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The encrypted content map does not match the conversation membership
    #[error("Recipient set mismatch (missing: {missing:?}, unexpected: {unexpected:?})")]
    RecipientMismatch {
        missing: Vec<Identity>,
        unexpected: Vec<Identity>,
    },

    /// The requested status cannot be set by a client
    #[error("Invalid status transition: {0}")]
    InvalidStatus(RecipientStatus),

    /// No row owned by the caller matched the message
    #[error("Message not found: {message_id}")]
    MessageNotFound { message_id: String },

    /// The persistence collaborator failed; the transaction was aborted
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// The hub coordination task is no longer running
    #[error("Hub is not running")]
    HubClosed,

    /// Envelope serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RelayError {
    /// Create a new protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a new transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Stable code carried in `error` envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport_error",
            Self::FrameTooLarge { .. } => "frame_too_large",
            Self::Protocol(_) => "protocol_error",
            Self::ConversationNotFound(_) => "conversation_not_found",
            Self::Forbidden(_) => "forbidden",
            Self::RecipientMismatch { .. } => "recipient_mismatch",
            Self::InvalidStatus(_) => "invalid_status",
            Self::MessageNotFound { .. } => "not_found",
            Self::Persistence(_) => "persistence_error",
            Self::HubClosed => "unavailable",
            Self::Serialization(_) => "internal_error",
        }
    }

    /// Whether the error is surfaced to the originating connection.
    pub fn is_reported(&self) -> bool {
        matches!(
            self,
            Self::ConversationNotFound(_)
                | Self::Forbidden(_)
                | Self::RecipientMismatch { .. }
                | Self::InvalidStatus(_)
                | Self::MessageNotFound { .. }
                | Self::Persistence(_)
        )
    }

    /// Message the error refers to, if any.
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::MessageNotFound { message_id } => Some(message_id),
            _ => None,
        }
    }
}

/// Failures of the conversation/message repository.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A query or statement failed
    #[error("Query failed: {0}")]
    Query(String),

    /// A write conflicted with existing data (e.g. duplicate id)
    #[error("Conflict: {0}")]
    Conflict(String),
}

/// Token validation and handshake failures.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No token was presented
    #[error("Missing token")]
    MissingToken,

    /// The token is malformed or its signature does not verify
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// The token's expiry has passed
    #[error("Token expired")]
    Expired,

    /// The identity claim is absent
    #[error("Missing claim: {0}")]
    MissingClaim(String),

    /// The client did not authenticate in time
    #[error("Authentication timed out")]
    Timeout,

    /// The first frame was not an `auth` envelope
    #[error("Authentication required: {0}")]
    AuthRequired(String),

    /// The transport closed before authentication completed
    #[error("Transport closed before authentication")]
    TransportClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reported_errors() {
        assert!(RelayError::ConversationNotFound("c1".into()).is_reported());
        assert!(RelayError::Persistence(StoreError::Query("boom".into())).is_reported());
        assert!(RelayError::MessageNotFound {
            message_id: "m1".into()
        }
        .is_reported());

        assert!(!RelayError::protocol("bad json").is_reported());
        assert!(!RelayError::transport("reset").is_reported());
        assert!(!RelayError::FrameTooLarge { size: 10, max: 5 }.is_reported());
    }

    #[test]
    fn test_error_codes() {
        let mismatch = RelayError::RecipientMismatch {
            missing: vec![Identity::new("bob")],
            unexpected: vec![],
        };
        assert_eq!(mismatch.code(), "recipient_mismatch");
        assert!(mismatch.to_string().contains("bob"));

        let not_found = RelayError::MessageNotFound {
            message_id: "m9".into(),
        };
        assert_eq!(not_found.code(), "not_found");
        assert_eq!(not_found.message_id(), Some("m9"));
    }
}
