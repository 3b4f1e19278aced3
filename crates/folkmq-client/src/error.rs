//! Client error types.

use std::time::Duration;

use folkmq_proto::MessageError;

/// Errors raised by a transport implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// No response within the request timeout
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// The session is closed
    #[error("session closed")]
    Closed,
    /// Connection level failure
    #[error("connection error: {0}")]
    Connection(String),
    /// The peer answered with an alarm
    #[error("alarm from peer: {0}")]
    Alarm(String),
}

/// Errors surfaced by client operations.
#[derive(Debug, thiserror::Error)]
pub enum MqError {
    /// `connect` has not completed, or the client was disconnected
    #[error("not connected")]
    NotConnected,
    /// Connected, but no valid session could be selected
    #[error("no session is available")]
    NoSessionAvailable,
    /// A QoS 1 operation was answered without a positive confirmation
    #[error("client message {operation} confirm failed: {message}")]
    ConfirmFailed {
        /// Operation that was rejected
        operation: &'static str,
        /// Diagnostic text supplied by the broker
        message: String,
    },
    /// A parameter was missing or malformed
    #[error("invalid parameter: {0}")]
    Invalid(String),
    /// The transport failed while the operation was in flight
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A payload could not be encoded
    #[error(transparent)]
    Payload(#[from] MessageError),
}

impl MqError {
    /// Whether the broker was unreachable, as opposed to having rejected the
    /// operation.
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::NotConnected
                | Self::NoSessionAvailable
                | Self::Transport(
                    TransportError::Timeout(_)
                        | TransportError::Closed
                        | TransportError::Connection(_)
                )
        )
    }
}

/// Error returned by user supplied handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
