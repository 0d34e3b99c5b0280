//! Errors surfaced to callers of the gateway connection.

use std::time::Duration;

use super::protocol::ErrorShape;

/// Failure of a single gateway request.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    /// The transport is not open; nothing was sent.
    #[error("gateway not connected")]
    NotConnected,

    /// The gateway answered with `ok: false`.
    #[error("gateway error {0}")]
    Server(ErrorShape),

    /// The transport closed while the request was outstanding.
    #[error("gateway connection lost")]
    ConnectionLost,

    /// The connect handshake was rejected; the session is open but unauthenticated.
    #[error("gateway session not authenticated: {0}")]
    Unauthenticated(ErrorShape),

    /// No response arrived before the request deadline.
    #[error("gateway request {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to encode frame: {0}")]
    Encode(String),
}

impl GatewayError {
    /// The server-supplied error, when there is one.
    pub fn server_error(&self) -> Option<&ErrorShape> {
        match self {
            GatewayError::Server(shape) | GatewayError::Unauthenticated(shape) => Some(shape),
            _ => None,
        }
    }
}
