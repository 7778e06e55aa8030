//! Transport error types

use thiserror::Error;

/// Errors raised by a broker transport, connection, or session
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Session failed: {0}")]
    SessionFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Check if this error means the live session can no longer be used
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, TransportError::ConnectionLost(_) | TransportError::Closed)
    }

    /// Human-readable reason without the variant prefix
    pub fn reason(&self) -> String {
        match self {
            TransportError::ConnectFailed(reason)
            | TransportError::SessionFailed(reason)
            | TransportError::ConnectionLost(reason)
            | TransportError::Rejected(reason) => reason.clone(),
            TransportError::Closed => "transport closed".to_string(),
        }
    }
}
