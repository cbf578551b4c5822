//! Transport error types.

use thiserror::Error;

/// Errors reported by a [`Transport`](super::Transport).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The server refused the request (bad input, busy chat, auth).
    #[error("request rejected: {message}")]
    Rejected { message: String },

    /// The server could not be reached.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// The transport has been shut down.
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }
}
