//! Error types for the FleetWatch environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvError {
    /// Request to the fleet backend failed (connection refused, 5xx, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The live event channel was closed or errored out
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// The backend does not know the requested resource
    #[error("Not found: {0}")]
    NotFound(String),

    /// Context operation failed
    #[error("Context error: {0}")]
    ContextError(String),
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// Creates a channel-closed error.
    pub fn channel_closed(msg: impl Into<String>) -> Self {
        Self::ChannelClosed(msg.into())
    }

    /// Creates a not-found error.
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }
}
