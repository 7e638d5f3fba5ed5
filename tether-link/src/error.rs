//! Link error types.

use crate::config::ConfigError;
use std::net::SocketAddr;
use thiserror::Error;

/// Link errors.
///
/// Per-message framing and transform failures never surface here; they are
/// logged and the message is skipped. These errors come from setting up
/// endpoints and connections.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("connect to {0} timed out")]
    ConnectTimeout(SocketAddr),

    #[error("session setup failed: {0}")]
    SetupFailed(String),

    #[error("not connected")]
    NotConnected,

    #[error("link shutting down")]
    ShuttingDown,
}

impl LinkError {
    /// Returns whether retrying the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LinkError::Io(_) | LinkError::ConnectTimeout(_) | LinkError::SetupFailed(_)
        )
    }
}
