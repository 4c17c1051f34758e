//! Error types for sessions, backends and model calls.

use thiserror::Error;

/// Errors raised by the session bridge and its backends.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The local pseudo-terminal could not be opened or the shell failed to spawn.
    #[error("failed to spawn local shell: {0}")]
    Spawn(String),

    /// The remote server rejected every authentication method we offered.
    #[error("authentication failed: {0}")]
    TransportAuth(String),

    /// The remote host was unreachable, timed out or dropped the transport.
    #[error("connection failed: {0}")]
    TransportConnect(String),

    /// No session is registered under this id.
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// The session exists but has no backend attached.
    #[error("session {0} is not connected")]
    NotConnected(String),
}

/// Errors raised by a language-model call.
#[derive(Error, Debug)]
pub enum ModelError {
    /// The call was abandoned because the run was stopped.
    #[error("model call cancelled")]
    Cancelled,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The model endpoint answered with a non-success status.
    #[error("model API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("invalid model response: {0}")]
    InvalidResponse(String),

    /// Credentials or endpoint settings are missing.
    #[error("model client not configured: {0}")]
    Configuration(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ModelError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if this is a rate-limit error (HTTP 429).
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Api { status: 429, .. })
    }
}
