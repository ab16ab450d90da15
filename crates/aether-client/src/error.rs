//! Client-side error taxonomy.

use thiserror::Error;

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors surfaced by the client core.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Configuration file missing, malformed, or inconsistent.
    #[error("config error: {0}")]
    Config(String),

    /// QUIC transport failure (dial, stream open, endpoint setup).
    #[error("transport error: {0}")]
    Transport(String),

    /// Shared runtime failure (pump, crypto, state machine).
    #[error(transparent)]
    Core(#[from] aether_core::CoreError),

    /// Local socket I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Inbound proxy request was malformed.
    #[error("bad inbound request: {0}")]
    BadRequest(&'static str),
}

impl ClientError {
    /// Stable code string for `core.error` / `stream.error` events.
    #[must_use]
    pub fn code_str(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Transport(_) => "transport",
            Self::Core(core) => core.code_str(),
            Self::Io(_) => "io",
            Self::BadRequest(_) => "bad_request",
        }
    }
}
