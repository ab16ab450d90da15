//! Gateway-side error taxonomy.

use thiserror::Error;

/// Result alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors surfaced by the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration problem (bind address, certificates, PSK).
    #[error("config error: {0}")]
    Config(String),

    /// QUIC endpoint or connection failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Shared runtime failure (pump, crypto, framing).
    #[error(transparent)]
    Core(#[from] aether_core::CoreError),

    /// Target-side TCP failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
