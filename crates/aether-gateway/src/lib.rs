//! Aether-Realist gateway.
//!
//! Terminates tunnel sessions over QUIC, validates each stream's
//! metadata handshake, and proxies the decrypted byte stream to its TCP
//! target. Failed handshakes are indistinguishable from an
//! uncooperative service (silent drop).
//!
//! # Architecture
//!
//! - [`GatewayTransport`]: quinn endpoint with TLS and window profiles
//! - [`handler`]: per-stream validation, silent drop, dial, relay
//! - [`GatewayConfig`]: environment + CLI configuration
//!
//! One task per connection, one task per stream (accept loops mirror the
//! client's listeners). Gateway-outbound records use one nonce generator
//! per connection, so its session id rotates with the client's sessions.

pub mod config;
pub mod error;
pub mod handler;
pub mod transport;

use std::sync::Arc;

use aether_core::{EventBus, Metrics, RecordPolicy};
use aether_crypto::NonceGenerator;
pub use config::{GatewayConfig, WindowProfile};
pub use error::{GatewayError, Result};
pub use handler::{HandlerContext, HandshakeReplayGuard, handle_stream};
use rand::{RngCore, rngs::OsRng};
pub use transport::GatewayTransport;

/// A bound gateway ready to serve.
pub struct Gateway {
    transport: GatewayTransport,
    ctx: Arc<HandlerContext>,
}

impl Gateway {
    /// Validate configuration and bind the QUIC endpoint.
    pub fn bind(config: &GatewayConfig) -> Result<Self> {
        config.validate()?;

        let transport = GatewayTransport::bind(
            &config.listen,
            config.cert_path.as_deref(),
            config.key_path.as_deref(),
            config.window_profile,
        )?;

        let ctx = HandlerContext::new(
            config.psk.clone(),
            RecordPolicy::default(),
            Metrics::new(),
            EventBus::new(),
        );

        Ok(Self { transport, ctx })
    }

    /// Local address the gateway is bound to.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    /// Shared handler context (metrics, event bus).
    #[must_use]
    pub fn context(&self) -> &Arc<HandlerContext> {
        &self.ctx
    }

    /// Accept connections until the endpoint closes.
    pub async fn run(self) -> Result<()> {
        loop {
            match self.transport.accept().await {
                Ok(connection) => {
                    let ctx = Arc::clone(&self.ctx);
                    tokio::spawn(async move {
                        handle_connection(connection, ctx).await;
                    });
                },
                Err(e) => {
                    tracing::error!("accept error: {e}");
                },
            }
        }
    }
}

/// Serve one QUIC connection: accept streams until it closes.
async fn handle_connection(connection: quinn::Connection, ctx: Arc<HandlerContext>) {
    // One outbound nonce generator per connection; its session id is
    // independent from the client's.
    let mut session_id = [0u8; 4];
    OsRng.fill_bytes(&mut session_id);
    let nonce = Arc::new(NonceGenerator::new(session_id));

    tracing::debug!(remote = %connection.remote_address(), "connection established");

    loop {
        match connection.accept_bi().await {
            Ok((send, recv)) => {
                let ctx = Arc::clone(&ctx);
                let nonce = Arc::clone(&nonce);
                tokio::spawn(async move {
                    handle_stream(recv, send, nonce, ctx).await;
                });
            },
            Err(e) => {
                tracing::debug!("connection closed: {e}");
                break;
            },
        }
    }
}
