//! Quinn-based QUIC transport for the gateway.
//!
//! Binds the UDP endpoint with TLS 1.3 via rustls: PEM certificate and
//! key when configured, an rcgen self-signed certificate otherwise
//! (testing only, loudly logged). ALPN is pinned to the protocol
//! identifier and receive windows come from the configured
//! [`WindowProfile`].

use std::{net::SocketAddr, sync::Arc};

use aether_proto::ALPN_PROTOCOL;
use quinn::{Endpoint, ServerConfig};

use crate::{config::WindowProfile, error::GatewayError};

/// QUIC endpoint accepting tunnel sessions.
pub struct GatewayTransport {
    endpoint: Endpoint,
}

impl GatewayTransport {
    /// Create and bind the endpoint.
    pub fn bind(
        address: &str,
        cert_path: Option<&str>,
        key_path: Option<&str>,
        profile: WindowProfile,
    ) -> Result<Self, GatewayError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| GatewayError::Config(format!("invalid bind address '{address}': {e}")))?;

        let mut server_config = match (cert_path, key_path) {
            (Some(cert), Some(key)) => load_tls_config(cert, key)?,
            _ => generate_self_signed_config()?,
        };
        server_config.transport_config(transport_config(profile));

        let endpoint = Endpoint::server(server_config, addr)
            .map_err(|e| GatewayError::Transport(format!("failed to create endpoint: {e}")))?;

        tracing::info!("QUIC transport bound to {}", addr);

        Ok(Self { endpoint })
    }

    /// Accept the next QUIC connection.
    pub async fn accept(&self) -> Result<quinn::Connection, GatewayError> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| GatewayError::Transport("endpoint closed".to_string()))?;

        incoming
            .await
            .map_err(|e| GatewayError::Transport(format!("connection failed: {e}")))
    }

    /// Local address the transport is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, GatewayError> {
        self.endpoint
            .local_addr()
            .map_err(|e| GatewayError::Transport(format!("failed to get local address: {e}")))
    }

    /// Stop accepting and close every connection.
    pub fn close(&self, code: u32, reason: &str) {
        self.endpoint.close(code.into(), reason.as_bytes());
    }
}

fn transport_config(profile: WindowProfile) -> Arc<quinn::TransportConfig> {
    let (stream_window, connection_window) = profile.windows();
    let mut transport = quinn::TransportConfig::default();
    transport.stream_receive_window(quinn::VarInt::from_u32(stream_window));
    transport.receive_window(quinn::VarInt::from_u32(connection_window));
    Arc::new(transport)
}

/// Load TLS configuration from certificate and key files.
fn load_tls_config(cert_path: &str, key_path: &str) -> Result<ServerConfig, GatewayError> {
    use std::fs;

    let cert_pem = fs::read(cert_path)
        .map_err(|e| GatewayError::Config(format!("failed to read cert '{cert_path}': {e}")))?;

    let key_pem = fs::read(key_path)
        .map_err(|e| GatewayError::Config(format!("failed to read key '{key_path}': {e}")))?;

    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::Config(format!("failed to parse certificates: {e}")))?;

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| GatewayError::Config(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| GatewayError::Config("no private key found".to_string()))?;

    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| GatewayError::Config(format!("invalid TLS config: {e}")))?;

    tls_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
            .map_err(|e| GatewayError::Config(format!("QUIC config error: {e}")))?,
    ));

    Ok(server_config)
}

/// Generate a self-signed certificate for testing.
fn generate_self_signed_config() -> Result<ServerConfig, GatewayError> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| GatewayError::Config(format!("failed to generate self-signed cert: {e}")))?;

    let cert_der = cert.cert.der().clone();
    let key_der = cert.key_pair.serialize_der();

    let cert_chain = vec![cert_der];
    let key = rustls::pki_types::PrivatePkcs8KeyDer::from(key_der);

    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key.into())
        .map_err(|e| GatewayError::Config(format!("invalid TLS config: {e}")))?;

    tls_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
            .map_err(|e| GatewayError::Config(format!("QUIC config error: {e}")))?,
    ));

    tracing::warn!("Using self-signed certificate - not for production use!");

    Ok(server_config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::config::WindowProfile;

    #[tokio::test]
    async fn transport_binds_with_self_signed() {
        let transport =
            GatewayTransport::bind("127.0.0.1:0", None, None, WindowProfile::Normal).unwrap();
        assert_ne!(transport.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn transport_rejects_invalid_address() {
        let result = GatewayTransport::bind("invalid:address:format", None, None, WindowProfile::Normal);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn transport_loads_pem_files() {
        let cert = rcgen::generate_simple_self_signed(vec!["relay.test".to_string()]).unwrap();

        let mut cert_file = tempfile::NamedTempFile::new().unwrap();
        cert_file.write_all(cert.cert.pem().as_bytes()).unwrap();
        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        key_file.write_all(cert.key_pair.serialize_pem().as_bytes()).unwrap();

        let transport = GatewayTransport::bind(
            "127.0.0.1:0",
            Some(cert_file.path().to_str().unwrap()),
            Some(key_file.path().to_str().unwrap()),
            WindowProfile::Aggressive,
        );
        assert!(transport.is_ok(), "PEM-backed bind failed: {:?}", transport.err());
    }

    #[tokio::test]
    async fn missing_cert_file_is_a_config_error() {
        let result = GatewayTransport::bind(
            "127.0.0.1:0",
            Some("/nonexistent/cert.pem"),
            Some("/nonexistent/key.pem"),
            WindowProfile::Normal,
        );
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }
}
