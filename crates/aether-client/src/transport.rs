//! Quinn-based QUIC transport for the client.
//!
//! Implements [`TunnelDial`]/[`TunnelSession`] over raw QUIC
//! bidirectional streams. TLS 1.3 via rustls with the webpki root set;
//! `allow_insecure` swaps in a verifier that accepts any certificate
//! (testing only). `dial_addr` lets a deployment point the UDP flow at a
//! fronting address while the TLS SNI and certificate validation keep
//! using the configured hostname.

use std::{
    future::Future,
    net::{SocketAddr, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

use aether_proto::ALPN_PROTOCOL;
use quinn::{ClientConfig, Endpoint};

use crate::{
    config::ServerEndpoint,
    error::{ClientError, Result},
    session::{TunnelDial, TunnelSession},
};

/// QUIC keep-alive cadence; sessions idle between user streams must
/// survive until rotation retires them.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Transport-level idle ceiling.
const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Dials gateway sessions over QUIC.
pub struct QuinnDialer {
    endpoint: Endpoint,
    remote: SocketAddr,
    server_name: String,
}

impl QuinnDialer {
    /// Build a dialer for the configured upstream.
    ///
    /// `dial_addr` overrides the network address while keeping the TLS
    /// SNI from `server.host`.
    pub fn new(server: &ServerEndpoint, dial_addr: Option<&str>, allow_insecure: bool) -> Result<Self> {
        let authority = match dial_addr {
            Some(addr) => addr.to_string(),
            None => format!("{}:{}", server.host, server.port),
        };
        let remote = authority
            .to_socket_addrs()
            .map_err(|e| ClientError::Transport(format!("cannot resolve '{authority}': {e}")))?
            .next()
            .ok_or_else(|| ClientError::Transport(format!("'{authority}' resolved to nothing")))?;

        let client_config = if allow_insecure {
            tracing::warn!("TLS certificate verification disabled (allow_insecure)");
            insecure_client_config()?
        } else {
            verified_client_config()?
        };

        let bind: SocketAddr = if remote.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" }
            .parse()
            .map_err(|e| ClientError::Transport(format!("bind address: {e}")))?;
        let mut endpoint = Endpoint::client(bind)
            .map_err(|e| ClientError::Transport(format!("endpoint creation failed: {e}")))?;
        endpoint.set_default_client_config(client_config);

        Ok(Self { endpoint, remote, server_name: server.host.clone() })
    }

    /// Address the dialer will send datagrams to.
    #[must_use]
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }
}

impl TunnelDial for QuinnDialer {
    type Session = QuinnSession;

    fn dial(&self) -> impl Future<Output = Result<Self::Session>> + Send {
        let connecting = self
            .endpoint
            .connect(self.remote, &self.server_name)
            .map_err(|e| ClientError::Transport(format!("connect failed: {e}")));
        async move {
            let connection = connecting?
                .await
                .map_err(|e| ClientError::Transport(format!("connection failed: {e}")))?;
            Ok(QuinnSession { connection })
        }
    }
}

/// One QUIC connection to the gateway. Clones share the connection.
#[derive(Clone)]
pub struct QuinnSession {
    connection: quinn::Connection,
}

impl TunnelSession for QuinnSession {
    type SendHalf = quinn::SendStream;
    type RecvHalf = quinn::RecvStream;

    fn open_stream(
        &self,
    ) -> impl Future<Output = Result<(Self::SendHalf, Self::RecvHalf)>> + Send {
        let connection = self.connection.clone();
        async move {
            connection
                .open_bi()
                .await
                .map_err(|e| ClientError::Transport(format!("open_bi failed: {e}")))
        }
    }

    fn close(&self, code: u32, reason: &str) {
        self.connection.close(code.into(), reason.as_bytes());
    }

    fn closed(&self) -> impl Future<Output = String> + Send {
        let connection = self.connection.clone();
        async move { connection.closed().await.to_string() }
    }
}

fn transport_config() -> Arc<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    if let Ok(idle) = MAX_IDLE_TIMEOUT.try_into() {
        transport.max_idle_timeout(Some(idle));
    }
    Arc::new(transport)
}

fn finish_client_config(mut tls: rustls::ClientConfig) -> Result<ClientConfig> {
    tls.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let quic = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
        .map_err(|e| ClientError::Transport(format!("QUIC TLS config error: {e}")))?;
    let mut config = ClientConfig::new(Arc::new(quic));
    config.transport_config(transport_config());
    Ok(config)
}

/// TLS config validating against the bundled webpki roots.
fn verified_client_config() -> Result<ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let tls = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    finish_client_config(tls)
}

/// TLS config that accepts any certificate.
///
/// WARNING: testing only; production must verify certificates.
fn insecure_client_config() -> Result<ClientConfig> {
    let tls = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier))
        .with_no_client_auth();
    finish_client_config(tls)
}

/// Certificate verifier that accepts any certificate (insecure, for
/// development).
#[derive(Debug)]
struct InsecureCertVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
