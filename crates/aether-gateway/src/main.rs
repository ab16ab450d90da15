//! Aether-Realist gateway binary.
//!
//! # Usage
//!
//! ```bash
//! # Environment-driven (deployment)
//! AETHER_PSK=... AETHER_LISTEN=0.0.0.0:4433 \
//!   AETHER_CERT=cert.pem AETHER_KEY=key.pem aether-gateway
//!
//! # Flags override environment (development, self-signed TLS)
//! aether-gateway --listen 127.0.0.1:4433 --psk testing
//! ```

use aether_core::EventKind;
use aether_gateway::{Gateway, GatewayConfig};
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Aether-Realist edge-relay gateway
#[derive(Parser, Debug)]
#[command(name = "aether-gateway")]
#[command(about = "Stateless segmented edge-relay gateway")]
#[command(version)]
struct Args {
    /// UDP address to bind (overrides AETHER_LISTEN)
    #[arg(short, long)]
    listen: Option<String>,

    /// Pre-shared key (overrides AETHER_PSK)
    #[arg(long)]
    psk: Option<String>,

    /// Path to TLS certificate in PEM format (overrides AETHER_CERT)
    #[arg(short, long)]
    cert: Option<String>,

    /// Path to TLS private key in PEM format (overrides AETHER_KEY)
    #[arg(short, long)]
    key: Option<String>,

    /// QUIC window profile: conservative, normal, aggressive
    #[arg(long)]
    window_profile: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let mut config = GatewayConfig::from_env()?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(psk) = args.psk {
        config.psk = psk.trim().to_string();
    }
    if let Some(cert) = args.cert {
        config.cert_path = Some(cert);
    }
    if let Some(key) = args.key {
        config.key_path = Some(key);
    }
    if let Some(profile) = args.window_profile {
        config.window_profile = profile.parse()?;
    }

    tracing::info!("aether gateway starting");
    if config.cert_path.is_none() {
        tracing::warn!("no TLS certificate provided - using a self-signed certificate");
    }

    let gateway = Gateway::bind(&config)?;
    tracing::info!("listening on {}", gateway.local_addr()?);

    // Stream events into the structured log.
    let bus = gateway.context().bus.clone();
    tokio::spawn(async move {
        let mut events = bus.subscribe();
        loop {
            match events.recv().await {
                Ok(event) => match &event.kind {
                    EventKind::StreamError { stream_id, code } => {
                        tracing::warn!(stream_id, code, "stream error");
                    },
                    other => tracing::debug!(kind = other.code(), "{other:?}"),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("event log lagged, {n} events dropped");
                },
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    tokio::select! {
        result = gateway.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        },
    }

    Ok(())
}
