//! Aether-Realist client binary.
//!
//! # Usage
//!
//! ```bash
//! # Run with a config file
//! aether-client --config client.json
//!
//! # Override the SOCKS bind without touching the file
//! aether-client --config client.json --listen 127.0.0.1:9050
//! ```

use std::{path::PathBuf, sync::Arc};

use aether_client::{
    ClientConfig, Dispatcher, QuinnDialer, SessionManager, SessionOptions,
    http_connect::run_http_listener, socks::run_socks_listener, spawn_scheduler,
};
use aether_core::{
    EventBus, EventKind, Metrics, PerfSample, RuleEngine, run_collector,
};
use clap::Parser;
use tokio::{io::AsyncWriteExt, net::TcpListener, sync::watch};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Aether-Realist edge-relay client
#[derive(Parser, Debug)]
#[command(name = "aether-client")]
#[command(about = "Stateless segmented edge-relay client")]
#[command(version)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "aether.json")]
    config: PathBuf,

    /// Override the SOCKS5 bind address from the config
    #[arg(long)]
    listen: Option<String>,

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

    let mut config = ClientConfig::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }

    tracing::info!("aether client starting");

    let endpoint = config.endpoint()?;
    tracing::info!("upstream {}:{}", endpoint.host, endpoint.port);

    let bus = EventBus::new();
    let metrics = Metrics::new();
    let rules = Arc::new(RuleEngine::new(config.effective_rules(), aether_core::RuleAction::Proxy));

    let dialer = QuinnDialer::new(&endpoint, config.dial_addr.as_deref(), config.allow_insecure)?;

    let options = SessionOptions {
        psk: config.psk.clone(),
        record_policy: config.record_policy(),
        drain_grace: aether_client::DEFAULT_DRAIN_GRACE,
        keep_standby_warm: config.keep_standby_warm(),
        session_pool_max: config.session_pool_max.max(2),
    };
    let manager = SessionManager::new(dialer, options, bus.clone(), Arc::clone(&metrics));

    // Event log: everything on the bus shows up in the structured log.
    tokio::spawn(log_events(bus.clone()));

    // Metrics snapshots.
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(run_collector(
        Arc::clone(&metrics),
        bus.clone(),
        aether_core::DEFAULT_SNAPSHOT_INTERVAL,
        stop_rx,
    ));

    // Optional perf capture sink.
    let perf = if config.perf_capture_enabled {
        let path = config
            .perf_capture_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("aether-perf.jsonl"));
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(write_perf_samples(path, rx));
        Some(tx)
    } else {
        None
    };

    manager.start().await?;

    let rotation = spawn_scheduler(Arc::clone(&manager), config.rotation.policy());
    let prober = aether_client::spawn_prober(
        Arc::clone(&manager),
        aether_client::DEFAULT_PROBE_INTERVAL,
    );

    let dispatcher = Dispatcher::new(
        Arc::clone(&manager),
        rules,
        config.record_policy().max_record_payload,
        config.max_padding,
        perf,
    );

    let socks = TcpListener::bind(&config.listen_addr).await?;
    tracing::info!("SOCKS5 listening on {}", socks.local_addr()?);
    tokio::spawn(run_socks_listener(socks, Arc::clone(&dispatcher)));

    if let Some(http_addr) = &config.http_proxy_addr {
        let http = TcpListener::bind(http_addr).await?;
        tracing::info!("HTTP CONNECT listening on {}", http.local_addr()?);
        tokio::spawn(run_http_listener(http, Arc::clone(&dispatcher)));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    rotation.stop();
    prober.stop();
    let _ = stop_tx.send(true);
    manager.close("shutdown").await;

    Ok(())
}

/// Route bus events into the structured log at sensible levels.
async fn log_events(bus: EventBus) {
    let mut events = bus.subscribe();
    loop {
        match events.recv().await {
            Ok(event) => match &event.kind {
                EventKind::CoreError { code, message } => {
                    tracing::error!(code, "{message}");
                },
                EventKind::StreamError { stream_id, code } => {
                    tracing::warn!(stream_id, code, "stream error");
                },
                EventKind::MetricsSnapshot(_) => {
                    tracing::trace!(kind = event.kind.code(), "snapshot");
                },
                other => {
                    tracing::debug!(kind = other.code(), "{other:?}");
                },
            },
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!("event log lagged, {n} events dropped");
            },
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Append perf samples as JSON lines.
async fn write_perf_samples(
    path: PathBuf,
    mut samples: tokio::sync::mpsc::UnboundedReceiver<PerfSample>,
) {
    let file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await;
    let mut file = match file {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!("cannot open perf capture file '{}': {e}", path.display());
            return;
        },
    };

    while let Some(sample) = samples.recv().await {
        let line = format!(
            "{{\"at_ms\":{},\"latency_us\":{},\"batch_bytes\":{}}}\n",
            sample.at_ms, sample.latency_us, sample.batch_bytes
        );
        if let Err(e) = file.write_all(line.as_bytes()).await {
            tracing::warn!("perf capture write failed: {e}");
            return;
        }
    }
}
