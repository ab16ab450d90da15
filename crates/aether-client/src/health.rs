//! Session health probing over Ping/Pong records.
//!
//! On a fixed cadence the prober opens a short-lived stream on the
//! current primary, sends a Ping, and waits for the gateway's Pong. The
//! round-trip time lands in `last_latency_ms`; a probe that cannot
//! complete is logged and surfaced as an `app.log` event but never
//! touches the session pool - the transport watcher owns liveness
//! decisions, the prober only measures.

use std::{sync::Arc, time::Duration};

use aether_core::EventKind;
use aether_proto::RecordKind;
use tokio::sync::watch;

use crate::session::{SessionManager, TunnelDial};

/// Default probe cadence.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// How long a probe waits for its Pong.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to a running prober; stopping is idempotent.
#[derive(Debug)]
pub struct ProbeHandle {
    stop: watch::Sender<bool>,
}

impl ProbeHandle {
    /// Signal the prober to stop after its current await point.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

/// Spawn the health prober for a session manager.
pub fn spawn_prober<D: TunnelDial>(
    manager: Arc<SessionManager<D>>,
    interval: Duration,
) -> ProbeHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(run_prober(manager, interval, stop_rx));
    ProbeHandle { stop: stop_tx }
}

async fn run_prober<D: TunnelDial>(
    manager: Arc<SessionManager<D>>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            () = tokio::time::sleep(interval) => {},
            result = stop.changed() => {
                if result.is_err() || *stop.borrow() {
                    return;
                }
                continue;
            },
        }

        match probe_once(&manager).await {
            Ok(rtt) => {
                manager.metrics().set_last_latency(rtt);
                tracing::debug!(rtt_ms = rtt.as_millis() as u64, "health probe");
            },
            Err(message) => {
                tracing::debug!("health probe failed: {message}");
                manager.bus().publish(EventKind::AppLog {
                    message: format!("health probe failed: {message}"),
                });
            },
        }
    }
}

/// One Ping/Pong round trip on a fresh stream.
async fn probe_once<D: TunnelDial>(manager: &Arc<SessionManager<D>>) -> Result<Duration, String> {
    let mut stream = manager.open_stream().await.map_err(|e| e.to_string())?;

    let started = tokio::time::Instant::now();
    stream.sender.send_ping().await.map_err(|e| e.to_string())?;

    let pong = tokio::time::timeout(PROBE_TIMEOUT, async {
        loop {
            match stream.receiver.next_record().await {
                Ok(Some(record)) if record.kind() == Some(RecordKind::Pong) => return Ok(()),
                Ok(Some(_)) => {},
                Ok(None) => return Err("stream closed before pong".to_string()),
                Err(e) => return Err(e.to_string()),
            }
        }
    })
    .await;

    match pong {
        Ok(Ok(())) => Ok(started.elapsed()),
        Ok(Err(message)) => Err(message),
        Err(_) => Err("pong timed out".to_string()),
    }
}
