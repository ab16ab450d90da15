//! Atomic counters and periodic snapshots.
//!
//! Counters are plain relaxed atomics updated from the data path; the
//! collector task turns them into `metrics.snapshot` events on a fixed
//! interval. Nothing here persists - metrics die with the process.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::Serialize;
use tokio::sync::watch;

use crate::events::{EventBus, EventKind};

/// Default snapshot cadence.
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);

/// Shared counters for one core instance.
///
/// Deliberately instance-scoped rather than process-global so several
/// cores can coexist in one process (and in tests).
#[derive(Debug, Default)]
pub struct Metrics {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    active_streams: AtomicU64,
    total_streams: AtomicU64,
    last_latency_ms: AtomicU64,
    session_start_ms: AtomicU64,
}

impl Metrics {
    /// Fresh zeroed counters.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add plaintext bytes sent upstream.
    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    /// Add plaintext bytes received downstream.
    pub fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    /// A stream opened: bumps both active and total counts.
    pub fn stream_opened(&self) {
        self.active_streams.fetch_add(1, Ordering::Relaxed);
        self.total_streams.fetch_add(1, Ordering::Relaxed);
    }

    /// A stream closed.
    pub fn stream_closed(&self) {
        // Saturating: a double-close must not wrap the gauge.
        let _ = self.active_streams.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            v.checked_sub(1)
        });
    }

    /// Record the latest observed record-write latency.
    pub fn set_last_latency(&self, latency: Duration) {
        self.last_latency_ms.store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Record when the current primary session was established.
    pub fn mark_session_start(&self) {
        self.session_start_ms.store(crate::time::unix_now_ms(), Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            active_streams: self.active_streams.load(Ordering::Relaxed),
            total_streams: self.total_streams.load(Ordering::Relaxed),
            last_latency_ms: self.last_latency_ms.load(Ordering::Relaxed),
            session_start_ms: self.session_start_ms.load(Ordering::Relaxed),
        }
    }
}

/// One emitted snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Plaintext bytes sent upstream since start.
    pub bytes_sent: u64,
    /// Plaintext bytes received downstream since start.
    pub bytes_received: u64,
    /// Streams currently open.
    pub active_streams: u64,
    /// Streams opened since start.
    pub total_streams: u64,
    /// Latest record-write latency, milliseconds.
    pub last_latency_ms: u64,
    /// Unix millis when the current primary session came up (0 = never).
    pub session_start_ms: u64,
}

/// Run the snapshot collector until `stop` flips to `true`.
///
/// Emits one `metrics.snapshot` event per interval tick. Intended to be
/// spawned; returns when stopped.
pub async fn run_collector(
    metrics: Arc<Metrics>,
    bus: EventBus,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                bus.publish(EventKind::MetricsSnapshot(metrics.snapshot()));
            }
            result = stop.changed() => {
                if result.is_err() || *stop.borrow() {
                    return;
                }
            }
        }
    }
}
