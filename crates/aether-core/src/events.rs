//! Structured event fan-out.
//!
//! Single producer side (the core and its children), many consumers
//! (CLI, logs, tests). Built on `tokio::sync::broadcast` with a bounded
//! per-subscriber queue: a stalled consumer loses *its own* events and
//! the producer never blocks - backpressure must never reach the data
//! path.

use tokio::sync::broadcast;

use crate::{metrics::MetricsSnapshot, state::CoreState};

/// Bounded queue depth per subscriber before events are dropped.
pub const EVENT_QUEUE_DEPTH: usize = 100;

/// Outbound session identifier as it appears on the wire (4 bytes,
/// rendered lowercase hex in logs and events).
pub type SessionId = [u8; 4];

/// Render a session id the way events and logs show it.
#[must_use]
pub fn session_id_hex(id: SessionId) -> String {
    format!("{:02x}{:02x}{:02x}{:02x}", id[0], id[1], id[2], id[3])
}

/// A timestamped event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Milliseconds since the Unix epoch at publish time.
    pub at_ms: u64,
    /// What happened.
    pub kind: EventKind,
}

/// Everything the core reports to its consumers.
#[derive(Debug, Clone)]
pub enum EventKind {
    /// The core FSM moved between states.
    StateChanged {
        /// Previous state.
        from: CoreState,
        /// New state.
        to: CoreState,
    },
    /// A session finished its transport handshake and is usable.
    SessionEstablished {
        /// Outbound session id.
        session: SessionId,
    },
    /// A rotation began; the named session is being replaced.
    SessionRotating {
        /// Session entering drain.
        session: SessionId,
    },
    /// A session fully closed.
    SessionClosed {
        /// The closed session.
        session: SessionId,
        /// Stable reason string.
        reason: String,
    },
    /// A tunnel stream was opened.
    StreamOpened {
        /// Dispatcher-assigned stream id.
        stream_id: u64,
        /// `host:port` of the destination.
        target: String,
    },
    /// A tunnel stream closed.
    StreamClosed {
        /// Dispatcher-assigned stream id.
        stream_id: u64,
        /// Plaintext bytes sent upstream.
        bytes_sent: u64,
        /// Plaintext bytes received downstream.
        bytes_received: u64,
    },
    /// A tunnel stream failed.
    StreamError {
        /// Dispatcher-assigned stream id.
        stream_id: u64,
        /// Stable code string.
        code: String,
    },
    /// The rotation scheduler committed to its next cycle.
    RotationScheduled {
        /// Milliseconds until promotion.
        in_ms: u64,
    },
    /// Pre-warm dial of the successor session started.
    PrewarmStarted,
    /// Rotation finished; the successor is primary.
    RotationCompleted {
        /// Session now draining.
        old: SessionId,
        /// Session now primary.
        new: SessionId,
    },
    /// Periodic metrics snapshot.
    MetricsSnapshot(MetricsSnapshot),
    /// A core-level failure (start/rotate).
    CoreError {
        /// Stable code string.
        code: String,
        /// Human-readable detail.
        message: String,
    },
    /// Free-form application log line routed through the bus.
    AppLog {
        /// Log line.
        message: String,
    },
}

impl EventKind {
    /// Stable dotted kind tag, the contract with CLI/GUI consumers.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "core.stateChanged",
            Self::SessionEstablished { .. } => "session.established",
            Self::SessionRotating { .. } => "session.rotating",
            Self::SessionClosed { .. } => "session.closed",
            Self::StreamOpened { .. } => "stream.opened",
            Self::StreamClosed { .. } => "stream.closed",
            Self::StreamError { .. } => "stream.error",
            Self::RotationScheduled { .. } => "rotation.scheduled",
            Self::PrewarmStarted => "rotation.prewarm.started",
            Self::RotationCompleted { .. } => "rotation.completed",
            Self::MetricsSnapshot(_) => "metrics.snapshot",
            Self::CoreError { .. } => "core.error",
            Self::AppLog { .. } => "app.log",
        }
    }
}

/// Cloneable publish handle; clones share one broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus with the default per-subscriber queue depth.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_QUEUE_DEPTH);
        Self { tx }
    }

    /// Subscribe; the receiver observes events published after this call
    /// and reports `Lagged` when it falls more than the queue depth
    /// behind.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event, stamping the wallclock. Never blocks; with no
    /// subscribers the event is dropped.
    pub fn publish(&self, kind: EventKind) {
        let event = Event { at_ms: crate::time::unix_now_ms(), kind };
        // Send only fails when there are no receivers; that is fine.
        let _ = self.tx.send(event);
    }

    /// Number of live subscribers (diagnostics).
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
