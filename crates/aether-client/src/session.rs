//! Session lifecycle: establish, pre-warm, promote, drain.
//!
//! The manager owns a small pool of tunnel sessions. Exactly one is
//! *primary* (all new streams land on it); during rotation a *warming*
//! successor is dialed in the background and then swapped in, while the
//! outgoing primary keeps serving its existing streams as *draining*
//! until a grace period elapses. This is what makes rotation invisible to
//! user connections.
//!
//! `primary` transitions are serialized under one mutex together with the
//! core FSM; stream opens take a snapshot of the primary under that lock
//! and then dial outside it, so a rotation that lands after the snapshot
//! cannot retroactively invalidate an in-flight open.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use aether_core::{
    CoreError, CoreState, EventBus, EventKind, Metrics, RecordPolicy, RecordReceiver, RecordSender,
    SessionId, StateMachine,
};
use aether_crypto::NonceGenerator;
use rand::{RngCore, rngs::OsRng};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::Mutex,
};

use crate::error::{ClientError, Result};

/// Ceiling on one session dial, handshake included.
pub const SESSION_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a draining session keeps serving its streams after losing
/// primary status.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(120);

/// Settle time between pre-warm and promotion in [`SessionManager::rotate_now`].
const ROTATE_SETTLE: Duration = Duration::from_millis(500);

/// One established tunnel session (a QUIC connection in production).
///
/// Clones are cheap handles onto the same underlying session and may be
/// used concurrently.
pub trait TunnelSession: Clone + Send + Sync + 'static {
    /// Write half of an opened bidirectional stream.
    type SendHalf: AsyncWrite + Unpin + Send + 'static;
    /// Read half of an opened bidirectional stream.
    type RecvHalf: AsyncRead + Unpin + Send + 'static;

    /// Open a bidirectional stream on this session.
    fn open_stream(
        &self,
    ) -> impl Future<Output = Result<(Self::SendHalf, Self::RecvHalf)>> + Send;

    /// Close the session with a code and reason.
    fn close(&self, code: u32, reason: &str);

    /// Resolves when the underlying transport reports closure, with a
    /// human-readable reason.
    fn closed(&self) -> impl Future<Output = String> + Send;
}

/// Dials new tunnel sessions (the injected transport dependency).
pub trait TunnelDial: Send + Sync + 'static {
    /// Session type produced by this dialer.
    type Session: TunnelSession;

    /// Establish a new session to the gateway.
    fn dial(&self) -> impl Future<Output = Result<Self::Session>> + Send;
}

/// Lifecycle of one pooled session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Serving new and existing streams.
    Active,
    /// Serving existing streams only; closes when the grace elapses.
    Draining,
}

/// Knobs for the session manager.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Pre-shared key (already trimmed).
    pub psk: String,
    /// Record policy for all senders.
    pub record_policy: RecordPolicy,
    /// Drain grace for outgoing primaries.
    pub drain_grace: Duration,
    /// Re-dial a warm standby right after each promotion.
    pub keep_standby_warm: bool,
    /// Hard cap on concurrent sessions, draining included.
    pub session_pool_max: usize,
}

impl SessionOptions {
    /// Options with spec defaults for the given PSK.
    #[must_use]
    pub fn new(psk: impl Into<String>) -> Self {
        Self {
            psk: psk.into(),
            record_policy: RecordPolicy::default(),
            drain_grace: DEFAULT_DRAIN_GRACE,
            keep_standby_warm: false,
            session_pool_max: 4,
        }
    }
}

struct SessionEntry<S> {
    session: S,
    nonce: Arc<NonceGenerator>,
    state: SessionState,
}

struct PoolState<S> {
    fsm: StateMachine,
    sessions: HashMap<SessionId, SessionEntry<S>>,
    primary: Option<SessionId>,
    warming: Option<SessionId>,
}

/// A freshly opened tunnel stream, ready for the metadata handshake.
#[derive(Debug)]
pub struct OpenedStream<S: TunnelSession> {
    /// Session the stream belongs to.
    pub session: SessionId,
    /// Sealed-record write half.
    pub sender: RecordSender<S::SendHalf>,
    /// Sealed-record read half.
    pub receiver: RecordReceiver<S::RecvHalf>,
}

/// Owner of the session pool and the core FSM.
pub struct SessionManager<D: TunnelDial> {
    dialer: D,
    options: SessionOptions,
    pool: Mutex<PoolState<D::Session>>,
    bus: EventBus,
    metrics: Arc<Metrics>,
}

enum Role {
    Primary,
    Warming,
}

impl<D: TunnelDial> SessionManager<D> {
    /// Create a manager; nothing is dialed until [`SessionManager::start`].
    #[must_use]
    pub fn new(dialer: D, options: SessionOptions, bus: EventBus, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            dialer,
            options,
            pool: Mutex::new(PoolState {
                fsm: StateMachine::new(),
                sessions: HashMap::new(),
                primary: None,
                warming: None,
            }),
            bus,
            metrics,
        })
    }

    /// Event bus shared with the rest of the core.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Metrics shared with the rest of the core.
    #[must_use]
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Current core state.
    pub async fn state(&self) -> CoreState {
        self.pool.lock().await.fsm.state()
    }

    /// Current primary session id, if any.
    pub async fn primary_id(&self) -> Option<SessionId> {
        self.pool.lock().await.primary
    }

    /// Dial the initial session and become Active.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.transition(CoreState::Starting).await?;

        match self.dial_with_timeout().await {
            Ok(session) => {
                self.install_session(session, Role::Primary).await?;
                self.metrics.mark_session_start();
                self.transition(CoreState::Active).await?;
                Ok(())
            },
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            },
        }
    }

    /// Open a bidirectional stream on the current primary.
    ///
    /// Fails without leaking a half-open stream when the core is not
    /// Active or the primary is gone. A primary with an exhausted nonce
    /// counter triggers an immediate background rotation and reports
    /// `ResourceLimit`-class failure to the caller.
    pub async fn open_stream(self: &Arc<Self>) -> Result<OpenedStream<D::Session>> {
        let (session, nonce, id) = {
            let pool = self.pool.lock().await;
            if !pool.fsm.may_open_streams() {
                return Err(CoreError::NotActive { state: pool.fsm.state() }.into());
            }
            let id = pool
                .primary
                .ok_or_else(|| ClientError::Transport("no primary session".to_string()))?;
            let entry = pool
                .sessions
                .get(&id)
                .ok_or_else(|| ClientError::Transport("primary session vanished".to_string()))?;
            (entry.session.clone(), Arc::clone(&entry.nonce), id)
        };

        if nonce.remaining() == 0 {
            // Rekey: rotate to a fresh session id and derived key.
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = manager.rotate_now().await {
                    tracing::warn!("exhaustion-triggered rotation failed: {e}");
                }
            });
            return Err(ClientError::Core(CoreError::Crypto(
                aether_crypto::CryptoError::CounterExhausted,
            )));
        }

        let (send, recv) = session.open_stream().await?;
        Ok(OpenedStream {
            session: id,
            sender: RecordSender::new(send, &self.options.psk, nonce, self.options.record_policy.clone()),
            receiver: RecordReceiver::new(recv, &self.options.psk),
        })
    }

    /// Dial a successor session and hold it warm.
    ///
    /// Idempotent: a second call while a warm session exists returns the
    /// existing one.
    pub async fn pre_warm(self: &Arc<Self>) -> Result<SessionId> {
        {
            let pool = self.pool.lock().await;
            if let Some(id) = pool.warming {
                return Ok(id);
            }
            if pool.sessions.len() >= self.options.session_pool_max {
                return Err(ClientError::Core(CoreError::Session(format!(
                    "session pool at capacity ({})",
                    self.options.session_pool_max
                ))));
            }
        }

        self.bus.publish(EventKind::PrewarmStarted);

        match self.dial_with_timeout().await {
            Ok(session) => self.install_session(session, Role::Warming).await,
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            },
        }
    }

    /// Swap the warm session in as primary and start draining the old
    /// one.
    pub async fn promote(self: &Arc<Self>) -> Result<()> {
        let (old, new, events) = {
            let mut pool = self.pool.lock().await;
            let Some(new) = pool.warming.take() else {
                return Err(ClientError::Core(CoreError::Session(
                    "no warm session to promote".to_string(),
                )));
            };

            let mut events = Vec::new();
            if pool.fsm.state() == CoreState::Active {
                events.push(pool.fsm.transition_to(CoreState::Rotating)?);
            }

            let old = pool.primary.replace(new);
            if let Some(old_id) = old {
                if let Some(entry) = pool.sessions.get_mut(&old_id) {
                    entry.state = SessionState::Draining;
                }
                events.push(EventKind::SessionRotating { session: old_id });
            }

            if pool.fsm.state() == CoreState::Rotating {
                events.push(pool.fsm.transition_to(CoreState::Active)?);
            }
            (old, new, events)
        };

        for event in events {
            self.bus.publish(event);
        }
        self.metrics.mark_session_start();

        if let Some(old_id) = old {
            self.bus.publish(EventKind::RotationCompleted { old: old_id, new });
            self.spawn_drain(old_id);
        }

        if self.options.keep_standby_warm {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = manager.pre_warm().await {
                    tracing::debug!("standby pre-warm failed: {e}");
                }
            });
        }

        Ok(())
    }

    /// Immediate rotation: pre-warm, settle, promote.
    pub async fn rotate_now(self: &Arc<Self>) -> Result<()> {
        self.pre_warm().await?;
        tokio::time::sleep(ROTATE_SETTLE).await;
        self.promote().await
    }

    /// Close everything and end in Closed.
    pub async fn close(self: &Arc<Self>, reason: &str) {
        let (sessions, closing_event) = {
            let mut pool = self.pool.lock().await;
            let closing_event = pool.fsm.transition_to(CoreState::Closing).ok();
            pool.primary = None;
            pool.warming = None;
            (pool.sessions.drain().collect::<Vec<_>>(), closing_event)
        };

        if let Some(event) = closing_event {
            self.bus.publish(event);
        }

        for (id, entry) in sessions {
            entry.session.close(0, reason);
            self.bus.publish(EventKind::SessionClosed { session: id, reason: reason.to_string() });
        }

        let closed_event = {
            let mut pool = self.pool.lock().await;
            pool.fsm.transition_to(CoreState::Closed).ok()
        };
        if let Some(event) = closed_event {
            self.bus.publish(event);
        }
    }

    async fn dial_with_timeout(&self) -> Result<D::Session> {
        tokio::time::timeout(SESSION_DIAL_TIMEOUT, self.dialer.dial())
            .await
            .map_err(|_| ClientError::Transport("session dial timed out".to_string()))?
    }

    async fn install_session(self: &Arc<Self>, session: D::Session, role: Role) -> Result<SessionId> {
        let id = {
            let mut pool = self.pool.lock().await;
            let id = loop {
                let mut id = [0u8; 4];
                OsRng.fill_bytes(&mut id);
                if !pool.sessions.contains_key(&id) {
                    break id;
                }
            };
            pool.sessions.insert(
                id,
                SessionEntry {
                    session: session.clone(),
                    nonce: Arc::new(NonceGenerator::new(id)),
                    state: SessionState::Active,
                },
            );
            match role {
                Role::Primary => pool.primary = Some(id),
                Role::Warming => pool.warming = Some(id),
            }
            id
        };

        self.bus.publish(EventKind::SessionEstablished { session: id });
        self.spawn_watcher(id, session);
        Ok(id)
    }

    fn spawn_watcher(self: &Arc<Self>, id: SessionId, session: D::Session) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let reason = session.closed().await;
            manager.on_transport_closed(id, reason).await;
        });
    }

    /// The transport reported asynchronous closure: the session goes
    /// straight to Closed and its streams fail on their own I/O.
    async fn on_transport_closed(&self, id: SessionId, reason: String) {
        let (was_live_primary, fsm_event) = {
            let mut pool = self.pool.lock().await;
            let Some(entry) = pool.sessions.remove(&id) else {
                // Already drained or closed by us; the watcher is late.
                return;
            };
            let was_live_primary =
                pool.primary == Some(id) && entry.state == SessionState::Active;
            if pool.primary == Some(id) {
                pool.primary = None;
            }
            if pool.warming == Some(id) {
                pool.warming = None;
            }
            let fsm_event = if was_live_primary && pool.fsm.state() == CoreState::Active {
                pool.fsm.transition_to(CoreState::Error).ok()
            } else {
                None
            };
            (was_live_primary, fsm_event)
        };

        self.bus.publish(EventKind::SessionClosed { session: id, reason: reason.clone() });
        if let Some(event) = fsm_event {
            self.bus.publish(event);
        }
        if was_live_primary {
            self.bus.publish(EventKind::CoreError {
                code: "transport".to_string(),
                message: format!("primary session closed: {reason}"),
            });
        }
    }

    fn spawn_drain(self: &Arc<Self>, id: SessionId) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(manager.options.drain_grace).await;
            manager.close_session(id, "drained").await;
        });
    }

    async fn close_session(&self, id: SessionId, reason: &str) {
        let entry = {
            let mut pool = self.pool.lock().await;
            if pool.primary == Some(id) {
                pool.primary = None;
            }
            if pool.warming == Some(id) {
                pool.warming = None;
            }
            pool.sessions.remove(&id)
        };
        if let Some(entry) = entry {
            entry.session.close(0, reason);
            self.bus.publish(EventKind::SessionClosed { session: id, reason: reason.to_string() });
        }
    }

    async fn transition(&self, to: CoreState) -> Result<()> {
        let event = {
            let mut pool = self.pool.lock().await;
            pool.fsm.transition_to(to)?
        };
        self.bus.publish(event);
        Ok(())
    }

    /// Record a fatal start/rotate failure: FSM to Error plus a
    /// `core.error` event. Existing streams are left to drain on their
    /// own sessions.
    async fn fail(&self, error: &ClientError) {
        let event = {
            let mut pool = self.pool.lock().await;
            pool.fsm.transition_to(CoreState::Error).ok()
        };
        if let Some(event) = event {
            self.bus.publish(event);
        }
        self.bus.publish(EventKind::CoreError {
            code: error.code_str().to_string(),
            message: error.to_string(),
        });
    }
}


#[cfg(test)]
mod tests {
    use aether_core::events::Event;
    use tokio::sync::broadcast;

    use super::{testing::MemoryDial, *};

    fn manager_with(
        options: SessionOptions,
    ) -> (
        Arc<SessionManager<MemoryDial>>,
        broadcast::Receiver<Event>,
        tokio::sync::mpsc::UnboundedReceiver<testing::MemorySession>,
    ) {
        let (dialer, sessions_rx, _peers_rx) = MemoryDial::new();
        let bus = EventBus::new();
        let events = bus.subscribe();
        let manager = SessionManager::new(dialer, options, bus, Metrics::new());
        (manager, events, sessions_rx)
    }

    async fn next_code(events: &mut broadcast::Receiver<Event>) -> String {
        events.recv().await.unwrap().kind.code().to_string()
    }

    #[tokio::test]
    async fn start_establishes_primary_and_goes_active() {
        let (manager, mut events, _) = manager_with(SessionOptions::new("psk"));

        manager.start().await.unwrap();

        assert_eq!(manager.state().await, CoreState::Active);
        assert!(manager.primary_id().await.is_some());

        assert_eq!(next_code(&mut events).await, "core.stateChanged"); // Idle->Starting
        assert_eq!(next_code(&mut events).await, "session.established");
        assert_eq!(next_code(&mut events).await, "core.stateChanged"); // Starting->Active
    }

    #[tokio::test]
    async fn dial_failure_moves_to_error() {
        let (manager, mut events, _) = manager_with(SessionOptions::new("psk"));
        manager.dialer.fail.store(true, std::sync::atomic::Ordering::SeqCst);

        assert!(manager.start().await.is_err());
        assert_eq!(manager.state().await, CoreState::Error);

        assert_eq!(next_code(&mut events).await, "core.stateChanged"); // Idle->Starting
        assert_eq!(next_code(&mut events).await, "core.stateChanged"); // Starting->Error
        assert_eq!(next_code(&mut events).await, "core.error");
    }

    #[tokio::test]
    async fn open_stream_requires_active() {
        let (manager, _events, _) = manager_with(SessionOptions::new("psk"));
        let err = manager.open_stream().await.unwrap_err();
        assert!(matches!(err, ClientError::Core(CoreError::NotActive { .. })));
    }

    #[tokio::test]
    async fn open_stream_on_primary_succeeds() {
        let (manager, _events, _) = manager_with(SessionOptions::new("psk"));
        manager.start().await.unwrap();

        let opened = manager.open_stream().await.unwrap();
        assert_eq!(Some(opened.session), manager.primary_id().await);
    }

    #[tokio::test]
    async fn rotate_now_swaps_primary_and_drains_old() {
        let (manager, _events, _) = manager_with(SessionOptions::new("psk"));
        manager.start().await.unwrap();
        let first = manager.primary_id().await.unwrap();

        manager.rotate_now().await.unwrap();

        let second = manager.primary_id().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(manager.state().await, CoreState::Active);

        // Old session still present (draining) until the grace elapses.
        let pool = manager.pool.lock().await;
        assert_eq!(pool.sessions.get(&first).map(|e| e.state), Some(SessionState::Draining));
        assert_eq!(pool.sessions.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn draining_session_closes_after_grace() {
        let mut options = SessionOptions::new("psk");
        options.drain_grace = Duration::from_secs(120);
        let (manager, _events, _) = manager_with(options);
        manager.start().await.unwrap();
        let first = manager.primary_id().await.unwrap();

        manager.rotate_now().await.unwrap();
        assert_eq!(manager.pool.lock().await.sessions.len(), 2);

        tokio::time::advance(Duration::from_secs(121)).await;
        // Let the drain task run.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let pool = manager.pool.lock().await;
        assert!(!pool.sessions.contains_key(&first));
        assert_eq!(pool.sessions.len(), 1);
    }

    #[tokio::test]
    async fn pre_warm_is_idempotent() {
        let (manager, _events, _) = manager_with(SessionOptions::new("psk"));
        manager.start().await.unwrap();

        let a = manager.pre_warm().await.unwrap();
        let b = manager.pre_warm().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(manager.dialer.dialed.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn promote_without_warm_session_fails() {
        let (manager, _events, _) = manager_with(SessionOptions::new("psk"));
        manager.start().await.unwrap();
        assert!(manager.promote().await.is_err());
    }

    #[tokio::test]
    async fn exhausted_counter_triggers_rotation_and_resource_error() {
        let (manager, _events, _) = manager_with(SessionOptions::new("psk"));
        manager.start().await.unwrap();
        let first = manager.primary_id().await.unwrap();

        // Exhaust the primary's counter by swapping in a generator that
        // sits at the ceiling.
        {
            let mut pool = manager.pool.lock().await;
            if let Some(entry) = pool.sessions.get_mut(&first) {
                entry.nonce = Arc::new(NonceGenerator::resumed_at(
                    first,
                    aether_crypto::COUNTER_CEILING - 1,
                ));
            }
        }

        let err = manager.open_stream().await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Core(CoreError::Crypto(aether_crypto::CryptoError::CounterExhausted))
        ));

        // The background rotation lands; subsequent opens succeed on a
        // fresh session.
        let mut waited = 0;
        loop {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if manager.primary_id().await != Some(first) {
                break;
            }
            waited += 1;
            assert!(waited < 100, "rotation never happened");
        }
        assert_eq!(manager.state().await, CoreState::Active);
        manager.open_stream().await.unwrap();
    }

    #[tokio::test]
    async fn transport_closure_of_primary_is_fatal() {
        let (manager, mut events, mut sessions) = manager_with(SessionOptions::new("psk"));
        manager.start().await.unwrap();
        let handle = sessions.recv().await.unwrap();

        // Drain startup events.
        while events.try_recv().is_ok() {}

        handle.force_close("network gone");

        // Watcher marks the session closed and the core Error.
        let mut saw_closed = false;
        let mut saw_error_state = false;
        for _ in 0..3 {
            let event = events.recv().await.unwrap();
            match event.kind {
                EventKind::SessionClosed { .. } => saw_closed = true,
                EventKind::StateChanged { to: CoreState::Error, .. } => saw_error_state = true,
                _ => {},
            }
        }
        assert!(saw_closed);
        assert!(saw_error_state);
        assert_eq!(manager.state().await, CoreState::Error);
        assert_eq!(manager.primary_id().await, None);
    }

    #[tokio::test]
    async fn close_ends_in_closed_state() {
        let (manager, _events, _) = manager_with(SessionOptions::new("psk"));
        manager.start().await.unwrap();
        manager.rotate_now().await.unwrap();

        manager.close("shutdown").await;

        assert_eq!(manager.state().await, CoreState::Closed);
        assert!(manager.pool.lock().await.sessions.is_empty());

        // Closed is a valid re-entry point.
        manager.start().await.unwrap();
        assert_eq!(manager.state().await, CoreState::Active);
    }

    #[tokio::test]
    async fn pool_capacity_bounds_pre_warm() {
        let mut options = SessionOptions::new("psk");
        options.session_pool_max = 1;
        let (manager, _events, _) = manager_with(options);
        manager.start().await.unwrap();

        let err = manager.pre_warm().await.unwrap_err();
        assert!(matches!(err, ClientError::Core(CoreError::Session(_))));
    }
}
