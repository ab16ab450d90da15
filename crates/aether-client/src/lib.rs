//! Aether-Realist client core.
//!
//! Accepts local application traffic on SOCKS5 and HTTP CONNECT
//! listeners and tunnels each destination connection as an independent
//! QUIC bidirectional stream through a gateway.
//!
//! # Architecture
//!
//! - [`SessionManager`]: pool of tunnel sessions with pre-warm /
//!   promote / drain rotation; owner of the core state machine
//! - [`rotation`]: jittered scheduler driving the manager
//! - [`Dispatcher`]: rule evaluation and the per-connection pipeline
//!   (metadata handshake, bidirectional pump)
//! - [`socks`] / [`http_connect`]: thin local wire front-ends
//! - [`health`]: Ping/Pong round-trip probing on the primary session
//! - [`QuinnDialer`]: the injected QUIC transport
//!
//! The shared runtime (records, crypto, relay, events, metrics) comes
//! from `aether-core`.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod http_connect;
pub mod rotation;
pub mod session;
pub mod socks;
pub mod transport;

pub use config::{ClientConfig, RotationConfig, ServerEndpoint};
pub use dispatch::{Dispatcher, Prepared, ProxyStream};
pub use error::{ClientError, Result};
pub use health::{DEFAULT_PROBE_INTERVAL, ProbeHandle, spawn_prober};
pub use rotation::{RotationHandle, RotationPolicy, spawn_scheduler};
pub use session::{
    DEFAULT_DRAIN_GRACE, OpenedStream, SESSION_DIAL_TIMEOUT, SessionManager, SessionOptions,
    SessionState, TunnelDial, TunnelSession,
};
pub use transport::{QuinnDialer, QuinnSession};
