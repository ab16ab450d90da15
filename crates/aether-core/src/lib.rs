//! Shared runtime for Aether-Realist endpoints.
//!
//! Everything the client core and the gateway have in common above the
//! crypto layer lives here:
//!
//! - [`StateMachine`]: the core lifecycle FSM, sole authority on whether
//!   new streams may be opened
//! - [`RuleEngine`]: destination → {proxy, direct, block, reject}
//! - [`EventBus`]: bounded broadcast of structured events
//! - [`Metrics`]: atomic counters with a periodic snapshot collector
//! - [`RecordSender`] / [`RecordReceiver`]: the record pump bridging
//!   framed, sealed records and plain byte streams
//! - [`relay_bidirectional`]: the TCP ⇄ record relay with adaptive
//!   coalescing, used verbatim by both endpoints
//!
//! Nothing here owns a QUIC endpoint or a listening socket; transports
//! are injected by the `aether-client` and `aether-gateway` crates.

pub mod coalesce;
pub mod error;
pub mod events;
pub mod metrics;
pub mod pump;
pub mod relay;
pub mod rules;
pub mod state;
pub mod time;

pub use coalesce::{CoalescePolicy, DEFAULT_COALESCE_WAIT};
pub use error::{CoreError, Result};
pub use events::{Event, EventBus, EventKind, SessionId, session_id_hex};
pub use metrics::{DEFAULT_SNAPSHOT_INTERVAL, Metrics, MetricsSnapshot, run_collector};
pub use pump::{
    DEFAULT_RECORD_PAYLOAD, MAX_RECORD_PAYLOAD, MIN_RECORD_PAYLOAD, RecordPolicy, RecordReceiver,
    RecordSender,
};
pub use relay::{PerfSample, PerfSink, RelayOutcome, relay_bidirectional};
pub use rules::{
    CidrBlock, GeoProvider, MatchResult, RouteRequest, Rule, RuleAction, RuleEngine, RuleMatch,
    block_ads_rules, bypass_cn_rules,
};
pub use state::{CoreState, StateMachine, transition_allowed};
