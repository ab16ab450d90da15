//! Record cryptosystem for the Aether-Realist relay protocol.
//!
//! Four primitives, each deliberately small:
//!
//! - [`NonceGenerator`]: `session_id ∥ counter` nonces with a hard 2^32
//!   ceiling, so a GCM nonce can never repeat within a key's lifetime and
//!   receivers get a deterministic replay predicate for free.
//! - [`derive_record_key`]: HKDF-SHA256 from the pre-shared key, salted
//!   by the sender's session id that travels in every record header.
//! - [`seal`] / [`open`]: AES-128-GCM over the payload with the full
//!   30-byte record header as associated data.
//! - [`ReplayGuard`]: per-stream timestamp-window and counter-monotonicity
//!   checks applied before any payload is touched.
//!
//! All functions are pure with respect to I/O; randomness (session ids)
//! must be provided by the caller. This keeps the crate deterministic
//! under test and free of any async or transport dependency.

mod derive;
mod error;
mod nonce;
mod replay;
mod seal;

pub use derive::{KEY_SIZE, RecordKey, derive_record_key};
pub use error::CryptoError;
pub use nonce::{COUNTER_CEILING, NONCE_SIZE, NonceGenerator, nonce_for};
pub use replay::{DEFAULT_REPLAY_WINDOW, ReplayGuard};
pub use seal::{TAG_SIZE, open, seal};
