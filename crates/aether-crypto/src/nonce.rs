//! Deterministic GCM nonce construction.
//!
//! The 96-bit nonce is `session_id (4 bytes) ∥ counter (8 bytes, big
//! endian)`. The session id is random per session and direction; the
//! counter is strictly monotonic and capped at 2^32, the GCM safe-usage
//! bound for a single key. Replacing per-record random IVs with mutable
//! state means receivers can validate `(session_id, counter)` without a
//! replay cache or clock sync.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::CryptoError;

/// Size of the AES-GCM nonce (96 bits).
pub const NONCE_SIZE: usize = 12;

/// First counter value the generator refuses to emit. Reaching it signals
/// rekey via [`CryptoError::CounterExhausted`].
pub const COUNTER_CEILING: u64 = 1 << 32;

/// Per-session, per-direction nonce source.
///
/// The counter is the only mutable field; it advances with a
/// compare-exchange update that detects the ceiling *before* handing out
/// a value, so an exhausted generator can never produce a nonce.
///
/// The first emitted counter is 1; receivers seed their replay state at 0
/// and require strict increase.
#[derive(Debug)]
pub struct NonceGenerator {
    session_id: [u8; 4],
    counter: AtomicU64,
}

impl NonceGenerator {
    /// Create a generator for a session id. The id must be
    /// cryptographically random and unique per (session, direction);
    /// drawing it is the caller's job.
    #[must_use]
    pub fn new(session_id: [u8; 4]) -> Self {
        Self { session_id, counter: AtomicU64::new(0) }
    }

    /// Create a generator whose next emitted counter is `counter + 1`.
    ///
    /// Diagnostic constructor for exercising the exhaustion path; normal
    /// sessions always start from [`NonceGenerator::new`].
    #[must_use]
    pub fn resumed_at(session_id: [u8; 4], counter: u64) -> Self {
        Self { session_id, counter: AtomicU64::new(counter) }
    }

    /// Session id this generator stamps into nonces.
    #[must_use]
    pub fn session_id(&self) -> [u8; 4] {
        self.session_id
    }

    /// Counters still available before exhaustion.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        COUNTER_CEILING.saturating_sub(self.counter.load(Ordering::Relaxed)).saturating_sub(1)
    }

    /// Produce the next unique `(nonce, counter)` pair.
    ///
    /// # Errors
    ///
    /// - `CryptoError::CounterExhausted` once the next counter would reach
    ///   [`COUNTER_CEILING`]; the generator stays exhausted forever after
    pub fn next(&self) -> Result<([u8; NONCE_SIZE], u64), CryptoError> {
        let previous = self
            .counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                let next = current + 1;
                (next < COUNTER_CEILING).then_some(next)
            })
            .map_err(|_| CryptoError::CounterExhausted)?;

        let counter = previous + 1;
        Ok((nonce_for(self.session_id, counter), counter))
    }
}

/// Assemble the 12-byte nonce `session_id ∥ counter_be`.
///
/// Receivers call this with the header's session id and counter to open
/// a sealed payload; senders get the same bytes from
/// [`NonceGenerator::next`].
#[must_use]
pub fn nonce_for(session_id: [u8; 4], counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..4].copy_from_slice(&session_id);
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}
