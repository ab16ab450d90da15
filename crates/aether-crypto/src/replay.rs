//! Per-stream anti-replay validation.
//!
//! Two deterministic checks run before a record's payload is touched:
//! the sender timestamp must fall within a wallclock window, and the
//! record counter must strictly exceed the last accepted counter on the
//! stream. Together with the nonce construction this rejects replayed
//! records without any shared cache across streams.

use std::time::Duration;

use crate::error::CryptoError;

/// Default timestamp window (spec: 30 seconds either direction).
pub const DEFAULT_REPLAY_WINDOW: Duration = Duration::from_secs(30);

/// Replay state for a single stream direction.
///
/// `last_seen_counter` seeds at 0 and the predicate is strict increase,
/// matching a sender whose generator emits 1 on its first record. A
/// literal counter of 0 is therefore never accepted.
#[derive(Debug, Clone)]
pub struct ReplayGuard {
    window: Duration,
    last_seen_counter: u64,
}

impl ReplayGuard {
    /// Guard with the default 30 s window.
    #[must_use]
    pub fn new() -> Self {
        Self::with_window(DEFAULT_REPLAY_WINDOW)
    }

    /// Guard with a custom timestamp window.
    #[must_use]
    pub fn with_window(window: Duration) -> Self {
        Self { window, last_seen_counter: 0 }
    }

    /// Highest counter accepted so far (0 before the first record).
    #[must_use]
    pub fn last_seen_counter(&self) -> u64 {
        self.last_seen_counter
    }

    /// Validate a record's replay fields and, on success, advance the
    /// stream's counter watermark.
    ///
    /// `now_ns` is the receiver's wallclock in nanoseconds since the Unix
    /// epoch; passing it in keeps the guard deterministic under test.
    ///
    /// # Errors
    ///
    /// - `CryptoError::TimestampOutsideWindow` if `|now - timestamp|`
    ///   exceeds the window
    /// - `CryptoError::CounterNotMonotonic` if the counter does not
    ///   strictly increase
    pub fn check(&mut self, timestamp_ns: u64, counter: u64, now_ns: u64) -> Result<(), CryptoError> {
        let skew_ns = now_ns.abs_diff(timestamp_ns);
        let window_ns = self.window.as_nanos() as u64;
        if skew_ns > window_ns {
            return Err(CryptoError::TimestampOutsideWindow { skew_ns, window_ns });
        }

        if counter <= self.last_seen_counter {
            return Err(CryptoError::CounterNotMonotonic {
                counter,
                last_seen: self.last_seen_counter,
            });
        }

        self.last_seen_counter = counter;
        Ok(())
    }
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000_000;

    #[test]
    fn accepts_first_record_with_counter_one() {
        let mut guard = ReplayGuard::new();
        assert!(guard.check(100 * SEC, 1, 100 * SEC).is_ok());
    }

    #[test]
    fn rejects_counter_zero() {
        let mut guard = ReplayGuard::new();
        assert_eq!(
            guard.check(100 * SEC, 0, 100 * SEC),
            Err(CryptoError::CounterNotMonotonic { counter: 0, last_seen: 0 })
        );
    }

    #[test]
    fn rejects_replayed_counter() {
        let mut guard = ReplayGuard::new();
        guard.check(100 * SEC, 5, 100 * SEC).unwrap();
        assert!(matches!(
            guard.check(100 * SEC, 5, 100 * SEC),
            Err(CryptoError::CounterNotMonotonic { .. })
        ));
        assert!(matches!(
            guard.check(100 * SEC, 3, 100 * SEC),
            Err(CryptoError::CounterNotMonotonic { .. })
        ));
    }

    #[test]
    fn accepts_counter_gaps() {
        // Lost records leave gaps; monotonicity, not contiguity, is required.
        let mut guard = ReplayGuard::new();
        guard.check(100 * SEC, 1, 100 * SEC).unwrap();
        guard.check(100 * SEC, 100, 100 * SEC).unwrap();
        assert_eq!(guard.last_seen_counter(), 100);
    }

    #[test]
    fn window_is_symmetric() {
        let mut guard = ReplayGuard::new();
        // Sender 20 s behind: fine.
        guard.check(80 * SEC, 1, 100 * SEC).unwrap();
        // Sender 20 s ahead: fine.
        guard.check(120 * SEC, 2, 100 * SEC).unwrap();
    }

    #[test]
    fn rejects_outside_window_both_directions() {
        let mut guard = ReplayGuard::new();
        assert!(matches!(
            guard.check(55 * SEC, 1, 100 * SEC),
            Err(CryptoError::TimestampOutsideWindow { .. })
        ));
        assert!(matches!(
            guard.check(145 * SEC, 1, 100 * SEC),
            Err(CryptoError::TimestampOutsideWindow { .. })
        ));
        // Rejected records do not advance the watermark.
        assert_eq!(guard.last_seen_counter(), 0);
    }

    #[test]
    fn skew_at_exact_window_boundary_accepted() {
        let mut guard = ReplayGuard::new();
        assert!(guard.check(70 * SEC, 1, 100 * SEC).is_ok());
    }

    #[test]
    fn clock_skew_scenario() {
        // Receiver 45 s ahead of sender: reject. Corrected to 20 s: accept.
        let mut guard = ReplayGuard::new();
        assert!(guard.check(100 * SEC, 1, 145 * SEC).is_err());
        assert!(guard.check(100 * SEC, 1, 120 * SEC).is_ok());
    }
}
