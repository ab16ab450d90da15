//! Wallclock helpers.
//!
//! Record timestamps are nanoseconds since the Unix epoch; events carry
//! milliseconds. A clock before the epoch collapses to 0 rather than
//! propagating an error nobody can handle.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wallclock, nanoseconds since the Unix epoch.
#[must_use]
pub fn unix_now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Current wallclock, milliseconds since the Unix epoch.
#[must_use]
pub fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clocks_are_consistent() {
        let ns = unix_now_ns();
        let ms = unix_now_ms();
        // Within a generous second of each other.
        assert!(ms.abs_diff(ns / 1_000_000) < 1_000);
    }
}
