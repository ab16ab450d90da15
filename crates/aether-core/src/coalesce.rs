//! Adaptive upstream coalescing policy.
//!
//! A fixed batching window either wastes bandwidth (too large) or
//! syscalls (too small). This policy couples batch size and delay to
//! observed record-write latency: slow writes mean the transport is
//! queueing, so widen both knobs to amortize; consistently fast writes on
//! full batches mean there is headroom, so narrow them to cut latency.
//! The policy is pure state - the relay drives it and owns the clock.

use std::time::Duration;

/// Writes slower than this widen the batching knobs.
const SLOW_WRITE: Duration = Duration::from_millis(12);

/// Writes faster than this (on a full batch) narrow the knobs.
const FAST_WRITE: Duration = Duration::from_millis(3);

/// Lower clamp for the coalesce wait.
const MIN_WAIT: Duration = Duration::from_millis(2);

/// Upper clamp for the coalesce wait.
const MAX_WAIT: Duration = Duration::from_millis(40);

/// Lower clamp for the flush threshold.
const MIN_THRESHOLD: usize = 4 * 1024;

/// Default coalesce wait before a partial batch is flushed anyway.
pub const DEFAULT_COALESCE_WAIT: Duration = Duration::from_millis(5);

/// Batching state for one upstream direction.
#[derive(Debug, Clone)]
pub struct CoalescePolicy {
    flush_threshold: usize,
    coalesce_wait: Duration,
    max_threshold: usize,
}

impl CoalescePolicy {
    /// Policy seeded from the record payload cap: threshold starts at one
    /// full record and may grow to two.
    #[must_use]
    pub fn new(max_record_payload: usize) -> Self {
        let max_threshold = max_record_payload.saturating_mul(2).max(MIN_THRESHOLD);
        Self {
            flush_threshold: max_record_payload.clamp(MIN_THRESHOLD, max_threshold),
            coalesce_wait: DEFAULT_COALESCE_WAIT,
            max_threshold,
        }
    }

    /// Bytes to accumulate before flushing without waiting.
    #[must_use]
    pub fn flush_threshold(&self) -> usize {
        self.flush_threshold
    }

    /// Longest time a partial batch may sit before being flushed.
    #[must_use]
    pub fn coalesce_wait(&self) -> Duration {
        self.coalesce_wait
    }

    /// Feed back one observed flush: `latency` of the record write and
    /// whether the flushed batch had reached the threshold.
    pub fn observe(&mut self, latency: Duration, full_batch: bool) {
        if latency > SLOW_WRITE {
            self.flush_threshold = (self.flush_threshold * 2).min(self.max_threshold);
            self.coalesce_wait = (self.coalesce_wait * 2).min(MAX_WAIT);
        } else if latency < FAST_WRITE && full_batch {
            self.flush_threshold = (self.flush_threshold / 2).max(MIN_THRESHOLD);
            self.coalesce_wait = (self.coalesce_wait / 2).max(MIN_WAIT);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_track_record_payload() {
        let policy = CoalescePolicy::new(16 * 1024);
        assert_eq!(policy.flush_threshold(), 16 * 1024);
        assert_eq!(policy.coalesce_wait(), DEFAULT_COALESCE_WAIT);
    }

    #[test]
    fn slow_writes_widen_both_knobs() {
        let mut policy = CoalescePolicy::new(16 * 1024);
        policy.observe(Duration::from_millis(20), false);
        assert_eq!(policy.flush_threshold(), 32 * 1024);
        assert_eq!(policy.coalesce_wait(), Duration::from_millis(10));
    }

    #[test]
    fn widening_clamps_at_twice_the_record_payload_and_40ms() {
        let mut policy = CoalescePolicy::new(16 * 1024);
        for _ in 0..16 {
            policy.observe(Duration::from_millis(100), false);
        }
        assert_eq!(policy.flush_threshold(), 32 * 1024);
        assert_eq!(policy.coalesce_wait(), MAX_WAIT);
    }

    #[test]
    fn fast_full_batches_narrow_both_knobs() {
        let mut policy = CoalescePolicy::new(16 * 1024);
        policy.observe(Duration::from_millis(1), true);
        assert_eq!(policy.flush_threshold(), 8 * 1024);
        assert_eq!(policy.coalesce_wait(), Duration::from_micros(2500));
    }

    #[test]
    fn fast_partial_batches_do_not_narrow() {
        let mut policy = CoalescePolicy::new(16 * 1024);
        policy.observe(Duration::from_millis(1), false);
        assert_eq!(policy.flush_threshold(), 16 * 1024);
        assert_eq!(policy.coalesce_wait(), DEFAULT_COALESCE_WAIT);
    }

    #[test]
    fn narrowing_clamps_at_4kib_and_2ms() {
        let mut policy = CoalescePolicy::new(16 * 1024);
        for _ in 0..16 {
            policy.observe(Duration::from_micros(100), true);
        }
        assert_eq!(policy.flush_threshold(), MIN_THRESHOLD);
        assert_eq!(policy.coalesce_wait(), MIN_WAIT);
    }

    #[test]
    fn midrange_latency_is_stable() {
        let mut policy = CoalescePolicy::new(16 * 1024);
        policy.observe(Duration::from_millis(7), true);
        policy.observe(Duration::from_millis(7), false);
        assert_eq!(policy.flush_threshold(), 16 * 1024);
        assert_eq!(policy.coalesce_wait(), DEFAULT_COALESCE_WAIT);
    }
}
