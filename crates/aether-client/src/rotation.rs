//! Jittered rotation scheduling.
//!
//! Each cycle draws its interval uniformly from `[min, max]` with a
//! cryptographic RNG, pre-warms the successor shortly before the
//! deadline, and promotes it at the deadline. Jitter defeats
//! fingerprinting by fixed cadence; pre-warming removes user-visible
//! downtime at the swap.

use std::{sync::Arc, time::Duration};

use aether_core::EventKind;
use rand::{Rng, rngs::OsRng};
use tokio::sync::watch;

use crate::session::{SessionManager, TunnelDial};

/// Pre-warm lead time coerced to this delay when it would land in the
/// past.
const LATE_PREWARM_DELAY: Duration = Duration::from_secs(5);

/// Rotation policy.
#[derive(Debug, Clone)]
pub struct RotationPolicy {
    /// Whether the scheduler runs.
    pub enabled: bool,
    /// Lower interval bound.
    pub min_interval: Duration,
    /// Upper interval bound.
    pub max_interval: Duration,
    /// Lead time between pre-warm and promotion.
    pub pre_warm: Duration,
    /// Draw intervals uniformly from `[min, max]`; pinned to `min` when
    /// off.
    pub jitter: bool,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval: Duration::from_secs(15 * 60),
            max_interval: Duration::from_secs(40 * 60),
            pre_warm: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RotationPolicy {
    /// Draw the next rotation interval.
    #[must_use]
    pub fn draw_interval(&self) -> Duration {
        if !self.jitter || self.max_interval <= self.min_interval {
            return self.min_interval;
        }
        let min_ms = self.min_interval.as_millis() as u64;
        let max_ms = self.max_interval.as_millis() as u64;
        Duration::from_millis(OsRng.gen_range(min_ms..=max_ms))
    }

    /// Split an interval into (pre-warm delay, promote delay after
    /// pre-warm). A pre-warm that would land in the past is coerced to
    /// [`LATE_PREWARM_DELAY`] from now.
    #[must_use]
    pub fn schedule(&self, interval: Duration) -> (Duration, Duration) {
        let prewarm_at = match interval.checked_sub(self.pre_warm) {
            Some(lead) => lead,
            None => LATE_PREWARM_DELAY.min(interval),
        };
        (prewarm_at, interval.saturating_sub(prewarm_at))
    }
}

/// Handle to a running scheduler; stopping is cooperative and
/// idempotent.
#[derive(Debug)]
pub struct RotationHandle {
    stop: watch::Sender<bool>,
}

impl RotationHandle {
    /// Signal the scheduler to stop after its current await point.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

/// Spawn the rotation scheduler for a session manager.
///
/// Does nothing (but still returns a handle) when the policy is
/// disabled.
pub fn spawn_scheduler<D: TunnelDial>(
    manager: Arc<SessionManager<D>>,
    policy: RotationPolicy,
) -> RotationHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    if policy.enabled {
        tokio::spawn(run_scheduler(manager, policy, stop_rx));
    }
    RotationHandle { stop: stop_tx }
}

async fn run_scheduler<D: TunnelDial>(
    manager: Arc<SessionManager<D>>,
    policy: RotationPolicy,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let interval = policy.draw_interval();
        let (prewarm_delay, promote_delay) = policy.schedule(interval);

        manager.bus().publish(EventKind::RotationScheduled { in_ms: interval.as_millis() as u64 });

        if sleep_or_stop(prewarm_delay, &mut stop).await {
            return;
        }
        if let Err(e) = manager.pre_warm().await {
            tracing::warn!("scheduled pre-warm failed: {e}");
            // The manager already moved to Error; stop rather than spin.
            return;
        }

        if sleep_or_stop(promote_delay, &mut stop).await {
            return;
        }
        if let Err(e) = manager.promote().await {
            tracing::warn!("scheduled promotion failed: {e}");
            return;
        }
    }
}

/// Sleep for `delay`, returning `true` if the stop signal fired first.
async fn sleep_or_stop(delay: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    if *stop.borrow() {
        return true;
    }
    tokio::select! {
        () = tokio::time::sleep(delay) => false,
        result = stop.changed() => result.is_err() || *stop.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use aether_core::{EventBus, Metrics};

    use super::*;
    use crate::session::{SessionOptions, testing::MemoryDial};

    #[test]
    fn jitter_draws_stay_in_bounds() {
        let policy = RotationPolicy {
            enabled: true,
            min_interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(20),
            pre_warm: Duration::from_secs(2),
            jitter: true,
        };
        for _ in 0..200 {
            let interval = policy.draw_interval();
            assert!(interval >= policy.min_interval);
            assert!(interval <= policy.max_interval);
        }
    }

    #[test]
    fn disabled_jitter_pins_to_min() {
        let policy = RotationPolicy { jitter: false, ..RotationPolicy::default() };
        assert_eq!(policy.draw_interval(), policy.min_interval);
    }

    #[test]
    fn schedule_splits_around_pre_warm() {
        let policy = RotationPolicy {
            pre_warm: Duration::from_secs(30),
            ..RotationPolicy::default()
        };
        let (prewarm, promote) = policy.schedule(Duration::from_secs(600));
        assert_eq!(prewarm, Duration::from_secs(570));
        assert_eq!(promote, Duration::from_secs(30));
    }

    #[test]
    fn late_pre_warm_coerced_forward() {
        let policy = RotationPolicy {
            pre_warm: Duration::from_secs(30),
            ..RotationPolicy::default()
        };
        // Interval shorter than the lead: pre-warm 5 s from now.
        let (prewarm, promote) = policy.schedule(Duration::from_secs(12));
        assert_eq!(prewarm, Duration::from_secs(5));
        assert_eq!(promote, Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_rotates_on_cadence() {
        let (dialer, _sessions, _peers) = MemoryDial::new();
        let bus = EventBus::new();
        let manager = SessionManager::new(dialer, SessionOptions::new("psk"), bus, Metrics::new());
        manager.start().await.unwrap();
        let first = manager.primary_id().await.unwrap();

        let policy = RotationPolicy {
            enabled: true,
            min_interval: Duration::from_secs(60),
            max_interval: Duration::from_secs(60),
            pre_warm: Duration::from_secs(10),
            jitter: false,
        };
        let handle = spawn_scheduler(Arc::clone(&manager), policy);

        // Walk past one full cycle.
        for _ in 0..200 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
            if manager.primary_id().await != Some(first) {
                break;
            }
        }
        assert_ne!(manager.primary_id().await, Some(first), "scheduler never promoted");

        handle.stop();
        handle.stop(); // idempotent
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_scheduler_does_not_rotate() {
        let (dialer, _sessions, _peers) = MemoryDial::new();
        let bus = EventBus::new();
        let manager = SessionManager::new(dialer, SessionOptions::new("psk"), bus, Metrics::new());
        manager.start().await.unwrap();
        let first = manager.primary_id().await.unwrap();

        let policy = RotationPolicy {
            enabled: true,
            min_interval: Duration::from_secs(30),
            max_interval: Duration::from_secs(30),
            pre_warm: Duration::from_secs(5),
            jitter: false,
        };
        let handle = spawn_scheduler(Arc::clone(&manager), policy);
        handle.stop();

        for _ in 0..120 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }
        assert_eq!(manager.primary_id().await, Some(first));
    }
}
