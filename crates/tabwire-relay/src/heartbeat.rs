//! Consecutive heartbeat failure tracking.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

/// Failed heartbeats in a row that force the link down.
pub const MAX_MISSED_HEARTBEATS: u32 = 3;

/// Floor for periodic timers; a zero period would panic `interval`.
pub(crate) const MIN_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    missed: u32,
    limit: u32,
}

impl HeartbeatMonitor {
    pub fn new() -> Self {
        Self::with_limit(MAX_MISSED_HEARTBEATS)
    }

    pub fn with_limit(limit: u32) -> Self {
        Self {
            missed: 0,
            limit: limit.max(1),
        }
    }

    pub fn record_success(&mut self) {
        self.missed = 0;
    }

    /// Returns `true` when this failure reaches the limit.
    pub fn record_failure(&mut self) -> bool {
        self.missed = self.missed.saturating_add(1);
        self.missed >= self.limit
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Call `send` every `period`, first right away, until `session` ends.
///
/// On the [`MAX_MISSED_HEARTBEATS`]th failure in a row this cancels
/// `session` and returns `true`.
pub async fn run_heartbeats<F, Fut, E>(period: Duration, session: &CancellationToken, mut send: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: fmt::Display,
{
    let mut ticker = interval(period.max(MIN_PERIOD));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut monitor = HeartbeatMonitor::new();

    loop {
        tokio::select! {
            _ = session.cancelled() => return false,
            _ = ticker.tick() => {}
        }

        match send().await {
            Ok(()) => monitor.record_success(),
            Err(e) => {
                let lost = monitor.record_failure();
                tracing::warn!("Heartbeat failed ({} in a row): {}", monitor.missed(), e);
                if lost {
                    tracing::warn!("Forcing relay reconnect after missed heartbeats");
                    session.cancel();
                    return true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::ready;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn third_failure_trips() {
        let mut monitor = HeartbeatMonitor::new();
        assert!(!monitor.record_failure());
        assert!(!monitor.record_failure());
        assert!(monitor.record_failure());
    }

    #[test]
    fn success_resets() {
        let mut monitor = HeartbeatMonitor::new();
        assert!(!monitor.record_failure());
        assert!(!monitor.record_failure());
        monitor.record_success();
        assert_eq!(monitor.missed(), 0);

        assert!(!monitor.record_failure());
        assert!(!monitor.record_failure());
        assert!(monitor.record_failure());
    }

    #[test]
    fn interleaved_failures_never_trip() {
        let mut monitor = HeartbeatMonitor::new();
        for _ in 0..50 {
            assert!(!monitor.record_failure());
            assert!(!monitor.record_failure());
            monitor.record_success();
        }
    }

    /// Fails the sends whose index is `false` in `script`; later sends succeed.
    async fn beat_with(script: &[bool], session: &CancellationToken) -> (bool, usize) {
        let sent = AtomicUsize::new(0);
        let lost = run_heartbeats(Duration::from_millis(1), session, || {
            let n = sent.fetch_add(1, Ordering::SeqCst);
            let ok = script.get(n).copied().unwrap_or(true);
            ready(if ok { Ok(()) } else { Err("write timed out") })
        })
        .await;
        (lost, sent.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn loop_gives_up_on_third_miss() {
        let session = CancellationToken::new();
        let (lost, sent) = beat_with(&[false, false, false], &session).await;
        assert!(lost);
        assert_eq!(sent, 3);
        assert!(session.is_cancelled());
    }

    #[tokio::test]
    async fn loop_survives_two_misses_between_successes() {
        let session = CancellationToken::new();
        let (lost, sent) = beat_with(&[false, false, true, false, false, false], &session).await;
        assert!(lost);
        assert_eq!(sent, 6);
    }

    #[tokio::test]
    async fn loop_stops_with_session() {
        let session = CancellationToken::new();
        let stopper = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });
        let (lost, sent) = beat_with(&[], &session).await;
        assert!(!lost);
        assert!(sent >= 1);
    }

    #[tokio::test]
    async fn zero_period_does_not_panic() {
        let session = CancellationToken::new();
        let lost = run_heartbeats(Duration::ZERO, &session, || ready(Err::<(), _>("closed"))).await;
        assert!(lost);
    }
}
