//! Heartbeat and telemetry watchdog.
//!
//! While the client holds control of the hand it sends a keep-alive `Acquire`
//! every period; the server releases control if those stop. Independently, a
//! watchdog counts ticks since the last accepted telemetry frame. Telemetry is
//! published continuously, so silence means the link is gone.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::commands::CommandHandler;
use crate::transport::Transport;

/// Snapshot of the liveness counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessState {
    /// Ticks since the last accepted telemetry frame.
    pub watchdog_ticks_since_telemetry: u32,
    /// When the last heartbeat was sent.
    pub last_heartbeat_sent_at: Option<Instant>,
    /// The client holds control of the hand.
    pub ownership_acquired: bool,
    /// The watchdog fired. Latched for the rest of the session.
    pub failed: bool,
}

/// Result of one watchdog tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// A heartbeat should be sent.
    pub send_heartbeat: bool,
    /// Set on the tick that crossed the threshold.
    pub failure: Option<u32>,
}

/// Shared liveness state.
pub struct Liveness {
    state: Mutex<LivenessState>,
    heartbeat: watch::Sender<Option<Instant>>,
    threshold: u32,
    freshness: Duration,
}

impl Liveness {
    /// Creates the state with the given watchdog threshold and heartbeat
    /// freshness bound.
    #[must_use]
    pub fn new(threshold: u32, freshness: Duration) -> Self {
        Self {
            state: Mutex::new(LivenessState {
                watchdog_ticks_since_telemetry: 0,
                last_heartbeat_sent_at: None,
                ownership_acquired: false,
                failed: false,
            }),
            heartbeat: watch::Sender::new(None),
            threshold,
            freshness,
        }
    }

    /// Returns a copy of the counters.
    #[must_use]
    pub fn state(&self) -> LivenessState {
        *self.state.lock()
    }

    /// Advances the watchdog by one tick.
    ///
    /// Crossing the threshold revokes ownership and latches the failure.
    pub fn tick(&self) -> Tick {
        let mut state = self.state.lock();
        let send_heartbeat = state.ownership_acquired && !state.failed;
        state.watchdog_ticks_since_telemetry = state.watchdog_ticks_since_telemetry.saturating_add(1);

        let mut failure = None;
        if !state.failed && state.watchdog_ticks_since_telemetry >= self.threshold {
            state.failed = true;
            state.ownership_acquired = false;
            failure = Some(state.watchdog_ticks_since_telemetry);
        }
        drop(state);

        if failure.is_some() {
            self.notify();
        }
        Tick {
            send_heartbeat,
            failure,
        }
    }

    /// Resets the watchdog. Called for every accepted telemetry frame.
    pub fn on_telemetry(&self) {
        self.state.lock().watchdog_ticks_since_telemetry = 0;
    }

    /// Records that a heartbeat went out.
    pub fn record_heartbeat(&self, at: Instant) {
        self.state.lock().last_heartbeat_sent_at = Some(at);
        self.heartbeat.send_replace(Some(at));
    }

    /// Sets ownership. Ignored once the watchdog fired.
    pub fn set_owned(&self, owned: bool) {
        {
            let mut state = self.state.lock();
            if state.failed {
                return;
            }
            state.ownership_acquired = owned;
        }
        self.notify();
    }

    /// Returns true while the client holds control of the hand.
    #[must_use]
    pub fn is_owned(&self) -> bool {
        self.state.lock().ownership_acquired
    }

    /// Returns the tick count at which the watchdog fired, if it did.
    #[must_use]
    pub fn failure(&self) -> Option<u32> {
        let state = self.state.lock();
        state.failed.then_some(state.watchdog_ticks_since_telemetry)
    }

    /// Waits until the last heartbeat is younger than the freshness bound.
    ///
    /// Returns immediately when the client does not hold control, since no
    /// heartbeats are sent then.
    pub async fn await_recent_heartbeat(&self) {
        let mut rx = self.heartbeat.subscribe();
        loop {
            let last = *rx.borrow_and_update();
            if !self.is_owned() || last.is_some_and(|at| at.elapsed() < self.freshness) {
                return;
            }
            // Woken by the next heartbeat or an ownership change.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn notify(&self) {
        self.heartbeat.send_modify(|_| {});
    }
}

/// Runs the heartbeat/watchdog ticker until the session closes or the
/// watchdog fires.
///
/// Returns the tick count on liveness failure.
pub async fn run_heartbeat<T: Transport>(
    liveness: Arc<Liveness>,
    commands: Arc<CommandHandler<T>>,
    period: Duration,
    closed: CancellationToken,
) -> Option<u32> {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = closed.cancelled() => return None,
            _ = interval.tick() => {}
        }

        let tick = liveness.tick();
        if tick.send_heartbeat {
            match commands.send_heartbeat().await {
                Ok(true) => liveness.record_heartbeat(Instant::now()),
                Ok(false) => tracing::trace!("heartbeat skipped during emergency abort"),
                Err(e) => tracing::warn!("heartbeat send failed: {e}"),
            }
        }
        if let Some(ticks) = tick.failure {
            tracing::error!(ticks, "no telemetry received, link considered lost");
            return Some(ticks);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watchdog_fires_at_threshold() {
        let liveness = Liveness::new(10, Duration::from_millis(500));
        liveness.set_owned(true);

        for _ in 0..9 {
            let tick = liveness.tick();
            assert!(tick.send_heartbeat);
            assert!(tick.failure.is_none());
        }
        let tick = liveness.tick();
        assert_eq!(tick.failure, Some(10));
        assert!(!liveness.is_owned());
        assert_eq!(liveness.failure(), Some(10));

        // Latched: no second failure, no more heartbeats.
        let tick = liveness.tick();
        assert!(!tick.send_heartbeat);
        assert!(tick.failure.is_none());
    }

    #[test]
    fn test_telemetry_resets_watchdog() {
        let liveness = Liveness::new(10, Duration::from_millis(500));
        for _ in 0..50 {
            for _ in 0..9 {
                assert!(liveness.tick().failure.is_none());
            }
            liveness.on_telemetry();
        }
        assert_eq!(liveness.state().watchdog_ticks_since_telemetry, 0);
        assert!(liveness.failure().is_none());
    }

    #[test]
    fn test_no_heartbeat_without_ownership() {
        let liveness = Liveness::new(10, Duration::from_millis(500));
        assert!(!liveness.tick().send_heartbeat);
    }

    #[test]
    fn test_ownership_cannot_return_after_failure() {
        let liveness = Liveness::new(1, Duration::from_millis(500));
        liveness.set_owned(true);
        assert!(liveness.tick().failure.is_some());
        liveness.set_owned(true);
        assert!(!liveness.is_owned());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_heartbeat_gate() {
        let liveness = Arc::new(Liveness::new(10, Duration::from_millis(500)));

        // Not owned: no gate.
        liveness.await_recent_heartbeat().await;

        liveness.set_owned(true);
        liveness.record_heartbeat(Instant::now());
        liveness.await_recent_heartbeat().await;

        tokio::time::advance(Duration::from_millis(600)).await;
        let waiter = {
            let liveness = Arc::clone(&liveness);
            tokio::spawn(async move { liveness.await_recent_heartbeat().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        liveness.record_heartbeat(Instant::now());
        tokio::time::timeout(Duration::from_millis(10), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_gate_released_on_ownership_loss() {
        let liveness = Arc::new(Liveness::new(10, Duration::from_millis(500)));
        liveness.set_owned(true);

        let waiter = {
            let liveness = Arc::clone(&liveness);
            tokio::spawn(async move { liveness.await_recent_heartbeat().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        liveness.set_owned(false);
        tokio::time::timeout(Duration::from_millis(10), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
