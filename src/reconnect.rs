//! Autoreconnect backoff policy and controller.
//!
//! The growth law lives in [`next_interval`], a pure function. The
//! [`ReconnectController`] owns the only mutable state: the current interval,
//! the single pending timer, and the in-flight marker of the attempt that timer
//! started.
//!
//! Retries never give up. Restoring realtime presence is best-effort, so the
//! controller keeps trying at the capped interval until the client is closed or
//! an attempt succeeds.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Sleep};
use tracing::debug;

/// Smallest reconnect delay, used after every success.
pub const DEFAULT_BACKOFF_FLOOR: Duration = Duration::from_millis(1000);

/// Largest reconnect delay.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_millis(60_000);

/// Double `current`, never exceeding `cap`.
pub fn next_interval(current: Duration, cap: Duration) -> Duration {
    current.saturating_mul(2).min(cap)
}

/// Bounds of the reconnect delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// First delay, and the delay after every success.
    pub floor: Duration,
    /// Upper bound on the delay.
    pub cap: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            floor: DEFAULT_BACKOFF_FLOOR,
            cap: DEFAULT_BACKOFF_CAP,
        }
    }
}

impl ReconnectPolicy {
    /// Create a policy. A cap below the floor is raised to the floor.
    pub fn new(floor: Duration, cap: Duration) -> Self {
        Self {
            floor,
            cap: cap.max(floor),
        }
    }
}

/// Point-in-time view of the reconnect state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectStatus {
    /// Whether a disconnect may schedule a retry.
    pub enabled: bool,
    /// Delay the next scheduled retry will use.
    pub interval: Duration,
    /// Whether a retry timer is pending.
    pub timer_armed: bool,
    /// Attempts started since the last success.
    pub attempts: u32,
}

/// Owns the reconnect interval, the pending timer, and the in-flight attempt.
pub struct ReconnectController {
    enabled: bool,
    policy: ReconnectPolicy,
    interval: Duration,
    timer: Option<Pin<Box<Sleep>>>,
    in_flight: bool,
    attempts: u32,
}

impl ReconnectController {
    /// Create a controller with no pending timer.
    pub fn new(enabled: bool, policy: ReconnectPolicy) -> Self {
        Self {
            enabled,
            policy,
            interval: policy.floor,
            timer: None,
            in_flight: false,
            attempts: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Turn autoreconnect on or off. Disabling also clears the timer.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.clear_timeout();
            self.in_flight = false;
        }
    }

    /// Delay the next retry will use.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_timer_armed(&self) -> bool {
        self.timer.is_some()
    }

    pub fn status(&self) -> ReconnectStatus {
        ReconnectStatus {
            enabled: self.enabled,
            interval: self.interval,
            timer_armed: self.is_timer_armed(),
            attempts: self.attempts,
        }
    }

    /// Arm the timer for the current interval, then grow the interval.
    ///
    /// Any existing timer is dropped first, so at most one is ever pending.
    /// Returns the delay that was armed.
    pub fn schedule_retry(&mut self) -> Duration {
        self.clear_timeout();
        let delay = self.interval;
        self.timer = Some(Box::pin(tokio::time::sleep_until(Instant::now() + delay)));
        self.interval = next_interval(self.interval, self.policy.cap);
        debug!(
            delay_ms = delay.as_millis() as u64,
            next_ms = self.interval.as_millis() as u64,
            "autoreconnect scheduled"
        );
        delay
    }

    /// Drop the pending timer, if any.
    pub fn clear_timeout(&mut self) {
        if self.timer.take().is_some() {
            debug!("autoreconnect timer cleared");
        }
    }

    /// Start an attempt: clear the timer and mark one attempt in flight.
    pub fn begin_attempt(&mut self) -> u32 {
        self.clear_timeout();
        self.in_flight = true;
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    /// Whether an attempt started by [`begin_attempt`](Self::begin_attempt)
    /// has not reported an outcome yet.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Report that the in-flight attempt failed.
    ///
    /// Schedules the next retry and returns its delay, or `None` when no
    /// attempt was in flight. Only the first outcome of an attempt counts.
    pub fn attempt_failed(&mut self) -> Option<Duration> {
        if !std::mem::take(&mut self.in_flight) || !self.enabled {
            return None;
        }
        Some(self.schedule_retry())
    }

    /// Record a successful connection: clear the timer and reset backoff.
    pub fn succeeded(&mut self) {
        self.in_flight = false;
        self.reset();
    }

    /// Clear the timer and return the interval and attempt count to the start.
    pub fn reset(&mut self) {
        self.clear_timeout();
        self.interval = self.policy.floor;
        self.attempts = 0;
    }

    /// Forget the in-flight marker without scheduling anything.
    pub fn abandon_attempt(&mut self) {
        self.in_flight = false;
    }

    /// Resolves when the pending timer fires. Pending forever with no timer.
    ///
    /// Cancel-safe: dropping the future leaves the timer armed.
    pub fn expired(&mut self) -> impl Future<Output = ()> + '_ {
        async move {
            match self.timer.as_mut() {
                Some(timer) => {
                    timer.as_mut().await;
                    self.timer = None;
                }
                None => std::future::pending().await,
            }
        }
    }
}

impl std::fmt::Debug for ReconnectController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectController")
            .field("enabled", &self.enabled)
            .field("interval", &self.interval)
            .field("timer_armed", &self.is_timer_armed())
            .field("in_flight", &self.in_flight)
            .field("attempts", &self.attempts)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn next_interval_doubles_and_caps() {
        let cap = DEFAULT_BACKOFF_CAP;
        assert_eq!(next_interval(ms(1000), cap), ms(2000));
        assert_eq!(next_interval(ms(32_000), cap), ms(60_000));
        assert_eq!(next_interval(ms(60_000), cap), ms(60_000));
    }

    #[tokio::test(start_paused = true)]
    async fn n_schedules_grow_interval_geometrically() {
        let mut ctl = ReconnectController::new(true, ReconnectPolicy::default());
        for n in 1..=10u32 {
            ctl.schedule_retry();
            let expected = (1000u64 << n).min(60_000);
            assert_eq!(ctl.interval(), ms(expected), "after {n} schedules");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn armed_delays_follow_the_documented_sequence() {
        let mut ctl = ReconnectController::new(true, ReconnectPolicy::default());
        let delays: Vec<u64> = (0..9)
            .map(|_| ctl.schedule_retry().as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![1000, 2000, 4000, 8000, 16_000, 32_000, 60_000, 60_000, 60_000]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn scheduling_keeps_a_single_timer() {
        let mut ctl = ReconnectController::new(true, ReconnectPolicy::default());
        ctl.schedule_retry();
        ctl.schedule_retry();
        assert!(ctl.is_timer_armed());

        // Only the second timer (2s) is pending; it has not fired at 1.5s.
        tokio::select! {
            _ = ctl.expired() => panic!("first timer survived rescheduling"),
            _ = tokio::time::sleep(ms(1500)) => {}
        }
        ctl.expired().await;
        assert!(!ctl.is_timer_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_to_floor_and_clears_timer() {
        let mut ctl = ReconnectController::new(true, ReconnectPolicy::default());
        for _ in 0..5 {
            ctl.schedule_retry();
        }
        ctl.begin_attempt();
        ctl.succeeded();
        assert_eq!(ctl.interval(), DEFAULT_BACKOFF_FLOOR);
        assert!(!ctl.is_timer_armed());
        assert_eq!(ctl.status().attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn only_first_failure_of_an_attempt_schedules() {
        let mut ctl = ReconnectController::new(true, ReconnectPolicy::default());
        ctl.begin_attempt();
        assert_eq!(ctl.attempt_failed(), Some(ms(1000)));
        assert_eq!(ctl.attempt_failed(), None);
        assert_eq!(ctl.interval(), ms(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_timeout_is_idempotent() {
        let mut ctl = ReconnectController::new(true, ReconnectPolicy::default());
        ctl.clear_timeout();
        ctl.schedule_retry();
        ctl.clear_timeout();
        ctl.clear_timeout();
        assert!(!ctl.is_timer_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn disabling_drops_timer_and_attempt() {
        let mut ctl = ReconnectController::new(true, ReconnectPolicy::default());
        ctl.schedule_retry();
        ctl.begin_attempt();
        ctl.set_enabled(false);
        assert!(!ctl.is_timer_armed());
        assert!(!ctl.is_in_flight());
        assert_eq!(ctl.attempt_failed(), None);
    }

    #[test]
    fn expired_is_pending_without_a_timer() {
        let mut ctl = ReconnectController::new(true, ReconnectPolicy::default());
        let mut fut = tokio_test::task::spawn(ctl.expired());
        tokio_test::assert_pending!(fut.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_resolves_once_the_interval_elapses() {
        let mut ctl = ReconnectController::new(true, ReconnectPolicy::default());
        ctl.schedule_retry();
        {
            let mut fut = tokio_test::task::spawn(ctl.expired());
            tokio_test::assert_pending!(fut.poll());
            tokio::time::advance(ms(1000)).await;
            tokio_test::assert_ready!(fut.poll());
        }
        assert!(!ctl.is_timer_armed());
    }

    #[test]
    fn policy_cap_never_below_floor() {
        let policy = ReconnectPolicy::new(ms(5000), ms(10));
        assert_eq!(policy.cap, ms(5000));
    }
}
