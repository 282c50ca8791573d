//! Rate governing for the external lookup quota
//!
//! The lookup service permits a fixed number of calls per rolling window
//! (e.g., 100 calls / 16 minutes). The [`RateGovernor`] enforces that quota
//! for the whole process: the call after the quota blocks until the window
//! has fully elapsed, then opens a fresh window and admits the caller.
//!
//! The quota is an external constraint, so exactly one governor instance is
//! constructed and shared by every job. An internal admission gate serializes
//! all callers across jobs; no two external calls are ever in flight at once.
//!
//! The governor cannot fail — it only delays.

use crate::config::RateLimitConfig;
use crate::types::GovernorStatus;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Progress notification emitted while a caller is blocked on the quota.
///
/// Delivered through the closure passed to [`RateGovernor::acquire`], once
/// when the pause starts, periodically while waiting, and once when the pause
/// ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PauseUpdate {
    /// The quota was hit; the caller will be suspended for `wait`
    Started {
        /// Total time until the window resets
        wait: Duration,
    },
    /// Still waiting; `remaining` time left before the window resets
    Remaining {
        /// Time left before the window resets
        remaining: Duration,
    },
    /// The pause is over; the call is being admitted
    Finished,
}

/// Counters for the currently open window
#[derive(Debug, Default)]
struct WindowState {
    /// Calls admitted since the window opened
    calls: u32,
    /// When the window opened (None until the first call)
    window_start: Option<Instant>,
}

/// Outcome of the admission check, computed under the state lock
enum Admission {
    Immediate,
    WaitFor(Duration),
}

/// Global quota governor shared across all jobs
///
/// # Algorithm
///
/// - The first call opens a window and is admitted immediately.
/// - Calls 2..=quota are admitted immediately.
/// - Call quota+1 computes `wait = window - elapsed`; if positive, the caller
///   sleeps in `wait_notice_interval` chunks (invoking the progress callback
///   between chunks), then the window resets with `calls = 1`.
///
/// # Invariant
///
/// No window ever observes more than `quota` admitted calls.
pub struct RateGovernor {
    config: RateLimitConfig,
    /// Admission gate: serializes all callers, held across the quota wait so
    /// queued callers from any job line up behind the pause
    gate: tokio::sync::Mutex<()>,
    /// Window counters; only held for short, synchronous critical sections so
    /// [`status`](Self::status) never blocks behind a multi-minute pause
    state: Mutex<WindowState>,
}

impl RateGovernor {
    /// Create a new governor for the given quota window
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(WindowState::default()),
        }
    }

    /// Block until the quota permits one more external call.
    ///
    /// `on_wait` is invoked with [`PauseUpdate`]s while the caller is blocked
    /// so the job can keep its requester informed during a multi-minute
    /// pause. It is never invoked when the call is admitted immediately.
    pub async fn acquire<F, Fut>(&self, mut on_wait: F)
    where
        F: FnMut(PauseUpdate) -> Fut,
        Fut: Future<Output = ()>,
    {
        let _admitted = self.gate.lock().await;

        match self.check_admission() {
            Admission::Immediate => {}
            Admission::WaitFor(wait) => {
                tracing::warn!(
                    quota = self.config.quota,
                    wait_secs = wait.as_secs(),
                    "lookup quota reached, pausing until the window resets"
                );
                on_wait(PauseUpdate::Started { wait }).await;

                let mut remaining = wait;
                while !remaining.is_zero() {
                    let chunk = remaining.min(self.config.wait_notice_interval);
                    tokio::time::sleep(chunk).await;
                    remaining = remaining.saturating_sub(chunk);
                    if !remaining.is_zero() {
                        on_wait(PauseUpdate::Remaining { remaining }).await;
                    }
                }

                self.reset_window();
                tracing::info!(quota = self.config.quota, "quota window reset, resuming");
                on_wait(PauseUpdate::Finished).await;
            }
        }
    }

    /// Advisory snapshot of the current window. Never mutates state and never
    /// blocks behind a pause.
    pub fn status(&self) -> GovernorStatus {
        let state = self.lock_state();
        let minutes_to_reset = match state.window_start {
            Some(start) => {
                let left = self.config.window.saturating_sub(start.elapsed());
                left.as_secs_f64() / 60.0
            }
            None => 0.0,
        };
        GovernorStatus {
            used: state.calls,
            remaining: self.config.quota.saturating_sub(state.calls),
            minutes_to_reset,
        }
    }

    /// Worst-case wall-clock estimate for `total_calls` governed calls.
    ///
    /// Assumes a fixed average per-call cost plus one full window pause per
    /// completed quota cycle. Used only for user-facing ETAs, never for
    /// control decisions.
    pub fn estimate(&self, total_calls: usize) -> Duration {
        if total_calls == 0 {
            return Duration::ZERO;
        }
        let full_cycles = (total_calls as u64) / u64::from(self.config.quota);
        let call_time = self.config.avg_call_cost * total_calls as u32;
        call_time + self.config.window * full_cycles as u32
    }

    /// Count this call against the window, deciding whether it may proceed
    /// now or must wait out the remainder of the window.
    fn check_admission(&self) -> Admission {
        let mut state = self.lock_state();
        state.calls += 1;

        if state.calls == 1 {
            state.window_start = Some(Instant::now());
            tracing::debug!(quota = self.config.quota, "opened a new quota window");
            return Admission::Immediate;
        }

        if state.calls <= self.config.quota {
            return Admission::Immediate;
        }

        let elapsed = state
            .window_start
            .map(|start| start.elapsed())
            .unwrap_or_default();
        let wait = self.config.window.saturating_sub(elapsed);
        if wait.is_zero() {
            // The window already elapsed on its own; reset inline.
            state.calls = 1;
            state.window_start = Some(Instant::now());
            Admission::Immediate
        } else {
            Admission::WaitFor(wait)
        }
    }

    /// Open a fresh window with the just-admitted call counted in it
    fn reset_window(&self) {
        let mut state = self.lock_state();
        state.calls = 1;
        state.window_start = Some(Instant::now());
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, WindowState> {
        // A poisoned lock only means another thread panicked mid-update of
        // two plain integers; the counters are still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn governor(quota: u32, window_ms: u64) -> RateGovernor {
        RateGovernor::new(RateLimitConfig {
            quota,
            window: Duration::from_millis(window_ms),
            wait_notice_interval: Duration::from_millis(20),
            avg_call_cost: Duration::from_secs(1),
        })
    }

    async fn no_notify(_: PauseUpdate) {}

    #[tokio::test]
    async fn first_call_is_admitted_immediately() {
        let gov = governor(3, 10_000);

        let start = Instant::now();
        gov.acquire(no_notify).await;

        assert!(start.elapsed() < Duration::from_millis(50));
        let status = gov.status();
        assert_eq!(status.used, 1);
        assert_eq!(status.remaining, 2);
    }

    #[tokio::test]
    async fn calls_within_quota_do_not_wait() {
        let gov = governor(5, 10_000);

        let start = Instant::now();
        for _ in 0..5 {
            gov.acquire(no_notify).await;
        }

        assert!(
            start.elapsed() < Duration::from_millis(100),
            "all quota calls should be admitted without delay, took {:?}",
            start.elapsed()
        );
        assert_eq!(gov.status().used, 5);
        assert_eq!(gov.status().remaining, 0);
    }

    #[tokio::test]
    async fn call_past_quota_waits_out_the_window() {
        let gov = governor(2, 300);

        let start = Instant::now();
        gov.acquire(no_notify).await;
        gov.acquire(no_notify).await;
        gov.acquire(no_notify).await; // third call must wait ~300ms
        let elapsed = start.elapsed();

        assert!(
            elapsed >= Duration::from_millis(250),
            "third call should have waited for the window, took {:?}",
            elapsed
        );
        // Fresh window with the admitted call counted in it
        assert_eq!(gov.status().used, 1);
    }

    #[tokio::test]
    async fn twenty_five_calls_with_quota_ten_pause_exactly_twice() {
        let gov = governor(10, 200);
        let pauses = Arc::new(Mutex::new(0_u32));

        for _ in 0..25 {
            let pauses = Arc::clone(&pauses);
            gov.acquire(move |update| {
                let pauses = Arc::clone(&pauses);
                async move {
                    if matches!(update, PauseUpdate::Started { .. }) {
                        *pauses.lock().unwrap() += 1;
                    }
                }
            })
            .await;
        }

        // Pauses after call 10 and call 20; the final 5 calls fit in window 3
        assert_eq!(*pauses.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn pause_emits_started_and_finished_updates() {
        let gov = governor(1, 100);
        let seen = Arc::new(Mutex::new(Vec::new()));

        gov.acquire(no_notify).await;
        let seen_clone = Arc::clone(&seen);
        gov.acquire(move |update| {
            let seen = Arc::clone(&seen_clone);
            async move {
                seen.lock().unwrap().push(update);
            }
        })
        .await;

        let updates = seen.lock().unwrap();
        assert!(matches!(updates.first(), Some(PauseUpdate::Started { .. })));
        assert!(matches!(updates.last(), Some(PauseUpdate::Finished)));
    }

    #[tokio::test]
    async fn status_is_advisory_and_does_not_mutate() {
        let gov = governor(4, 10_000);
        gov.acquire(no_notify).await;
        gov.acquire(no_notify).await;

        let before = gov.status();
        let again = gov.status();
        assert_eq!(before.used, again.used);
        assert_eq!(before.used, 2);
        assert_eq!(before.remaining, 2);
        assert!(before.minutes_to_reset > 0.0);
    }

    #[tokio::test]
    async fn status_before_any_call_reports_idle() {
        let gov = governor(10, 10_000);
        let status = gov.status();
        assert_eq!(status.used, 0);
        assert_eq!(status.remaining, 10);
        assert_eq!(status.minutes_to_reset, 0.0);
    }

    #[tokio::test]
    async fn concurrent_callers_from_several_tasks_respect_the_quota() {
        let gov = Arc::new(governor(3, 300));
        let pauses = Arc::new(Mutex::new(0_u32));

        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..6 {
            let gov = Arc::clone(&gov);
            let pauses = Arc::clone(&pauses);
            handles.push(tokio::spawn(async move {
                gov.acquire(move |update| {
                    let pauses = Arc::clone(&pauses);
                    async move {
                        if matches!(update, PauseUpdate::Started { .. }) {
                            *pauses.lock().unwrap() += 1;
                        }
                    }
                })
                .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // 6 calls at quota 3 = one full pause somewhere in the middle
        assert_eq!(*pauses.lock().unwrap(), 1);
        assert!(
            start.elapsed() >= Duration::from_millis(250),
            "the shared gate must have enforced one window pause"
        );
    }

    #[test]
    fn estimate_accounts_for_full_pause_cycles() {
        let gov = RateGovernor::new(RateLimitConfig {
            quota: 10,
            window: Duration::from_secs(960),
            wait_notice_interval: Duration::from_secs(60),
            avg_call_cost: Duration::from_secs(1),
        });

        // 25 calls: 25s of calls plus floor(25/10) = 2 full window pauses
        assert_eq!(
            gov.estimate(25),
            Duration::from_secs(25 + 2 * 960),
            "estimate should be linear call cost plus full-cycle pauses"
        );
        assert_eq!(gov.estimate(0), Duration::ZERO);
        // Under one quota cycle: no pauses at all
        assert_eq!(gov.estimate(9), Duration::from_secs(9));
    }
}
