//! Session Reconnection Module
//!
//! Exponential-backoff scheduler for re-establishing a dropped transport.
//! The manager only decides *when* to try; every `Attempt` event it emits must be
//! answered by the owner with [`ReconnectionManager::on_success`] or
//! [`ReconnectionManager::on_failure`], tagged with the attempt number it answers.
//!
//! ```text
//!   start ──► Waiting ──(delay)──► Attempting ──fail──► Waiting ... ──► Exhausted
//!                │                     │
//!              pause                success ──► Idle
//!                ▼
//!             Paused ──resume──► Waiting (same delay)
//! ```
//!
//! Events are sent while holding the state lock, so attempt numbers reach the
//! receiver strictly in order.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Jitter spread applied to each computed delay (±20%)
const JITTER_RATIO: f64 = 0.2;

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionPolicy {
    /// Whether to reconnect automatically after an unexpected drop
    pub enabled: bool,
    /// Maximum number of attempts (0 = unlimited)
    pub max_attempts: u32,
    /// Delay before the second attempt; the first attempt is immediate (seconds)
    pub initial_delay_secs: f64,
    /// Upper bound for any computed delay (seconds)
    pub max_delay_secs: f64,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Randomize each delay by up to ±20%
    pub jitter: bool,
    /// Reset the attempt counter after a successful reconnect
    pub reset_after_success: bool,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            initial_delay_secs: 1.0,
            max_delay_secs: 30.0,
            backoff_multiplier: 1.5,
            jitter: true,
            reset_after_success: true,
        }
    }
}

impl ReconnectionPolicy {
    /// Un-jittered delay to wait before attempt number `attempt + 1`.
    ///
    /// `0` for the very first attempt, then
    /// `min(initial * multiplier^(attempt-1), max)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = (self.initial_delay_secs * self.backoff_multiplier.powi(exponent))
            .min(self.max_delay_secs)
            .max(0.0);
        if secs.is_finite() {
            Duration::from_secs_f64(secs)
        } else {
            Duration::from_secs_f64(self.max_delay_secs.max(0.0))
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-JITTER_RATIO..=JITTER_RATIO);
        base.mul_f64(factor)
    }
}

/// Reconnection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectState {
    /// Not attempting reconnection
    Idle,
    /// Waiting before next attempt
    Waiting,
    /// An attempt has been handed to the owner
    Attempting,
    /// Suspended by the user
    Paused,
}

/// Events emitted during reconnection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReconnectEvent {
    /// Next attempt scheduled
    Waiting {
        delay_ms: u64,
        next_attempt: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// Owner should try to reconnect now
    Attempt { attempt: u32, max_attempts: u32 },
    Success { attempt: u32 },
    Failed { attempt: u32, error: String },
    /// All attempts used up
    Exhausted { attempts: u32 },
    Paused { attempt: u32 },
    Resumed { attempt: u32 },
    Cancelled,
}

/// Read-only view of the scheduler
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconnectSnapshot {
    pub attempt: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub state: ReconnectState,
}

struct ManagerState {
    session_id: String,
    attempt: u32,
    state: ReconnectState,
    next_retry_at: Option<DateTime<Utc>>,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever a timer is armed or cleared; a timer only fires if its
    /// sequence number is still current.
    timer_seq: u64,
}

struct Shared {
    policy: ReconnectionPolicy,
    state: Mutex<ManagerState>,
    events: mpsc::UnboundedSender<ReconnectEvent>,
}

/// Backoff scheduler for one connection
#[derive(Clone)]
pub struct ReconnectionManager {
    shared: Arc<Shared>,
}

impl ReconnectionManager {
    pub fn new(policy: ReconnectionPolicy, events: mpsc::UnboundedSender<ReconnectEvent>) -> Self {
        Self {
            shared: Arc::new(Shared {
                policy,
                state: Mutex::new(ManagerState {
                    session_id: String::new(),
                    attempt: 0,
                    state: ReconnectState::Idle,
                    next_retry_at: None,
                    timer: None,
                    timer_seq: 0,
                }),
                events,
            }),
        }
    }

    /// Create a manager together with the receiving end of its event stream.
    pub fn with_channel(
        policy: ReconnectionPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<ReconnectEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(policy, tx), rx)
    }

    pub fn policy(&self) -> &ReconnectionPolicy {
        &self.shared.policy
    }

    /// Begin a reconnection cycle from attempt 0.
    pub fn start(&self, session_id: &str) {
        let mut s = self.shared.state.lock();
        clear_timer(&mut s);
        s.session_id = session_id.to_string();
        s.attempt = 0;
        info!("Session {}: starting reconnection", session_id);
        schedule_next(&self.shared, &mut s);
    }

    /// Report that `attempt` failed. Returns `false` if the report was stale.
    ///
    /// Only the most recently fired attempt may report; results of attempts
    /// superseded by [`retry_now`](Self::retry_now) or [`cancel`](Self::cancel)
    /// are dropped. While paused the failure is recorded but nothing is scheduled.
    pub fn on_failure(&self, attempt: u32, error: impl Into<String>) -> bool {
        let error = error.into();
        let mut s = self.shared.state.lock();
        if !is_outstanding(&s, attempt) {
            debug!(
                "Session {}: ignoring failure of stale attempt {} (current {})",
                s.session_id, attempt, s.attempt
            );
            return false;
        }
        warn!(
            "Session {}: reconnect attempt {} failed: {}",
            s.session_id, attempt, error
        );
        let _ = self
            .shared
            .events
            .send(ReconnectEvent::Failed { attempt, error });
        if s.state == ReconnectState::Attempting {
            schedule_next(&self.shared, &mut s);
        }
        true
    }

    /// Report that `attempt` succeeded. Returns `false` if the report was stale.
    pub fn on_success(&self, attempt: u32) -> bool {
        let mut s = self.shared.state.lock();
        if !is_outstanding(&s, attempt) {
            debug!(
                "Session {}: ignoring success of stale attempt {} (current {})",
                s.session_id, attempt, s.attempt
            );
            return false;
        }
        clear_timer(&mut s);
        info!("Session {}: reconnected on attempt {}", s.session_id, attempt);
        let _ = self
            .shared
            .events
            .send(ReconnectEvent::Success { attempt });
        if self.shared.policy.reset_after_success {
            s.attempt = 0;
        }
        s.state = ReconnectState::Idle;
        s.next_retry_at = None;
        true
    }

    /// Whether `attempt` is the attempt currently awaiting a result.
    pub fn is_current(&self, attempt: u32) -> bool {
        is_outstanding(&self.shared.state.lock(), attempt)
    }

    /// Suspend scheduling. Returns `false` if there was nothing to pause.
    pub fn pause(&self) -> bool {
        let mut s = self.shared.state.lock();
        if !matches!(s.state, ReconnectState::Waiting | ReconnectState::Attempting) {
            return false;
        }
        clear_timer(&mut s);
        s.state = ReconnectState::Paused;
        s.next_retry_at = None;
        debug!("Session {}: reconnection paused", s.session_id);
        let _ = self
            .shared
            .events
            .send(ReconnectEvent::Paused { attempt: s.attempt });
        true
    }

    /// Leave the paused state and reschedule with the current attempt count.
    pub fn resume(&self) -> bool {
        let mut s = self.shared.state.lock();
        if s.state != ReconnectState::Paused {
            return false;
        }
        debug!("Session {}: reconnection resumed", s.session_id);
        let _ = self
            .shared
            .events
            .send(ReconnectEvent::Resumed { attempt: s.attempt });
        schedule_next(&self.shared, &mut s);
        true
    }

    /// Skip any pending wait and attempt immediately. Returns the new attempt number.
    pub fn retry_now(&self) -> u32 {
        let mut s = self.shared.state.lock();
        clear_timer(&mut s);
        fire_attempt(&self.shared, &mut s);
        s.attempt
    }

    pub fn cancel(&self) {
        let mut s = self.shared.state.lock();
        let was_active = s.state != ReconnectState::Idle;
        clear_timer(&mut s);
        s.attempt = 0;
        s.state = ReconnectState::Idle;
        s.next_retry_at = None;
        if was_active {
            info!("Session {}: reconnection cancelled", s.session_id);
            let _ = self.shared.events.send(ReconnectEvent::Cancelled);
        }
    }

    pub fn snapshot(&self) -> ReconnectSnapshot {
        let s = self.shared.state.lock();
        ReconnectSnapshot {
            attempt: s.attempt,
            max_attempts: self.shared.policy.max_attempts,
            next_retry_at: s.next_retry_at,
            state: s.state,
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.abort();
        }
    }
}

/// An attempt is outstanding from `fire_attempt` until it reports or is
/// superseded; pausing mid-attempt keeps it outstanding.
fn is_outstanding(s: &ManagerState, attempt: u32) -> bool {
    attempt != 0
        && s.attempt == attempt
        && matches!(s.state, ReconnectState::Attempting | ReconnectState::Paused)
}

fn clear_timer(s: &mut ManagerState) {
    if let Some(timer) = s.timer.take() {
        timer.abort();
    }
    s.timer_seq = s.timer_seq.wrapping_add(1);
}

fn schedule_next(shared: &Arc<Shared>, s: &mut ManagerState) {
    clear_timer(s);

    let max_attempts = shared.policy.max_attempts;
    if max_attempts > 0 && s.attempt >= max_attempts {
        warn!(
            "Session {}: reconnection exhausted after {} attempts",
            s.session_id, s.attempt
        );
        s.state = ReconnectState::Idle;
        s.next_retry_at = None;
        let _ = shared.events.send(ReconnectEvent::Exhausted {
            attempts: s.attempt,
        });
        return;
    }

    let delay = shared.policy.delay_for(s.attempt);
    let next_retry_at =
        Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    s.state = ReconnectState::Waiting;
    s.next_retry_at = Some(next_retry_at);

    debug!(
        "Session {}: attempt {} in {:?}",
        s.session_id,
        s.attempt + 1,
        delay
    );
    let _ = shared.events.send(ReconnectEvent::Waiting {
        delay_ms: delay.as_millis() as u64,
        next_attempt: s.attempt + 1,
        next_retry_at,
    });

    if delay.is_zero() {
        fire_attempt(shared, s);
        return;
    }

    let seq = s.timer_seq;
    let weak: Weak<Shared> = Arc::downgrade(shared);
    s.timer = Some(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let mut s = shared.state.lock();
        if s.timer_seq != seq || s.state != ReconnectState::Waiting {
            return;
        }
        s.timer = None;
        fire_attempt(&shared, &mut s);
    }));
}

fn fire_attempt(shared: &Shared, s: &mut ManagerState) {
    s.attempt += 1;
    s.state = ReconnectState::Attempting;
    s.next_retry_at = None;
    let _ = shared.events.send(ReconnectEvent::Attempt {
        attempt: s.attempt,
        max_attempts: shared.policy.max_attempts,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_policy(max_attempts: u32) -> ReconnectionPolicy {
        ReconnectionPolicy {
            enabled: true,
            max_attempts,
            initial_delay_secs: 1.0,
            max_delay_secs: 120.0,
            backoff_multiplier: 2.0,
            jitter: false,
            reset_after_success: true,
        }
    }

    /// Drop the timestamp so sequences can be compared directly.
    fn label(event: &ReconnectEvent) -> String {
        match event {
            ReconnectEvent::Waiting { delay_ms, .. } => format!("waiting({}ms)", delay_ms),
            ReconnectEvent::Attempt { attempt, .. } => format!("attempt({})", attempt),
            ReconnectEvent::Success { attempt } => format!("success({})", attempt),
            ReconnectEvent::Failed { attempt, .. } => format!("failed({})", attempt),
            ReconnectEvent::Exhausted { attempts } => format!("exhausted({})", attempts),
            ReconnectEvent::Paused { attempt } => format!("paused({})", attempt),
            ReconnectEvent::Resumed { attempt } => format!("resumed({})", attempt),
            ReconnectEvent::Cancelled => "cancelled".to_string(),
        }
    }

    #[test]
    fn test_base_delay_progression() {
        let policy = fixed_policy(0);
        assert_eq!(policy.base_delay(0), Duration::ZERO);
        assert_eq!(policy.base_delay(1), Duration::from_secs(1));
        assert_eq!(policy.base_delay(2), Duration::from_secs(2));
        assert_eq!(policy.base_delay(3), Duration::from_secs(4));
    }

    #[test]
    fn test_base_delay_is_capped() {
        let policy = ReconnectionPolicy {
            max_delay_secs: 5.0,
            ..fixed_policy(0)
        };
        assert_eq!(policy.base_delay(10), Duration::from_secs(5));
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = ReconnectionPolicy {
            jitter: true,
            ..fixed_policy(0)
        };
        for _ in 0..200 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_millis(1600), "{:?}", delay);
            assert!(delay <= Duration::from_millis(2400), "{:?}", delay);
        }
        assert_eq!(policy.delay_for(0), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_sequence() {
        let (manager, mut rx) = ReconnectionManager::with_channel(fixed_policy(3));
        manager.start("s1");

        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = matches!(event, ReconnectEvent::Exhausted { .. });
            if let ReconnectEvent::Attempt { attempt, .. } = event {
                assert!(manager.on_failure(attempt, "refused"));
            }
            seen.push(label(&event));
            if done {
                break;
            }
        }

        assert_eq!(
            seen,
            vec![
                "waiting(0ms)",
                "attempt(1)",
                "failed(1)",
                "waiting(1000ms)",
                "attempt(2)",
                "failed(2)",
                "waiting(2000ms)",
                "attempt(3)",
                "failed(3)",
                "exhausted(3)",
            ]
        );
        assert_eq!(manager.snapshot().state, ReconnectState::Idle);

        // No further attempts after exhaustion
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_attempts() {
        let (manager, mut rx) = ReconnectionManager::with_channel(fixed_policy(5));
        manager.start("s1");

        assert!(matches!(rx.recv().await, Some(ReconnectEvent::Waiting { .. })));
        assert!(matches!(
            rx.recv().await,
            Some(ReconnectEvent::Attempt { attempt: 1, .. })
        ));
        assert!(manager.on_success(1));
        assert_eq!(
            rx.recv().await,
            Some(ReconnectEvent::Success { attempt: 1 })
        );

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.attempt, 0);
        assert_eq!(snapshot.state, ReconnectState::Idle);
        assert!(snapshot.next_retry_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_resume_reuses_same_delay() {
        let (manager, mut rx) = ReconnectionManager::with_channel(fixed_policy(5));
        manager.start("s1");
        let _ = rx.recv().await; // waiting(0)
        let _ = rx.recv().await; // attempt(1)
        manager.on_failure(1, "timeout");
        let _ = rx.recv().await; // failed(1)
        let first = rx.recv().await.unwrap();
        assert_eq!(label(&first), "waiting(1000ms)");

        assert!(manager.pause());
        assert_eq!(label(&rx.recv().await.unwrap()), "paused(1)");
        assert_eq!(manager.snapshot().state, ReconnectState::Paused);

        // Paused: the armed timer must not fire
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());

        assert!(manager.resume());
        assert_eq!(label(&rx.recv().await.unwrap()), "resumed(1)");
        assert_eq!(label(&rx.recv().await.unwrap()), "waiting(1000ms)");
        assert_eq!(label(&rx.recv().await.unwrap()), "attempt(2)");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_while_paused_does_not_schedule() {
        let (manager, mut rx) = ReconnectionManager::with_channel(fixed_policy(5));
        manager.start("s1");
        let _ = rx.recv().await;
        let _ = rx.recv().await; // attempt(1)

        assert!(manager.pause());
        assert!(manager.on_failure(1, "late failure"));
        assert_eq!(label(&rx.recv().await.unwrap()), "paused(1)");
        assert_eq!(label(&rx.recv().await.unwrap()), "failed(1)");

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(manager.snapshot().state, ReconnectState::Paused);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_now_increments_regardless_of_state() {
        let (manager, mut rx) = ReconnectionManager::with_channel(fixed_policy(10));
        manager.start("s1");
        let _ = rx.recv().await;
        let _ = rx.recv().await; // attempt(1)
        manager.on_failure(1, "boom");
        let _ = rx.recv().await; // failed(1)
        let _ = rx.recv().await; // waiting(1000ms)

        assert_eq!(manager.retry_now(), 2);
        assert_eq!(label(&rx.recv().await.unwrap()), "attempt(2)");

        assert!(manager.pause());
        let _ = rx.recv().await;
        assert_eq!(manager.retry_now(), 3);
        assert_eq!(label(&rx.recv().await.unwrap()), "attempt(3)");

        // The timer armed before retry_now must not produce an extra attempt
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_pending_attempt() {
        let (manager, mut rx) = ReconnectionManager::with_channel(fixed_policy(5));
        manager.start("s1");
        let _ = rx.recv().await;
        let _ = rx.recv().await;
        manager.on_failure(1, "boom");
        let _ = rx.recv().await;
        let _ = rx.recv().await; // waiting(1000ms)

        manager.cancel();
        assert_eq!(rx.recv().await, Some(ReconnectEvent::Cancelled));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.state, ReconnectState::Idle);
        assert_eq!(snapshot.attempt, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_reports_next_retry() {
        let (manager, mut rx) = ReconnectionManager::with_channel(fixed_policy(5));
        manager.start("s1");
        let _ = rx.recv().await;
        let _ = rx.recv().await;
        manager.on_failure(1, "boom");

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.state, ReconnectState::Waiting);
        assert_eq!(snapshot.attempt, 1);
        assert_eq!(snapshot.max_attempts, 5);
        assert!(snapshot.next_retry_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_attempt_results_are_dropped() {
        let (manager, mut rx) = ReconnectionManager::with_channel(fixed_policy(2));
        manager.start("s1");
        let _ = rx.recv().await; // waiting(0ms)
        let _ = rx.recv().await; // attempt(1)

        // Attempt 1 is still in flight when the user forces attempt 2
        assert_eq!(manager.retry_now(), 2);
        assert_eq!(label(&rx.recv().await.unwrap()), "attempt(2)");
        assert!(manager.is_current(2));
        assert!(!manager.is_current(1));

        // A late failure of attempt 1 must neither be reported nor exhaust
        assert!(!manager.on_failure(1, "late"));
        assert!(!manager.on_success(1));
        assert!(rx.try_recv().is_err());
        assert_eq!(manager.snapshot().state, ReconnectState::Attempting);

        assert!(manager.on_success(2));
        assert_eq!(label(&rx.recv().await.unwrap()), "success(2)");
        assert!(!manager.on_failure(2, "after success"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_after_cancel_are_dropped() {
        let (manager, mut rx) = ReconnectionManager::with_channel(fixed_policy(5));
        manager.start("s1");
        let _ = rx.recv().await;
        let _ = rx.recv().await; // attempt(1)

        manager.cancel();
        assert_eq!(rx.recv().await, Some(ReconnectEvent::Cancelled));
        assert!(!manager.on_failure(1, "late"));
        assert!(!manager.on_success(1));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }
}
