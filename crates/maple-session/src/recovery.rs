//! Retry policies and the cancellable timer both sessions recover with.

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Delay used before every recovery attempt unless configured otherwise.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Decides how long to wait before a recovery attempt, and when to stop.
pub trait RecoveryPolicy: Send + Sync + fmt::Debug {
    /// Delay before attempt number `attempt` (starting at 1), or `None` to give up.
    fn delay_for(&self, attempt: u32) -> Option<Duration>;
}

/// Same delay before every attempt. Unbounded unless `max_attempts` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay {
    pub delay: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for FixedDelay {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RETRY_DELAY,
            max_attempts: None,
        }
    }
}

impl RecoveryPolicy for FixedDelay {
    fn delay_for(&self, attempt: u32) -> Option<Duration> {
        within_cap(attempt, self.max_attempts).then_some(self.delay)
    }
}

/// Doubling delay, clamped to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: Option<u32>,
}

impl RecoveryPolicy for ExponentialBackoff {
    fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if !within_cap(attempt, self.max_attempts) {
            return None;
        }
        let shift = attempt.saturating_sub(1).min(31);
        let delay = self
            .initial
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max)
            .min(self.max);
        Some(delay)
    }
}

fn within_cap(attempt: u32, max_attempts: Option<u32>) -> bool {
    max_attempts.map_or(true, |max| attempt <= max)
}

/// Counts consecutive recovery attempts; reset whenever recovery succeeds.
#[derive(Debug, Default)]
pub struct RetryCounter {
    attempt: u32,
}

impl RetryCounter {
    /// Advance to the next attempt. Returns its number and delay, or `None`
    /// when the policy gives up.
    pub fn next(&mut self, policy: &dyn RecoveryPolicy) -> Option<(u32, Duration)> {
        let attempt = self.attempt.saturating_add(1);
        let delay = policy.delay_for(attempt)?;
        self.attempt = attempt;
        Some((attempt, delay))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Single-slot delayed action delivered into an actor's queue.
///
/// Each scheduled action gets a ticket. Scheduling again or cancelling
/// supersedes the pending ticket, and [`RetryTimer::fire`] only accepts the
/// current one, so an action that was already in the queue when it was
/// superseded is still recognised as stale.
pub struct RetryTimer<E: Send + 'static> {
    tx: mpsc::UnboundedSender<E>,
    pending: Option<(u64, JoinHandle<()>)>,
    next_ticket: u64,
}

impl<E: Send + 'static> RetryTimer<E> {
    pub fn new(tx: mpsc::UnboundedSender<E>) -> Self {
        Self {
            tx,
            pending: None,
            next_ticket: 0,
        }
    }

    /// Deliver `make_event(ticket)` after `delay`, replacing any pending action.
    pub fn schedule<F>(&mut self, delay: Duration, make_event: F) -> u64
    where
        F: FnOnce(u64) -> E + Send + 'static,
    {
        self.cancel();
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(make_event(ticket));
        });
        self.pending = Some((ticket, handle));
        ticket
    }

    /// Drop the pending action. Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Claim a delivered action. `false` means the ticket was superseded.
    pub fn fire(&mut self, ticket: u64) -> bool {
        match self.pending {
            Some((current, _)) if current == ticket => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }
}

impl<E: Send + 'static> Drop for RetryTimer<E> {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[test]
    fn test_fixed_delay_is_unbounded_by_default() {
        let policy = FixedDelay::default();
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(1000)));
        assert_eq!(policy.delay_for(10_000), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn test_fixed_delay_respects_cap() {
        let policy = FixedDelay {
            delay: Duration::from_millis(250),
            max_attempts: Some(2),
        };
        assert!(policy.delay_for(2).is_some());
        assert!(policy.delay_for(3).is_none());
    }

    #[test]
    fn test_exponential_backoff_doubles_and_clamps() {
        let policy = ExponentialBackoff {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(3),
            max_attempts: None,
        };
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(1000)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_millis(2000)));
        assert_eq!(policy.delay_for(4), Some(Duration::from_secs(3)));
        assert_eq!(policy.delay_for(64), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_counter_stops_advancing_when_policy_gives_up() {
        let policy = FixedDelay {
            delay: DEFAULT_RETRY_DELAY,
            max_attempts: Some(1),
        };
        let mut counter = RetryCounter::default();
        assert_eq!(counter.next(&policy), Some((1, DEFAULT_RETRY_DELAY)));
        assert_eq!(counter.next(&policy), None);
        assert_eq!(counter.attempts(), 1);
        counter.reset();
        assert_eq!(counter.next(&policy), Some((1, DEFAULT_RETRY_DELAY)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = RetryTimer::new(tx);
        let start = Instant::now();
        let ticket = timer.schedule(Duration::from_millis(1000), |t| t);

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired, ticket);
        assert_eq!(start.elapsed(), Duration::from_millis(1000));
        assert!(timer.fire(fired));
        assert!(!timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel::<u64>();
        let mut timer = RetryTimer::new(tx);
        timer.schedule(Duration::from_millis(1000), |t| t);
        assert!(timer.cancel());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_ticket_is_stale() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = RetryTimer::new(tx);
        let first = timer.schedule(Duration::from_millis(10), |t| t);
        tokio::time::sleep(Duration::from_millis(20)).await;
        // First action is queued but not yet claimed when it is superseded.
        let second = timer.schedule(Duration::from_millis(10), |t| t);

        assert_eq!(rx.recv().await, Some(first));
        assert!(!timer.fire(first));
        assert_eq!(rx.recv().await, Some(second));
        assert!(timer.fire(second));
    }
}
