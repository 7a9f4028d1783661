//! Jittered retry delays for the reconnect loop.
//!
//! A [`Backoff`] walks a list of base delays, one step per [`Backoff::run`],
//! and stays on the last entry once the list is exhausted. Each delay is
//! drawn uniformly from `[0, 1.5 * base]` so many clients losing the same
//! mirror do not reconnect in lockstep.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::Notify;
use tokio::time::{sleep, Duration};

/// Base delays used when no strategy is configured.
pub const DEFAULT_BACKOFF: [Duration; 4] = [
    Duration::from_secs(5),
    Duration::from_secs(15),
    Duration::from_secs(60),
    Duration::from_secs(300),
];

/// Why a [`Backoff::run`] call returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wake {
    /// The full delay elapsed.
    Elapsed,
    /// [`Backoff::reset`] cut the wait short.
    Woken,
    /// The generator was destroyed; the caller should stop retrying.
    Destroyed,
}

/// Jittered delay generator with reset and cancellation.
#[derive(Debug)]
pub struct Backoff {
    strategy: Vec<Duration>,
    count: AtomicUsize,
    destroyed: AtomicBool,
    wake: Notify,
}

impl Backoff {
    /// Create a generator over the given base delays.
    ///
    /// An empty list behaves like a single zero delay.
    pub fn new(strategy: Vec<Duration>) -> Self {
        let strategy = if strategy.is_empty() {
            vec![Duration::ZERO]
        } else {
            strategy
        };
        Self {
            strategy,
            count: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    /// Number of steps taken through the strategy list, capped at its length.
    pub fn attempts(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Whether [`destroy`](Self::destroy) has been called.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Pick the base delay for this step and advance the attempt counter.
    fn next_base(&self) -> Duration {
        let len = self.strategy.len();
        let index = match self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                (c < len).then_some(c + 1)
            }) {
            Ok(previous) => previous,
            Err(current) => current - 1,
        };
        self.strategy[index]
    }

    /// Sleep for the next jittered delay, or until woken.
    pub async fn run(&self) -> Wake {
        // Register for wake-ups before checking state so a concurrent
        // reset/destroy cannot slip in between.
        let notified = self.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_destroyed() {
            return Wake::Destroyed;
        }

        let delay = jitter(self.next_base(), rand::random::<f64>());
        tokio::select! {
            _ = sleep(delay) => Wake::Elapsed,
            _ = &mut notified => {
                if self.is_destroyed() {
                    Wake::Destroyed
                } else {
                    Wake::Woken
                }
            }
        }
    }

    /// Start over from the first base delay and wake the current waiter.
    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    /// Stop the generator. Idempotent; wakes the current waiter.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF.to_vec())
    }
}

/// Scale `base` by `1.5 * sample`, rounded to whole milliseconds.
///
/// `sample` is expected in `[0, 1)`.
pub(crate) fn jitter(base: Duration, sample: f64) -> Duration {
    let millis = (1.5 * sample * base.as_millis() as f64).round();
    Duration::from_millis(millis as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::Instant;

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_millis(1000);
        assert_eq!(jitter(base, 0.0), Duration::ZERO);
        assert_eq!(jitter(base, 0.5), Duration::from_millis(750));
        assert!(jitter(base, 0.999_999) <= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn run_walks_strategy_and_repeats_last() {
        let backoff = Backoff::new(vec![Duration::from_millis(100), Duration::from_millis(400)]);
        let bounds = [150u64, 600, 600, 600];
        for (step, bound) in bounds.iter().enumerate() {
            let start = Instant::now();
            assert_eq!(backoff.run().await, Wake::Elapsed);
            let elapsed = start.elapsed();
            assert!(
                elapsed <= Duration::from_millis(*bound),
                "step {step} slept {elapsed:?}"
            );
        }
        assert_eq!(backoff.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_restarts_from_first_delay_and_wakes_waiter() {
        let backoff = Arc::new(Backoff::new(vec![
            Duration::from_millis(10),
            Duration::from_secs(3600),
        ]));
        backoff.run().await;
        assert_eq!(backoff.attempts(), 1);

        let waiter = {
            let backoff = backoff.clone();
            tokio::spawn(async move { backoff.run().await })
        };
        tokio::task::yield_now().await;
        backoff.reset();
        assert_eq!(waiter.await.expect("join"), Wake::Woken);
        assert_eq!(backoff.attempts(), 0);

        let start = Instant::now();
        backoff.run().await;
        assert!(start.elapsed() <= Duration::from_millis(15));
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_releases_pending_run() {
        let backoff = Arc::new(Backoff::new(vec![Duration::from_secs(3600)]));
        let start = Instant::now();
        let waiter = {
            let backoff = backoff.clone();
            tokio::spawn(async move { backoff.run().await })
        };
        tokio::task::yield_now().await;
        backoff.destroy();
        backoff.destroy();

        assert_eq!(waiter.await.expect("join"), Wake::Destroyed);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(backoff.run().await, Wake::Destroyed);
    }
}
