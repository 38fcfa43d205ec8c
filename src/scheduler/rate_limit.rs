//! Submission throttling.
//!
//! A single-token bucket: each submission reserves the next free slot with a
//! compare-and-swap on a shared counter, then sleeps until that slot. Slots
//! are spaced `submission_delay` apart. With smart delay enabled the spacing is
//! multiplied while the failure ratio over the last `window` submissions
//! exceeds the configured threshold.
//!
//! A caller never waits longer than the bound it passes in: a slot further out
//! is refused without being reserved. Closing the limiter releases every
//! waiter and refuses new reservations.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::pipeline::{RunConfig, SmartDelayConfig};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LimiterError {
    #[error("Submission limiter is closed")]
    Closed,

    #[error("Next submission slot is {0:?} away")]
    Saturated(Duration),
}

#[derive(Debug)]
pub struct SubmissionLimiter {
    spacing: Duration,
    smart: SmartDelayConfig,
    origin: Instant,
    /// Next free slot, in nanoseconds since `origin`.
    next_slot: AtomicU64,
    recent: Mutex<VecDeque<bool>>,
    closed: watch::Sender<bool>,
}

impl SubmissionLimiter {
    pub fn new(spacing: Duration, smart: SmartDelayConfig) -> Self {
        Self {
            spacing,
            smart,
            origin: Instant::now(),
            next_slot: AtomicU64::new(0),
            recent: Mutex::new(VecDeque::new()),
            closed: watch::Sender::new(false),
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(config.submission_delay(), config.smart_delay.clone())
    }

    /// Waits for the next submission slot and returns how long it waited.
    ///
    /// Fails with [`LimiterError::Saturated`] when the next free slot is more
    /// than `max_wait` away, and with [`LimiterError::Closed`] once the limiter
    /// is closed, including while waiting.
    pub async fn acquire(&self, max_wait: Duration) -> Result<Duration, LimiterError> {
        let mut closed = self.closed.subscribe();
        let is_closed = *closed.borrow_and_update();
        if is_closed {
            return Err(LimiterError::Closed);
        }

        let spacing = nanos(self.current_spacing());
        let max_wait = nanos(max_wait);
        let slot = loop {
            let now = nanos(self.origin.elapsed());
            let current = self.next_slot.load(Ordering::SeqCst);
            let slot = current.max(now);
            if slot - now > max_wait {
                return Err(LimiterError::Saturated(Duration::from_nanos(slot - now)));
            }
            if self
                .next_slot
                .compare_exchange(
                    current,
                    slot.saturating_add(spacing),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                break slot;
            }
        };

        let deadline = self.origin + Duration::from_nanos(slot);
        let waited = deadline.saturating_duration_since(Instant::now());
        if !waited.is_zero() {
            debug!(delay_ms = waited.as_millis() as u64, "Waiting for submission slot");
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = closed.wait_for(|closed| *closed) => return Err(LimiterError::Closed),
            }
        }
        Ok(waited)
    }

    /// Refuses further reservations and wakes every waiter.
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!("Submission limiter closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Records the outcome of a dispatched submission.
    pub fn record(&self, success: bool) {
        if !self.smart.enabled {
            return;
        }
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        recent.push_back(success);
        while recent.len() > self.smart.window {
            recent.pop_front();
        }
    }

    /// Spacing applied to the next reservation.
    pub fn current_spacing(&self) -> Duration {
        if !self.smart.enabled {
            return self.spacing;
        }
        let recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        if recent.len() < self.smart.window {
            return self.spacing;
        }
        let failures = recent.iter().filter(|ok| !**ok).count();
        let ratio = failures as f64 / recent.len() as f64;
        if ratio > self.smart.failure_ratio {
            self.spacing.mul_f64(self.smart.multiplier)
        } else {
            self.spacing
        }
    }
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_secs(60);

    fn smart(window: usize) -> SmartDelayConfig {
        SmartDelayConfig {
            enabled: true,
            window,
            failure_ratio: 0.5,
            multiplier: 3.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slots_are_spaced() {
        let limiter = SubmissionLimiter::new(Duration::from_secs(2), SmartDelayConfig::default());
        let start = Instant::now();

        assert_eq!(limiter.acquire(WAIT).await, Ok(Duration::ZERO));
        limiter.acquire(WAIT).await.unwrap();
        limiter.acquire(WAIT).await.unwrap();

        assert!(start.elapsed() >= Duration::from_secs(4));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquirers_get_distinct_slots() {
        let limiter = Arc::new(SubmissionLimiter::new(
            Duration::from_secs(1),
            SmartDelayConfig::default(),
        ));
        let start = Instant::now();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    limiter.acquire(WAIT).await.unwrap();
                    Instant::now()
                })
            })
            .collect();

        let mut finished = Vec::new();
        for handle in handles {
            finished.push(handle.await.unwrap().duration_since(start));
        }
        finished.sort();
        assert_eq!(
            finished,
            vec![
                Duration::ZERO,
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3)
            ]
        );
    }

    #[test]
    fn test_smart_delay_multiplies_on_failures() {
        let limiter = SubmissionLimiter::new(Duration::from_secs(1), smart(4));
        limiter.record(false);
        limiter.record(false);
        limiter.record(false);
        // window not yet full
        assert_eq!(limiter.current_spacing(), Duration::from_secs(1));

        limiter.record(true);
        assert_eq!(limiter.current_spacing(), Duration::from_secs(3));

        for _ in 0..4 {
            limiter.record(true);
        }
        assert_eq!(limiter.current_spacing(), Duration::from_secs(1));
    }

    #[test]
    fn test_disabled_smart_delay_ignores_outcomes() {
        let limiter = SubmissionLimiter::new(Duration::from_secs(1), SmartDelayConfig::default());
        for _ in 0..20 {
            limiter.record(false);
        }
        assert_eq!(limiter.current_spacing(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_beyond_max_wait_is_not_reserved() {
        let limiter = SubmissionLimiter::new(Duration::from_secs(10), SmartDelayConfig::default());
        limiter.acquire(WAIT).await.unwrap();

        let err = limiter.acquire(Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err, LimiterError::Saturated(Duration::from_secs(10)));

        // The refused caller left the slot free for the next one.
        let start = Instant::now();
        assert_eq!(limiter.acquire(WAIT).await, Ok(Duration::from_secs(10)));
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_releases_waiters() {
        let limiter = Arc::new(SubmissionLimiter::new(
            Duration::from_secs(3600),
            SmartDelayConfig::default(),
        ));
        limiter.acquire(Duration::from_secs(7200)).await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire(Duration::from_secs(7200)).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        let start = Instant::now();
        limiter.close();
        assert_eq!(waiter.await.unwrap(), Err(LimiterError::Closed));
        assert!(start.elapsed() < Duration::from_secs(1));

        assert!(limiter.is_closed());
        assert_eq!(limiter.acquire(WAIT).await, Err(LimiterError::Closed));
    }
}
