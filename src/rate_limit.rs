use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// How long a caller is willing to queue for a token before degrading.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("rate limiter for {source_name}: next token in {wait:?} exceeds timeout {timeout:?}")]
pub struct RateLimitTimeout {
    pub source_name: String,
    pub wait: Duration,
    pub timeout: Duration,
}

/// Token bucket with capacity 1, refilling one token per interval.
///
/// Shared by every poller of one source. Callers reserve the next free slot
/// under a short lock and then sleep outside it, so waiters are served in
/// reservation order.
#[derive(Debug)]
pub struct RateLimiter {
    source_name: String,
    interval: Duration,
    timeout: Duration,
    next_token: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(source_name: impl Into<String>, interval: Duration, timeout: Duration) -> Self {
        Self {
            source_name: source_name.into(),
            interval,
            timeout,
            next_token: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for a token. Fails without consuming anything when the token
    /// would arrive later than the configured timeout.
    pub async fn acquire(&self) -> Result<(), RateLimitTimeout> {
        let slot = self.reserve(Some(self.timeout))?;
        tokio::time::sleep_until(slot).await;
        Ok(())
    }

    /// Wait for a token however long it takes.
    pub async fn acquire_unbounded(&self) {
        // reserve(None) cannot fail
        if let Ok(slot) = self.reserve(None) {
            tokio::time::sleep_until(slot).await;
        }
    }

    fn reserve(&self, limit: Option<Duration>) -> Result<Instant, RateLimitTimeout> {
        let mut next = self
            .next_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let slot = match *next {
            Some(at) if at > now => at,
            _ => now,
        };
        let wait = slot - now;
        if let Some(timeout) = limit {
            if wait > timeout {
                return Err(RateLimitTimeout {
                    source_name: self.source_name.clone(),
                    wait,
                    timeout,
                });
            }
        }
        *next = Some(slot + self.interval);
        if !wait.is_zero() {
            debug!(source = %self.source_name, ?wait, "queued for rate limiter token");
        }
        Ok(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn first_token_is_immediate_then_one_per_interval() {
        let limiter = RateLimiter::new("src", Duration::from_secs(10), DEFAULT_ACQUIRE_TIMEOUT);
        let start = Instant::now();

        limiter.acquire().await.unwrap();
        assert_eq!(Instant::now() - start, Duration::ZERO);

        limiter.acquire().await.unwrap();
        assert_eq!(Instant::now() - start, Duration::from_secs(10));

        limiter.acquire().await.unwrap();
        assert_eq!(Instant::now() - start, Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_does_not_accumulate_burst() {
        let limiter = RateLimiter::new("src", Duration::from_secs(5), DEFAULT_ACQUIRE_TIMEOUT);
        limiter.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        let start = Instant::now();
        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();
        assert_eq!(Instant::now() - start, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_consuming_a_slot() {
        let limiter = RateLimiter::new("src", Duration::from_secs(30), Duration::from_secs(45));
        limiter.acquire().await.unwrap(); // t=0, next at 30
        limiter.reserve(Some(Duration::from_secs(45))).unwrap(); // takes 30, next at 60

        let err = limiter.acquire().await.unwrap_err();
        assert_eq!(err.wait, Duration::from_secs(60));
        assert_eq!(err.timeout, Duration::from_secs(45));

        // the failed attempt did not push the schedule back
        let start = Instant::now();
        limiter.acquire_unbounded().await;
        assert_eq!(Instant::now() - start, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn completed_attempts_are_bounded_by_window() {
        let interval = Duration::from_secs(3);
        let window = Duration::from_secs(20);
        let limiter = Arc::new(RateLimiter::new("src", interval, Duration::from_secs(3600)));
        let start = Instant::now();
        let grants = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let limiter = Arc::clone(&limiter);
            let grants = Arc::clone(&grants);
            tasks.push(tokio::spawn(async move {
                loop {
                    limiter.acquire().await.unwrap();
                    grants.lock().unwrap().push(Instant::now());
                }
            }));
        }

        tokio::time::sleep(window).await;
        for task in &tasks {
            task.abort();
        }

        let granted = grants
            .lock()
            .unwrap()
            .iter()
            .filter(|at| **at - start <= window)
            .count() as u64;
        let bound = window.as_secs() / interval.as_secs() + 1;
        assert!(granted <= bound, "{} grants exceed bound {}", granted, bound);
        assert!(granted >= bound - 1);
    }
}
