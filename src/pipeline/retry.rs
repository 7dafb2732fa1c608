//! Retry budget and backoff schedule shared by the prefix read and the fetcher.
//!
//! The n-th retry (n ≥ 1) waits `backoff_factor^n` seconds; the first attempt
//! never waits. A logical download therefore makes at most
//! `max_retries + 1` transfer attempts.
//!
//! Sleeping goes through [`Sleeper`] so tests can record the schedule instead
//! of waiting it out.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Longest single backoff; `factor^n` is clamped here.
pub const MAX_BACKOFF: Duration = Duration::from_secs(3600);

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Real sleeping via `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(duration).boxed()
    }
}

/// Returns immediately and remembers every requested delay.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays requested so far, in order.
    pub fn delays(&self) -> Vec<Duration> {
        match self.delays.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        match self.delays.lock() {
            Ok(mut guard) => guard.push(duration),
            Err(poisoned) => poisoned.into_inner().push(duration),
        }
        futures::future::ready(()).boxed()
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_factor: f64,
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("backoff_factor", &self.backoff_factor)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_factor: f64) -> Self {
        Self {
            max_retries,
            backoff_factor,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Total transfer attempts one logical operation may make.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Wait before retry number `attempt` (1-based). Zero for `attempt == 0`.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= MAX_BACKOFF.as_secs_f64() {
            return MAX_BACKOFF;
        }
        if secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(secs)
    }

    /// Sleep for [`Self::delay`]`(attempt)`.
    pub async fn backoff(&self, attempt: u32) {
        let delay = self.delay(attempt);
        if !delay.is_zero() {
            self.sleeper.sleep(delay).await;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_is_exponential() {
        let p = RetryPolicy::new(5, 2.0);
        assert_eq!(p.delay(0), Duration::ZERO);
        assert_eq!(p.delay(1), Duration::from_secs(2));
        assert_eq!(p.delay(2), Duration::from_secs(4));
        assert_eq!(p.delay(5), Duration::from_secs(32));
        assert_eq!(p.max_attempts(), 6);
    }

    #[test]
    fn huge_attempts_saturate() {
        let p = RetryPolicy::new(u32::MAX, 2.0);
        assert_eq!(p.delay(10_000), MAX_BACKOFF);
        assert_eq!(p.max_attempts(), u32::MAX);
    }

    #[test]
    fn zero_factor_never_waits() {
        let p = RetryPolicy::new(3, 0.0);
        assert_eq!(p.delay(1), Duration::ZERO);
        assert_eq!(p.delay(3), Duration::ZERO);
    }

    #[tokio::test]
    async fn recording_sleeper_captures_schedule() {
        let sleeper = RecordingSleeper::new();
        let p = RetryPolicy::new(3, 1.5).with_sleeper(Arc::new(sleeper.clone()));
        p.backoff(1).await;
        p.backoff(2).await;
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_secs_f64(1.5), Duration::from_secs_f64(2.25)]
        );
    }
}
