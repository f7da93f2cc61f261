//! Exponential backoff with jitter and a retry budget, shared by the
//! file-descriptor cache's parallel GETs and the multipart scheduler's part
//! dispatch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::FsError;

/// Backoff strategy. Only `ExponentialWithJitter` is exposed through
/// `Config`, but the plain variant is kept for tests that want determinism.
#[derive(Debug, Clone)]
pub enum BackoffStrategy {
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: f64,
    },
    ExponentialWithJitter {
        initial: Duration,
        max: Duration,
        multiplier: f64,
    },
}

impl BackoffStrategy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let ms = initial.as_millis() as f64 * multiplier.powi(attempt as i32);
                Duration::from_millis(ms as u64).min(*max)
            }
            BackoffStrategy::ExponentialWithJitter {
                initial,
                max,
                multiplier,
            } => {
                let base_ms = initial.as_millis() as f64 * multiplier.powi(attempt as i32);
                let jitter = rand::random::<f64>() * base_ms;
                Duration::from_millis((base_ms + jitter) as u64).min(*max)
            }
        }
    }
}

/// A shared, stateless retry policy. Each call site tracks its own attempt
/// counter; the policy only decides delays and limits.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    strategy: BackoffStrategy,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        RetryPolicy {
            strategy: BackoffStrategy::ExponentialWithJitter {
                initial: cfg.retry_initial_backoff,
                max: cfg.retry_max_backoff,
                multiplier: 2.0,
            },
            max_attempts: cfg.retry_max_attempts,
        }
    }

    #[cfg(test)]
    pub fn fixed_for_tests(max_attempts: u32) -> Self {
        RetryPolicy {
            strategy: BackoffStrategy::Exponential {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(5),
                multiplier: 1.0,
            },
            max_attempts,
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.strategy.delay_for_attempt(attempt)
    }

    /// Runs `op` up to `max_attempts` times, sleeping between attempts,
    /// stopping early on a non-retryable error or when `cancel` is set.
    pub fn run_with_retry<T>(
        &self,
        cancel: &CancelToken,
        mut op: impl FnMut(u32) -> Result<T, FsError>,
    ) -> Result<T, FsError> {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(FsError::client_fatal("operation cancelled"));
            }
            match op(attempt) {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt + 1 < self.max_attempts => {
                    std::thread::sleep(self.delay_for_attempt(attempt));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Shared cancellation flag checked between retry attempts. The
/// multipart scheduler sets this once any part exhausts its own budget so
/// that peers stop retrying and the upload moves to `Aborting`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn retries_until_success_within_budget() {
        let policy = RetryPolicy::fixed_for_tests(5);
        let cancel = CancelToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<i32, FsError> = policy.run_with_retry(&cancel, |_attempt| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(FsError::server_transient("simulated 503"))
            } else {
                Ok(42)
            }
        });

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let policy = RetryPolicy::fixed_for_tests(3);
        let cancel = CancelToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<i32, FsError> = policy.run_with_retry(&cancel, |_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FsError::server_transient("persistent 503"))
        });

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn non_retryable_error_stops_immediately() {
        let policy = RetryPolicy::fixed_for_tests(5);
        let cancel = CancelToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<i32, FsError> = policy.run_with_retry(&cancel, |_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FsError::not_found("some/key"))
        });

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancellation_short_circuits_retry_loop() {
        let policy = RetryPolicy::fixed_for_tests(10);
        let cancel = CancelToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);

        let result: Result<i32, FsError> = policy.run_with_retry(&cancel, |_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FsError::server_transient("never reached"))
        });

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
