//! Retry logic with exponential backoff for transient backend errors.

use crate::error::BackendError;
use std::thread;
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with custom settings.
    pub fn new(max_attempts: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_factor,
            ..Default::default()
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Create a config that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Run a backend operation, retrying transient failures with backoff.
///
/// `label` identifies the operation in log output (e.g. `"create vnet1"`).
/// Non-retryable errors are returned immediately; after the last attempt
/// the last error is returned.
pub fn with_retry<T, F>(config: &RetryConfig, label: &str, mut operation: F) -> Result<T, BackendError>
where
    F: FnMut() -> Result<T, BackendError>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation() {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() || attempt + 1 >= max_attempts => return Err(e),
            Err(e) => {
                let delay = config.delay_for_attempt(attempt);
                log::warn!(
                    "{label}: attempt {}/{} failed: {e}. Retrying in {:?}",
                    attempt + 1,
                    max_attempts,
                    delay
                );
                thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            backoff_factor: 1.0,
            max_delay: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_delay_calculation() {
        let config = RetryConfig::new(5, Duration::from_secs(2), 2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(8));
        // capped at max_delay
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn test_with_retry_success_first_try() {
        let result = with_retry(&RetryConfig::no_retry(), "op", || Ok::<_, BackendError>(42));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_with_retry_permanent_error() {
        let attempts = Cell::new(0);

        let result: Result<(), _> = with_retry(&fast(), "op", || {
            attempts.set(attempts.get() + 1);
            Err(BackendError::permanent("quota exceeded"))
        });

        assert!(result.is_err());
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn test_with_retry_eventual_success() {
        let attempts = Cell::new(0);

        let result = with_retry(&fast(), "op", || {
            let current = attempts.get();
            attempts.set(current + 1);
            if current < 2 {
                Err(BackendError::transient("throttled"))
            } else {
                Ok(7)
            }
        });

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn test_with_retry_budget_exhausted() {
        let attempts = Cell::new(0);

        let result: Result<(), _> = with_retry(&fast(), "op", || {
            attempts.set(attempts.get() + 1);
            Err(BackendError::transient("timeout"))
        });

        assert_eq!(result, Err(BackendError::transient("timeout")));
        assert_eq!(attempts.get(), 3);
    }
}
