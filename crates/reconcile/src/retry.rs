//! Retry logic with exponential backoff for transient collaborator errors.

use crate::error::category_of;
use anyhow::Result;
use std::thread;
use std::time::Duration;

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    /// Base delay between retries
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
            base_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(10),
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

/// Execute a collaborator call, retrying transient failures.
///
/// Permanent errors are returned immediately; transient ones are retried
/// until `max_attempts` is reached, sleeping with exponential backoff in
/// between. `label` names the call in log output.
pub fn with_retry<T, F>(config: &RetryConfig, label: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation() {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !category_of(&e).is_retryable() || attempt + 1 >= max_attempts {
                    return Err(e);
                }

                let delay = config.delay_for_attempt(attempt);
                log::warn!(
                    "{label}: attempt {}/{} failed: {e:#}. Retrying in {:?}",
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
    use crate::error::Transient;
    use std::cell::Cell;

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(1),
            backoff_factor: 1.0,
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_delay_for_attempt_is_exponential_and_capped() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(5),
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(5));
    }

    #[test]
    fn test_with_retry_success_first_try() {
        let result = with_retry(&RetryConfig::no_retry(), "test", || Ok(42));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_with_retry_permanent_error_is_not_retried() {
        let attempts = Cell::new(0);
        let result: Result<()> = with_retry(&fast(3), "test", || {
            attempts.set(attempts.get() + 1);
            anyhow::bail!("not found")
        });

        assert!(result.is_err());
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn test_with_retry_eventual_success() {
        let attempts = Cell::new(0);
        let result = with_retry(&fast(3), "test", || {
            let current = attempts.get();
            attempts.set(current + 1);
            if current < 2 {
                Err(Transient::new("timeout").into())
            } else {
                Ok(42)
            }
        });

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn test_with_retry_all_attempts_fail() {
        let attempts = Cell::new(0);
        let result: Result<()> = with_retry(&fast(3), "test", || {
            attempts.set(attempts.get() + 1);
            Err(Transient::new("timeout").into())
        });

        assert!(result.is_err());
        assert_eq!(attempts.get(), 3);
    }
}
