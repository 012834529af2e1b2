use std::time::Duration;

/// Exponential backoff settings for [`retry_with_backoff`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay after the first failure (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap (backoff won't exceed this)
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a given attempt using exponential backoff
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }
}

/// Retry `f` with exponential backoff, returning the last error once
/// `policy.max_attempts` attempts failed.
pub fn retry_with_backoff<F, T, E>(mut f: F, policy: &RetryPolicy, operation_name: &str) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match f() {
            Ok(result) => return Ok(result),
            Err(e) if attempt + 1 < max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name,
                    attempt + 1,
                    max_attempts,
                    e,
                    delay
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(
                    "{} failed after {} attempts: {}",
                    operation_name,
                    max_attempts,
                    e
                );
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_micros(10),
            max_delay: Duration::from_micros(50),
        }
    }

    #[test]
    fn test_exponential_backoff_calculation() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        // 800ms, capped
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(500));
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let mut calls = 0;
        let result: Result<u32, String> = retry_with_backoff(
            || {
                calls += 1;
                if calls < 3 { Err(format!("attempt {}", calls)) } else { Ok(calls) }
            },
            &fast_policy(5),
            "flaky",
        );
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn test_returns_last_error_when_exhausted() {
        let mut calls = 0;
        let result: Result<(), String> = retry_with_backoff(
            || {
                calls += 1;
                Err(format!("attempt {}", calls))
            },
            &fast_policy(4),
            "always failing",
        );
        assert_eq!(result, Err("attempt 4".to_string()));
        assert_eq!(calls, 4, "should try exactly max_attempts times");
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let mut calls = 0;
        let _: Result<(), &str> = retry_with_backoff(
            || {
                calls += 1;
                Err("no")
            },
            &fast_policy(0),
            "zero",
        );
        assert_eq!(calls, 1);
    }
}
