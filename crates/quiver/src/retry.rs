//! Per-request retry state with exponential backoff.

use std::time::Duration;

use crate::error::Error;

/// The default socket timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2500);

/// The default number of retries.
pub const DEFAULT_MAX_RETRIES: u32 = 0;

/// The default backoff multiplier.
pub const DEFAULT_BACKOFF_MULTIPLIER: f32 = 1.0;

/// Mutable retry state owned by a single request.
///
/// The current timeout is handed to the transport as both connect and read
/// timeout. Every [`retry`](Self::retry) grows the timeout by
/// `timeout * backoff_multiplier` and uses up one attempt; once attempts are
/// exhausted the triggering error is handed back to the caller.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    current_timeout: Duration,
    current_retry_count: u32,
    max_retries: u32,
    backoff_multiplier: f32,
}

impl RetryPolicy {
    pub fn new(initial_timeout: Duration, max_retries: u32, backoff_multiplier: f32) -> Self {
        RetryPolicy {
            current_timeout: initial_timeout,
            current_retry_count: 0,
            max_retries,
            backoff_multiplier,
        }
    }

    /// The timeout to use for the next attempt.
    pub fn current_timeout(&self) -> Duration {
        self.current_timeout
    }

    /// The number of retries used up so far.
    pub fn current_retry_count(&self) -> u32 {
        self.current_retry_count
    }

    pub fn backoff_multiplier(&self) -> f32 {
        self.backoff_multiplier
    }

    /// Prepares a retry for the given error.
    ///
    /// On `Ok(())` the caller should attempt again with the updated timeout;
    /// on `Err` attempts are exhausted and the error must be surfaced.
    pub fn retry(&mut self, error: Error) -> Result<(), Error> {
        self.current_retry_count += 1;
        self.current_timeout += self.current_timeout.mul_f32(self.backoff_multiplier);
        if self.current_retry_count > self.max_retries {
            Err(error)
        } else {
            Ok(())
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(DEFAULT_TIMEOUT, DEFAULT_MAX_RETRIES, DEFAULT_BACKOFF_MULTIPLIER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout_error() -> Error {
        Error::Timeout(Default::default())
    }

    #[test]
    fn test_default_gives_up_immediately() {
        let mut policy = RetryPolicy::default();
        assert_eq!(policy.current_timeout(), DEFAULT_TIMEOUT);
        assert!(policy.retry(timeout_error()).is_err());
    }

    #[test]
    fn test_backoff_progression() {
        let mut policy = RetryPolicy::new(Duration::from_millis(100), 2, 1.0);

        assert_eq!(policy.current_timeout(), Duration::from_millis(100));
        policy.retry(timeout_error()).unwrap();
        assert_eq!(policy.current_timeout(), Duration::from_millis(200));
        assert_eq!(policy.current_retry_count(), 1);
        policy.retry(timeout_error()).unwrap();
        assert_eq!(policy.current_timeout(), Duration::from_millis(400));
        assert_eq!(policy.current_retry_count(), 2);

        // Third failure exhausts the budget of two retries.
        assert!(policy.retry(timeout_error()).is_err());
    }

    #[test]
    fn test_fractional_backoff() {
        let mut policy = RetryPolicy::new(Duration::from_millis(1000), 3, 0.5);

        policy.retry(timeout_error()).unwrap();
        assert_eq!(policy.current_timeout(), Duration::from_millis(1500));
        policy.retry(timeout_error()).unwrap();
        assert_eq!(policy.current_timeout(), Duration::from_millis(2250));
    }
}
