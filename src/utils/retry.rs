use std::time::Duration;
use tokio::time::sleep;

// ============================================================================
// Exponential Backoff
// ============================================================================
//
// Two consumers:
// - the relay, which only needs the delay for the n-th failed attempt because
//   its retries happen on later polls
// - the bus, which retries dead-letter publishes inline
//
// ============================================================================

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts for inline retries
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
    /// Multiplier applied per further failure
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Few quick attempts, for paths that must not stall a consumer for long
    pub fn conservative() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }

    /// Delay to wait after `failures` consecutive failures (1-based).
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.powi(failures.saturating_sub(1).min(32) as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Result of an inline retry
#[derive(Debug)]
pub enum RetryResult<T, E> {
    Success(T),
    /// Gave up after `attempts` attempts; carries the last error
    Failed { error: E, attempts: u32 },
}

/// Execute an operation with exponential backoff retry
pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempt = attempt, "Operation succeeded after retry");
                }
                return RetryResult::Success(result);
            }
            Err(error) if attempt >= config.max_attempts => {
                tracing::error!(attempt = attempt, error = %error, "Operation failed after all retries");
                return RetryResult::Failed { error, attempts: attempt };
            }
            Err(error) => {
                let delay = config.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt = attempt,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying after delay"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{BrokerMessage, InMemoryBroker, MessageBroker};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_send_recovers_after_transient_broker_failures() {
        let broker = InMemoryBroker::new();
        broker.fail_next_sends(2);
        let message = BrokerMessage::new("audit.events", "audit.recorded", b"{}".to_vec());
        let seen = Arc::new(AtomicU32::new(0));

        let (sender, message, counter) = (&broker, &message, &seen);
        let result = retry_with_backoff(&fast(), move |attempt| {
            counter.store(attempt, Ordering::SeqCst);
            sender.send(message)
        })
        .await;

        assert!(matches!(result, RetryResult::Success(())));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(broker.messages("audit.events").len(), 1);
    }

    #[tokio::test]
    async fn test_retry_fails_after_max_attempts() {
        let config = RetryConfig { max_attempts: 2, ..fast() };

        let result = retry_with_backoff(&config, |_attempt| async { Err::<(), _>("persistent failure") }).await;

        assert!(matches!(result, RetryResult::Failed { attempts: 2, .. }));
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(40), Duration::from_millis(500));
    }
}
