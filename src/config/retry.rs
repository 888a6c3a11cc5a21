use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::AppResult;

/// Retry settings for control-plane calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts, including the first one
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Add up to 10% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry max_attempts must be at least 1".to_string());
        }
        if self.backoff_multiplier < 1.0 {
            return Err("retry backoff_multiplier must be >= 1.0".to_string());
        }
        Ok(())
    }

    /// Same policy with a different attempt budget
    pub fn with_max_attempts(&self, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..self.clone()
        }
    }

    /// Same policy with the backoff capped at `cap`
    pub fn capped_at(&self, cap: Duration) -> Self {
        Self {
            max_backoff_ms: self.max_backoff_ms.min(cap.as_millis() as u64),
            ..self.clone()
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            initial: Duration::from_millis(self.initial_backoff_ms),
            max: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.backoff_multiplier,
            jitter: self.jitter,
        }
    }
}

/// Exponential backoff schedule
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: bool,
}

impl Backoff {
    /// Delay before retry number `failures` (1-based), capped at the maximum.
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let base_ms = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.max.as_millis() as f64) as u64;
        let delay = Duration::from_millis(capped_ms);
        if self.jitter {
            add_jitter(delay).min(self.max)
        } else {
            delay
        }
    }
}

fn add_jitter(base: Duration) -> Duration {
    let jitter_range = (base.as_millis() as f64 * 0.1) as u64;
    let jitter = rand::random::<f64>() * jitter_range.max(1) as f64;
    base + Duration::from_millis(jitter as u64)
}

/// Retries an async operation while its error is transient
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub async fn execute_with_retry<F, Fut, T>(&self, mut operation: F, label: &str) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let backoff = self.config.backoff();
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(label, attempt, "succeeded after retry");
                    }
                    return Ok(result);
                }
                Err(error) => {
                    if attempt >= self.config.max_attempts || !error.is_transient() {
                        return Err(error);
                    }

                    let delay = backoff.delay(attempt);
                    warn!(
                        label,
                        attempt,
                        max_attempts = self.config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient failure, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        }
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff_multiplier, 2.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = no_jitter().capped_at(Duration::from_millis(900)).backoff();
        assert_eq!(backoff.delay(1), Duration::from_millis(250));
        assert_eq!(backoff.delay(2), Duration::from_millis(500));
        assert_eq!(backoff.delay(3), Duration::from_millis(900));
        assert_eq!(backoff.delay(30), Duration::from_millis(900));
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let config = RetryConfig::default().capped_at(Duration::from_millis(1000));
        let backoff = config.backoff();
        for failures in 1..10 {
            assert!(backoff.delay(failures) <= Duration::from_millis(1000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(no_jitter());

        let result = executor
            .execute_with_retry(
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(AppError::timeout("ack"))
                    } else {
                        Ok(7)
                    }
                },
                "ack",
            )
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(no_jitter());

        let result: AppResult<()> = executor
            .execute_with_retry(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::control_plane(400, "bad request"))
                },
                "result",
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
