//! Retry utilities with exponential backoff and jitter.
//!
//! Two users share one [`RetryConfig`]:
//! - the dispatcher, which keeps a [`Backoff`] per scope and re-queues failed
//!   passes after [`Backoff::next_delay`]
//! - [`retry_with_backoff`], which wraps one-off async operations such as
//!   building the Kubernetes client at startup
//!
//! # Example
//!
//! ```ignore
//! use machine_lb_controller::retry::{retry_with_backoff, RetryConfig};
//!
//! let client = retry_with_backoff(
//!     &RetryConfig::with_max_attempts(5),
//!     "kube_client",
//!     || async { kube::Client::try_default().await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Create a config that retries forever (infinite attempts)
    pub fn infinite() -> Self {
        Self::default()
    }

    /// Un-jittered delay before retry number `attempt` (1-based), capped at `max_delay`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Apply 0.5x to 1.5x jitter to a delay, never exceeding `cap`
fn jittered(delay: Duration, cap: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64((delay.as_secs_f64() * jitter).min(cap.as_secs_f64()))
}

/// Consecutive-failure tracker for one retry key
#[derive(Clone, Debug)]
pub struct Backoff {
    config: RetryConfig,
    failures: u32,
}

impl Backoff {
    /// Create a tracker with no recorded failures
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before retrying
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        jittered(
            self.config.delay_for_attempt(self.failures),
            self.config.max_delay,
        )
    }

    /// Number of consecutive failures recorded
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether `max_attempts` consecutive failures have been recorded
    pub fn exhausted(&self) -> bool {
        self.config.max_attempts > 0 && self.failures >= self.config.max_attempts
    }

    /// Clear recorded failures after a success
    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries indefinitely (or up to max_attempts if set) until success.
///
/// # Arguments
/// * `config` - Retry configuration
/// * `operation_name` - Name for logging purposes
/// * `operation` - The async operation to retry
///
/// # Returns
/// The result of the operation, or the last error if max_attempts is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut backoff = Backoff::new(config.clone());

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let delay = backoff.next_delay();

                if backoff.exhausted() {
                    error!(
                        operation = %operation_name,
                        attempt = backoff.failures(),
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                warn!(
                    operation = %operation_name,
                    attempt = backoff.failures(),
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}
