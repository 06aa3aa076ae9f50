use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tidevault_core::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

/// How often and how patiently a failing remote call is repeated.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// 1.0 gives a fixed delay between attempts.
    pub backoff_multiplier: f64,
    /// Adds up to 25% random delay on top of the backoff.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Same delay before every retry.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff: delay,
            max_backoff: delay,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Chunk transfers: 3 attempts, 5 seconds apart.
    pub fn chunk_upload() -> Self {
        Self::fixed(3, Duration::from_secs(5))
    }

    fn backoff_duration(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let duration_ms = base_ms.min(self.max_backoff.as_millis() as f64) as u64;
        let mut duration = Duration::from_millis(duration_ms);

        if self.jitter && duration_ms >= 4 {
            let jitter_ms = rand::thread_rng().gen_range(0..=(duration_ms / 4));
            duration += Duration::from_millis(jitter_ms);
        }

        duration
    }
}

pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // Connection resets, timeouts and chunk responses other than
            // complete/partial are transient.
            Error::Transport { .. } | Error::ChunkRejected { .. } | Error::Io(_) => true,
            _ => false,
        }
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error or
/// runs out of attempts. The last error is returned as-is.
pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, operation_name: &str, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(error) if !error.is_retryable() => {
                debug!(operation = operation_name, error = %error, "Error is not retryable, failing immediately");
                return Err(error);
            }
            Err(error) if attempt + 1 >= max_attempts => {
                warn!(
                    operation = operation_name,
                    max_attempts,
                    error = %error,
                    "Operation failed after all retry attempts"
                );
                return Err(error);
            }
            Err(error) => {
                let backoff = config.backoff_duration(attempt);
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %error,
                    "Operation failed, retrying after backoff"
                );
                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
