use crate::config::RetryConfig;
use crate::error::ClientError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Bounded exponential backoff with full jitter around one remote call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Upper bound of the uniform random term added to every delay.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            jitter: Duration::from_secs(1),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            ..Self::default()
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// `base_delay * 2^attempt + U(0, jitter)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(2u32.saturating_pow(attempt));
        let jitter = if self.jitter.is_zero() {
            Duration::ZERO
        } else {
            self.jitter.mul_f64(rand::thread_rng().gen_range(0.0..1.0))
        };
        exp + jitter
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// `max_retries` retries are used up. The last error is returned unchanged.
    pub async fn run<T, F, Fut>(&self, name: &str, mut op: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if !e.is_retryable() => {
                    debug!("{}: not retrying after error: {}", name, e);
                    return Err(e);
                }
                Err(e) if attempt >= self.max_retries => {
                    error!("{} failed after {} retries: {}", name, self.max_retries, e);
                    return Err(e);
                }
                Err(e) => {
                    let mut delay = self.backoff(attempt);
                    if let Some(server_wait) = e.retry_after() {
                        delay = delay.max(server_wait);
                    }
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:.2}s",
                        name,
                        attempt + 1,
                        self.max_retries + 1,
                        e,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
