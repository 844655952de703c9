//! Bounded exponential backoff for rate-limited requests

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::AnnotationError;

/// Suspends the caller between retry attempts
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real wall-clock sleeper
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Outcome of one attempt, as seen by the backoff loop
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt<T> {
    Ready(T),
    RateLimited,
    Failed(String),
}

/// Retry limits for rate-limited requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay after attempt `n` is `backoff_base_secs ^ n`
    pub backoff_base_secs: f64,
    /// Extra random fraction added to each delay (0 disables)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_secs: 2.0,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following attempt `attempt` (1-based)
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let mut secs = self.backoff_base_secs.max(0.0).powi(exponent);
        if self.jitter > 0.0 {
            secs *= 1.0 + rand::thread_rng().gen_range(0.0..=self.jitter);
        }
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Run `op` until it is ready, fails, or the attempt budget is spent.
    ///
    /// Only [`Attempt::RateLimited`] is retried. No sleep follows the final
    /// attempt.
    pub async fn run<T, F, Fut>(
        &self,
        sleeper: &dyn Sleeper,
        mut op: F,
    ) -> Result<T, AnnotationError>
    where
        F: FnMut(u32) -> Fut + Send,
        Fut: Future<Output = Attempt<T>> + Send,
    {
        let max_attempts = self.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match op(attempt).await {
                Attempt::Ready(value) => return Ok(value),
                Attempt::Failed(reason) => return Err(AnnotationError::Transport(reason)),
                Attempt::RateLimited if attempt == max_attempts => break,
                Attempt::RateLimited => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_s = delay.as_secs_f64(),
                        "Rate limit reached, retrying"
                    );
                    sleeper.sleep(delay).await;
                }
            }
        }

        Err(AnnotationError::RateLimited {
            attempts: max_attempts,
        })
    }
}
