//! Bounded retry with exponential backoff and jitter.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RetryConfig;

/// Delay schedule for [`retry`]: `base * multiplier^(attempt-1)` plus, when
/// enabled, jitter drawn from `[0, base)`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }

    /// Delay to sleep after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let exp = base_ms * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let mut ms = exp.min(u64::MAX as f64) as u64;
        if self.jitter {
            let span = self.base_delay.as_millis().max(1) as u64;
            ms = ms.saturating_add(rand::rng().random_range(0..span));
        }
        Duration::from_millis(ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Terminal outcome of a retried operation that never succeeded.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed transiently; `last` is the final error.
    Exhausted { attempts: u32, last: E },
    /// The classifier declared the failure non-retryable.
    Permanent(E),
    /// The cancellation token fired during a backoff sleep.
    Cancelled,
}

/// Run `op` until it succeeds, the classifier rejects the error as
/// permanent, the attempt budget runs out, or `cancel` fires.
///
/// `op` receives the 1-based attempt number. The classifier returns `true`
/// for errors worth retrying.
pub async fn retry<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    classify: C,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if !classify(&err) => return Err(RetryError::Permanent(err)),
            Err(err) if attempt >= max_attempts => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                })
            }
            Err(err) => {
                let delay = policy.delay_for(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying after transient failure");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
