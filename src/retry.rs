//! Bounded retry for chunk fetches
//!
//! A failed fetch is retried while its error is transient and the
//! [`Backoff`] schedule still has a delay to hand out.
//!
//! # Example
//!
//! ```no_run
//! use fanout_relay::retry::{IsRetryable, fetch_with_retry};
//! use fanout_relay::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{:?}", self)
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let config = RetryConfig::default();
//! fetch_with_retry(&config, |_attempt| async { Ok::<_, MyError>(()) }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::Error;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        // Transport hiccups and per-chunk failures only. A missing broker,
        // unknown ids and expired sessions are permanent for this attempt.
        matches!(
            self,
            Error::ChannelTimeout { .. } | Error::ChunkFetchFailure { .. }
        )
    }
}

/// Delay schedule for one retried fetch
///
/// Hands out at most `max_attempts` delays. Each delay is the previous one
/// times `backoff_multiplier`, capped at `max_delay`; jitter, when enabled,
/// stretches a delay by up to 100% without feeding back into the schedule.
#[derive(Debug, Clone)]
pub struct Backoff {
    delay: Duration,
    retries_left: u32,
    multiplier: f64,
    max_delay: Duration,
    jitter: bool,
}

impl Backoff {
    /// Fresh schedule from a retry config
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            delay: config.initial_delay.min(config.max_delay),
            retries_left: config.max_attempts,
            multiplier: config.backoff_multiplier,
            max_delay: config.max_delay,
            jitter: config.jitter,
        }
    }

    /// Retries still available
    pub fn retries_left(&self) -> u32 {
        self.retries_left
    }

    /// Delay before the next retry, or `None` once retries are used up
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries_left == 0 {
            return None;
        }
        self.retries_left -= 1;
        let base = self.delay;
        self.delay = Duration::from_secs_f64(base.as_secs_f64() * self.multiplier).min(self.max_delay);
        Some(if self.jitter { stretch(base) } else { base })
    }
}

fn stretch(delay: Duration) -> Duration {
    delay.mul_f64(1.0 + rand::thread_rng().gen_range(0.0..=1.0))
}

/// Run `fetch` until it succeeds, fails permanently or the backoff runs out.
///
/// `fetch` receives the 1-based attempt number. `config.max_attempts` counts
/// retries, so it runs at most `max_attempts + 1` times. Callers put the
/// chunk being fetched in the surrounding span.
pub async fn fetch_with_retry<F, Fut, T, E>(config: &RetryConfig, mut fetch: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut backoff = Backoff::new(config);
    let mut attempt = 1;

    loop {
        let error = match fetch(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(attempt, "Chunk fetch recovered");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !error.is_retryable() {
            tracing::debug!(error = %error, attempt, "Chunk fetch failed permanently");
            return Err(error);
        }
        let Some(delay) = backoff.next_delay() else {
            tracing::error!(error = %error, attempts = attempt, "Chunk fetch gave up");
            return Err(error);
        };

        tracing::warn!(
            error = %error,
            attempt,
            retries_left = backoff.retries_left(),
            delay_ms = delay.as_millis() as u64,
            "Chunk fetch failed, backing off"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
