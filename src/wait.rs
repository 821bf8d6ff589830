//! Bounded polling
//!
//! Re-checks a condition at a fixed interval until it is satisfied, the
//! check fails, or a deadline passes.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Result of a bounded wait
#[derive(Debug, PartialEq, Eq)]
pub enum WaitOutcome<T, E> {
    /// The check reported the condition satisfied
    Ready(T),
    /// The deadline elapsed first
    TimedOut,
    /// The check failed
    Errored(E),
}

impl<T, E> WaitOutcome<T, E> {
    /// True for [`WaitOutcome::Ready`]
    pub fn is_ready(&self) -> bool {
        matches!(self, WaitOutcome::Ready(_))
    }
}

/// Poll `check` every `interval` until it yields `Some`, errors, or `within` elapses.
///
/// The check runs immediately on entry. A check still pending at the
/// deadline is abandoned and counts as a timeout.
pub async fn poll_until<F, Fut, T, E>(interval: Duration, within: Duration, mut check: F) -> WaitOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let deadline = Instant::now() + within;

    loop {
        match tokio::time::timeout_at(deadline, check()).await {
            Ok(Ok(Some(value))) => return WaitOutcome::Ready(value),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => return WaitOutcome::Errored(e),
            Err(_) => return WaitOutcome::TimedOut,
        }

        let now = Instant::now();
        if now >= deadline {
            return WaitOutcome::TimedOut;
        }
        tokio::time::sleep_until((now + interval).min(deadline)).await;
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn ready_after_a_few_polls() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let outcome: WaitOutcome<u32, ()> =
            poll_until(Duration::from_millis(100), Duration::from_secs(5), || {
                let calls = calls_clone.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok((n == 3).then_some(n))
                }
            })
            .await;

        assert_eq!(outcome, WaitOutcome::Ready(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_at_deadline() {
        let start = Instant::now();
        let outcome: WaitOutcome<(), ()> =
            poll_until(Duration::from_millis(300), Duration::from_secs(1), || async {
                Ok(None)
            })
            .await;

        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn check_error_stops_polling() {
        let outcome: WaitOutcome<(), &str> =
            poll_until(Duration::from_millis(10), Duration::from_secs(1), || async {
                Err("gone")
            })
            .await;
        assert_eq!(outcome, WaitOutcome::Errored("gone"));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_check_counts_as_timeout() {
        let outcome: WaitOutcome<(), ()> =
            poll_until(Duration::from_millis(10), Duration::from_millis(50), || {
                std::future::pending::<Result<Option<()>, ()>>()
            })
            .await;
        assert!(!outcome.is_ready());
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }
}
