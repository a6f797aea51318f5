//! Bounded retry with a fixed delay

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;

/// Run `work` up to `attempts` times, sleeping `delay` between attempts
///
/// After a failure with attempts remaining, `should_retry(remaining, &error)`
/// decides whether to go on. It runs before the delay, so whatever it records
/// is visible to the next attempt. The last error is returned when retries
/// stop.
pub async fn retry<T, F, Fut, P>(
    attempts: usize,
    delay: Duration,
    mut work: F,
    mut should_retry: P,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: FnMut(usize, &Error) -> bool,
{
    if attempts == 0 {
        return Err(Error::state("retry requires at least one attempt"));
    }

    let mut remaining = attempts;
    loop {
        remaining -= 1;
        match work().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if remaining == 0 || !should_retry(remaining, &e) {
                    return Err(e);
                }
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_stops_after_attempts() {
        let calls = AtomicUsize::new(0);
        let mut seen_remaining = Vec::new();
        let started = tokio::time::Instant::now();

        let result: Result<()> = retry(
            3,
            Duration::from_secs(2),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Network("down".into())) }
            },
            |remaining, _| {
                seen_remaining.push(remaining);
                true
            },
        )
        .await;

        assert_eq!(result, Err(Error::Network("down".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(seen_remaining, vec![2, 1]);
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_aborts() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry(
            3,
            Duration::from_secs(2),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::state("nope")) }
            },
            |_, _| false,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_second_attempt() {
        let calls = AtomicUsize::new(0);
        let result = retry(
            3,
            Duration::from_millis(10),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(Error::Network("flaky".into()))
                    } else {
                        Ok(n)
                    }
                }
            },
            |_, _| true,
        )
        .await;
        assert_eq!(result, Ok(1));
    }
}
