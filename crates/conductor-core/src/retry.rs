//! Bounded retry with jitter for infrastructure errors, and the process
//! circuit breaker.
//!
//! Infrastructure failures (database, broker) never terminate a run
//! directly: callers in the dispatcher and sweeper loops re-enter through
//! [`with_infra_retry`], and only a sustained failure streak trips the
//! [`CircuitBreaker`] into a process-level fatal.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tracing::warn;

/// Attempts per [`with_infra_retry`] call.
const INFRA_ATTEMPTS: u32 = 3;
/// Base delay between infra attempts; doubled per attempt, plus jitter.
const INFRA_BASE_DELAY: Duration = Duration::from_millis(250);

/// Full jitter on an exponential backoff: a uniform duration in
/// `[0, base * 2^attempt)`.
fn jittered_delay(attempt: u32, rng: &mut impl Rng) -> Duration {
    let ceiling = INFRA_BASE_DELAY.as_millis() as u64 * 2u64.saturating_pow(attempt);
    Duration::from_millis(rng.random_range(0..ceiling.max(1)))
}

/// Run `op`, retrying transient infrastructure failures with jittered
/// backoff. The final error is returned unchanged for the caller's circuit
/// breaker to count.
pub async fn with_infra_retry<F, Fut, T>(label: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;
    for attempt in 0..INFRA_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(
                    op = label,
                    attempt = attempt + 1,
                    error = %err,
                    "infrastructure operation failed"
                );
                last_err = Some(err);
                if attempt + 1 < INFRA_ATTEMPTS {
                    let delay = jittered_delay(attempt, &mut rand::rng());
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(last_err.expect("at least one attempt ran"))
}

/// Counts consecutive infrastructure failures; trips once the threshold is
/// crossed. Any success resets the streak.
#[derive(Debug)]
pub struct CircuitBreaker {
    consecutive_failures: AtomicU32,
    threshold: u32,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            threshold,
        }
    }

    /// Record a success; the streak resets.
    pub fn succeed(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Record a failure; returns `true` when the breaker has tripped.
    pub fn fail(&self) -> bool {
        let streak = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        streak >= self.threshold
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[tokio::test]
    async fn succeeds_without_retrying() {
        let calls = AtomicUsize::new(0);
        let result: Result<i32> = with_infra_retry("test", async || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_then_returns_the_value() {
        let calls = AtomicUsize::new(0);
        let result: Result<&str> = with_infra_retry("test", async || {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("transient")
            }
            Ok("recovered")
        })
        .await;
        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_surfaces_the_error() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = with_infra_retry("test", async || {
            calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("db down")
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), INFRA_ATTEMPTS as usize);
    }

    #[test]
    fn breaker_trips_at_threshold_and_resets_on_success() {
        let breaker = CircuitBreaker::new(3);
        assert!(!breaker.fail());
        assert!(!breaker.fail());
        assert!(breaker.fail(), "third consecutive failure trips");

        breaker.succeed();
        assert!(!breaker.fail(), "streak resets after a success");
    }

    #[test]
    fn jitter_stays_under_the_exponential_ceiling() {
        let mut rng = rand::rng();
        for attempt in 0..5 {
            let ceiling = INFRA_BASE_DELAY.as_millis() as u64 * 2u64.pow(attempt);
            for _ in 0..50 {
                let d = jittered_delay(attempt, &mut rng);
                assert!(d.as_millis() < ceiling as u128 || ceiling == 0);
            }
        }
    }
}
