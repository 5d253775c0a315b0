//! Retry with exponential backoff, jitter, and a total-elapsed cap.
//!
//! Callers hand in a deadline budget; the helper never sleeps past
//! it, so a retried router call cannot stall the control loop beyond
//! its configured timeout.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::RngExt;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomized on each side (0.25 = ±25%).
    pub jitter: f64,
    /// Hard cap on total time spent including sleeps.
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 3,
            initial_delay: Duration::from_millis(200),
            multiplier: 2.0,
            jitter: 0.25,
            max_elapsed: Duration::from_secs(5),
        }
    }
}

/// Run `op` until it succeeds, a non-retryable error occurs, attempts
/// run out, or the elapsed budget is exhausted. Returns the last error.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    policy: RetryPolicy,
    mut is_retryable: R,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(&E) -> bool,
    E: std::fmt::Display,
{
    let started = Instant::now();
    let mut delay = policy.initial_delay;
    let mut last_err = None;

    for attempt in 1..=policy.attempts.max(1) {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !is_retryable(&e) || attempt == policy.attempts.max(1) {
                    return Err(e);
                }
                let sleep = jittered(delay, policy.jitter);
                if started.elapsed() + sleep > policy.max_elapsed {
                    return Err(e);
                }
                tracing::debug!(attempt, error = %e, delay_ms = sleep.as_millis() as u64, "retrying");
                last_err = Some(e);
                tokio::time::sleep(sleep).await;
                delay = delay.mul_f64(policy.multiplier);
            }
        }
    }

    // Unreachable in practice: the loop always returns. Keeps the
    // compiler satisfied without panicking in non-test code.
    match last_err {
        Some(e) => Err(e),
        None => unreachable!("retry loop runs at least once"),
    }
}

fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let mut rng = rand::rng();
    let factor = 1.0 + rng.random_range(-jitter..jitter);
    delay.mul_f64(factor.max(0.0))
}
