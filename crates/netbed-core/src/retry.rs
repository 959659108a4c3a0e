//! Fixed-backoff retry
//!
//! Both the connect phase (50 attempts, 30 s apart by default) and the start
//! phase (10 attempts, 1 s apart) are the same shape: try a bounded number of
//! times with a fixed delay between failures, then fail hard. The budgets are
//! configuration; the bounded-attempts-then-hard-failure semantics are not.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Attempt budget and fixed delay between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        RetryPolicy { attempts, delay }
    }
}

/// Run `op` until it succeeds or the attempt budget is exhausted, sleeping
/// the fixed delay between failures. The operation receives the 1-based
/// attempt number. Returns the last error when every attempt fails.
pub async fn retry_fixed<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.attempts.max(1);
    for attempt in 1..attempts {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(_) => {
                debug!("Attempt {} of {} failed", attempt, attempts);
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
    // the last attempt's error is the one callers see
    op(attempts).await
}
