use std::future::Future;
use std::time::Duration;

use crate::error::Error;

const MAX_ATTEMPTS: usize = 8;
const DEFAULT_CAP: Duration = Duration::from_secs(10);

/// Exponential backoff w/ "full jitter": sleep a random duration in
/// `[0, min(cap, base * 2^attempt)]`. Behaves well under contention and
/// avoids lockstep retries between the reconcile loop and any concurrent
/// invocation racing it for the same cluster.
pub fn backoff_full_jitter(base: Duration, cap: Duration, attempt: usize) -> Duration {
    let base_ms = base.as_millis() as u64;
    let cap_ms = cap.as_millis() as u64;

    let pow = if attempt >= 63 { u64::MAX } else { 1u64 << attempt };
    let exp_ms = base_ms.saturating_mul(pow);
    let upper = exp_ms.min(cap_ms).max(1);

    let jitter_ms = rand::random_range(0..=upper);
    Duration::from_millis(jitter_ms)
}

/// Retries `op` up to `MAX_ATTEMPTS` times on transient AWS errors, sleeping
/// a full-jitter backoff between attempts. `is_transient` decides whether a
/// given failure is worth retrying at all (throttling, 5xx, connection
/// resets) versus one that should fail the reconcile immediately (access
/// denied, malformed request).
pub async fn with_retry<T, F, Fut>(
    base: Duration,
    is_transient: impl Fn(&Error) -> bool,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut last_err = None;
    for attempt in 0..MAX_ATTEMPTS {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if is_transient(&e) => {
                let delay = backoff_full_jitter(base, DEFAULT_CAP, attempt);
                tracing::warn!(attempt, ?delay, error = %e, "transient error, retrying");
                last_err = Some(e);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::RetriesExhausted(
        last_err.map(|e| e.to_string()).unwrap_or_default(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_respects_cap() {
        let cap = Duration::from_secs(10);
        for attempt in 0..20 {
            let d = backoff_full_jitter(Duration::from_millis(250), cap, attempt);
            assert!(d <= cap);
        }
    }

    #[test]
    fn backoff_is_never_zero_upper() {
        // attempt 0 still produces a sensible jittered range, not a fixed 0.
        let d = backoff_full_jitter(Duration::from_millis(250), Duration::from_secs(10), 0);
        assert!(d <= Duration::from_millis(250));
    }
}
