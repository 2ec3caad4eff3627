use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

use k3ctl_common::error::{Error, Result};
use k3ctl_common::retry::backoff_full_jitter;
use k3ctl_types::Lease;

use crate::lock::{AcquireOutcome, LockRegistry};

const RELEASE_TIMEOUT: Duration = Duration::from_secs(10);

/// Wraps one reconcile in acquire/renew/release (§4.7), generalizing the
/// acquire/renew-loop/cancel-on-failure shape of a leader-election loop from
/// "one process leads forever" to "one reconcile holds a lease for one
/// bounded call".
pub struct LeaseGuard<L: LockRegistry> {
    lock: Arc<L>,
    owner_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardOutcome<T> {
    Ran(T),
    Conflict,
}

impl<T> GuardOutcome<T> {
    pub fn into_ran(self) -> Option<T> {
        match self {
            GuardOutcome::Ran(v) => Some(v),
            GuardOutcome::Conflict => None,
        }
    }
}

impl<L: LockRegistry + 'static> LeaseGuard<L> {
    pub fn new(lock: Arc<L>, owner_id: impl Into<String>) -> Self {
        Self { lock, owner_id: owner_id.into() }
    }

    /// Runs `f` while holding the lease, racing it against the overall
    /// `deadline` and against cancellation triggered by a failed renewal.
    pub async fn run<F, Fut, T>(
        &self,
        resource_id: &str,
        ttl: Duration,
        deadline: Duration,
        f: F,
    ) -> Result<GuardOutcome<T>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = match self.lock.acquire(resource_id, &self.owner_id, ttl).await? {
            AcquireOutcome::Acquired(lease) => lease,
            AcquireOutcome::Conflict { owner } => {
                tracing::debug!(resource_id, held_by = %owner, "lease contended");
                return Ok(GuardOutcome::Conflict);
            }
        };

        let cancel = CancellationToken::new();
        let renewer_cancel = cancel.clone();
        let renew_lock = self.lock.clone();
        let renew_resource = resource_id.to_string();
        let renew_token = lease.token.clone();
        let renew_every = ttl.div_f64(2.5);

        let renew_task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(renew_every);
            tick.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = renewer_cancel.cancelled() => return,
                    _ = tick.tick() => {}
                }
                let outcome = tokio::time::timeout(
                    Duration::from_secs(10),
                    renew_lock.renew(&renew_resource, &renew_token, ttl),
                )
                .await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        eprintln!("{} {e}", "lease renewal failed, cancelling reconcile:".red());
                        renewer_cancel.cancel();
                        return;
                    }
                    Err(_) => {
                        eprintln!("{}", "lease renewal timed out, cancelling reconcile".red());
                        renewer_cancel.cancel();
                        return;
                    }
                }
            }
        });

        let work = f(cancel.clone());
        tokio::pin!(work);

        let result = tokio::select! {
            res = &mut work => res,
            _ = cancel.cancelled() => Err(Error::LeaseConflict),
            _ = tokio::time::sleep(deadline) => Err(Error::RetriesExhausted("reconcile deadline exceeded".into())),
        };

        cancel.cancel();
        renew_task.abort();

        // Fresh, short-lived context: release must happen even if the work
        // above was cancelled or the deadline hit.
        let _ = tokio::time::timeout(RELEASE_TIMEOUT, release(&self.lock, resource_id, &lease)).await;

        result.map(GuardOutcome::Ran)
    }
}

async fn release<L: LockRegistry>(lock: &L, resource_id: &str, lease: &Lease) -> Result<()> {
    lock.release(resource_id, &lease.token).await
}

/// Delay for a conflicted lease's caller-side requeue (§4.7 step 1: 20-30s).
pub fn conflict_requeue_delay() -> Duration {
    Duration::from_secs(20) + backoff_full_jitter(Duration::from_secs(1), Duration::from_secs(10), 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::fakes::InMemoryLock;

    #[tokio::test]
    async fn second_acquirer_gets_conflict() {
        let lock = Arc::new(InMemoryLock::default());
        let guard_a = LeaseGuard::new(lock.clone(), "owner-a");
        let guard_b = LeaseGuard::new(lock.clone(), "owner-b");

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let a = tokio::spawn({
            let guard_a = guard_a;
            async move {
                guard_a
                    .run("cluster-c1", Duration::from_secs(30), Duration::from_secs(5), move |_cancel| async move {
                        rx.await.ok();
                        Ok(())
                    })
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let b_outcome = guard_b
            .run("cluster-c1", Duration::from_secs(30), Duration::from_secs(5), |_cancel| async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(b_outcome, GuardOutcome::Conflict);

        tx.send(()).ok();
        let a_outcome = a.await.unwrap().unwrap();
        assert_eq!(a_outcome, GuardOutcome::Ran(()));
    }
}
