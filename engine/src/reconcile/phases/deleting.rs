use std::time::Duration;

use futures::future::join_all;

use k3ctl_common::error::Result;
use k3ctl_common::notify::{ClusterEvent, Topic};
use k3ctl_types::{ClusterConfig, ClusterPhase, ClusterStatus, InstanceState, keys};

use crate::reconcile::{Engine, PhaseOutcome};

const DELETE_INSTANCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Teardown (§4.8.9). Never blocks on actual termination; each reconcile
/// only fires the next round of `deleteInstance` calls and requeues until
/// the cloud reports nothing left.
pub async fn run(engine: &Engine, config: &ClusterConfig, status: &mut ClusterStatus) -> Result<PhaseOutcome> {
    let actual = engine.compute.list_instances(&config.region, &config.name).await?;

    if actual.is_empty() {
        // Best-effort: a security group still referenced by a lingering
        // network interface can fail to delete; that's the driver's
        // problem to retry on a future cluster with the same name, not
        // this reconcile's.
        if let Err(e) = engine.compute.cleanup_cluster(&config.region, &config.name, &engine.sg_prefix).await {
            tracing::warn!(cluster = %config.name, error = %e, "cluster cleanup failed, proceeding with deletion anyway");
        }

        engine.store.delete(&keys::config(&config.name)).await?;
        engine.store.delete(&keys::status(&config.name)).await?;

        if let Err(e) = engine.notify.publish(Topic::ClusterEvents, &ClusterEvent::Deleted { cluster: config.name.clone() }).await {
            tracing::warn!(cluster = %config.name, error = %e, "deletion notification publish failed");
        }

        // §4.8.9 step 2: never persist `status` after this point — that
        // would recreate the blob we just deleted.
        return Ok(PhaseOutcome {
            next_phase: ClusterPhase::Deleting,
            message: None,
            requeue_after: None,
            terminal_delete: true,
        });
    }

    let mut to_delete = Vec::new();
    for cloud in &actual {
        match status.find_mut(&cloud.name) {
            Some(record) => {
                if record.state != InstanceState::Terminating && record.state != InstanceState::Terminated {
                    to_delete.push(cloud.instance_id.clone());
                }
                record.instance_id = cloud.instance_id.clone();
                record.state = InstanceState::Terminating;
            }
            None => to_delete.push(cloud.instance_id.clone()),
        }
    }

    // Persist `terminating` before firing deletes: a crash after this point
    // re-lists cloud truth and never double-issues a delete for an instance
    // this tick already marked.
    engine.store.put(&keys::status(&config.name), serde_json::to_vec(status)?).await?;

    let region = config.region.clone();
    join_all(to_delete.into_iter().map(|instance_id| {
        let region = region.clone();
        async move {
            let outcome = tokio::time::timeout(DELETE_INSTANCE_TIMEOUT, engine.compute.delete_instance(&region, &instance_id)).await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(instance_id, error = %e, "delete_instance failed, retrying next reconcile"),
                Err(_) => tracing::warn!(instance_id, "delete_instance timed out, retrying next reconcile"),
            }
        }
    }))
    .await;

    Ok(PhaseOutcome::stay(ClusterPhase::Deleting, Duration::from_secs(18)).with_message("waiting for instances to terminate"))
}
