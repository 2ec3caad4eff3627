use k3ctl_engine::demux::{self, Trigger};
use k3ctl_engine::lease_guard::GuardOutcome;

use crate::wiring::Context;

/// Runs every trigger in a batch through lease-guarded reconcile, in order.
/// A trigger that resolves to no cluster name, or whose lease is contended,
/// is a no-op, not a failure — the next requeue (or the event that loses the
/// lease race) picks the cluster back up (§4.5, §4.7).
pub async fn run_batch(ctx: &Context, triggers: Vec<Trigger>) -> anyhow::Result<()> {
    for trigger in triggers {
        run_one(ctx, trigger).await?;
    }
    Ok(())
}

pub async fn run_one(ctx: &Context, trigger: Trigger) -> anyhow::Result<()> {
    let Some(cluster_name) = demux::extract_cluster_name(&trigger) else {
        tracing::debug!(?trigger, "trigger resolved to no cluster, skipping");
        return Ok(());
    };

    let attempt = match &trigger {
        Trigger::Requeue { attempt, .. } => *attempt,
        _ => 0,
    };

    k3ctl_common::metrics::reconcile::loop_started(&cluster_name);
    let started = std::time::Instant::now();

    let engine = ctx.engine.clone();
    let cluster_for_work = cluster_name.clone();
    let outcome = ctx
        .lease
        .run(&cluster_name, ctx.lease_ttl, ctx.reconcile_deadline, move |_cancel| {
            let engine = engine.clone();
            let cluster_name = cluster_for_work.clone();
            async move { engine.reconcile(&cluster_name).await }
        })
        .await?;

    let phase = match outcome {
        GuardOutcome::Ran(reconcile_outcome) => {
            k3ctl_common::metrics::reconcile::loop_duration(
                &cluster_name,
                &reconcile_outcome.phase.to_string(),
                started.elapsed().as_secs_f64(),
            );
            k3ctl_common::metrics::reconcile::phase_gauge(&cluster_name, &reconcile_outcome.phase.to_string());

            if !reconcile_outcome.deleted {
                if let Some(after) = reconcile_outcome.requeue_after {
                    ctx.requeue.schedule(&cluster_name, after, attempt + 1).await?;
                    k3ctl_common::metrics::reconcile::requeue_scheduled(&cluster_name, after.as_secs());
                }
            }
            Some(reconcile_outcome.phase)
        }
        GuardOutcome::Conflict => {
            k3ctl_common::metrics::reconcile::lease_contended(&cluster_name);
            let delay = k3ctl_engine::lease_guard::conflict_requeue_delay();
            ctx.requeue.schedule(&cluster_name, delay, attempt + 1).await?;
            None
        }
    };

    tracing::info!(cluster = %cluster_name, ?phase, "reconcile tick complete");
    Ok(())
}
