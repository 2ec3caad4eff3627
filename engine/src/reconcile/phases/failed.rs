use k3ctl_common::error::Result;
use k3ctl_types::{ClusterConfig, ClusterPhase, ClusterStatus};

use crate::reconcile::{Engine, PhaseOutcome};

/// Terminal until deletion is requested (§4.8.8). `reconcile/mod.rs` already
/// forces a transition to `Deleting` before this phase runs if
/// `deletionTimestamp` is set, so reaching here means: stay put, no
/// requeue. The existing message (why the cluster failed) is preserved.
pub async fn run(_engine: &Engine, _config: &ClusterConfig, status: &mut ClusterStatus) -> Result<PhaseOutcome> {
    Ok(PhaseOutcome {
        next_phase: ClusterPhase::Failed,
        message: status.message.clone(),
        requeue_after: None,
        terminal_delete: false,
    })
}
