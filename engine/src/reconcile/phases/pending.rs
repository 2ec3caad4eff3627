use std::time::Duration;

use k3ctl_common::error::Result;
use k3ctl_types::{ClusterConfig, ClusterPhase, ClusterStatus};

use crate::reconcile::{Engine, PhaseOutcome};

/// Pure bookkeeping (§4.8.2): no cloud calls, just the initial transition.
pub async fn run(_engine: &Engine, _config: &ClusterConfig, _status: &mut ClusterStatus) -> Result<PhaseOutcome> {
    Ok(PhaseOutcome::to(ClusterPhase::Provisioning, Duration::from_secs(5))
        .with_message("Starting infrastructure provisioning"))
}
