use std::time::Duration;

use k3ctl_common::error::Result;
use k3ctl_types::{ClusterConfig, ClusterPhase, ClusterStatus, CommandStatus, keys};

use crate::reconcile::{Engine, PhaseOutcome};
use crate::scripts;

/// K3s binary install, fanned out across every not-yet-installed running
/// instance in one Command Channel call (§4.8.4). The script itself is the
/// idempotent part; this phase only records the outcome per target.
pub async fn run(engine: &Engine, config: &ClusterConfig, status: &mut ClusterStatus) -> Result<PhaseOutcome> {
    let pending_ids: Vec<String> = status
        .instances
        .iter()
        .filter(|i| i.state == k3ctl_types::InstanceState::Running && !i.k3s_installed)
        .map(|i| i.instance_id.clone())
        .collect();

    if pending_ids.is_empty() {
        return Ok(PhaseOutcome::to(ClusterPhase::Configuring, Duration::from_secs(2)));
    }

    let script = scripts::base_install_script(config.k3s_version.as_deref());
    let result = engine.command.run(&config.region, &pending_ids, &script).await?;

    for (instance_id, target) in &result.per_target {
        let Some(record) = status.instances.iter_mut().find(|i| &i.instance_id == instance_id) else { continue };
        if target.status == CommandStatus::Success {
            record.k3s_installed = true;
            record.k3s_config_error = None;
        } else {
            record.k3s_config_error = Some(format!("install failed: exit={:?} err={}", target.exit_code, target.error));
        }
    }

    // Persisted here too (not just by the caller at tick end) so a crash
    // right after this call doesn't force a re-install of targets that
    // already succeeded.
    engine.store.put(&keys::status(&config.name), serde_json::to_vec(status)?).await?;

    if status.instances.iter().all(|i| i.k3s_installed) {
        Ok(PhaseOutcome::to(ClusterPhase::Configuring, Duration::from_secs(2)))
    } else {
        Ok(PhaseOutcome::stay(ClusterPhase::Installing, Duration::from_secs(15)).with_message("installing k3s binary"))
    }
}
