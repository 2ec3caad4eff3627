use std::time::Duration;

use chrono::Utc;

use k3ctl_common::error::Result;
use k3ctl_types::{ClusterConfig, ClusterPhase, ClusterStatus, CommandStatus, InstanceState, keys};

use crate::reconcile::{Engine, PhaseOutcome};
use crate::{planner, scripts};

/// Periodic health check (§4.8.7), plus worker-pool joining (§4.8.11) which
/// rides along on every tick but never gates or reverts the phase.
pub async fn run(engine: &Engine, config: &ClusterConfig, status: &mut ClusterStatus) -> Result<PhaseOutcome> {
    join_pending_workers(engine, config, status).await?;

    if planner::running_needs_reprovision(config, status) {
        return Ok(PhaseOutcome::to(ClusterPhase::Provisioning, Duration::from_secs(2))
            .with_message("generation or topology drift detected, reconverging"));
    }

    Ok(PhaseOutcome::to(ClusterPhase::Running, Duration::from_secs(50)).with_message("healthy"))
}

/// Agent join for optional worker pools (§4.8.11). Additive only: a worker
/// that never joins is retried indefinitely here and never affects the
/// `Running` phase's own transitions.
async fn join_pending_workers(engine: &Engine, config: &ClusterConfig, status: &mut ClusterStatus) -> Result<()> {
    let pending_ids: Vec<String> = status
        .instances
        .iter()
        .filter(|i| !i.is_master() && i.state == InstanceState::Running && i.k3s_installed && !i.k3s_running)
        .map(|i| i.instance_id.clone())
        .collect();
    if pending_ids.is_empty() {
        return Ok(());
    }

    // Prefer the seed, but any running master with a private IP will do —
    // workers are plain agents, not control-plane voters.
    let Some(master) = status
        .masters()
        .filter(|m| m.state == InstanceState::Running && m.k3s_running && m.private_ip.is_some())
        .min_by(|a, b| a.name.cmp(&b.name))
        .cloned()
    else {
        return Ok(());
    };

    let Some(token_bytes) = engine.store.get(&keys::server_token(&config.name)).await? else {
        return Ok(());
    };
    let token = String::from_utf8_lossy(&token_bytes).trim().to_string();
    let private_ip = master.private_ip.expect("filtered for Some above");

    let script = scripts::worker_join_script(&private_ip, &token, config.k3s_version.as_deref());
    let result = engine.command.run(&config.region, &pending_ids, &script).await?;

    for (instance_id, target) in &result.per_target {
        let Some(record) = status.instances.iter_mut().find(|i| &i.instance_id == instance_id) else { continue };
        if target.status == CommandStatus::Success {
            record.k3s_running = true;
            record.k3s_config_time = Some(Utc::now());
            record.k3s_config_error = None;
        } else {
            record.k3s_config_error = Some(format!("worker join failed: exit={:?} err={}", target.exit_code, target.error));
        }
    }

    engine.store.put(&keys::status(&config.name), serde_json::to_vec(status)?).await?;
    Ok(())
}
