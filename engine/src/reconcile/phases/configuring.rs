use std::time::Duration;

use chrono::Utc;

use k3ctl_common::error::Result;
use k3ctl_types::{
    ClusterConfig, ClusterMode, ClusterPhase, ClusterStatus, CommandStatus, InstanceRecord, InstanceState, keys,
};

use crate::reconcile::{Engine, PhaseOutcome};
use crate::{planner, scripts};

/// §4.8.5/§4.8.6. Dispatches on `mode`; both branches converge on
/// `capture_kubeconfig` for the final `-> Running` step.
pub async fn run(engine: &Engine, config: &ClusterConfig, status: &mut ClusterStatus) -> Result<PhaseOutcome> {
    // Configuring -> Installing: a node that lost its k3s binary (e.g. a
    // reboot onto a fresh root volume) sends the cluster back a step.
    if status
        .instances
        .iter()
        .any(|i| i.state == InstanceState::Running && !i.k3s_installed)
    {
        return Ok(PhaseOutcome::to(ClusterPhase::Installing, Duration::from_secs(2))
            .with_message("a node lost its k3s binary, reinstalling"));
    }

    match config.mode {
        ClusterMode::Dev => run_dev(engine, config, status).await,
        ClusterMode::Ha => run_ha(engine, config, status).await,
    }
}

/// Single-master bring-up (§4.8.5).
async fn run_dev(engine: &Engine, config: &ClusterConfig, status: &mut ClusterStatus) -> Result<PhaseOutcome> {
    let master_name = planner::desired_master_names(config).into_iter().next().expect("dev mode always has one master");
    let Some(master) = status.find(&master_name).cloned() else {
        return Ok(PhaseOutcome::stay(ClusterPhase::Configuring, Duration::from_secs(10)).with_message("master record missing"));
    };

    if !master.k3s_running {
        let Some(private_ip) = master.private_ip.clone() else {
            return Ok(PhaseOutcome::stay(ClusterPhase::Configuring, Duration::from_secs(10)).with_message("waiting for master private IP"));
        };

        let script = scripts::dev_master_install_script(&private_ip, config.k3s_version.as_deref());
        let result = engine.command.run(&config.region, &[master.instance_id.clone()], &script).await?;
        let Some(target) = result.per_target.get(&master.instance_id) else {
            return Ok(PhaseOutcome::stay(ClusterPhase::Configuring, Duration::from_secs(10)).with_message("master install produced no result"));
        };

        if target.status != CommandStatus::Success {
            if let Some(record) = status.find_mut(&master_name) {
                record.k3s_config_error = Some(format!("server install failed: exit={:?} err={}", target.exit_code, target.error));
            }
            return Ok(PhaseOutcome::stay(ClusterPhase::Configuring, Duration::from_secs(15)).with_message("master server install failed, retrying"));
        }

        let token = read_token(engine, &config.region, &master.instance_id, &target.output).await;
        let Some(token) = token else {
            return Ok(PhaseOutcome::stay(ClusterPhase::Configuring, Duration::from_secs(10)).with_message("server started but token not yet readable"));
        };

        engine.store.put(&keys::server_token(&config.name), token.into_bytes()).await?;
        if let Some(record) = status.find_mut(&master_name) {
            record.k3s_running = true;
            record.k3s_config_time = Some(Utc::now());
            record.k3s_config_error = None;
        }
        return Ok(PhaseOutcome::stay(ClusterPhase::Configuring, Duration::from_secs(5)).with_message("server up, capturing kubeconfig"));
    }

    capture_kubeconfig(engine, config, status, &master).await
}

/// Three-master bring-up (§4.8.6): seed first, then joiners in parallel,
/// then a formation check before the final kubeconfig capture.
async fn run_ha(engine: &Engine, config: &ClusterConfig, status: &mut ClusterStatus) -> Result<PhaseOutcome> {
    let master_names = planner::desired_master_names(config);
    let masters: Vec<InstanceRecord> = master_names.iter().filter_map(|n| status.find(n).cloned()).collect();
    if masters.len() < master_names.len() {
        return Ok(PhaseOutcome::stay(ClusterPhase::Configuring, Duration::from_secs(10)).with_message("waiting for all master records"));
    }

    let seed = planner::select_seed(&masters).expect("masters is non-empty, checked above").clone();

    if !seed.k3s_running {
        return seed_bring_up(engine, config, status, &seed).await;
    }

    let joiners: Vec<InstanceRecord> = masters.into_iter().filter(|m| m.name != seed.name && !m.k3s_running).collect();
    if !joiners.is_empty() {
        return join_peers(engine, config, status, &seed, &joiners).await;
    }

    verify_formation_and_capture(engine, config, status, &seed, master_names.len()).await
}

async fn seed_bring_up(
    engine: &Engine,
    config: &ClusterConfig,
    status: &mut ClusterStatus,
    seed: &InstanceRecord,
) -> Result<PhaseOutcome> {
    let Some(private_ip) = seed.private_ip.clone() else {
        return Ok(PhaseOutcome::stay(ClusterPhase::Configuring, Duration::from_secs(10)).with_message("waiting for seed private IP"));
    };

    let script = scripts::ha_seed_script(&private_ip, config.k3s_version.as_deref());
    let result = engine.command.run(&config.region, &[seed.instance_id.clone()], &script).await?;
    let Some(target) = result.per_target.get(&seed.instance_id) else {
        return Ok(PhaseOutcome::stay(ClusterPhase::Configuring, Duration::from_secs(15)).with_message("seed bring-up produced no result"));
    };

    if target.status != CommandStatus::Success {
        if let Some(record) = status.find_mut(&seed.name) {
            record.k3s_config_error = Some(format!("seed bring-up failed: exit={:?} err={}", target.exit_code, target.error));
        }
        return Ok(PhaseOutcome::stay(ClusterPhase::Configuring, Duration::from_secs(20)).with_message("seed bring-up failed, retrying"));
    }

    let token = read_token(engine, &config.region, &seed.instance_id, &target.output).await;
    let Some(token) = token else {
        if let Some(record) = status.find_mut(&seed.name) {
            record.k3s_config_error = Some("seed came up but server token was never readable".to_string());
        }
        return Ok(PhaseOutcome::stay(ClusterPhase::Configuring, Duration::from_secs(15)).with_message("seed up, token not yet readable"));
    };

    engine.store.put(&keys::server_token(&config.name), token.into_bytes()).await?;
    if let Some(record) = status.find_mut(&seed.name) {
        record.k3s_running = true;
        record.k3s_config_time = Some(Utc::now());
        record.k3s_config_error = None;
    }
    // Let the seed stabilise before peers start joining (§4.8.6 step 3).
    Ok(PhaseOutcome::stay(ClusterPhase::Configuring, Duration::from_secs(60)).with_message("seed up, stabilising before joining peers"))
}

async fn join_peers(
    engine: &Engine,
    config: &ClusterConfig,
    status: &mut ClusterStatus,
    seed: &InstanceRecord,
    joiners: &[InstanceRecord],
) -> Result<PhaseOutcome> {
    let Some(token_bytes) = engine.store.get(&keys::server_token(&config.name)).await? else {
        return Ok(PhaseOutcome::stay(ClusterPhase::Configuring, Duration::from_secs(15)).with_message("waiting for server token"));
    };
    let Some(seed_ip) = seed.private_ip.clone() else {
        return Ok(PhaseOutcome::stay(ClusterPhase::Configuring, Duration::from_secs(15)).with_message("waiting for seed private IP"));
    };
    let token = String::from_utf8_lossy(&token_bytes).trim().to_string();

    let script = scripts::ha_joiner_script(&seed_ip, &token, config.k3s_version.as_deref());
    let ids: Vec<String> = joiners.iter().map(|m| m.instance_id.clone()).collect();
    // All joiners run in parallel — they depend only on the seed, never on
    // each other (§9 "parallel fan-out vs serial dependencies").
    let result = engine.command.run(&config.region, &ids, &script).await?;

    for (instance_id, target) in &result.per_target {
        let Some(record) = status.instances.iter_mut().find(|i| &i.instance_id == instance_id) else { continue };
        if target.status == CommandStatus::Success {
            record.k3s_running = true;
            record.k3s_config_time = Some(Utc::now());
            record.k3s_config_error = None;
        } else {
            record.k3s_config_error = Some(format!("join failed: exit={:?} err={}", target.exit_code, target.error));
        }
    }

    engine.store.put(&keys::status(&config.name), serde_json::to_vec(status)?).await?;
    Ok(PhaseOutcome::stay(ClusterPhase::Configuring, Duration::from_secs(30)).with_message("joining peers"))
}

async fn verify_formation_and_capture(
    engine: &Engine,
    config: &ClusterConfig,
    status: &mut ClusterStatus,
    seed: &InstanceRecord,
    masters_desired: usize,
) -> Result<PhaseOutcome> {
    let result = engine
        .command
        .run(&config.region, &[seed.instance_id.clone()], scripts::cluster_formation_check_script())
        .await?;
    let Some(target) = result.per_target.get(&seed.instance_id) else {
        return Ok(PhaseOutcome::stay(ClusterPhase::Configuring, Duration::from_secs(20)).with_message("formation check produced no result"));
    };
    if target.status != CommandStatus::Success {
        return Ok(PhaseOutcome::stay(ClusterPhase::Configuring, Duration::from_secs(20)).with_message("formation check failed, retrying"));
    }
    let Some((total, ready)) = scripts::parse_formation_output(&target.output) else {
        return Ok(PhaseOutcome::stay(ClusterPhase::Configuring, Duration::from_secs(20)).with_message("could not parse formation check output"));
    };

    if !planner::cluster_formed(total, ready, masters_desired) {
        return Ok(PhaseOutcome::stay(ClusterPhase::Configuring, Duration::from_secs(20))
            .with_message(format!("waiting for cluster formation ({ready}/{total} ready, {masters_desired} expected)")));
    }

    capture_kubeconfig(engine, config, status, seed).await
}

/// Shared final step for both modes (§4.8.5 step 2): read the already-up
/// master's kubeconfig, rewrite the loopback server URL to the public IP,
/// persist it, and transition to `Running`.
async fn capture_kubeconfig(
    engine: &Engine,
    config: &ClusterConfig,
    status: &mut ClusterStatus,
    master: &InstanceRecord,
) -> Result<PhaseOutcome> {
    let Some(public_ip) = master.public_ip.clone() else {
        return Ok(PhaseOutcome::stay(ClusterPhase::Configuring, Duration::from_secs(10)).with_message("waiting for master public IP"));
    };

    let result = engine
        .command
        .run(&config.region, &[master.instance_id.clone()], scripts::read_kubeconfig_script())
        .await?;
    let Some(target) = result.per_target.get(&master.instance_id) else {
        return Ok(PhaseOutcome::stay(ClusterPhase::Configuring, Duration::from_secs(10)).with_message("kubeconfig read produced no result"));
    };
    if target.status != CommandStatus::Success {
        return Ok(PhaseOutcome::stay(ClusterPhase::Configuring, Duration::from_secs(10)).with_message("kubeconfig not yet readable"));
    }

    let rewritten = scripts::rewrite_kubeconfig_server(&target.output, &public_ip);
    engine.store.put(&keys::kubeconfig(&config.name), rewritten.clone().into_bytes()).await?;
    status.kube_config = Some(rewritten);
    status.k3s_server_url = Some(format!("https://{public_ip}:6443"));

    Ok(PhaseOutcome::to(ClusterPhase::Running, Duration::from_secs(45)).with_message("cluster running"))
}

/// Three-tier token extraction (§9): the caller's own script output first,
/// then a dedicated follow-up read if markers/regex found nothing there.
async fn read_token(engine: &Engine, region: &str, instance_id: &str, script_output: &str) -> Option<String> {
    if let Some(token) = scripts::parse_token(script_output) {
        return Some(token);
    }

    let result = engine
        .command
        .run(region, &[instance_id.to_string()], scripts::read_seed_token_script())
        .await
        .ok()?;
    let target = result.per_target.get(instance_id)?;
    scripts::parse_token(&target.output).filter(|t| scripts::is_valid_token(t))
}
