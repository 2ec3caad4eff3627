use std::time::Duration;

use k3ctl_common::error::{Error, Result};
use k3ctl_types::{ClusterConfig, ClusterPhase, ClusterStatus, InstanceRecord, InstanceRole, InstanceState, keys};

use crate::compute::InstanceSpec;
use crate::planner;
use crate::reconcile::{Engine, PhaseOutcome};

/// Desired-vs-actual convergence (§4.8.3). Every step below is numbered to
/// match the algorithm it implements.
pub async fn run(engine: &Engine, config: &ClusterConfig, status: &mut ClusterStatus) -> Result<PhaseOutcome> {
    // 1. list cloud truth, region-scoped.
    let actual = engine.compute.list_instances(&config.region, &config.name).await?;

    // 2. reconcile cloud fields into status.instances by name.
    for cloud in &actual {
        if let Some(record) = status.find_mut(&cloud.name) {
            record.instance_id = cloud.instance_id.clone();
            record.state = cloud.state;
            record.private_ip = cloud.private_ip.clone();
            record.public_ip = cloud.public_ip.clone();
            record.launch_time = cloud.launch_time;
        } else {
            // Cloud has a VM with no corresponding record (e.g. a create that
            // succeeded right before a crash, before step 7's persist ran).
            // Cloud truth always wins; adopt it rather than re-creating.
            let role = if cloud.name.contains("-worker-") { InstanceRole::Worker } else { InstanceRole::Master };
            status.instances.push(InstanceRecord {
                name: cloud.name.clone(),
                instance_id: cloud.instance_id.clone(),
                state: cloud.state,
                role,
                private_ip: cloud.private_ip.clone(),
                public_ip: cloud.public_ip.clone(),
                launch_time: cloud.launch_time,
                ..Default::default()
            });
        }
    }

    // 3. desired topology: masters from mode, workers from optional pools (§4.8.11).
    let master_names = planner::desired_master_names(config);
    let worker_entries: Vec<(String, String)> = config
        .worker_pools
        .iter()
        .flat_map(|pool| {
            let pool_name = pool.name.clone();
            let instance_type = pool.instance_type.clone();
            let cluster = config.name.clone();
            (0..pool.count).map(move |i| (k3ctl_types::names::worker(&cluster, &pool_name, i), instance_type.clone()))
        })
        .collect();

    // 4. append placeholders for anything desired but not yet present.
    let mut to_create: Vec<(String, InstanceRole, String)> = Vec::new();
    for name in &master_names {
        if status.find(name).is_none() {
            status.instances.push(InstanceRecord::placeholder(name.clone(), InstanceRole::Master));
        }
        if status.find(name).is_some_and(|r| r.is_placeholder()) {
            to_create.push((name.clone(), InstanceRole::Master, config.instance_type.clone()));
        }
    }
    for (name, instance_type) in &worker_entries {
        if status.find(name).is_none() {
            status.instances.push(InstanceRecord::placeholder(name.clone(), InstanceRole::Worker));
        }
        if status.find(name).is_some_and(|r| r.is_placeholder()) {
            to_create.push((name.clone(), InstanceRole::Worker, instance_type.clone()));
        }
    }

    // 5. persist placeholders before any cloud create — crash after this point
    // must never duplicate a create, only resume it.
    engine.store.put(&keys::status(&config.name), serde_json::to_vec(status)?).await?;

    if !to_create.is_empty() {
        let network = engine
            .compute
            .ensure_network(&config.region, &config.name, &engine.sg_prefix)
            .await?;
        let image_id = engine
            .image_id_for(config)
            .ok_or_else(|| Error::UserInput(format!("cluster {} has no image id and no default is configured", config.name)))?;

        // 6. create each marked placeholder; a failure here leaves the
        // placeholder in place for the next reconcile to retry.
        for (name, _role, instance_type) in &to_create {
            let spec = InstanceSpec {
                name: name.clone(),
                region: config.region.clone(),
                instance_type: instance_type.clone(),
                image_id: image_id.clone(),
                cluster_name: config.name.clone(),
                security_group_id: network.security_group_id.clone(),
                subnet_id: network.subnet_id.clone(),
                key_name: engine.key_name.clone(),
            };
            match engine.compute.create_instance(&spec).await {
                Ok(cloud) => {
                    if let Some(record) = status.find_mut(name) {
                        record.instance_id = cloud.instance_id;
                        record.state = cloud.state;
                        record.private_ip = cloud.private_ip;
                        record.public_ip = cloud.public_ip;
                        record.launch_time = cloud.launch_time;
                    }
                }
                Err(e) => {
                    tracing::warn!(cluster = %config.name, instance = %name, error = %e, "create_instance failed, retrying next reconcile");
                }
            }
        }

        // 7. persist again with whichever ids were actually assigned.
        engine.store.put(&keys::status(&config.name), serde_json::to_vec(status)?).await?;
    }

    let all_ready = master_names
        .iter()
        .chain(worker_entries.iter().map(|(n, _)| n))
        .all(|name| status.find(name).map(|r| r.state == InstanceState::Running).unwrap_or(false));

    // 8/9. requeue while anything is still materializing, advance once everything is up.
    if all_ready {
        Ok(PhaseOutcome::to(ClusterPhase::Installing, Duration::from_secs(2)))
    } else {
        Ok(PhaseOutcome::stay(ClusterPhase::Provisioning, Duration::from_secs(12))
            .with_message("waiting for instances to reach running"))
    }
}
