//! Pure logic for the phase state machine's desired-vs-actual decisions.
//! Colocated with its tests, same shape as a reconciler's planner module:
//! no I/O, no clock reads beyond what's passed in, fully table-tested.

use k3ctl_types::{ClusterConfig, ClusterStatus, InstanceRecord, InstanceRole, InstanceState};

/// Deterministic master names for a cluster's prescribed mode.
pub fn desired_master_names(config: &ClusterConfig) -> Vec<String> {
    (0..config.masters_desired())
        .map(|i| k3ctl_types::names::master(&config.name, i))
        .collect()
}

/// Deterministic worker names across every configured pool (§4.8.11).
pub fn desired_worker_names(config: &ClusterConfig) -> Vec<String> {
    config
        .worker_pools
        .iter()
        .flat_map(|pool| {
            (0..pool.count).map(|i| k3ctl_types::names::worker(&config.name, &pool.name, i))
        })
        .collect()
}

/// Names present in `actual` but missing from `status.instances`, and vice
/// versa — mirrors the create/delete split a convergence loop needs.
pub fn topology_diff(desired: &[String], existing: &[String]) -> (Vec<String>, Vec<String>) {
    let desired_set: std::collections::HashSet<_> = desired.iter().cloned().collect();
    let existing_set: std::collections::HashSet<_> = existing.iter().cloned().collect();
    let mut create: Vec<String> = desired_set.difference(&existing_set).cloned().collect();
    let mut delete: Vec<String> = existing_set.difference(&desired_set).cloned().collect();
    create.sort();
    delete.sort();
    (create, delete)
}

/// The deterministically-chosen first master in HA mode (§9: lexicographic
/// sort on name, never creation time or random choice).
pub fn select_seed(masters: &[InstanceRecord]) -> Option<&InstanceRecord> {
    masters.iter().min_by(|a, b| a.name.cmp(&b.name))
}

pub fn all_present_and_running(records: &[InstanceRecord]) -> bool {
    !records.is_empty() && records.iter().all(|r| r.state == InstanceState::Running)
}

pub fn all_installed(records: &[InstanceRecord]) -> bool {
    records.iter().all(|r| r.k3s_installed)
}

pub fn masters_of(status: &ClusterStatus) -> Vec<&InstanceRecord> {
    status.instances.iter().filter(|i| i.role == InstanceRole::Master).collect()
}

pub fn uninstalled_instances(status: &ClusterStatus) -> Vec<&InstanceRecord> {
    status.instances.iter().filter(|i| !i.k3s_installed && i.state == InstanceState::Running).collect()
}

/// A single master's readiness implies the whole control plane is formed
/// once `node_count` matches the expected master count and every reported
/// node is `Ready` (§4.8.6 step 6).
pub fn cluster_formed(node_count: usize, ready_count: usize, masters_desired: usize) -> bool {
    node_count == masters_desired && ready_count == masters_desired
}

/// `Running -> Provisioning` drift detection (§4.8.7): either the user
/// surface bumped `generation`, or the actual master count/instance type no
/// longer matches what `config` prescribes.
pub fn running_needs_reprovision(config: &ClusterConfig, status: &ClusterStatus) -> bool {
    if config.generation != status.observed_generation {
        return true;
    }
    let masters = masters_of(status);
    masters.len() as u32 != config.masters_desired()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k3ctl_types::{ClusterMode, WorkerPoolSpec};
    use chrono::Utc;

    fn config(mode: ClusterMode) -> ClusterConfig {
        ClusterConfig {
            name: "c1".into(),
            mode,
            generation: 1,
            region: "us-east-1".into(),
            instance_type: "t3.small".into(),
            image_id: None,
            k3s_version: None,
            description: None,
            worker_pools: vec![],
            deletion_timestamp: None,
        }
    }

    fn instance(name: &str, role: InstanceRole, state: InstanceState) -> InstanceRecord {
        InstanceRecord { name: name.into(), role, state, ..Default::default() }
    }

    #[test]
    fn dev_mode_desires_one_master() {
        let names = desired_master_names(&config(ClusterMode::Dev));
        assert_eq!(names, vec!["c1-master-0".to_string()]);
    }

    #[test]
    fn ha_mode_desires_three_masters() {
        let names = desired_master_names(&config(ClusterMode::Ha));
        assert_eq!(names, vec!["c1-master-0", "c1-master-1", "c1-master-2"]);
    }

    #[test]
    fn worker_pools_expand_to_deterministic_names() {
        let mut c = config(ClusterMode::Ha);
        c.worker_pools = vec![WorkerPoolSpec { name: "default".into(), count: 2, instance_type: "t3.medium".into() }];
        let names = desired_worker_names(&c);
        assert_eq!(names, vec!["c1-worker-default-0", "c1-worker-default-1"]);
    }

    #[test]
    fn topology_diff_creates_missing_and_deletes_extra() {
        let desired = vec!["c1-master-0".to_string(), "c1-master-1".to_string()];
        let existing = vec!["c1-master-0".to_string(), "c1-master-9".to_string()];
        let (create, delete) = topology_diff(&desired, &existing);
        assert_eq!(create, vec!["c1-master-1".to_string()]);
        assert_eq!(delete, vec!["c1-master-9".to_string()]);
    }

    #[test]
    fn seed_election_is_lexicographic_not_insertion_order() {
        let masters = vec![
            instance("c1-master-2", InstanceRole::Master, InstanceState::Running),
            instance("c1-master-0", InstanceRole::Master, InstanceState::Running),
            instance("c1-master-1", InstanceRole::Master, InstanceState::Running),
        ];
        assert_eq!(select_seed(&masters).unwrap().name, "c1-master-0");
    }

    #[test]
    fn all_present_and_running_rejects_empty_and_partial() {
        assert!(!all_present_and_running(&[]));
        let partial = vec![
            instance("m0", InstanceRole::Master, InstanceState::Running),
            instance("m1", InstanceRole::Master, InstanceState::Pending),
        ];
        assert!(!all_present_and_running(&partial));
        let all_up = vec![
            instance("m0", InstanceRole::Master, InstanceState::Running),
            instance("m1", InstanceRole::Master, InstanceState::Running),
        ];
        assert!(all_present_and_running(&all_up));
    }

    #[test]
    fn cluster_formed_requires_every_node_ready() {
        assert!(cluster_formed(3, 3, 3));
        assert!(!cluster_formed(3, 2, 3));
        assert!(!cluster_formed(2, 2, 3));
    }

    #[test]
    fn generation_bump_triggers_reprovision() {
        let c = config(ClusterMode::Dev);
        let mut status = ClusterStatus { observed_generation: 1, ..Default::default() };
        status.instances.push(instance("c1-master-0", InstanceRole::Master, InstanceState::Running));
        assert!(!running_needs_reprovision(&c, &status));

        let mut bumped = c.clone();
        bumped.generation = 2;
        assert!(running_needs_reprovision(&bumped, &status));
    }

    #[test]
    fn master_count_drift_triggers_reprovision_even_without_generation_bump() {
        let c = config(ClusterMode::Ha);
        let mut status = ClusterStatus { observed_generation: 1, ..Default::default() };
        status.instances.push(instance("c1-master-0", InstanceRole::Master, InstanceState::Running));
        // only one master present, but ha mode desires three
        assert!(running_needs_reprovision(&c, &status));
        let _ = Utc::now();
    }
}
