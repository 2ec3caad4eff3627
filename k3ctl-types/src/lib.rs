//! Wire types shared between the reconciler engine, the worker binary, and
//! (out of scope) the user-facing surface that writes `ClusterConfig` blobs.
//!
//! These are plain `serde` types rather than Kubernetes custom resources:
//! there is no API server here, just JSON blobs in an object store, so the
//! `kube`/`schemars` derives the wider example corpus reaches for do not
//! apply. See DESIGN.md for the full rationale.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_k3s_version() -> Option<String> {
    None
}

/// Cluster size/topology. `Dev` always means exactly one master; `Ha` always
/// means exactly three. This is immutable once a cluster exists (§3).
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMode {
    #[default]
    Dev,
    Ha,
}

impl ClusterMode {
    /// Number of control-plane (master) nodes this mode prescribes.
    pub fn masters_desired(self) -> u32 {
        match self {
            ClusterMode::Dev => 1,
            ClusterMode::Ha => 3,
        }
    }
}

/// An optional pool of plain K3s agents (§4.8.11). Workers never vote in the
/// control plane and never gate the `Configuring -> Running` transition.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default)]
pub struct WorkerPoolSpec {
    pub name: String,
    pub count: u32,
    pub instance_type: String,
}

/// User-authored desired state. The engine reads this; it never writes it.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ClusterConfig {
    /// Immutable identifier. Also the object-store key prefix and the
    /// `ClusterName` tag value on every cloud resource this cluster owns.
    pub name: String,

    /// Immutable. See `ClusterMode::masters_desired`.
    pub mode: ClusterMode,

    /// Bumped by the user surface on every config write; the engine only
    /// ever compares it to `status.observed_generation` (§3.1).
    #[serde(default)]
    pub generation: u64,

    pub region: String,
    pub instance_type: String,

    #[serde(default)]
    pub image_id: Option<String>,

    #[serde(default = "default_k3s_version")]
    pub k3s_version: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub worker_pools: Vec<WorkerPoolSpec>,

    /// Set by the user surface to request deletion; the engine never clears
    /// it itself (it removes the whole config object on terminal deletion).
    #[serde(default)]
    pub deletion_timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

impl ClusterConfig {
    /// Total masters this config prescribes, independent of worker pools.
    pub fn masters_desired(&self) -> u32 {
        self.mode.masters_desired()
    }

    pub fn deletion_requested(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ClusterPhase {
    #[default]
    Pending,
    Provisioning,
    Installing,
    Configuring,
    Running,
    Failed,
    Deleting,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClusterPhase::Pending => "Pending",
            ClusterPhase::Provisioning => "Provisioning",
            ClusterPhase::Installing => "Installing",
            ClusterPhase::Configuring => "Configuring",
            ClusterPhase::Running => "Running",
            ClusterPhase::Failed => "Failed",
            ClusterPhase::Deleting => "Deleting",
        };
        write!(f, "{s}")
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstanceRole {
    #[default]
    Master,
    Worker,
}

/// Mirrors the cloud provider's instance lifecycle states (§3). `Initiating`
/// is the one state with no cloud-side counterpart: it exists only on a
/// placeholder that has not yet been materialized.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    #[default]
    Initiating,
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminating,
    Terminated,
}

impl InstanceState {
    /// States the Provisioning and Deleting phases must still see to
    /// consider a VM "present" (§4.8.3 step 1, §4.8.9 step 1).
    pub fn is_present(self) -> bool {
        matches!(
            self,
            InstanceState::Pending | InstanceState::Running | InstanceState::Stopping
                | InstanceState::Stopped
        )
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default)]
pub struct InstanceRecord {
    /// Deterministic: `{cluster}-master-{index}`, `{cluster}-worker-{pool}-{index}`.
    pub name: String,

    /// Empty until the cloud returns one. `instance_id == ""` implies
    /// `state == Initiating` and no cloud resource is believed to exist (I3).
    #[serde(default)]
    pub instance_id: String,

    pub state: InstanceState,
    pub role: InstanceRole,

    #[serde(default)]
    pub private_ip: Option<String>,
    #[serde(default)]
    pub public_ip: Option<String>,

    #[serde(default)]
    pub launch_time: Option<chrono::DateTime<chrono::Utc>>,

    #[serde(default)]
    pub k3s_installed: bool,
    #[serde(default)]
    pub k3s_running: bool,
    #[serde(default)]
    pub k3s_config_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub k3s_config_error: Option<String>,
}

impl InstanceRecord {
    pub fn placeholder(name: impl Into<String>, role: InstanceRole) -> Self {
        InstanceRecord {
            name: name.into(),
            instance_id: String::new(),
            state: InstanceState::Initiating,
            role,
            ..Default::default()
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.instance_id.is_empty()
    }

    pub fn is_master(&self) -> bool {
        self.role == InstanceRole::Master
    }
}

/// Engine-authored actual state. Written only by the current lease holder.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct ClusterStatus {
    pub phase: ClusterPhase,

    #[serde(default)]
    pub message: Option<String>,

    /// Last `ClusterConfig::generation` this reconcile observed and acted on.
    #[serde(default)]
    pub observed_generation: u64,

    #[serde(default)]
    pub last_reconcile_time: Option<chrono::DateTime<chrono::Utc>>,

    #[serde(default)]
    pub instances: Vec<InstanceRecord>,

    #[serde(default)]
    pub k3s_server_url: Option<String>,

    /// Opaque; never the token value itself (that lives at a separate,
    /// more-sensitive object-store key, see `ClusterStore`).
    #[serde(default)]
    pub kube_config: Option<String>,

    #[serde(default)]
    pub deletion_timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

impl ClusterStatus {
    pub fn masters(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.instances.iter().filter(|i| i.is_master())
    }

    pub fn masters_mut(&mut self) -> impl Iterator<Item = &mut InstanceRecord> {
        self.instances.iter_mut().filter(|i| i.is_master())
    }

    pub fn workers(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.instances.iter().filter(|i| !i.is_master())
    }

    pub fn find(&self, name: &str) -> Option<&InstanceRecord> {
        self.instances.iter().find(|i| i.name == name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut InstanceRecord> {
        self.instances.iter_mut().find(|i| i.name == name)
    }
}

/// A distributed, expiring, token-authenticated right to mutate one
/// cluster's status (§4.1).
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Lease {
    pub resource_id: String,
    pub owner: String,
    pub token: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,

    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub step: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

impl Lease {
    pub fn resource_id_for(cluster_name: &str) -> String {
        format!("cluster-{cluster_name}")
    }
}

/// Tag keys stamped onto every cloud resource the engine creates (§6).
pub mod tags {
    pub const CLUSTER_NAME: &str = "ClusterName";
    pub const MANAGED_BY: &str = "ManagedBy";
    pub const NAME: &str = "Name";
}

/// Object-store key layout (§4.2, §6) — bit-exact, shared by every producer
/// and consumer so no component hand-rolls a format string.
pub mod keys {
    pub fn config(cluster: &str) -> String {
        format!("clusters/{cluster}/config.json")
    }

    pub fn status(cluster: &str) -> String {
        format!("clusters/{cluster}/status.json")
    }

    pub fn server_token(cluster: &str) -> String {
        format!("clusters/{cluster}/k3s-server-token")
    }

    pub fn kubeconfig(cluster: &str) -> String {
        format!("clusters/{cluster}/kubeconfig")
    }

    /// Common prefix under which every key for a cluster lives.
    pub fn prefix(cluster: &str) -> String {
        format!("clusters/{cluster}/")
    }
}

/// Deterministic resource-naming conventions (§6).
pub mod names {
    pub fn master(cluster: &str, index: u32) -> String {
        format!("{cluster}-master-{index}")
    }

    pub fn worker(cluster: &str, pool: &str, index: u32) -> String {
        format!("{cluster}-worker-{pool}-{index}")
    }

    pub fn security_group(prefix: &str, cluster: &str) -> String {
        format!("{prefix}-{cluster}-sg")
    }
}

/// A single target's result from a Command Channel `run` call (§4.3).
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct TargetResult {
    pub instance_id: String,
    pub output: String,
    pub error: String,
    pub exit_code: Option<i32>,
    pub status: CommandStatus,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CommandStatus {
    #[default]
    Success,
    Failed,
    Timeout,
    Unreachable,
    Permission,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct CommandResult {
    pub aggregate_status: CommandStatus,
    pub per_target: BTreeMap<String, TargetResult>,
}

impl CommandResult {
    pub fn all_succeeded(&self) -> bool {
        self.per_target
            .values()
            .all(|t| t.status == CommandStatus::Success)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&String, &TargetResult)> {
        self.per_target
            .iter()
            .filter(|(_, t)| t.status != CommandStatus::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masters_desired_matches_mode() {
        assert_eq!(ClusterMode::Dev.masters_desired(), 1);
        assert_eq!(ClusterMode::Ha.masters_desired(), 3);
    }

    #[test]
    fn placeholder_has_empty_instance_id() {
        let p = InstanceRecord::placeholder("c1-master-0", InstanceRole::Master);
        assert!(p.is_placeholder());
        assert_eq!(p.state, InstanceState::Initiating);
    }

    #[test]
    fn key_layout_is_stable() {
        assert_eq!(keys::config("c1"), "clusters/c1/config.json");
        assert_eq!(keys::status("c1"), "clusters/c1/status.json");
        assert_eq!(keys::server_token("c1"), "clusters/c1/k3s-server-token");
        assert_eq!(keys::kubeconfig("c1"), "clusters/c1/kubeconfig");
    }

    #[test]
    fn deterministic_names() {
        assert_eq!(names::master("c1", 0), "c1-master-0");
        assert_eq!(names::worker("c1", "default", 2), "c1-worker-default-2");
    }
}
