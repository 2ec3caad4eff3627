use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_ec2::Client as Ec2Client;
use aws_sdk_ec2::config::Region;
use aws_sdk_ec2::types::{
    Filter, IpPermission, IpRange, ResourceType, Tag, TagSpecification,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use k3ctl_common::error::{Error, Result};
use k3ctl_common::retry::with_retry;
use k3ctl_types::{InstanceState, tags};

#[derive(Clone, Debug)]
pub struct InstanceSpec {
    pub name: String,
    pub region: String,
    pub instance_type: String,
    pub image_id: String,
    pub cluster_name: String,
    pub security_group_id: String,
    pub subnet_id: String,
    pub key_name: Option<String>,
}

#[derive(Clone, Debug)]
pub struct CloudInstance {
    pub name: String,
    pub instance_id: String,
    pub state: InstanceState,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    pub launch_time: Option<DateTime<Utc>>,
}

/// Identifiers for the per-region network scaffolding a cluster's instances
/// launch into (§4.4: default VPC/subnet, per-cluster security group).
#[derive(Clone, Debug)]
pub struct NetworkContext {
    pub subnet_id: String,
    pub security_group_id: String,
}

/// Region-aware VM/network/security-group operations (§4.4). Implementors
/// must cache one client per region; a single default client silently
/// targets the wrong region once clusters span more than one (§9).
#[async_trait]
pub trait ComputeDriver: Send + Sync {
    async fn ensure_network(&self, region: &str, cluster_name: &str, sg_prefix: &str) -> Result<NetworkContext>;
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<CloudInstance>;
    async fn delete_instance(&self, region: &str, instance_id: &str) -> Result<()>;
    async fn list_instances(&self, region: &str, cluster_name: &str) -> Result<Vec<CloudInstance>>;
    async fn cleanup_cluster(&self, region: &str, cluster_name: &str, sg_prefix: &str) -> Result<()>;

    /// Looks up a single instance's `ClusterName` tag, region-scoped (§4.5:
    /// the Event Demux resolves a VM state-change trigger this way before
    /// constructing a `Trigger::VmStateChange`). `Ok(None)` covers both "no
    /// such instance" and "instance untagged" — either way there's no
    /// cluster to reconcile.
    async fn cluster_name_for(&self, region: &str, instance_id: &str) -> Result<Option<String>>;
}

pub struct Ec2Compute {
    clients: DashMap<String, Ec2Client>,
    system_id: String,
}

impl Ec2Compute {
    pub fn new(system_id: impl Into<String>) -> Self {
        Self {
            clients: DashMap::new(),
            system_id: system_id.into(),
        }
    }

    async fn client_for(&self, region: &str) -> Ec2Client {
        if let Some(client) = self.clients.get(region) {
            return client.clone();
        }
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        let client = Ec2Client::new(&config);
        self.clients.insert(region.to_string(), client.clone());
        client
    }

    fn is_retryable(err: &Error) -> bool {
        match err {
            Error::Compute { source } => {
                let msg = source.to_string();
                msg.contains("Throttling") || msg.contains("RequestLimitExceeded") || msg.contains("InternalError")
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ComputeDriver for Ec2Compute {
    async fn ensure_network(&self, region: &str, cluster_name: &str, sg_prefix: &str) -> Result<NetworkContext> {
        let client = self.client_for(region).await;

        let vpcs = with_retry(Duration::from_millis(250), Self::is_retryable, || async {
            client
                .describe_vpcs()
                .filters(Filter::builder().name("is-default").values("true").build())
                .send()
                .await
                .map_err(aws_sdk_ec2::Error::from)
                .map_err(Error::from)
        })
        .await?;

        let vpc_id = vpcs
            .vpcs
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|v| v.vpc_id)
            .ok_or_else(|| Error::UserInput(format!("no default VPC in region {region}")))?;

        let subnets = with_retry(Duration::from_millis(250), Self::is_retryable, || async {
            client
                .describe_subnets()
                .filters(Filter::builder().name("vpc-id").values(&vpc_id).build())
                .send()
                .await
                .map_err(aws_sdk_ec2::Error::from)
                .map_err(Error::from)
        })
        .await?;

        let subnet_id = subnets
            .subnets
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|s| s.subnet_id)
            .ok_or_else(|| Error::UserInput(format!("no subnet in default VPC in region {region}")))?;

        let sg_name = k3ctl_types::names::security_group(sg_prefix, cluster_name);

        let existing = client
            .describe_security_groups()
            .filters(Filter::builder().name("group-name").values(&sg_name).build())
            .filters(Filter::builder().name("vpc-id").values(&vpc_id).build())
            .send()
            .await
            .map_err(aws_sdk_ec2::Error::from)?;

        let security_group_id = if let Some(group) = existing.security_groups.unwrap_or_default().into_iter().next() {
            group.group_id.unwrap_or_default()
        } else {
            let created = client
                .create_security_group()
                .group_name(&sg_name)
                .description(format!("k3ctl cluster {cluster_name}"))
                .vpc_id(&vpc_id)
                .tag_specifications(
                    TagSpecification::builder()
                        .resource_type(ResourceType::SecurityGroup)
                        .tags(Tag::builder().key(tags::CLUSTER_NAME).value(cluster_name).build())
                        .tags(Tag::builder().key(tags::MANAGED_BY).value(&self.system_id).build())
                        .tags(Tag::builder().key(tags::NAME).value(&sg_name).build())
                        .build(),
                )
                .send()
                .await
                .map_err(aws_sdk_ec2::Error::from)?;
            let group_id = created.group_id.unwrap_or_default();

            // Intra-cluster K3s traffic only: API 6443, kubelet 10250, VXLAN UDP 8472.
            // No inbound public SSH.
            for (proto, port) in [("tcp", 6443), ("tcp", 10250), ("udp", 8472)] {
                client
                    .authorize_security_group_ingress()
                    .group_id(&group_id)
                    .ip_permissions(
                        IpPermission::builder()
                            .ip_protocol(proto)
                            .from_port(port)
                            .to_port(port)
                            .user_id_group_pairs(
                                aws_sdk_ec2::types::UserIdGroupPair::builder()
                                    .group_id(&group_id)
                                    .build(),
                            )
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(aws_sdk_ec2::Error::from)?;
            }
            group_id
        };

        Ok(NetworkContext { subnet_id, security_group_id })
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<CloudInstance> {
        let client = self.client_for(&spec.region).await;

        let mut run_instances = client
            .run_instances()
            .image_id(&spec.image_id)
            .instance_type(spec.instance_type.clone().into())
            .min_count(1)
            .max_count(1)
            .subnet_id(&spec.subnet_id)
            .security_group_ids(&spec.security_group_id)
            .tag_specifications(
                TagSpecification::builder()
                    .resource_type(ResourceType::Instance)
                    .tags(Tag::builder().key(tags::NAME).value(&spec.name).build())
                    .tags(Tag::builder().key(tags::CLUSTER_NAME).value(&spec.cluster_name).build())
                    .tags(Tag::builder().key(tags::MANAGED_BY).value(&self.system_id).build())
                    .build(),
            );
        if let Some(key_name) = &spec.key_name {
            run_instances = run_instances.key_name(key_name);
        }

        let response = with_retry(Duration::from_millis(250), Self::is_retryable, || {
            let request = run_instances.clone();
            async move { request.send().await.map_err(aws_sdk_ec2::Error::from).map_err(Error::from) }
        })
        .await?;

        let instance = response
            .instances
            .unwrap_or_default()
            .into_iter()
            .next()
            .ok_or_else(|| Error::UserInput("EC2 accepted run_instances but returned no instance".into()))?;

        Ok(CloudInstance {
            name: spec.name.clone(),
            instance_id: instance.instance_id.unwrap_or_default(),
            state: map_state(instance.state.and_then(|s| s.name).map(|n| n.as_str().to_string())),
            private_ip: instance.private_ip_address,
            public_ip: instance.public_ip_address,
            launch_time: instance.launch_time.and_then(|t| DateTime::from_timestamp(t.secs(), 0)),
        })
    }

    async fn delete_instance(&self, region: &str, instance_id: &str) -> Result<()> {
        let client = self.client_for(region).await;

        // Tolerate already-terminating instances; disable termination protection first.
        let _ = client
            .modify_instance_attribute()
            .instance_id(instance_id)
            .disable_api_termination(aws_sdk_ec2::types::AttributeBooleanValue::builder().value(false).build())
            .send()
            .await;

        let result = client.terminate_instances().instance_ids(instance_id).send().await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                if matches!(e.as_service_error(), Some(err) if err.to_string().contains("InvalidInstanceID.NotFound")) {
                    Ok(())
                } else {
                    Err(Error::from(aws_sdk_ec2::Error::from(e)))
                }
            }
        }
    }

    async fn list_instances(&self, region: &str, cluster_name: &str) -> Result<Vec<CloudInstance>> {
        let client = self.client_for(region).await;

        let response = with_retry(Duration::from_millis(250), Self::is_retryable, || async {
            client
                .describe_instances()
                .filters(Filter::builder().name(format!("tag:{}", tags::CLUSTER_NAME)).values(cluster_name).build())
                .filters(
                    Filter::builder()
                        .name("instance-state-name")
                        .values("pending")
                        .values("running")
                        .values("stopping")
                        .values("stopped")
                        .build(),
                )
                .send()
                .await
                .map_err(aws_sdk_ec2::Error::from)
                .map_err(Error::from)
        })
        .await?;

        let mut out = Vec::new();
        for reservation in response.reservations.unwrap_or_default() {
            for instance in reservation.instances.unwrap_or_default() {
                let name = instance
                    .tags
                    .unwrap_or_default()
                    .into_iter()
                    .find(|t| t.key.as_deref() == Some(tags::NAME))
                    .and_then(|t| t.value)
                    .unwrap_or_default();
                out.push(CloudInstance {
                    name,
                    instance_id: instance.instance_id.unwrap_or_default(),
                    state: map_state(instance.state.and_then(|s| s.name).map(|n| n.as_str().to_string())),
                    private_ip: instance.private_ip_address,
                    public_ip: instance.public_ip_address,
                    launch_time: instance.launch_time.and_then(|t| DateTime::from_timestamp(t.secs(), 0)),
                });
            }
        }
        Ok(out)
    }

    async fn cluster_name_for(&self, region: &str, instance_id: &str) -> Result<Option<String>> {
        let client = self.client_for(region).await;

        let response = client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                if matches!(e.as_service_error(), Some(err) if err.to_string().contains("InvalidInstanceID.NotFound")) {
                    return Ok(None);
                }
                return Err(Error::from(aws_sdk_ec2::Error::from(e)));
            }
        };

        let tag = response
            .reservations
            .unwrap_or_default()
            .into_iter()
            .flat_map(|r| r.instances.unwrap_or_default())
            .flat_map(|i| i.tags.unwrap_or_default())
            .find(|t| t.key.as_deref() == Some(tags::CLUSTER_NAME))
            .and_then(|t| t.value);

        Ok(tag)
    }

    async fn cleanup_cluster(&self, region: &str, cluster_name: &str, sg_prefix: &str) -> Result<()> {
        let client = self.client_for(region).await;
        let sg_name = k3ctl_types::names::security_group(sg_prefix, cluster_name);

        let existing = client
            .describe_security_groups()
            .filters(Filter::builder().name("group-name").values(&sg_name).build())
            .send()
            .await
            .map_err(aws_sdk_ec2::Error::from)?;

        for group in existing.security_groups.unwrap_or_default() {
            if let Some(group_id) = group.group_id {
                // Best-effort: a security group still referenced by a lingering
                // network interface fails to delete; the next cleanup retries.
                let _ = client.delete_security_group().group_id(group_id).send().await;
            }
        }
        Ok(())
    }
}

fn map_state(name: Option<String>) -> InstanceState {
    match name.as_deref() {
        Some("pending") => InstanceState::Pending,
        Some("running") => InstanceState::Running,
        Some("stopping") => InstanceState::Stopping,
        Some("stopped") => InstanceState::Stopped,
        Some("shutting-down") => InstanceState::ShuttingDown,
        Some("terminated") => InstanceState::Terminated,
        _ => InstanceState::Terminating,
    }
}

#[cfg(test)]
pub mod fakes {
    use super::*;
    use dashmap::DashMap as DMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    pub struct InMemoryCompute {
        instances: DMap<String, CloudInstance>,
        counter: AtomicU64,
        pub fail_next_create: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl ComputeDriver for InMemoryCompute {
        async fn ensure_network(&self, _region: &str, cluster_name: &str, sg_prefix: &str) -> Result<NetworkContext> {
            Ok(NetworkContext {
                subnet_id: "subnet-fake".to_string(),
                security_group_id: k3ctl_types::names::security_group(sg_prefix, cluster_name),
            })
        }

        async fn create_instance(&self, spec: &InstanceSpec) -> Result<CloudInstance> {
            if self.fail_next_create.swap(false, Ordering::SeqCst) {
                return Err(Error::UserInput("fake create failure".into()));
            }
            let id = format!("i-{:016x}", self.counter.fetch_add(1, Ordering::SeqCst));
            let instance = CloudInstance {
                name: spec.name.clone(),
                instance_id: id.clone(),
                state: InstanceState::Pending,
                private_ip: Some(format!("10.0.0.{}", self.instances.len() + 1)),
                public_ip: Some(format!("203.0.113.{}", self.instances.len() + 1)),
                launch_time: Some(Utc::now()),
            };
            self.instances.insert(spec.name.clone(), instance.clone());
            Ok(instance)
        }

        async fn delete_instance(&self, _region: &str, instance_id: &str) -> Result<()> {
            self.instances.retain(|_, v| v.instance_id != instance_id);
            Ok(())
        }

        async fn list_instances(&self, _region: &str, _cluster_name: &str) -> Result<Vec<CloudInstance>> {
            Ok(self.instances.iter().map(|e| e.value().clone()).collect())
        }

        async fn cleanup_cluster(&self, _region: &str, _cluster_name: &str, _sg_prefix: &str) -> Result<()> {
            Ok(())
        }

        async fn cluster_name_for(&self, _region: &str, instance_id: &str) -> Result<Option<String>> {
            Ok(self
                .instances
                .iter()
                .find(|e| e.value().instance_id == instance_id)
                .map(|e| {
                    // The fake never stores cluster name directly on
                    // `CloudInstance`; tests that exercise this path key
                    // instances by a name already prefixed with the
                    // cluster, matching real `Name` tag conventions.
                    e.value().name.split("-master-").next().or_else(|| e.value().name.split("-worker-").next()).unwrap_or(&e.value().name).to_string()
                }))
        }
    }

    impl InMemoryCompute {
        /// Test helper: mark an instance `running` the way a real VM transitions
        /// from `pending` after the cloud finishes scheduling it.
        pub fn mark_running(&self, name: &str) {
            if let Some(mut entry) = self.instances.get_mut(name) {
                entry.state = InstanceState::Running;
            }
        }
    }
}
