use aws_lambda_events::event::cloudwatch_events::CloudWatchEvent;
use aws_lambda_events::event::s3::S3Event;
use aws_lambda_events::event::sqs::SqsEvent;
use k3ctl_engine::demux::Trigger;
use serde::Deserialize;
use serde_json::Value;

use k3ctl_engine::compute::ComputeDriver;

/// EC2's own `detail-type` string for instance state-change notifications,
/// as delivered over EventBridge (§4.5 row 3).
const EC2_STATE_CHANGE_DETAIL_TYPE: &str = "EC2 Instance State-change Notification";

#[derive(Deserialize)]
struct Ec2StateChangeDetail {
    #[serde(rename = "instance-id")]
    instance_id: String,
}

#[derive(Deserialize)]
struct DirectInvokePayload {
    #[serde(rename = "clusterName")]
    cluster_name: String,
}

/// Sniffs one Lambda event envelope into zero or more `Trigger`s (§4.5).
/// Tried in order: S3 object-write batch, SQS requeue-message batch, EC2
/// state-change notification, bare direct-invoke payload. The first shape
/// that deserializes wins — the four envelopes don't overlap in practice
/// (an S3 event always carries a `Records[].s3` key an SQS batch never has,
/// and vice versa), so trying them in sequence is safe rather than
/// ambiguous.
pub async fn parse(payload: Value, compute: &dyn ComputeDriver, default_region: &str) -> Vec<Trigger> {
    if let Ok(event) = serde_json::from_value::<S3Event>(payload.clone()) {
        if !event.records.is_empty() {
            return event
                .records
                .into_iter()
                .filter_map(|record| record.s3.object.key)
                .map(|key| Trigger::ObjectStoreWrite { key })
                .collect();
        }
    }

    if let Ok(event) = serde_json::from_value::<SqsEvent>(payload.clone()) {
        if !event.records.is_empty() {
            return event
                .records
                .into_iter()
                .filter_map(|record| record.body)
                .filter_map(|body| serde_json::from_str::<RequeueBody>(&body).ok())
                .map(|body| Trigger::Requeue { cluster_name: body.cluster_name, attempt: body.attempt })
                .collect();
        }
    }

    if let Ok(event) = serde_json::from_value::<CloudWatchEvent<Ec2StateChangeDetail>>(payload.clone()) {
        if event.detail_type == EC2_STATE_CHANGE_DETAIL_TYPE {
            let region = event.region.clone().unwrap_or_else(|| default_region.to_string());
            let cluster_name = match compute.cluster_name_for(&region, &event.detail.instance_id).await {
                Ok(name) => name,
                Err(e) => {
                    tracing::warn!(instance_id = %event.detail.instance_id, error = %e, "cluster tag lookup failed");
                    None
                }
            };
            return vec![Trigger::VmStateChange { cluster_name }];
        }
    }

    if let Ok(direct) = serde_json::from_value::<DirectInvokePayload>(payload) {
        return vec![Trigger::DirectInvoke { cluster_name: direct.cluster_name }];
    }

    tracing::warn!("unrecognized trigger payload shape, ignoring");
    Vec::new()
}

#[derive(Deserialize)]
struct RequeueBody {
    #[serde(rename = "clusterName")]
    cluster_name: String,
    attempt: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use k3ctl_engine::compute::{CloudInstance, InstanceSpec, NetworkContext};
    use k3ctl_common::error::Result;

    /// Local stand-in for the worker crate's own tests; the engine crate's
    /// `#[cfg(test)]`-gated fakes aren't visible across the crate boundary.
    #[derive(Default)]
    struct NullCompute;

    #[async_trait]
    impl ComputeDriver for NullCompute {
        async fn ensure_network(&self, _region: &str, _cluster_name: &str, _sg_prefix: &str) -> Result<NetworkContext> {
            unimplemented!("unused by trigger parsing tests")
        }
        async fn create_instance(&self, _spec: &InstanceSpec) -> Result<CloudInstance> {
            unimplemented!("unused by trigger parsing tests")
        }
        async fn delete_instance(&self, _region: &str, _instance_id: &str) -> Result<()> {
            unimplemented!("unused by trigger parsing tests")
        }
        async fn list_instances(&self, _region: &str, _cluster_name: &str) -> Result<Vec<CloudInstance>> {
            unimplemented!("unused by trigger parsing tests")
        }
        async fn cleanup_cluster(&self, _region: &str, _cluster_name: &str, _sg_prefix: &str) -> Result<()> {
            unimplemented!("unused by trigger parsing tests")
        }
        async fn cluster_name_for(&self, _region: &str, _instance_id: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn parses_direct_invoke() {
        let compute = NullCompute;
        let payload = serde_json::json!({"clusterName": "c1"});
        let triggers = parse(payload, &compute, "us-east-1").await;
        assert_eq!(triggers, vec![Trigger::DirectInvoke { cluster_name: "c1".into() }]);
    }

    #[tokio::test]
    async fn parses_s3_event() {
        let payload = serde_json::json!({
            "Records": [{
                "eventVersion": "2.1",
                "eventSource": "aws:s3",
                "awsRegion": "us-east-1",
                "eventTime": "2024-01-01T00:00:00.000Z",
                "eventName": "ObjectCreated:Put",
                "s3": {
                    "s3SchemaVersion": "1.0",
                    "configurationId": "cfg",
                    "bucket": {"name": "bucket", "ownerIdentity": {"principalId": "x"}, "arn": "arn:aws:s3:::bucket"},
                    "object": {"key": "clusters/c1/status.json", "size": 10, "eTag": "abc", "sequencer": "1"}
                }
            }]
        });
        let compute = NullCompute;
        let triggers = parse(payload, &compute, "us-east-1").await;
        assert_eq!(triggers, vec![Trigger::ObjectStoreWrite { key: "clusters/c1/status.json".into() }]);
    }

    #[tokio::test]
    async fn unrecognized_payload_yields_nothing() {
        let compute = NullCompute;
        let triggers = parse(serde_json::json!({"nonsense": true}), &compute, "us-east-1").await;
        assert!(triggers.is_empty());
    }
}
