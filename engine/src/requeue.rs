use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::Client as SqsClient;
use aws_sdk_sqs::config::Region;
use serde::Serialize;

use k3ctl_common::error::{Error, Result};
use k3ctl_types::keys;

use crate::store::ClusterStore;

/// SQS's own delay-seconds ceiling. The engine's documented 900s cap is
/// literally this, not an arbitrary choice (§4.6.1).
pub const MAX_DELAY_SECONDS: u32 = 900;

#[derive(Serialize)]
struct RequeueMessage<'a> {
    #[serde(rename = "clusterName")]
    cluster_name: &'a str,
    attempt: u32,
}

/// Enqueues a delayed self-message for the same cluster after a reconcile
/// returns `requeue` (§4.6). At-least-once delivery is acceptable; the
/// reconciler is idempotent.
#[async_trait]
pub trait RequeueScheduler: Send + Sync {
    async fn schedule(&self, cluster_name: &str, after: Duration, attempt: u32) -> Result<()>;
}

pub struct SqsRequeue {
    client: SqsClient,
    queue_url: String,
    store: std::sync::Arc<dyn ClusterStore>,
}

impl SqsRequeue {
    pub async fn new(region: &str, queue_url: &str, store: std::sync::Arc<dyn ClusterStore>) -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        Self {
            client: SqsClient::new(&config),
            queue_url: queue_url.to_string(),
            store,
        }
    }
}

#[async_trait]
impl RequeueScheduler for SqsRequeue {
    async fn schedule(&self, cluster_name: &str, after: Duration, attempt: u32) -> Result<()> {
        // Skip if the cluster was deleted between reconcile finishing and this call.
        if self.store.get(&keys::config(cluster_name)).await?.is_none() {
            tracing::debug!(cluster = cluster_name, "config gone, skipping requeue");
            return Ok(());
        }

        let delay = after.as_secs().min(MAX_DELAY_SECONDS as u64).max(0) as u32;
        let body = serde_json::to_string(&RequeueMessage { cluster_name, attempt })?;

        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .delay_seconds(delay as i32)
            .send()
            .await
            .map_err(aws_sdk_sqs::Error::from)
            .map_err(Error::from)?;

        Ok(())
    }
}

#[cfg(test)]
pub mod fakes {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingRequeue {
        pub scheduled: Mutex<Vec<(String, Duration, u32)>>,
    }

    #[async_trait]
    impl RequeueScheduler for RecordingRequeue {
        async fn schedule(&self, cluster_name: &str, after: Duration, attempt: u32) -> Result<()> {
            self.scheduled
                .lock()
                .unwrap()
                .push((cluster_name.to_string(), after, attempt));
            Ok(())
        }
    }
}
