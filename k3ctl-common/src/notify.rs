use aws_sdk_sns::Client as SnsClient;
use serde::Serialize;

use crate::error::{Error, Result};

/// Message-attribute names carried on every notification.
pub mod attributes {
    pub const EVENT: &str = "k3ctl.event";
    pub const CLUSTER: &str = "k3ctl.cluster";
}

/// The three publish-only topics from §6: `cluster-events` fires on a
/// transition into `Running`/`Failed`, `error-events` fires whenever a
/// reconcile absorbed a user-visible error (§4.8.10), `reconcile-events`
/// fires on every phase transition and is the general-purpose channel the
/// other two are a more specific view of.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Topic {
    ClusterEvents,
    ReconcileEvents,
    ErrorEvents,
}

#[derive(Serialize, Clone, Debug)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClusterEvent {
    Running { cluster: String },
    Failed { cluster: String, reason: String },
    Deleted { cluster: String },
    PhaseTransition { cluster: String, from: String, to: String },
    ErrorAbsorbed { cluster: String, phase: String, error: String },
}

impl ClusterEvent {
    fn event_name(&self) -> &'static str {
        match self {
            ClusterEvent::Running { .. } => "running",
            ClusterEvent::Failed { .. } => "failed",
            ClusterEvent::Deleted { .. } => "deleted",
            ClusterEvent::PhaseTransition { .. } => "phase_transition",
            ClusterEvent::ErrorAbsorbed { .. } => "error_absorbed",
        }
    }

    fn cluster(&self) -> &str {
        match self {
            ClusterEvent::Running { cluster }
            | ClusterEvent::Failed { cluster, .. }
            | ClusterEvent::Deleted { cluster }
            | ClusterEvent::PhaseTransition { cluster, .. }
            | ClusterEvent::ErrorAbsorbed { cluster, .. } => cluster,
        }
    }
}

/// One topic ARN per logical topic (§6.1); each is independently optional —
/// an unset ARN is a deliberate no-op for that topic, not an error.
pub struct Notifier {
    client: SnsClient,
    cluster_events_topic_arn: Option<String>,
    reconcile_events_topic_arn: Option<String>,
    error_events_topic_arn: Option<String>,
}

impl Notifier {
    pub fn new(
        client: SnsClient,
        cluster_events_topic_arn: Option<String>,
        reconcile_events_topic_arn: Option<String>,
        error_events_topic_arn: Option<String>,
    ) -> Self {
        Self { client, cluster_events_topic_arn, reconcile_events_topic_arn, error_events_topic_arn }
    }

    fn topic_arn(&self, topic: Topic) -> Option<&str> {
        match topic {
            Topic::ClusterEvents => self.cluster_events_topic_arn.as_deref(),
            Topic::ReconcileEvents => self.reconcile_events_topic_arn.as_deref(),
            Topic::ErrorEvents => self.error_events_topic_arn.as_deref(),
        }
    }

    /// Publishes one event to the named topic. Notifications are not
    /// durable state (§9): a publish failure is logged and swallowed by the
    /// caller, never propagated into the reconcile's own error handling.
    pub async fn publish(&self, topic: Topic, event: &ClusterEvent) -> Result<()> {
        let Some(topic_arn) = self.topic_arn(topic) else {
            tracing::debug!(cluster = %event.cluster(), topic = ?topic, "notify topic unset, skipping publish");
            return Ok(());
        };

        let payload = serde_json::to_string(event)?;

        tracing::info!(
            cluster = %event.cluster(),
            event = event.event_name(),
            topic = ?topic,
            "publishing cluster event"
        );

        self.client
            .publish()
            .topic_arn(topic_arn)
            .message(payload)
            .message_attributes(
                attributes::EVENT,
                aws_sdk_sns::types::MessageAttributeValue::builder()
                    .data_type("String")
                    .string_value(event.event_name())
                    .build()
                    .expect("message attribute"),
            )
            .message_attributes(
                attributes::CLUSTER,
                aws_sdk_sns::types::MessageAttributeValue::builder()
                    .data_type("String")
                    .string_value(event.cluster())
                    .build()
                    .expect("message attribute"),
            )
            .send()
            .await
            .map_err(aws_sdk_sns::Error::from)
            .map_err(Error::from)?;

        Ok(())
    }
}

#[cfg(test)]
impl Notifier {
    /// A `Notifier` with no topic ARNs set is a real no-op (see `publish`
    /// above), so the client here never actually talks to SNS; building it
    /// from a bare config keeps tests off `aws_config`'s env/IMDS lookups.
    pub fn for_tests() -> Self {
        let config = aws_sdk_sns::config::Builder::new()
            .region(aws_sdk_sns::config::Region::new("us-east-1"))
            .behavior_version(aws_sdk_sns::config::BehaviorVersion::latest())
            .build();
        Self {
            client: SnsClient::from_conf(config),
            cluster_events_topic_arn: None,
            reconcile_events_topic_arn: None,
            error_events_topic_arn: None,
        }
    }
}
