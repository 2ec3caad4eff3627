//! The phase state machine (§4.8). `Engine::reconcile` is the single entry
//! point both worker run-modes (`lambda`, `serve`, `invoke`) call after the
//! Event Demux and Lease Guard have done their jobs.

mod phases;
#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use k3ctl_common::error::Result;
use k3ctl_common::notify::{ClusterEvent, Notifier, Topic};
use k3ctl_types::{ClusterConfig, ClusterPhase, ClusterStatus, keys};

use crate::command::CommandChannel;
use crate::compute::ComputeDriver;
use crate::store::ClusterStore;

/// What one phase handler decided. Kept internal to `reconcile`; external
/// callers only see `ReconcileOutcome`.
pub(crate) struct PhaseOutcome {
    pub next_phase: ClusterPhase,
    pub message: Option<String>,
    pub requeue_after: Option<Duration>,
    /// Set only by the Deleting phase's terminal step (§4.8.9 step 2):
    /// config and status have already been removed and must not be
    /// recreated by persisting `status` again.
    pub terminal_delete: bool,
}

impl PhaseOutcome {
    fn to(next_phase: ClusterPhase, requeue_after: Duration) -> Self {
        Self { next_phase, message: None, requeue_after: Some(requeue_after), terminal_delete: false }
    }

    fn stay(phase: ClusterPhase, requeue_after: Duration) -> Self {
        Self::to(phase, requeue_after)
    }

    fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

pub struct ReconcileOutcome {
    pub phase: ClusterPhase,
    pub requeue_after: Option<Duration>,
    /// True only when the cluster's config/status were just removed for
    /// good; callers must not schedule a requeue for a deleted cluster.
    pub deleted: bool,
}

/// The assembled set of external collaborators a reconcile needs. One
/// instance is built once per worker process and shared across invocations.
pub struct Engine {
    pub store: Arc<dyn ClusterStore>,
    pub compute: Arc<dyn ComputeDriver>,
    pub command: Arc<dyn CommandChannel>,
    pub notify: Notifier,
    pub sg_prefix: String,
    pub system_id: String,
    pub key_name: Option<String>,
    pub default_image_id: Option<String>,
}

impl Engine {
    pub fn image_id_for(&self, config: &ClusterConfig) -> Option<String> {
        config.image_id.clone().or_else(|| self.default_image_id.clone())
    }

    /// Absorbs phase errors into `status.message` rather than propagating
    /// them (§4.8.10, §7): the user-visible surface only ever reads the
    /// status blob, never a raw engine exception. Errors that threaten
    /// correctness (lease lost, deadline hit) never reach here — the Lease
    /// Guard races those against the reconcile future directly.
    pub async fn reconcile(&self, cluster_name: &str) -> Result<ReconcileOutcome> {
        let Some(config_bytes) = self.store.get(&keys::config(cluster_name)).await? else {
            tracing::warn!(cluster = cluster_name, "reconcile triggered for a cluster with no config, skipping");
            return Ok(ReconcileOutcome { phase: ClusterPhase::Deleting, requeue_after: None, deleted: true });
        };
        let config: ClusterConfig = serde_json::from_slice(&config_bytes)?;

        let mut status: ClusterStatus = match self.store.get(&keys::status(cluster_name)).await? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => ClusterStatus::default(),
        };

        if config.deletion_requested() && status.phase != ClusterPhase::Deleting {
            tracing::info!(cluster = cluster_name, "deletion requested, transitioning to Deleting");
            status.phase = ClusterPhase::Deleting;
        }

        let previous_phase = status.phase;

        let outcome = match status.phase {
            ClusterPhase::Pending => phases::pending::run(self, &config, &mut status).await,
            ClusterPhase::Provisioning => phases::provisioning::run(self, &config, &mut status).await,
            ClusterPhase::Installing => phases::installing::run(self, &config, &mut status).await,
            ClusterPhase::Configuring => phases::configuring::run(self, &config, &mut status).await,
            ClusterPhase::Running => phases::running::run(self, &config, &mut status).await,
            ClusterPhase::Failed => phases::failed::run(self, &config, &mut status).await,
            ClusterPhase::Deleting => phases::deleting::run(self, &config, &mut status).await,
        };

        let mut absorbed_error = None;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(cluster = cluster_name, phase = %status.phase, error = %e, "phase error absorbed into status");
                absorbed_error = Some(e.to_string());
                PhaseOutcome::stay(status.phase, Duration::from_secs(30)).with_message(e.to_string())
            }
        };

        if outcome.terminal_delete {
            tracing::info!(cluster = cluster_name, "cluster deletion complete, config and status removed");
            return Ok(ReconcileOutcome { phase: ClusterPhase::Deleting, requeue_after: None, deleted: true });
        }

        status.phase = outcome.next_phase;
        status.message = outcome.message;
        status.observed_generation = config.generation;
        status.last_reconcile_time = Some(Utc::now());

        if previous_phase != status.phase {
            tracing::info!(cluster = cluster_name, from = %previous_phase, to = %status.phase, "phase transition");
        }

        self.store
            .put(&keys::status(cluster_name), serde_json::to_vec(&status)?)
            .await?;

        self.publish_transition_notifications(cluster_name, previous_phase, &status).await;
        if let Some(error) = absorbed_error {
            self.publish(
                Topic::ErrorEvents,
                &ClusterEvent::ErrorAbsorbed { cluster: cluster_name.to_string(), phase: previous_phase.to_string(), error },
            )
            .await;
        }

        Ok(ReconcileOutcome {
            phase: status.phase,
            requeue_after: outcome.requeue_after,
            deleted: false,
        })
    }

    /// §4.8.10: `Running`/`Failed` transitions publish to `cluster-events`;
    /// every phase transition (terminal or not) also publishes to the more
    /// general `reconcile-events` topic.
    async fn publish_transition_notifications(&self, cluster_name: &str, previous_phase: ClusterPhase, status: &ClusterStatus) {
        if previous_phase == status.phase {
            return;
        }

        self.publish(
            Topic::ReconcileEvents,
            &ClusterEvent::PhaseTransition {
                cluster: cluster_name.to_string(),
                from: previous_phase.to_string(),
                to: status.phase.to_string(),
            },
        )
        .await;

        let event = match status.phase {
            ClusterPhase::Running => Some(ClusterEvent::Running { cluster: cluster_name.to_string() }),
            ClusterPhase::Failed => Some(ClusterEvent::Failed {
                cluster: cluster_name.to_string(),
                reason: status.message.clone().unwrap_or_default(),
            }),
            _ => None,
        };
        if let Some(event) = event {
            self.publish(Topic::ClusterEvents, &event).await;
        }
    }

    async fn publish(&self, topic: Topic, event: &ClusterEvent) {
        if let Err(e) = self.notify.publish(topic, event).await {
            tracing::warn!(error = %e, "notification publish failed");
        }
    }
}
