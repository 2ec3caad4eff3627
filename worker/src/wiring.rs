use std::sync::Arc;

use aws_sdk_sns::Client as SnsClient;

use k3ctl_common::notify::Notifier;
use k3ctl_engine::command::SsmCommand;
use k3ctl_engine::compute::Ec2Compute;
use k3ctl_engine::lease_guard::LeaseGuard;
use k3ctl_engine::lock::DynamoLock;
use k3ctl_engine::reconcile::Engine;
use k3ctl_engine::requeue::SqsRequeue;
use k3ctl_engine::store::{ClusterStore, S3Store};

use crate::args::EngineArgs;

/// Everything a reconcile needs, built once per process and cheap to clone
/// (every field is an `Arc` or owned config, per the `compiler` binary's
/// `Context` pattern).
#[derive(Clone)]
pub struct Context {
    pub engine: Arc<Engine>,
    pub lease: Arc<LeaseGuard<DynamoLock>>,
    pub requeue: Arc<SqsRequeue>,
    pub lease_ttl: std::time::Duration,
    pub reconcile_deadline: std::time::Duration,
}

impl Context {
    pub async fn build(args: &EngineArgs) -> anyhow::Result<Self> {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_sns::config::Region::new(args.aws.region.clone()))
            .load()
            .await;

        let store: Arc<dyn ClusterStore> = Arc::new(
            S3Store::new(&args.aws.region, &args.store.bucket, args.store.endpoint.as_deref()).await,
        );

        let compute = Arc::new(Ec2Compute::new(args.system_id.clone()));
        let command = Arc::new(SsmCommand::new(&args.aws.region).await);
        let lock = Arc::new(DynamoLock::new(&args.aws.region, &args.lock.lock_table).await);
        let requeue = Arc::new(
            SqsRequeue::new(&args.aws.region, &args.requeue.requeue_queue_url, store.clone()).await,
        );
        let notify = Notifier::new(
            SnsClient::new(&sdk_config),
            args.notify.cluster_events_topic_arn.clone(),
            args.notify.reconcile_events_topic_arn.clone(),
            args.notify.error_events_topic_arn.clone(),
        );

        let engine = Arc::new(Engine {
            store,
            compute,
            command,
            notify,
            sg_prefix: args.security.sg_prefix.clone(),
            system_id: args.system_id.clone(),
            key_name: args.security.key_name.clone(),
            default_image_id: args.default_image_id.clone(),
        });

        let lease = Arc::new(LeaseGuard::new(lock, args.system_id.clone()));

        Ok(Self {
            engine,
            lease,
            requeue,
            lease_ttl: std::time::Duration::from_secs(args.lock.lease_ttl_seconds),
            reconcile_deadline: std::time::Duration::from_secs(args.reconcile_deadline_seconds),
        })
    }
}
