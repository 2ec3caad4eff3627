use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct AwsArgs {
    /// Default region used for the object store, lock table, queue, and
    /// topic. Per-cluster EC2/SSM calls use `ClusterConfig::region` instead.
    #[arg(long, env = "AWS_REGION", default_value = "us-east-1")]
    pub region: String,

    #[arg(long, env = "AWS_PROFILE")]
    pub profile: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct StoreArgs {
    /// S3 bucket holding `clusters/{name}/config.json` and `status.json`.
    #[arg(long, env = "K3CTL_BUCKET", required = true)]
    pub bucket: String,

    #[arg(long, env = "K3CTL_S3_ENDPOINT")]
    pub endpoint: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct LockArgs {
    /// DynamoDB table backing the Lock Registry (§4.1).
    #[arg(long, env = "K3CTL_LOCK_TABLE", default_value = "k3ctl-leases")]
    pub lock_table: String,

    /// Lease TTL in seconds; the holder must renew before this elapses or
    /// another reconcile is free to steal the lease (§4.1 I-LEASE).
    #[arg(long, env = "K3CTL_LEASE_TTL_SECONDS", default_value_t = 120)]
    pub lease_ttl_seconds: u64,
}

#[derive(Parser, Debug, Clone)]
pub struct RequeueArgs {
    /// SQS queue the engine posts self-requeue messages to (§4.6).
    #[arg(long, env = "K3CTL_REQUEUE_QUEUE_URL", required = true)]
    pub requeue_queue_url: String,

    /// SQS's own delay-seconds ceiling; self-requeues never ask for more.
    #[arg(long, env = "K3CTL_MAX_REQUEUE_SECONDS", default_value_t = 900)]
    pub max_requeue_seconds: u32,
}

#[derive(Parser, Debug, Clone)]
pub struct NotifyArgs {
    /// SNS topic ARN for transitions into `Running` (§4.8.10, §6.1). Unset
    /// disables this topic's publishes; this is allowed, not an error.
    #[arg(long, env = "K3CTL_CLUSTER_EVENTS_TOPIC_ARN")]
    pub cluster_events_topic_arn: Option<String>,

    /// SNS topic ARN for every phase transition, terminal or not (§6).
    #[arg(long, env = "K3CTL_RECONCILE_EVENTS_TOPIC_ARN")]
    pub reconcile_events_topic_arn: Option<String>,

    /// SNS topic ARN for reconciles that absorbed a user-visible error
    /// (§4.8.10, §7).
    #[arg(long, env = "K3CTL_ERROR_EVENTS_TOPIC_ARN")]
    pub error_events_topic_arn: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct SecurityArgs {
    /// Name prefix for security groups the Compute Driver creates per
    /// cluster (§6).
    #[arg(long, env = "K3CTL_SG_PREFIX", default_value = "k3ctl")]
    pub sg_prefix: String,

    /// SSH key pair name attached to every instance the engine launches.
    #[arg(long, env = "K3CTL_KEY_NAME")]
    pub key_name: Option<String>,
}
