use clap::{Parser, Subcommand};

use k3ctl_common::args::{AwsArgs, LockArgs, NotifyArgs, RequeueArgs, SecurityArgs, StoreArgs};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Mirrors the `compiler` binary's `Dispatch`/`Process` subcommand split
/// (§2.1): every run mode shares the same Event-Demux/Lease-Guard/Engine
/// code, only the outer trigger loop differs.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Runs under `lambda_runtime`, one invocation per trigger. Production
    /// deployment target.
    Lambda(EngineArgs),

    /// Long-running loop that long-polls the requeue queue in-process.
    /// Local development and self-hosted (non-Lambda) deployments.
    Serve(EngineArgs),

    /// Direct single-shot invocation for operational debugging; bypasses
    /// the Event Demux trigger-shape parsing entirely.
    Invoke(InvokeArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct EngineArgs {
    #[command(flatten)]
    pub aws: AwsArgs,
    #[command(flatten)]
    pub store: StoreArgs,
    #[command(flatten)]
    pub lock: LockArgs,
    #[command(flatten)]
    pub requeue: RequeueArgs,
    #[command(flatten)]
    pub notify: NotifyArgs,
    #[command(flatten)]
    pub security: SecurityArgs,

    /// Image id used when a `ClusterConfig` doesn't set one itself.
    #[arg(long, env = "K3CTL_DEFAULT_IMAGE_ID")]
    pub default_image_id: Option<String>,

    /// Identifies this worker fleet in the `ManagedBy` tag and as the
    /// Lease Guard's default owner-id prefix.
    #[arg(long, env = "K3CTL_SYSTEM_ID", default_value = "k3ctl")]
    pub system_id: String,

    /// Lease Guard's overall reconcile deadline (§4.7 step 3).
    #[arg(long, env = "K3CTL_RECONCILE_DEADLINE_SECONDS", default_value_t = 600)]
    pub reconcile_deadline_seconds: u64,
}

#[derive(Parser, Debug, Clone)]
pub struct InvokeArgs {
    #[command(flatten)]
    pub engine: EngineArgs,

    /// Cluster to reconcile directly, bypassing event-shape detection.
    #[arg(long, required = true)]
    pub cluster: String,
}
