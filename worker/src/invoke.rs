use k3ctl_engine::demux::Trigger;

use crate::args::InvokeArgs;
use crate::run::run_one;
use crate::wiring::Context;

/// `k3ctl-worker invoke --cluster <name>` entry point (§2.1). Bypasses the
/// Event Demux's trigger-shape parsing entirely; useful for forcing a
/// reconcile from the operator's own terminal without waiting for the next
/// event.
pub async fn run(args: InvokeArgs) -> anyhow::Result<()> {
    let ctx = Context::build(&args.engine).await?;
    run_one(&ctx, Trigger::DirectInvoke { cluster_name: args.cluster }).await
}
