use lambda_runtime::{Error as LambdaError, LambdaEvent, service_fn};
use serde_json::Value;

use crate::args::EngineArgs;
use crate::run::run_batch;
use crate::trigger;
use crate::wiring::Context;

/// `k3ctl-worker lambda` entry point (§2.1). One invocation per event batch;
/// the payload's shape (S3/SQS/EventBridge/direct) is sniffed fresh on every
/// call rather than assumed from the trigger configuration, so the same
/// binary serves every event source Lambda is wired to.
pub async fn run(args: EngineArgs) -> anyhow::Result<()> {
    let ctx = Context::build(&args).await?;
    let region = args.aws.region.clone();

    lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| {
        let ctx = ctx.clone();
        let region = region.clone();
        async move { handle(&ctx, &region, event).await }
    }))
    .await
    .map_err(|e| anyhow::anyhow!("lambda runtime error: {e}"))
}

async fn handle(ctx: &Context, region: &str, event: LambdaEvent<Value>) -> Result<(), LambdaError> {
    let (payload, _context) = event.into_parts();
    let triggers = trigger::parse(payload, ctx.engine.compute.as_ref(), region).await;
    run_batch(ctx, triggers)
        .await
        .map_err(|e| LambdaError::from(e.to_string()))
}
