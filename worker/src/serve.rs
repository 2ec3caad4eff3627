use aws_sdk_sqs::Client as SqsClient;
use serde::Deserialize;

use k3ctl_common::shutdown::shutdown_signal;
use k3ctl_engine::demux::Trigger;

use crate::args::EngineArgs;
use crate::run::run_one;
use crate::wiring::Context;

const WAIT_TIME_SECONDS: i32 = 20;
const MAX_MESSAGES: i32 = 10;
const VISIBILITY_TIMEOUT_SECONDS: i32 = 120;

#[derive(Deserialize)]
struct RequeueBody {
    #[serde(rename = "clusterName")]
    cluster_name: String,
    attempt: u32,
}

/// `k3ctl-worker serve` entry point (§2.1). Long-polls the requeue queue
/// in-process instead of running under `lambda_runtime`; every tick shares
/// the exact `LeaseGuard`/`Engine::reconcile` path the `lambda` subcommand
/// uses, mirroring the `frusta` services' long-running consume loop shape.
pub async fn run(args: EngineArgs) -> anyhow::Result<()> {
    let ctx = Context::build(&args).await?;
    k3ctl_common::metrics::maybe_spawn_metrics_server();

    let sqs_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_sdk_sqs::config::Region::new(args.aws.region.clone()))
        .load()
        .await;
    let sqs = SqsClient::new(&sqs_config);
    let queue_url = args.requeue.requeue_queue_url.clone();

    tracing::info!(queue = %queue_url, "serve loop starting");

    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                tracing::info!("serve loop shutting down");
                return Ok(());
            }
            received = sqs
                .receive_message()
                .queue_url(&queue_url)
                .max_number_of_messages(MAX_MESSAGES)
                .wait_time_seconds(WAIT_TIME_SECONDS)
                .visibility_timeout(VISIBILITY_TIMEOUT_SECONDS)
                .send() => {
                let messages = match received {
                    Ok(out) => out.messages.unwrap_or_default(),
                    Err(e) => {
                        tracing::warn!(error = %e, "receive_message failed, retrying");
                        continue;
                    }
                };

                for message in messages {
                    let Some(body) = message.body.as_deref() else { continue };
                    let Ok(requeue) = serde_json::from_str::<RequeueBody>(body) else {
                        tracing::warn!(body, "unparseable requeue message, dropping");
                        delete(&sqs, &queue_url, message.receipt_handle.as_deref()).await;
                        continue;
                    };

                    let trigger = Trigger::Requeue { cluster_name: requeue.cluster_name, attempt: requeue.attempt };
                    if let Err(e) = run_one(&ctx, trigger).await {
                        tracing::warn!(error = %e, "reconcile tick failed, message will redeliver");
                        continue;
                    }
                    delete(&sqs, &queue_url, message.receipt_handle.as_deref()).await;
                }
            }
        }
    }
}

async fn delete(sqs: &SqsClient, queue_url: &str, receipt_handle: Option<&str>) {
    let Some(receipt_handle) = receipt_handle else { return };
    if let Err(e) = sqs.delete_message().queue_url(queue_url).receipt_handle(receipt_handle).send().await {
        tracing::warn!(error = %e, "failed to delete processed requeue message");
    }
}
