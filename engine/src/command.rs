use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_ssm::Client as SsmClient;
use aws_sdk_ssm::config::Region;
use futures::stream::{self, StreamExt};

use k3ctl_common::error::{Error, Result};
use k3ctl_types::{CommandResult, CommandStatus, TargetResult};

const POLL_CONCURRENCY: usize = 8;
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Runs a shell script across a set of VM identifiers (§4.3). Best-effort
/// parallel; per-target failures never fail the whole call.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn run(&self, region: &str, instance_ids: &[String], script: &str) -> Result<CommandResult>;
}

pub struct SsmCommand {
    client: SsmClient,
    timeout: Duration,
}

impl SsmCommand {
    pub async fn new(region: &str) -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        Self {
            client: SsmClient::new(&config),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    async fn poll_one(&self, command_id: &str, instance_id: &str) -> TargetResult {
        let deadline = tokio::time::Instant::now() + self.timeout;

        loop {
            let invocation = self
                .client
                .get_command_invocation()
                .command_id(command_id)
                .instance_id(instance_id)
                .send()
                .await;

            match invocation {
                Ok(inv) => {
                    let status = inv.status.map(|s| s.as_str().to_string()).unwrap_or_default();
                    match status.as_str() {
                        "Success" => {
                            return TargetResult {
                                instance_id: instance_id.to_string(),
                                output: inv.standard_output_content.unwrap_or_default(),
                                error: inv.standard_error_content.unwrap_or_default(),
                                exit_code: inv.response_code,
                                status: CommandStatus::Success,
                            };
                        }
                        "Failed" => {
                            return TargetResult {
                                instance_id: instance_id.to_string(),
                                output: inv.standard_output_content.unwrap_or_default(),
                                error: inv.standard_error_content.unwrap_or_default(),
                                exit_code: inv.response_code,
                                status: CommandStatus::Failed,
                            };
                        }
                        "Cancelled" | "TimedOut" => {
                            return TargetResult {
                                instance_id: instance_id.to_string(),
                                output: String::new(),
                                error: format!("invocation ended with status {status}"),
                                exit_code: None,
                                status: CommandStatus::Unreachable,
                            };
                        }
                        _ => {}
                    }
                }
                Err(e) => {
                    if matches!(e.as_service_error(), Some(err) if err.to_string().contains("InvocationDoesNotExist")) {
                        // SSM has not yet materialized the per-target invocation record.
                    } else if matches!(e.as_service_error(), Some(err) if err.to_string().contains("AccessDenied")) {
                        return TargetResult {
                            instance_id: instance_id.to_string(),
                            output: String::new(),
                            error: e.to_string(),
                            exit_code: None,
                            status: CommandStatus::Permission,
                        };
                    } else {
                        tracing::warn!(instance_id, error = %e, "transient error polling SSM invocation");
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return TargetResult {
                    instance_id: instance_id.to_string(),
                    output: String::new(),
                    error: "timed out waiting for command invocation".to_string(),
                    exit_code: None,
                    status: CommandStatus::Timeout,
                };
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl CommandChannel for SsmCommand {
    async fn run(&self, _region: &str, instance_ids: &[String], script: &str) -> Result<CommandResult> {
        if instance_ids.is_empty() {
            return Ok(CommandResult::default());
        }

        let send_result = self
            .client
            .send_command()
            .document_name("AWS-RunShellScript")
            .set_instance_ids(Some(instance_ids.to_vec()))
            .parameters("commands", vec![script.to_string()])
            .send()
            .await;

        let command_id = match send_result {
            Ok(response) => response
                .command
                .and_then(|c| c.command_id)
                .ok_or_else(|| Error::UserInput("SSM accepted send_command but returned no command id".into()))?,
            Err(e) => {
                if matches!(e.as_service_error(), Some(err) if err.to_string().contains("InvalidInstanceId")) {
                    let mut per_target = BTreeMap::new();
                    for id in instance_ids {
                        per_target.insert(
                            id.clone(),
                            TargetResult {
                                instance_id: id.clone(),
                                output: String::new(),
                                error: "invalid or unreachable instance id".to_string(),
                                exit_code: None,
                                status: CommandStatus::Unreachable,
                            },
                        );
                    }
                    return Ok(CommandResult { aggregate_status: CommandStatus::Unreachable, per_target });
                }
                return Err(Error::from(aws_sdk_ssm::Error::from(e)));
            }
        };

        // Give SSM a moment to fan the command out to each target before polling.
        tokio::time::sleep(Duration::from_secs(1)).await;

        let results = stream::iter(instance_ids.iter().cloned())
            .map(|instance_id| {
                let command_id = command_id.clone();
                async move { self.poll_one(&command_id, &instance_id).await }
            })
            .buffer_unordered(POLL_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;

        let mut per_target = BTreeMap::new();
        let mut any_failed = false;
        for result in results {
            if result.status != CommandStatus::Success {
                any_failed = true;
            }
            per_target.insert(result.instance_id.clone(), result);
        }

        Ok(CommandResult {
            aggregate_status: if any_failed { CommandStatus::Failed } else { CommandStatus::Success },
            per_target,
        })
    }
}

#[cfg(test)]
pub mod fakes {
    use super::*;

    /// Returns `Success` for every target by default; tests can override
    /// `script_handler` to simulate per-target outcomes (e.g. one joiner
    /// failing on first attempt).
    pub struct ScriptedCommand<F>
    where
        F: Fn(&str, &str) -> TargetResult + Send + Sync,
    {
        pub handler: F,
    }

    #[async_trait]
    impl<F> CommandChannel for ScriptedCommand<F>
    where
        F: Fn(&str, &str) -> TargetResult + Send + Sync,
    {
        async fn run(&self, _region: &str, instance_ids: &[String], script: &str) -> Result<CommandResult> {
            let mut per_target = BTreeMap::new();
            let mut any_failed = false;
            for id in instance_ids {
                let result = (self.handler)(id, script);
                if result.status != CommandStatus::Success {
                    any_failed = true;
                }
                per_target.insert(id.clone(), result);
            }
            Ok(CommandResult {
                aggregate_status: if any_failed { CommandStatus::Failed } else { CommandStatus::Success },
                per_target,
            })
        }
    }
}
