use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::Client as DynamoClient;
use aws_sdk_dynamodb::config::Region;
use aws_sdk_dynamodb::types::AttributeValue;
use chrono::Utc;

use k3ctl_common::error::{Error, Result};
use k3ctl_types::Lease;

/// Single-writer discipline keyed by cluster id (§4.1). Acquire succeeds
/// only if no record exists or the existing one has expired; release and
/// renew are conditioned on the caller presenting the matching token.
#[async_trait]
pub trait LockRegistry: Send + Sync {
    async fn acquire(&self, resource_id: &str, owner: &str, ttl: Duration) -> Result<AcquireOutcome>;
    async fn renew(&self, resource_id: &str, token: &str, ttl: Duration) -> Result<()>;
    async fn release(&self, resource_id: &str, token: &str) -> Result<()>;
    async fn is_held(&self, resource_id: &str) -> Result<(bool, Option<String>)>;
}

#[derive(Debug, Clone)]
pub enum AcquireOutcome {
    Acquired(Lease),
    Conflict { owner: String },
}

pub struct DynamoLock {
    client: DynamoClient,
    table: String,
}

impl DynamoLock {
    pub async fn new(region: &str, table: &str) -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        Self {
            client: DynamoClient::new(&config),
            table: table.to_string(),
        }
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
impl LockRegistry for DynamoLock {
    async fn acquire(&self, resource_id: &str, owner: &str, ttl: Duration) -> Result<AcquireOutcome> {
        let token = uuid::Uuid::new_v4().to_string();
        let now = now_millis();
        let expires_at = now + ttl.as_millis() as i64;

        let result = self
            .client
            .put_item()
            .table_name(&self.table)
            .item("resource_id", AttributeValue::S(resource_id.to_string()))
            .item("owner", AttributeValue::S(owner.to_string()))
            .item("token", AttributeValue::S(token.clone()))
            .item("expires_at", AttributeValue::N(expires_at.to_string()))
            .condition_expression(
                "attribute_not_exists(resource_id) OR expires_at < :now",
            )
            .expression_attribute_values(":now", AttributeValue::N(now.to_string()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(AcquireOutcome::Acquired(Lease {
                resource_id: resource_id.to_string(),
                owner: owner.to_string(),
                token,
                expires_at: chrono::DateTime::from_timestamp_millis(expires_at)
                    .unwrap_or_else(Utc::now),
                phase: None,
                step: None,
                request_id: None,
            })),
            Err(e) => {
                if matches!(e.as_service_error(), Some(err) if err.is_conditional_check_failed_exception()) {
                    let (_, current_owner) = self.is_held(resource_id).await?;
                    Ok(AcquireOutcome::Conflict {
                        owner: current_owner.unwrap_or_else(|| "unknown".to_string()),
                    })
                } else {
                    Err(Error::from(aws_sdk_dynamodb::Error::from(e)))
                }
            }
        }
    }

    async fn renew(&self, resource_id: &str, token: &str, ttl: Duration) -> Result<()> {
        let now = now_millis();
        let expires_at = now + ttl.as_millis() as i64;

        let result = self
            .client
            .update_item()
            .table_name(&self.table)
            .key("resource_id", AttributeValue::S(resource_id.to_string()))
            .update_expression("SET expires_at = :expires_at")
            .condition_expression("token = :token")
            .expression_attribute_values(":expires_at", AttributeValue::N(expires_at.to_string()))
            .expression_attribute_values(":token", AttributeValue::S(token.to_string()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                if matches!(e.as_service_error(), Some(err) if err.is_conditional_check_failed_exception()) {
                    Err(Error::LeaseNotFound)
                } else {
                    Err(Error::from(aws_sdk_dynamodb::Error::from(e)))
                }
            }
        }
    }

    async fn release(&self, resource_id: &str, token: &str) -> Result<()> {
        let result = self
            .client
            .delete_item()
            .table_name(&self.table)
            .key("resource_id", AttributeValue::S(resource_id.to_string()))
            .condition_expression("token = :token")
            .expression_attribute_values(":token", AttributeValue::S(token.to_string()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                if matches!(e.as_service_error(), Some(err) if err.is_conditional_check_failed_exception()) {
                    // Already expired and reclaimed by someone else; releasing is then a no-op.
                    Ok(())
                } else {
                    Err(Error::from(aws_sdk_dynamodb::Error::from(e)))
                }
            }
        }
    }

    async fn is_held(&self, resource_id: &str) -> Result<(bool, Option<String>)> {
        let response = self
            .client
            .get_item()
            .table_name(&self.table)
            .key("resource_id", AttributeValue::S(resource_id.to_string()))
            .send()
            .await
            .map_err(aws_sdk_dynamodb::Error::from)?;

        let Some(item) = response.item else {
            return Ok((false, None));
        };

        let expires_at: i64 = item
            .get("expires_at")
            .and_then(|v| v.as_n().ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let owner = item.get("owner").and_then(|v| v.as_s().ok()).cloned();

        Ok((expires_at > now_millis(), owner))
    }
}

#[cfg(test)]
pub mod fakes {
    use super::*;
    use dashmap::DashMap;

    struct Entry {
        owner: String,
        token: String,
        expires_at: i64,
    }

    #[derive(Default)]
    pub struct InMemoryLock {
        entries: DashMap<String, Entry>,
    }

    #[async_trait]
    impl LockRegistry for InMemoryLock {
        async fn acquire(&self, resource_id: &str, owner: &str, ttl: Duration) -> Result<AcquireOutcome> {
            let now = now_millis();
            let mut held_by = None;
            if let Some(existing) = self.entries.get(resource_id) {
                if existing.expires_at >= now {
                    held_by = Some(existing.owner.clone());
                }
            }
            if let Some(owner) = held_by {
                return Ok(AcquireOutcome::Conflict { owner });
            }
            let token = uuid::Uuid::new_v4().to_string();
            let expires_at = now + ttl.as_millis() as i64;
            self.entries.insert(
                resource_id.to_string(),
                Entry { owner: owner.to_string(), token: token.clone(), expires_at },
            );
            Ok(AcquireOutcome::Acquired(Lease {
                resource_id: resource_id.to_string(),
                owner: owner.to_string(),
                token,
                expires_at: chrono::DateTime::from_timestamp_millis(expires_at).unwrap_or_else(Utc::now),
                phase: None,
                step: None,
                request_id: None,
            }))
        }

        async fn renew(&self, resource_id: &str, token: &str, ttl: Duration) -> Result<()> {
            let mut entry = self.entries.get_mut(resource_id).ok_or(Error::LeaseNotFound)?;
            if entry.token != token {
                return Err(Error::LeaseNotFound);
            }
            entry.expires_at = now_millis() + ttl.as_millis() as i64;
            Ok(())
        }

        async fn release(&self, resource_id: &str, token: &str) -> Result<()> {
            if let Some(entry) = self.entries.get(resource_id) {
                if entry.token == token {
                    drop(entry);
                    self.entries.remove(resource_id);
                }
            }
            Ok(())
        }

        async fn is_held(&self, resource_id: &str) -> Result<(bool, Option<String>)> {
            let now = now_millis();
            Ok(match self.entries.get(resource_id) {
                Some(e) if e.expires_at >= now => (true, Some(e.owner.clone())),
                _ => (false, None),
            })
        }
    }
}
