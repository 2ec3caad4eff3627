use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;

use k3ctl_common::error::{Error, Result};

/// Object store holding, per cluster, a `config` blob, a `status` blob, the
/// k3s server token, and the kubeconfig (§4.2). Writes are whole-object;
/// there are no ordering guarantees across keys.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

pub struct S3Store {
    client: S3Client,
    bucket: String,
}

impl S3Store {
    pub async fn new(region: &str, bucket: &str, endpoint: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region.to_string()));
        if let Some(endpoint) = endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        Self {
            client: S3Client::new(&config),
            bucket: bucket.to_string(),
        }
    }
}

#[async_trait]
impl ClusterStore for S3Store {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let result = self.client.get_object().bucket(&self.bucket).key(key).send().await;
        let response = match result {
            Ok(r) => r,
            Err(e) => {
                if matches!(e.as_service_error(), Some(err) if err.is_no_such_key()) {
                    return Ok(None);
                }
                return Err(Error::from(aws_sdk_s3::Error::from(e)));
            }
        };
        let body = response
            .body
            .collect()
            .await
            .map_err(|e| Error::UserInput(format!("failed reading object body for {key}: {e}")))?;
        Ok(Some(body.into_bytes().to_vec()))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(aws_sdk_s3::Error::from)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(aws_sdk_s3::Error::from)?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }
            let response = request.send().await.map_err(aws_sdk_s3::Error::from)?;

            if let Some(contents) = response.contents {
                for object in contents {
                    if let Some(key) = object.key {
                        keys.push(key);
                    }
                }
            }

            if response.is_truncated.unwrap_or(false) {
                continuation_token = response.next_continuation_token;
            } else {
                break;
            }
        }

        Ok(keys)
    }
}
