/// Crate-wide error taxonomy. AWS SDK calls surface their per-service
/// top-level `Error` type (via `From<SdkError<..>>`), so call sites do
/// `.map_err(aws_sdk_ec2::Error::from)?` to land here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object store: {source}")]
    Store {
        #[from]
        source: aws_sdk_s3::Error,
    },

    #[error("lock registry: {source}")]
    Lock {
        #[from]
        source: aws_sdk_dynamodb::Error,
    },

    #[error("compute driver: {source}")]
    Compute {
        #[from]
        source: aws_sdk_ec2::Error,
    },

    #[error("command channel: {source}")]
    Command {
        #[from]
        source: aws_sdk_ssm::Error,
    },

    #[error("requeue scheduler: {source}")]
    Requeue {
        #[from]
        source: aws_sdk_sqs::Error,
    },

    #[error("notifications: {source}")]
    Notify {
        #[from]
        source: aws_sdk_sns::Error,
    },

    #[error("lease held by another owner")]
    LeaseConflict,

    #[error("lease expired or not found")]
    LeaseNotFound,

    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("invalid config: {0}")]
    UserInput(String),

    #[error("json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("chrono: {source}")]
    Chrono {
        #[from]
        source: chrono::ParseError,
    },

    #[error("exhausted retries: {0}")]
    RetriesExhausted(String),
}

pub type Result<T> = std::result::Result<T, Error>;
