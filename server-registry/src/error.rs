use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The store could not be reached for this operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store answered a batch with a reply that does not fit the operation.
    #[error("Unexpected store reply: {0}")]
    UnexpectedReply(String),
}
