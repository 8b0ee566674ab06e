use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::Error;

/// One operation inside a store batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Upsert `field` in the hash at `key`.
    SetField {
        key: String,
        field: String,
        value: String,
    },
    /// Set `key` to `value`, expiring after `ttl`.
    SetWithTtl {
        key: String,
        value: String,
        ttl: Duration,
    },
    Exists {
        key: String,
    },
    DeleteFields {
        key: String,
        fields: Vec<String>,
    },
    DeleteKey {
        key: String,
    },
}

/// Result of one [`StoreOp`], returned in call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreReply {
    /// A write that has no interesting result.
    Done,
    Exists(bool),
    /// Number of fields or keys removed by a delete.
    Removed(u64),
}

impl StoreReply {
    pub fn as_exists(&self) -> Result<bool, Error> {
        match self {
            Self::Exists(present) => Ok(*present),
            other => Err(Error::UnexpectedReply(format!(
                "expected existence reply, got {other:?}"
            ))),
        }
    }

    pub fn as_removed(&self) -> Result<u64, Error> {
        match self {
            Self::Removed(count) => Ok(*count),
            other => Err(Error::UnexpectedReply(format!(
                "expected delete count, got {other:?}"
            ))),
        }
    }
}

/// The key-value capabilities the registry needs from its store.
///
/// Implementations receive an already connected client; connection
/// management is the caller's concern. All writes are idempotent upserts and
/// all deletes idempotent removals, so any number of processes may share one
/// store.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Read every field of the hash at `key`. A missing hash is empty.
    async fn get_all_fields(&self, key: &str) -> Result<HashMap<String, String>, Error>;

    /// Execute `ops` as one atomic round trip, replies in call order.
    async fn execute_batch(&self, ops: Vec<StoreOp>) -> Result<Vec<StoreReply>, Error>;

    async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<(), Error> {
        self.execute_batch(vec![StoreOp::SetField {
            key: key.to_string(),
            field: field.to_string(),
            value: value.to_string(),
        }])
        .await?;
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error> {
        self.execute_batch(vec![StoreOp::SetWithTtl {
            key: key.to_string(),
            value: value.to_string(),
            ttl,
        }])
        .await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, Error> {
        let replies = self
            .execute_batch(vec![StoreOp::Exists {
                key: key.to_string(),
            }])
            .await?;
        single_reply(&replies)?.as_exists()
    }

    async fn delete_fields(&self, key: &str, fields: &[String]) -> Result<u64, Error> {
        if fields.is_empty() {
            return Ok(0);
        }
        let replies = self
            .execute_batch(vec![StoreOp::DeleteFields {
                key: key.to_string(),
                fields: fields.to_vec(),
            }])
            .await?;
        single_reply(&replies)?.as_removed()
    }

    async fn delete_key(&self, key: &str) -> Result<u64, Error> {
        let replies = self
            .execute_batch(vec![StoreOp::DeleteKey {
                key: key.to_string(),
            }])
            .await?;
        single_reply(&replies)?.as_removed()
    }
}

fn single_reply(replies: &[StoreReply]) -> Result<&StoreReply, Error> {
    match replies {
        [reply] => Ok(reply),
        other => Err(Error::UnexpectedReply(format!(
            "expected 1 reply, got {}",
            other.len()
        ))),
    }
}

/// Check that a batch came back with one reply per operation.
pub(crate) fn expect_replies(replies: &[StoreReply], ops: usize) -> Result<(), Error> {
    if replies.len() != ops {
        return Err(Error::UnexpectedReply(format!(
            "expected {} replies, got {}",
            ops,
            replies.len()
        )));
    }
    Ok(())
}
