use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Value};
use std::collections::HashMap;

use crate::store::{RegistryStore, StoreOp, StoreReply};
use crate::Error;

/// [`RegistryStore`] over a Redis multiplexed connection.
///
/// Batches run inside `MULTI`/`EXEC`, so a heartbeat's record and liveness
/// marker land in the same round trip.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    /// Open a client for `redis_url` and take one multiplexed connection.
    pub async fn connect(redis_url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        tracing::debug!("Connected registry store to Redis");
        Ok(Self { conn })
    }

    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

#[async_trait]
impl RegistryStore for RedisStore {
    async fn get_all_fields(&self, key: &str) -> Result<HashMap<String, String>, Error> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(fields)
    }

    async fn execute_batch(&self, ops: Vec<StoreOp>) -> Result<Vec<StoreReply>, Error> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            match op {
                StoreOp::SetField { key, field, value } => {
                    pipe.hset(key, field, value);
                }
                StoreOp::SetWithTtl { key, value, ttl } => {
                    let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                    pipe.cmd("SET").arg(key).arg(value).arg("PX").arg(millis);
                }
                StoreOp::Exists { key } => {
                    pipe.exists(key);
                }
                StoreOp::DeleteFields { key, fields } => {
                    pipe.hdel(key, fields);
                }
                StoreOp::DeleteKey { key } => {
                    pipe.del(key);
                }
            }
        }

        let mut conn = self.conn.clone();
        let values: Vec<Value> = pipe.query_async(&mut conn).await?;
        if values.len() != ops.len() {
            return Err(Error::UnexpectedReply(format!(
                "pipeline returned {} values for {} commands",
                values.len(),
                ops.len()
            )));
        }

        ops.iter()
            .zip(values.iter())
            .map(|(op, value)| reply_for(op, value))
            .collect()
    }
}

fn reply_for(op: &StoreOp, value: &Value) -> Result<StoreReply, Error> {
    match op {
        StoreOp::SetField { .. } | StoreOp::SetWithTtl { .. } => Ok(StoreReply::Done),
        StoreOp::Exists { .. } => Ok(StoreReply::Exists(redis::from_redis_value::<bool>(value)?)),
        StoreOp::DeleteFields { .. } | StoreOp::DeleteKey { .. } => {
            Ok(StoreReply::Removed(redis::from_redis_value::<u64>(value)?))
        }
    }
}
