use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::config::RegistryKeys;
use crate::identity::ServerIdentity;
use crate::record::ServerRecord;
use crate::store::{expect_replies, RegistryStore, StoreOp};
use crate::Error;

/// Value written to liveness markers; only their existence matters.
const MARKER_VALUE: &str = "1";

/// Publish this process's record and liveness marker in one batch.
///
/// The record is stamped with `now` as its heartbeat time and with the
/// process start time held by the caller. Writing both in one round trip
/// avoids a window where the record exists without its marker.
pub async fn write_heartbeat(
    store: &dyn RegistryStore,
    keys: &RegistryKeys,
    identity: &ServerIdentity,
    started_at: DateTime<Utc>,
    ttl: Duration,
) -> Result<ServerRecord, Error> {
    let record = ServerRecord::new(identity, started_at, Utc::now());
    let ops = vec![
        StoreOp::SetField {
            key: keys.registry().to_string(),
            field: identity.server_id.clone(),
            value: record.to_json()?,
        },
        StoreOp::SetWithTtl {
            key: keys.ttl_marker(&identity.server_id),
            value: MARKER_VALUE.to_string(),
            ttl,
        },
    ];
    let replies = store.execute_batch(ops).await?;
    expect_replies(&replies, 2)?;

    tracing::trace!(server_id = %identity.server_id, "Heartbeat written");
    Ok(record)
}

/// Remove this process's record and marker. Both deletes are idempotent.
pub async fn deregister(
    store: &dyn RegistryStore,
    keys: &RegistryKeys,
    server_id: &str,
) -> Result<(), Error> {
    let ops = vec![
        StoreOp::DeleteFields {
            key: keys.registry().to_string(),
            fields: vec![server_id.to_string()],
        },
        StoreOp::DeleteKey {
            key: keys.ttl_marker(server_id),
        },
    ];
    let replies = store.execute_batch(ops).await?;
    expect_replies(&replies, 2)?;

    tracing::info!(%server_id, "Deregistered server from registry");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;

    fn identity(id: &str) -> ServerIdentity {
        ServerIdentity {
            server_id: id.to_string(),
            hostname: "host-a".into(),
            process_id: 7,
        }
    }

    #[tokio::test]
    async fn test_heartbeat_writes_record_and_marker_in_one_round_trip() {
        let store = MemoryStore::new();
        let keys = RegistryKeys::new("server:registry");
        let started = Utc::now();

        let written = write_heartbeat(
            &store,
            &keys,
            &identity("game-1"),
            started,
            Duration::from_secs(30),
        )
        .await
        .unwrap();

        assert_eq!(store.round_trips(), 1);
        assert!(store.contains_key("server:registry:ttl:game-1"));

        let fields = store.get_all_fields("server:registry").await.unwrap();
        let stored = ServerRecord::from_json(&fields["game-1"]).unwrap();
        assert_eq!(stored, written);
        assert_eq!(stored.started_at, started);
        assert_eq!(stored.process_id, 7);
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_started_at_and_moves_last_heartbeat() {
        let store = MemoryStore::new();
        let keys = RegistryKeys::new("server:registry");
        let started = Utc::now();
        let ttl = Duration::from_secs(30);

        let first = write_heartbeat(&store, &keys, &identity("game-1"), started, ttl)
            .await
            .unwrap();
        let second = write_heartbeat(&store, &keys, &identity("game-1"), started, ttl)
            .await
            .unwrap();

        assert_eq!(first.started_at, second.started_at);
        assert!(second.last_heartbeat >= first.last_heartbeat);
        assert_eq!(store.get_all_fields("server:registry").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_fails_when_store_is_down() {
        let store = MemoryStore::new();
        store.set_available(false);
        let result = write_heartbeat(
            &store,
            &RegistryKeys::new("server:registry"),
            &identity("game-1"),
            Utc::now(),
            Duration::from_secs(30),
        )
        .await;
        assert!(matches!(result, Err(Error::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_deregister_is_idempotent() {
        let store = MemoryStore::new();
        let keys = RegistryKeys::new("server:registry");
        write_heartbeat(
            &store,
            &keys,
            &identity("game-1"),
            Utc::now(),
            Duration::from_secs(30),
        )
        .await
        .unwrap();

        deregister(&store, &keys, "game-1").await.unwrap();
        deregister(&store, &keys, "game-1").await.unwrap();

        assert!(!store.contains_key("server:registry:ttl:game-1"));
        assert!(store.get_all_fields("server:registry").await.unwrap().is_empty());
    }
}
