use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

use crate::store::{RegistryStore, StoreOp, StoreReply};
use crate::Error;

#[derive(Default)]
struct Keyspace {
    values: HashMap<String, (String, Instant)>,
    hashes: HashMap<String, HashMap<String, String>>,
}

impl Keyspace {
    fn value(&mut self, key: &str, now: Instant) -> Option<&str> {
        if matches!(self.values.get(key), Some((_, expires_at)) if *expires_at <= now) {
            self.values.remove(key);
        }
        self.values.get(key).map(|(value, _)| value.as_str())
    }

    fn exists(&mut self, key: &str, now: Instant) -> bool {
        self.value(key, now).is_some() || self.hashes.contains_key(key)
    }

    fn hash_mut(&mut self, key: &str) -> &mut HashMap<String, String> {
        self.values.remove(key);
        self.hashes.entry(key.to_string()).or_default()
    }

    fn delete_key(&mut self, key: &str, now: Instant) -> bool {
        let existed = self.exists(key, now);
        self.values.remove(key);
        self.hashes.remove(key);
        existed
    }

    fn delete_fields(&mut self, key: &str, fields: &[String]) -> u64 {
        let Some(hash) = self.hashes.get_mut(key) else {
            return 0;
        };
        let removed = fields
            .iter()
            .filter(|field| hash.remove(field.as_str()).is_some())
            .count() as u64;
        if hash.is_empty() {
            self.hashes.remove(key);
        }
        removed
    }
}

#[derive(Default)]
struct Inner {
    keyspace: Mutex<Keyspace>,
    round_trips: AtomicUsize,
    ops: AtomicUsize,
    unavailable: AtomicBool,
    failing_deletes: AtomicUsize,
}

/// In-process [`RegistryStore`].
///
/// Clones share one keyspace, so several registries in one process behave
/// like peers sharing a Redis. Expiry follows tokio's clock, which lets
/// paused-time tests expire markers with `tokio::time::advance`. Every call
/// is counted, and the store can be switched off to simulate an outage.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of round trips served (a batch counts once).
    pub fn round_trips(&self) -> usize {
        self.inner.round_trips.load(Ordering::Relaxed)
    }

    /// Number of individual operations served.
    pub fn op_count(&self) -> usize {
        self.inner.ops.load(Ordering::Relaxed)
    }

    /// While unavailable, every call fails with `Error::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::Relaxed);
    }

    /// Fail the next `batches` batches that contain a `DeleteFields` op,
    /// leaving every other call untouched.
    pub fn fail_next_field_deletes(&self, batches: usize) {
        self.inner.failing_deletes.store(batches, Ordering::Relaxed);
    }

    /// Write a raw hash field, bypassing the registry's encoding.
    pub fn insert_raw_field(&self, key: &str, field: &str, value: &str) {
        self.lock()
            .hash_mut(key)
            .insert(field.to_string(), value.to_string());
    }

    /// Drop a key immediately, as if its TTL had run out.
    pub fn expire_now(&self, key: &str) {
        self.lock().values.remove(key);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().exists(key, Instant::now())
    }

    /// Current value of a plain (non-hash) key, if it has not expired.
    pub fn value(&self, key: &str) -> Option<String> {
        self.lock().value(key, Instant::now()).map(str::to_string)
    }

    fn lock(&self) -> MutexGuard<'_, Keyspace> {
        self.inner
            .keyspace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self, ops: usize) -> Result<(), Error> {
        self.inner.round_trips.fetch_add(1, Ordering::Relaxed);
        self.inner.ops.fetch_add(ops, Ordering::Relaxed);
        if self.inner.unavailable.load(Ordering::Relaxed) {
            return Err(Error::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }

    fn take_delete_failure(&self, ops: &[StoreOp]) -> bool {
        ops.iter().any(|op| matches!(op, StoreOp::DeleteFields { .. }))
            && self
                .inner
                .failing_deletes
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_ok()
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn get_all_fields(&self, key: &str) -> Result<HashMap<String, String>, Error> {
        self.begin(1)?;
        Ok(self.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn execute_batch(&self, ops: Vec<StoreOp>) -> Result<Vec<StoreReply>, Error> {
        self.begin(ops.len())?;
        if self.take_delete_failure(&ops) {
            return Err(Error::Unavailable("injected field delete failure".into()));
        }
        let now = Instant::now();
        let mut keyspace = self.lock();

        let replies = ops
            .into_iter()
            .map(|op| match op {
                StoreOp::SetField { key, field, value } => {
                    keyspace.hash_mut(&key).insert(field, value);
                    StoreReply::Done
                }
                StoreOp::SetWithTtl { key, value, ttl } => {
                    keyspace.hashes.remove(&key);
                    keyspace.values.insert(key, (value, now + ttl));
                    StoreReply::Done
                }
                StoreOp::Exists { key } => StoreReply::Exists(keyspace.exists(&key, now)),
                StoreOp::DeleteFields { key, fields } => {
                    StoreReply::Removed(keyspace.delete_fields(&key, &fields))
                }
                StoreOp::DeleteKey { key } => {
                    StoreReply::Removed(u64::from(keyspace.delete_key(&key, now)))
                }
            })
            .collect();
        Ok(replies)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("round_trips", &self.round_trips())
            .field("op_count", &self.op_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_marker_expires_with_tokio_clock() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("marker", "1", Duration::from_secs(3))
            .await
            .unwrap();
        assert!(store.exists("marker").await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.exists("marker").await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!store.exists("marker").await.unwrap());
    }

    #[tokio::test]
    async fn test_batch_counts_one_round_trip() {
        let store = MemoryStore::new();
        let replies = store
            .execute_batch(vec![
                StoreOp::SetField {
                    key: "h".into(),
                    field: "a".into(),
                    value: "1".into(),
                },
                StoreOp::SetField {
                    key: "h".into(),
                    field: "b".into(),
                    value: "2".into(),
                },
                StoreOp::DeleteFields {
                    key: "h".into(),
                    fields: vec!["a".into(), "missing".into()],
                },
            ])
            .await
            .unwrap();

        assert_eq!(
            replies,
            vec![StoreReply::Done, StoreReply::Done, StoreReply::Removed(1)]
        );
        assert_eq!(store.round_trips(), 1);
        assert_eq!(store.op_count(), 3);

        let fields = store.get_all_fields("h").await.unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["b"], "2");
    }

    #[tokio::test]
    async fn test_clones_share_keyspace() {
        let a = MemoryStore::new();
        let b = a.clone();
        a.set_field("h", "x", "1").await.unwrap();
        assert_eq!(b.get_all_fields("h").await.unwrap()["x"], "1");
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get_all_fields("h").await,
            Err(Error::Unavailable(_))
        ));
        assert!(store.exists("k").await.is_err());

        store.set_available(true);
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_delete_failure_hits_only_field_deletes() {
        let store = MemoryStore::new();
        store.set_field("h", "a", "1").await.unwrap();
        store.fail_next_field_deletes(1);

        assert!(store.exists("h").await.unwrap());
        assert!(matches!(
            store.delete_fields("h", &["a".to_string()]).await,
            Err(Error::Unavailable(_))
        ));
        assert_eq!(store.get_all_fields("h").await.unwrap().len(), 1);

        assert_eq!(store.delete_fields("h", &["a".to_string()]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_key_is_idempotent() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("k", "1", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(store.delete_key("k").await.unwrap(), 1);
        assert_eq!(store.delete_key("k").await.unwrap(), 0);
    }
}
