use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use siphasher::sip::SipHasher24;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::record::ServerRecord;

/// Immutable view of the registry as of one refresh.
///
/// `count == servers.len()` and `my_index` is either `None` or below
/// `count`; [`RegistrySnapshot::new`] is the only way to build one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegistrySnapshot {
    servers: Vec<ServerRecord>,
    my_index: Option<usize>,
    updated_at: Option<DateTime<Utc>>,
}

impl RegistrySnapshot {
    /// Build a snapshot from an already sorted alive list.
    pub fn new(servers: Vec<ServerRecord>, my_server_id: &str, updated_at: DateTime<Utc>) -> Self {
        let my_index = servers.iter().position(|s| s.server_id == my_server_id);
        Self {
            servers,
            my_index,
            updated_at: Some(updated_at),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn servers(&self) -> &[ServerRecord] {
        &self.servers
    }

    pub fn count(&self) -> usize {
        self.servers.len()
    }

    /// Rank of this process among alive servers, `None` when not listed.
    pub fn my_index(&self) -> Option<usize> {
        self.my_index
    }

    /// Rank with `-1` standing in for "not listed".
    pub fn index_or_sentinel(&self) -> i64 {
        self.my_index.map_or(-1, |i| i as i64)
    }

    /// When this snapshot was computed; `None` before the first refresh.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn server_ids(&self) -> impl Iterator<Item = &str> {
        self.servers.iter().map(|s| s.server_id.as_str())
    }

    /// Whether shard `shard` belongs to this process (`shard % count`).
    pub fn owns_shard(&self, shard: usize) -> bool {
        match self.my_index {
            Some(index) => shard % self.count() == index,
            None => false,
        }
    }

    /// Whether this process owns `key` when keys are spread over the ranks.
    pub fn should_handle(&self, key: &str) -> bool {
        if self.my_index.is_none() {
            return false;
        }
        let mut hasher = SipHasher24::new();
        key.hash(&mut hasher);
        let bucket = hasher.finish() % self.count() as u64;
        self.owns_shard(bucket as usize)
    }
}

/// Shared handle to the current [`RegistrySnapshot`].
///
/// Reads are a lock-free pointer load and never touch the store. The refresh
/// cycle is the single writer and replaces the whole snapshot at once, so a
/// reader sees either the previous snapshot or the new one, never a mix.
#[derive(Clone)]
pub struct SnapshotHandle {
    current: Arc<ArcSwap<RegistrySnapshot>>,
}

impl Default for SnapshotHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotHandle {
    pub fn new() -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(RegistrySnapshot::empty())),
        }
    }

    /// The whole current snapshot; use this when several fields must agree.
    pub fn load(&self) -> Arc<RegistrySnapshot> {
        self.current.load_full()
    }

    pub fn cached_server_count(&self) -> usize {
        self.current.load().count()
    }

    pub fn cached_server_index(&self) -> Option<usize> {
        self.current.load().my_index()
    }

    pub fn cached_active_servers(&self) -> Vec<ServerRecord> {
        self.current.load().servers().to_vec()
    }

    pub fn owns_shard(&self, shard: usize) -> bool {
        self.current.load().owns_shard(shard)
    }

    pub fn should_handle(&self, key: &str) -> bool {
        self.current.load().should_handle(key)
    }

    pub(crate) fn publish(&self, snapshot: RegistrySnapshot) {
        self.current.store(Arc::new(snapshot));
    }

    pub(crate) fn clear(&self) {
        self.publish(RegistrySnapshot::empty());
    }
}

impl std::fmt::Debug for SnapshotHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SnapshotHandle")
            .field(&*self.current.load())
            .finish()
    }
}
