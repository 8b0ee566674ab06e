//! Server registry over a shared key-value store.
//!
//! Horizontally scaled server processes use this crate to learn which peers
//! are alive and where they themselves rank among them:
//! - Heartbeat writes a record plus a self-expiring liveness marker
//!   (10s interval, 30s TTL by default)
//! - Each tick reconciles the full registry in two round trips, evicts
//!   entries whose marker expired, and sorts survivors in natural order
//! - The result is published as an immutable snapshot that hot loops read
//!   without touching the store
//! - Graceful deregistration on stop; crashed peers expire through the TTL
//!
//! This is a best-effort, eventually consistent liveness view. It does not
//! elect leaders or fence writers.
//!
//! # Example
//!
//! ```rust,ignore
//! use server_registry::{start_registry, stop_registry, RedisStore, RegistryConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = RedisStore::connect(&std::env::var("REDIS_URL")?).await?;
//!     let registry = start_registry(store, RegistryConfig::from_env()?).await?;
//!
//!     // Every simulation tick: free, never blocks.
//!     let shard_count = registry.get_cached_server_count();
//!     let my_shard = registry.get_cached_server_index();
//!
//!     stop_registry(&registry).await;
//!     Ok(())
//! }
//! ```
//!
//! # Rank stability
//!
//! Ranks come from sorting server ids, so a process keeps its rank across
//! restarts only if it keeps its id. Set `SERVER_ID` explicitly for that;
//! the `<hostname>-<pid>` fallback changes with every restart.

pub mod config;
mod error;
mod heartbeat;
mod identity;
mod memory_store;
mod natural;
mod record;
mod redis_store;
mod refresh;
mod registry;
mod snapshot;
mod store;

pub use config::{RegistryConfig, RegistryKeys};
pub use error::Error;
pub use heartbeat::{deregister, write_heartbeat};
pub use identity::ServerIdentity;
pub use memory_store::MemoryStore;
pub use natural::{natural_cmp, split_numeric_suffix};
pub use record::ServerRecord;
pub use redis_store::RedisStore;
pub use refresh::{reconcile, RefreshOutcome};
pub use registry::{start_registry, stop_registry, LifecycleState, MembershipEvent, ServerRegistry};
pub use snapshot::{RegistrySnapshot, SnapshotHandle};
pub use store::{RegistryStore, StoreOp, StoreReply};
