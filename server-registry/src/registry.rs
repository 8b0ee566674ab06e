use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{RegistryConfig, RegistryKeys};
use crate::heartbeat::{deregister, write_heartbeat};
use crate::identity::ServerIdentity;
use crate::record::ServerRecord;
use crate::refresh::{reconcile, RefreshOutcome};
use crate::snapshot::{RegistrySnapshot, SnapshotHandle};
use crate::store::RegistryStore;
use crate::Error;

/// Membership change seen by this process's refresh cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipEvent {
    Joined(String),
    Left(String),
}

/// Lifecycle of a [`ServerRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl LifecycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Everything a tick needs, shared between the controller and its task.
struct Shared {
    store: Arc<dyn RegistryStore>,
    keys: RegistryKeys,
    identity: ServerIdentity,
    ttl: Duration,
    snapshot: SnapshotHandle,
    event_tx: broadcast::Sender<MembershipEvent>,
    /// Serializes refresh-and-publish so a forced refresh and a tick never
    /// interleave their membership diffs. `stop` clears the snapshot under it.
    refresh_lock: Mutex<()>,
    state: AtomicU8,
    /// Stamped by the first `start` and kept across restarts.
    started_at: OnceLock<DateTime<Utc>>,
}

impl Shared {
    fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: LifecycleState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn started_at(&self) -> DateTime<Utc> {
        *self.started_at.get_or_init(Utc::now)
    }

    async fn heartbeat(&self) -> Result<ServerRecord, Error> {
        write_heartbeat(
            self.store.as_ref(),
            &self.keys,
            &self.identity,
            self.started_at(),
            self.ttl,
        )
        .await
    }

    async fn refresh(&self) -> Result<Arc<RegistrySnapshot>, Error> {
        let _guard = self.refresh_lock.lock().await;
        let outcome = reconcile(self.store.as_ref(), &self.keys, &self.identity.server_id).await?;
        if self.state() == LifecycleState::Stopped {
            // Not registered, so the result is returned but never cached.
            return Ok(Arc::new(outcome.snapshot));
        }
        Ok(self.publish(outcome))
    }

    async fn clear(&self) {
        let _guard = self.refresh_lock.lock().await;
        self.snapshot.clear();
        self.set_state(LifecycleState::Stopped);
    }

    fn publish(&self, outcome: RefreshOutcome) -> Arc<RegistrySnapshot> {
        let previous = self.snapshot.load();
        let next = outcome.snapshot;

        let (joined, left) = {
            let before: HashSet<&str> = previous.server_ids().collect();
            let after: HashSet<&str> = next.server_ids().collect();
            let joined: Vec<String> = after.difference(&before).map(|id| id.to_string()).collect();
            let left: Vec<String> = before.difference(&after).map(|id| id.to_string()).collect();
            (joined, left)
        };

        if !joined.is_empty() || !left.is_empty() {
            tracing::debug!(
                server_id = %self.identity.server_id,
                count = next.count(),
                index = next.index_or_sentinel(),
                joined = joined.len(),
                left = left.len(),
                "Registry membership changed"
            );
        }

        self.snapshot.publish(next);

        // Events go out only after the new snapshot is visible.
        for id in joined {
            let _ = self.event_tx.send(MembershipEvent::Joined(id));
        }
        for id in left {
            let _ = self.event_tx.send(MembershipEvent::Left(id));
        }
        self.snapshot.load()
    }

    async fn initial_cycle(&self) -> Result<Arc<RegistrySnapshot>, Error> {
        self.heartbeat().await?;
        self.refresh().await
    }

    async fn tick(&self) -> Result<(), Error> {
        self.heartbeat().await?;
        self.refresh().await?;
        Ok(())
    }
}

struct Lifecycle {
    cancel_token: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

/// Registry participant for one server process.
///
/// `start` publishes this process and begins the heartbeat/refresh timer;
/// `stop` ends it and removes the entry. In between, the cached accessors
/// answer from memory and are safe to call every simulation tick, while the
/// live accessors pay for a fresh reconciliation pass.
pub struct ServerRegistry {
    shared: Arc<Shared>,
    heartbeat_interval: Duration,
    lifecycle: Mutex<Lifecycle>,
}

impl ServerRegistry {
    /// Build a stopped registry.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `config` fails validation.
    pub fn new(store: impl RegistryStore + 'static, config: RegistryConfig) -> Result<Self, Error> {
        Self::with_store(Arc::new(store), config)
    }

    /// Build a stopped registry over a shared store handle.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `config` fails validation.
    pub fn with_store(store: Arc<dyn RegistryStore>, config: RegistryConfig) -> Result<Self, Error> {
        config.validate()?;
        let identity = ServerIdentity::resolve(config.server_id.as_deref());
        let (event_tx, _) = broadcast::channel(16);

        Ok(Self {
            shared: Arc::new(Shared {
                store,
                keys: config.keys(),
                identity,
                ttl: config.ttl,
                snapshot: SnapshotHandle::new(),
                event_tx,
                refresh_lock: Mutex::new(()),
                state: AtomicU8::new(LifecycleState::Stopped as u8),
                started_at: OnceLock::new(),
            }),
            heartbeat_interval: config.heartbeat_interval,
            lifecycle: Mutex::new(Lifecycle {
                cancel_token: None,
                task: None,
            }),
        })
    }

    /// Register with the fleet and start the periodic timer.
    ///
    /// Runs one heartbeat and one refresh before returning, so the cached
    /// view already contains this process. Does nothing unless stopped.
    ///
    /// # Errors
    ///
    /// Returns the store error if the initial heartbeat or refresh fails; the
    /// registry is then left stopped.
    pub async fn start(&self) -> Result<(), Error> {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.state() != LifecycleState::Stopped {
            tracing::debug!(server_id = %self.server_id(), "Registry already started");
            return Ok(());
        }
        self.set_state(LifecycleState::Starting);

        let snapshot = match self.shared.initial_cycle().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.set_state(LifecycleState::Stopped);
                return Err(e);
            }
        };

        let cancel_token = CancellationToken::new();
        let task = Self::spawn_tick_task(
            self.shared.clone(),
            cancel_token.clone(),
            self.heartbeat_interval,
        );
        lifecycle.cancel_token = Some(cancel_token);
        lifecycle.task = Some(task);
        self.set_state(LifecycleState::Running);

        tracing::info!(
            server_id = %self.server_id(),
            count = snapshot.count(),
            index = snapshot.index_or_sentinel(),
            "Registered server in registry"
        );
        Ok(())
    }

    /// Stop the timer and remove this process's entry.
    ///
    /// Does nothing unless running. If the store is unreachable the entry is
    /// left to expire through its TTL.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.state() != LifecycleState::Running {
            tracing::debug!(server_id = %self.server_id(), "Registry not running, stop ignored");
            return;
        }
        self.set_state(LifecycleState::Stopping);

        // Cancel first so no tick can re-register after the delete.
        if let Some(token) = lifecycle.cancel_token.take() {
            token.cancel();
        }
        if let Some(task) = lifecycle.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Registry tick task ended abnormally: {}", e);
            }
        }

        if let Err(e) = deregister(
            self.shared.store.as_ref(),
            &self.shared.keys,
            &self.shared.identity.server_id,
        )
        .await
        {
            tracing::warn!(
                server_id = %self.server_id(),
                ttl_secs = self.shared.ttl.as_secs(),
                "Deregistration failed, entry will expire: {}",
                e
            );
        }

        self.shared.clear().await;
    }

    fn spawn_tick_task(
        shared: Arc<Shared>,
        cancel_token: CancellationToken,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            // The first cycle already ran inside `start`.
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut consecutive_failures: u32 = 0;

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let result = tokio::select! {
                    biased;
                    _ = cancel_token.cancelled() => break,
                    result = shared.tick() => result,
                };

                match result {
                    Ok(()) => {
                        if consecutive_failures > 0 {
                            tracing::info!(
                                server_id = %shared.identity.server_id,
                                failures = consecutive_failures,
                                "Registry store reachable again"
                            );
                        }
                        consecutive_failures = 0;
                    }
                    Err(e) => {
                        consecutive_failures = consecutive_failures.saturating_add(1);
                        let missed = interval.saturating_mul(consecutive_failures);
                        if missed >= shared.ttl {
                            tracing::warn!(
                                server_id = %shared.identity.server_id,
                                failures = consecutive_failures,
                                "Registry tick failed past the liveness TTL, peers may evict us: {}",
                                e
                            );
                        } else {
                            tracing::warn!(
                                server_id = %shared.identity.server_id,
                                failures = consecutive_failures,
                                "Registry tick failed: {}",
                                e
                            );
                        }
                    }
                }
            }
            tracing::debug!(server_id = %shared.identity.server_id, "Registry tick task shutting down");
        })
    }

    fn set_state(&self, state: LifecycleState) {
        self.shared.set_state(state);
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.state()
    }

    /// The resolved id this process registers under.
    pub fn server_id(&self) -> &str {
        &self.shared.identity.server_id
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.shared.identity
    }

    /// Cloneable read handle for callers that should not hold the registry.
    pub fn snapshot(&self) -> SnapshotHandle {
        self.shared.snapshot.clone()
    }

    pub fn get_cached_server_count(&self) -> usize {
        self.shared.snapshot.cached_server_count()
    }

    /// This process's rank, `None` when it is not in the current view.
    pub fn get_cached_server_index(&self) -> Option<usize> {
        self.shared.snapshot.cached_server_index()
    }

    pub fn get_cached_active_servers(&self) -> Vec<ServerRecord> {
        self.shared.snapshot.cached_active_servers()
    }

    pub fn owns_shard(&self, shard: usize) -> bool {
        self.shared.snapshot.owns_shard(shard)
    }

    pub fn should_handle(&self, key: &str) -> bool {
        self.shared.snapshot.should_handle(key)
    }

    /// Subscribe to membership changes.
    ///
    /// Events are broadcast after the snapshot has been replaced.
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Run a reconciliation pass now and publish its result.
    ///
    /// A stopped registry returns the fresh view without caching it.
    ///
    /// # Errors
    ///
    /// Returns the store error; the cached view is left unchanged.
    pub async fn refresh(&self) -> Result<Arc<RegistrySnapshot>, Error> {
        self.shared.refresh().await
    }

    /// Alive servers after a forced refresh.
    ///
    /// # Errors
    ///
    /// Returns the store error rather than a stale view.
    pub async fn get_active_servers(&self) -> Result<Vec<ServerRecord>, Error> {
        Ok(self.refresh().await?.servers().to_vec())
    }

    /// Alive server count after a forced refresh.
    ///
    /// # Errors
    ///
    /// Returns the store error rather than a stale count.
    pub async fn get_active_server_count(&self) -> Result<usize, Error> {
        Ok(self.refresh().await?.count())
    }
}

impl Drop for ServerRegistry {
    fn drop(&mut self) {
        if self.state() == LifecycleState::Running {
            tracing::debug!(
                server_id = %self.server_id(),
                "ServerRegistry dropped while running (stop should be called explicitly)"
            );
        }
        if let Ok(lifecycle) = self.lifecycle.try_lock() {
            if let Some(token) = &lifecycle.cancel_token {
                token.cancel();
            }
        }
    }
}

/// Build a registry from `config` and start it.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the first heartbeat
/// or refresh fails.
pub async fn start_registry(
    store: impl RegistryStore + 'static,
    config: RegistryConfig,
) -> Result<ServerRegistry, Error> {
    let registry = ServerRegistry::new(store, config)?;
    registry.start().await?;
    Ok(registry)
}

/// Stop `registry`; a no-op if it is not running.
pub async fn stop_registry(registry: &ServerRegistry) {
    registry.stop().await;
}
