//! Multi-process scenarios for server-registry.
//!
//! Each `ServerRegistry` stands in for one server process; they share a
//! `MemoryStore` the way real processes share a Redis.

use chrono::Utc;
use server_registry::{
    deregister, start_registry, stop_registry, write_heartbeat, MemoryStore, RegistryConfig,
    RegistryKeys, ServerIdentity, ServerRegistry,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const INTERVAL: Duration = Duration::from_secs(1);
const TTL: Duration = Duration::from_secs(3);

fn config(id: &str) -> RegistryConfig {
    RegistryConfig::default()
        .with_server_id(id)
        .with_heartbeat_interval(INTERVAL)
        .with_ttl(TTL)
}

fn keys() -> RegistryKeys {
    RegistryKeys::new("server:registry")
}

/// Let every registry run exactly one more tick.
async fn one_tick() {
    sleep(INTERVAL + Duration::from_millis(100)).await;
}

#[tokio::test(start_paused = true)]
async fn test_two_servers_rank_then_one_leaves() {
    let store = MemoryStore::new();

    let a = start_registry(store.clone(), config("x-1")).await.unwrap();
    let b = start_registry(store.clone(), config("x-2")).await.unwrap();
    one_tick().await;

    assert_eq!(a.get_cached_server_count(), 2);
    assert_eq!(b.get_cached_server_count(), 2);
    assert_eq!(a.get_cached_server_index(), Some(0));
    assert_eq!(b.get_cached_server_index(), Some(1));

    stop_registry(&b).await;
    one_tick().await;

    assert_eq!(a.get_cached_server_count(), 1);
    assert_eq!(a.get_cached_server_index(), Some(0));
    assert_eq!(b.get_cached_server_count(), 0);
    assert_eq!(b.get_cached_server_index(), None);

    stop_registry(&a).await;
}

#[tokio::test(start_paused = true)]
async fn test_crashed_peer_is_evicted_after_ttl() {
    let store = MemoryStore::new();
    let a = start_registry(store.clone(), config("x-2")).await.unwrap();

    // A peer that heartbeats once and then disappears without deregistering.
    let crashed = ServerIdentity::resolve(Some("x-1"));
    write_heartbeat(&store, &keys(), &crashed, Utc::now(), TTL)
        .await
        .unwrap();
    one_tick().await;
    assert_eq!(a.get_cached_server_count(), 2);
    assert_eq!(a.get_cached_server_index(), Some(1));

    sleep(TTL).await;

    assert_eq!(a.get_cached_server_count(), 1);
    assert_eq!(a.get_cached_server_index(), Some(0));
    let fields = store_fields(&store).await;
    assert!(!fields.contains(&"x-1".to_string()), "dead record should be collected");

    stop_registry(&a).await;
}

#[tokio::test(start_paused = true)]
async fn test_ranks_follow_natural_order() {
    let store = MemoryStore::new();
    let mut registries = Vec::new();
    for id in ["server-10", "server-2", "server-1"] {
        registries.push(start_registry(store.clone(), config(id)).await.unwrap());
    }
    one_tick().await;

    let ranks: Vec<(String, Option<usize>)> = registries
        .iter()
        .map(|r| (r.server_id().to_string(), r.get_cached_server_index()))
        .collect();
    assert_eq!(
        ranks,
        vec![
            ("server-10".to_string(), Some(2)),
            ("server-2".to_string(), Some(1)),
            ("server-1".to_string(), Some(0)),
        ]
    );

    let listed: Vec<String> = registries[0]
        .get_cached_active_servers()
        .into_iter()
        .map(|s| s.server_id)
        .collect();
    assert_eq!(listed, vec!["server-1", "server-2", "server-10"]);

    for r in &registries {
        stop_registry(r).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_rank_survives_restart_with_same_id() {
    let store = MemoryStore::new();
    let ids = ["pod-3", "pod-1", "pod-2"];

    let mut first = Vec::new();
    for id in ids {
        first.push(start_registry(store.clone(), config(id)).await.unwrap());
    }
    one_tick().await;
    let before: Vec<Option<usize>> = first.iter().map(|r| r.get_cached_server_index()).collect();
    for r in &first {
        stop_registry(r).await;
    }
    drop(first);

    let mut second = Vec::new();
    for id in ids.iter().rev() {
        second.push(start_registry(store.clone(), config(id)).await.unwrap());
    }
    one_tick().await;
    let mut after: Vec<Option<usize>> = second.iter().map(|r| r.get_cached_server_index()).collect();
    after.reverse();

    assert_eq!(before, after);
    assert_eq!(before, vec![Some(2), Some(0), Some(1)]);

    for r in &second {
        stop_registry(r).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_store_outage_degrades_then_recovers() {
    let store = MemoryStore::new();
    let a = start_registry(store.clone(), config("x-1")).await.unwrap();
    let b = start_registry(store.clone(), config("x-2")).await.unwrap();
    one_tick().await;

    store.set_available(false);
    sleep(TTL + INTERVAL).await;

    // Cached views hold the last good snapshot while the store is down.
    assert_eq!(a.get_cached_server_count(), 2);
    assert!(a.get_active_server_count().await.is_err());

    store.set_available(true);
    // Markers lapsed during the outage; whichever peer ticks first may evict
    // the other until it heartbeats again, so allow a second cycle.
    one_tick().await;
    one_tick().await;
    assert_eq!(a.get_cached_server_count(), 2);
    assert_eq!(b.get_cached_server_index(), Some(1));

    stop_registry(&a).await;
    stop_registry(&b).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_never_see_torn_snapshot() {
    let store = MemoryStore::new();
    let registry = ServerRegistry::new(store.clone(), config("peer-5")).unwrap();
    registry.start().await.unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let mut readers = Vec::new();
    for _ in 0..4 {
        let handle = registry.snapshot();
        let done = done.clone();
        readers.push(std::thread::spawn(move || {
            let mut reads = 0u64;
            loop {
                let snapshot = handle.load();
                assert_eq!(snapshot.count(), snapshot.servers().len());
                if let Some(index) = snapshot.my_index() {
                    assert!(index < snapshot.count());
                    assert_eq!(snapshot.servers()[index].server_id, "peer-5");
                }
                reads += 1;
                if done.load(Ordering::Relaxed) {
                    break reads;
                }
            }
        }));
    }

    let store_keys = keys();
    for round in 0..200 {
        let id = format!("peer-{}", round % 10);
        if id == "peer-5" {
            continue;
        }
        let peer = ServerIdentity::resolve(Some(&id));
        if round % 3 == 0 {
            deregister(&store, &store_keys, &id).await.unwrap();
        } else {
            write_heartbeat(&store, &store_keys, &peer, Utc::now(), TTL)
                .await
                .unwrap();
        }
        registry.refresh().await.unwrap();
    }

    done.store(true, Ordering::Relaxed);
    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
    registry.stop().await;
}

async fn store_fields(store: &MemoryStore) -> Vec<String> {
    use server_registry::RegistryStore;
    store
        .get_all_fields("server:registry")
        .await
        .unwrap()
        .into_keys()
        .collect()
}
