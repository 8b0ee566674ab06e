use chrono::Utc;

use crate::config::RegistryKeys;
use crate::natural::natural_cmp;
use crate::record::ServerRecord;
use crate::snapshot::RegistrySnapshot;
use crate::store::{expect_replies, RegistryStore, StoreOp};
use crate::Error;

/// What one reconciliation pass saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub snapshot: RegistrySnapshot,
    /// Ids found without a liveness marker or with an unreadable record.
    pub evicted: Vec<String>,
}

/// Run one reconciliation pass and return the new view.
///
/// Costs two round trips regardless of fleet size (read all records, then
/// one batched existence check of every marker) plus one best-effort delete
/// when dead entries were found. Any peer may collect any dead entry; a
/// failed delete is retried by whoever refreshes next.
pub async fn reconcile(
    store: &dyn RegistryStore,
    keys: &RegistryKeys,
    my_server_id: &str,
) -> Result<RefreshOutcome, Error> {
    let mut entries: Vec<(String, String)> =
        store.get_all_fields(keys.registry()).await?.into_iter().collect();
    // Hash order is arbitrary; fix it so ties sort the same on every peer.
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let liveness = if entries.is_empty() {
        Vec::new()
    } else {
        let ops = entries
            .iter()
            .map(|(server_id, _)| StoreOp::Exists {
                key: keys.ttl_marker(server_id),
            })
            .collect();
        let replies = store.execute_batch(ops).await?;
        expect_replies(&replies, entries.len())?;
        replies
            .iter()
            .map(|reply| reply.as_exists())
            .collect::<Result<Vec<bool>, Error>>()?
    };

    let mut alive = Vec::with_capacity(entries.len());
    let mut evicted = Vec::new();
    for ((server_id, raw), has_marker) in entries.into_iter().zip(liveness) {
        match parse_entry(&server_id, &raw) {
            Some(record) if has_marker => alive.push(record),
            Some(_) => evicted.push(server_id),
            None => {
                tracing::debug!(%server_id, "Unreadable registry record, treating as dead");
                evicted.push(server_id);
            }
        }
    }

    if !evicted.is_empty() {
        match store.delete_fields(keys.registry(), &evicted).await {
            Ok(removed) => {
                tracing::info!(
                    count = evicted.len(),
                    removed,
                    "Evicted dead servers from registry"
                );
            }
            Err(e) => {
                tracing::warn!(count = evicted.len(), "Failed to evict dead servers: {}", e);
            }
        }
    }

    alive.sort_by(|a, b| natural_cmp(&a.server_id, &b.server_id));

    Ok(RefreshOutcome {
        snapshot: RegistrySnapshot::new(alive, my_server_id, Utc::now()),
        evicted,
    })
}

/// A record is usable only if it parses and agrees with the field it sits in.
fn parse_entry(server_id: &str, raw: &str) -> Option<ServerRecord> {
    ServerRecord::from_json(raw)
        .ok()
        .filter(|record| record.server_id == server_id)
}
