//! In-process replicated store.
//!
//! Each replica keeps its own map and applies writes synchronously. Replicas
//! only learn about each other through explicit `gossip_from` calls, which
//! makes gossip rounds deterministic in tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

use super::crdt::LwwMap;
use super::store::{ReplicatedStore, WriteFuture};
use super::types::{AckUpdate, ClaimTable, ClusterAddress, StoreChanged, WriteConsistency};
use crate::error::ReplicationError;

const CHANGE_BUFFER: usize = 256;

pub struct InMemoryReplicator {
    map: LwwMap,
    changes: broadcast::Sender<StoreChanged>,
    fail_writes: AtomicBool,
}

impl InMemoryReplicator {
    pub fn new() -> Arc<Self> {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Arc::new(Self {
            map: LwwMap::new(),
            changes,
            fail_writes: AtomicBool::new(false),
        })
    }

    /// Makes every following `write` fail without touching the map.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Pulls the full state of `other` into this replica.
    ///
    /// Returns `true` if anything changed here.
    pub fn gossip_from(&self, other: &InMemoryReplicator) -> bool {
        let changed = self.map.merge_all(other.map.snapshot());
        if changed.is_empty() {
            return false;
        }

        tracing::debug!("In-memory gossip changed {} key(s)", changed.len());
        self.notify(changed);
        true
    }

    fn notify(&self, keys: Vec<ClusterAddress>) {
        // No subscribers is fine: the table is still readable.
        let _ = self.changes.send(StoreChanged { keys });
    }
}

/// Lets every replica gossip with every other one once.
///
/// A single round is enough for all replicas to hold the same map.
pub fn gossip_round(replicas: &[Arc<InMemoryReplicator>]) -> usize {
    let mut changed = 0;
    for (i, target) in replicas.iter().enumerate() {
        for (j, source) in replicas.iter().enumerate() {
            if i != j && target.gossip_from(source) {
                changed += 1;
            }
        }
    }
    changed
}

impl ReplicatedStore for InMemoryReplicator {
    fn write(
        &self,
        key: ClusterAddress,
        update: AckUpdate,
        _consistency: WriteConsistency,
    ) -> WriteFuture {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Box::pin(std::future::ready(Err(ReplicationError::Transport(
                "injected write failure".to_string(),
            ))));
        }

        self.map.put(key.clone(), update);
        self.notify(vec![key]);
        Box::pin(std::future::ready(Ok(())))
    }

    fn remove_address(&self, key: ClusterAddress, _consistency: WriteConsistency) -> WriteFuture {
        if self.map.remove(&key).is_some() {
            self.notify(vec![key]);
        }
        Box::pin(std::future::ready(Ok(())))
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<StoreChanged> {
        self.changes.subscribe()
    }

    fn table(&self) -> ClaimTable {
        self.map.table()
    }
}
