//! The replicated state store seen by the registry coordinator.

use dashmap::DashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::sync::broadcast;

use super::types::{AckUpdate, ClaimTable, ClusterAddress, StoreChanged, WriteConsistency};
use crate::error::ReplicationError;

/// Completion of a write, resolved once the requested consistency is reached.
pub type WriteFuture = Pin<Box<dyn Future<Output = Result<(), ReplicationError>> + Send>>;

/// A CRDT map from cluster address to that node's published claim set.
///
/// Implementations apply writes to the local replica before returning the
/// future, so `table()` reflects a write as soon as `write` has been called.
pub trait ReplicatedStore: Send + Sync {
    /// Publishes `update` under `key`. Only the owning node writes its key.
    fn write(
        &self,
        key: ClusterAddress,
        update: AckUpdate,
        consistency: WriteConsistency,
    ) -> WriteFuture;

    /// Drops the entry of a departed node.
    fn remove_address(&self, key: ClusterAddress, consistency: WriteConsistency) -> WriteFuture;

    /// Change notifications. Notifications for one key arrive in write order.
    fn subscribe_changes(&self) -> broadcast::Receiver<StoreChanged>;

    /// The merged table of live entries.
    fn table(&self) -> ClaimTable;
}

/// Where the replicator finds the data addresses of its peers.
pub trait PeerSource: Send + Sync {
    fn peers(&self) -> Vec<SocketAddr>;
}

/// A fixed, editable peer list.
#[derive(Debug, Default)]
pub struct StaticPeers {
    addrs: DashSet<SocketAddr>,
}

impl StaticPeers {
    pub fn new(addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
        let peers = Self::default();
        for addr in addrs {
            peers.add(addr);
        }
        peers
    }

    pub fn add(&self, addr: SocketAddr) {
        self.addrs.insert(addr);
    }

    pub fn remove(&self, addr: &SocketAddr) {
        self.addrs.remove(addr);
    }
}

impl PeerSource for StaticPeers {
    fn peers(&self) -> Vec<SocketAddr> {
        self.addrs.iter().map(|addr| *addr).collect()
    }
}
