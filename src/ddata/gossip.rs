use anyhow::Result;
use dashmap::DashMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, oneshot};

use super::crdt::{LwwMap, Versioned, now_ms};
use super::protocol::{DataMessage, MAX_DATAGRAM, MAX_PAYLOAD, encode_gossip};
use super::store::{PeerSource, ReplicatedStore, WriteFuture};
use super::types::{AckUpdate, ClaimTable, ClusterAddress, StoreChanged, WriteConsistency};
use crate::config::ReplicatorConfig;
use crate::error::ReplicationError;

const CHANGE_BUFFER: usize = 1_024;

/// Replicated store that spreads a `LwwMap` over UDP.
///
/// Anti-entropy runs as push gossip of the full map to one random peer per
/// round. Writes that ask for more than local consistency are additionally
/// pushed to every peer and complete once enough peers acknowledged them.
///
/// Every live node rewrites its key on each registry tick, so an entry older
/// than the tombstone retention belongs to a node that stopped writing. Such
/// tombstones are purged and such entries are refused on receipt, so a stale
/// replica cannot bring a purged key back.
pub struct GossipReplicator {
    state: Arc<ReplicatorState>,
}

struct ReplicatorState {
    own_address: ClusterAddress,
    map: LwwMap,
    socket: UdpSocket,
    peers: Arc<dyn PeerSource>,
    changes: broadcast::Sender<StoreChanged>,
    pending: DashMap<u64, PendingWrite>,
    next_ack_id: AtomicU64,
    gossip_interval: Duration,
    tombstone_retention_ms: u64,
}

struct PendingWrite {
    acked_by: HashSet<SocketAddr>,
    required: usize,
    done: oneshot::Sender<()>,
}

impl GossipReplicator {
    pub async fn new(
        bind_addr: SocketAddr,
        own_address: ClusterAddress,
        peers: Arc<dyn PeerSource>,
        config: &ReplicatorConfig,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);

        tracing::info!(
            "Replicator for {} bound to {}",
            own_address,
            socket.local_addr()?
        );

        Ok(Arc::new(Self {
            state: Arc::new(ReplicatorState {
                own_address,
                map: LwwMap::new(),
                socket,
                peers,
                changes,
                pending: DashMap::new(),
                next_ack_id: AtomicU64::new(1),
                gossip_interval: config.gossip_interval(),
                tombstone_retention_ms: config.tombstone_retention_ms,
            }),
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.state.socket.local_addr()?)
    }

    pub async fn start(self: Arc<Self>) {
        tracing::info!("Starting replicator...");

        let _gossip_handle = {
            let state = self.state.clone();
            tokio::spawn(async move {
                state.gossip_loop().await;
            })
        };

        let _receive_handle = {
            let state = self.state.clone();
            tokio::spawn(async move {
                state.receive_loop().await;
            })
        };

        tracing::info!("Replicator background tasks started");
    }

    /// Pushes the full local map to every peer once.
    pub async fn gossip_now(&self) {
        for peer in self.state.peers.peers() {
            self.state.send_gossip(peer).await;
        }
    }

    fn replicate(
        &self,
        key: ClusterAddress,
        entry: Versioned,
        consistency: WriteConsistency,
    ) -> WriteFuture {
        let peers = self.state.peers.peers();
        let required = consistency.required_acks(peers.len());
        if required == 0 {
            return Box::pin(std::future::ready(Ok(())));
        }

        let timeout = consistency
            .timeout()
            .unwrap_or_else(|| self.state.gossip_interval);
        let ack_id = self.state.next_ack_id.fetch_add(1, Ordering::Relaxed);
        let (done, completed) = oneshot::channel();
        self.state.pending.insert(
            ack_id,
            PendingWrite {
                acked_by: HashSet::new(),
                required,
                done,
            },
        );

        let state = self.state.clone();
        Box::pin(async move {
            let msg = DataMessage::Write {
                from: state.own_address.clone(),
                ack_id,
                key,
                entry,
            };
            let encoded = match bincode::serialize(&msg) {
                Ok(encoded) if encoded.len() <= MAX_PAYLOAD => encoded,
                Ok(encoded) => {
                    state.pending.remove(&ack_id);
                    return Err(ReplicationError::Transport(format!(
                        "write of {} bytes exceeds datagram limit",
                        encoded.len()
                    )));
                }
                Err(e) => {
                    state.pending.remove(&ack_id);
                    return Err(ReplicationError::Transport(e.to_string()));
                }
            };

            for peer in &peers {
                if let Err(e) = state.socket.send_to(&encoded, peer).await {
                    tracing::warn!("Failed to push write {} to {}: {}", ack_id, peer, e);
                }
            }

            match tokio::time::timeout(timeout, completed).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(ReplicationError::Closed),
                Err(_) => {
                    let acked = state
                        .pending
                        .remove(&ack_id)
                        .map(|(_, pending)| pending.acked_by.len())
                        .unwrap_or(0);
                    Err(ReplicationError::Timeout { acked, required })
                }
            }
        })
    }
}

impl ReplicatedStore for GossipReplicator {
    fn write(
        &self,
        key: ClusterAddress,
        update: AckUpdate,
        consistency: WriteConsistency,
    ) -> WriteFuture {
        let entry = self.state.map.put(key.clone(), update);
        self.state.notify(vec![key.clone()]);
        self.replicate(key, entry, consistency)
    }

    fn remove_address(&self, key: ClusterAddress, consistency: WriteConsistency) -> WriteFuture {
        match self.state.map.remove(&key) {
            Some(tombstone) => {
                tracing::info!("Removed replicated entry of {}", key);
                self.state.notify(vec![key.clone()]);
                self.replicate(key, tombstone, consistency)
            }
            None => Box::pin(std::future::ready(Ok(()))),
        }
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<StoreChanged> {
        self.state.changes.subscribe()
    }

    fn table(&self) -> ClaimTable {
        self.state.map.table()
    }
}

impl ReplicatorState {
    fn notify(&self, keys: Vec<ClusterAddress>) {
        let _ = self.changes.send(StoreChanged { keys });
    }

    fn retention_cutoff(&self) -> u64 {
        now_ms().saturating_sub(self.tombstone_retention_ms)
    }

    fn purge_expired(&self) {
        let purged = self.map.purge_tombstones(self.retention_cutoff());
        if !purged.is_empty() {
            tracing::debug!("Purged {} expired tombstone(s)", purged.len());
        }
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.gossip_interval);

        loop {
            interval.tick().await;
            self.purge_expired();

            let peers = self.peers.peers();
            if peers.is_empty() || self.map.is_empty() {
                continue;
            }

            use rand::Rng;
            let idx = rand::thread_rng().gen_range(0..peers.len());
            self.send_gossip(peers[idx]).await;
        }
    }

    async fn send_gossip(&self, target: SocketAddr) {
        let batches = match encode_gossip(&self.own_address, self.map.snapshot(), MAX_PAYLOAD) {
            Ok(batches) => batches,
            Err(e) => {
                tracing::error!("Failed to serialize DataMessage::Gossip: {}", e);
                return;
            }
        };

        for key in &batches.oversized {
            tracing::error!("Entry of {} exceeds datagram limit, not gossiped", key);
        }

        for datagram in &batches.datagrams {
            if let Err(e) = self.socket.send_to(datagram, target).await {
                tracing::warn!("Failed to gossip to {}: {}", target, e);
                return;
            }
        }
        tracing::debug!(
            "Gossiped {} entries to {} in {} datagram(s)",
            self.map.len(),
            target,
            batches.datagrams.len()
        );
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match bincode::deserialize::<DataMessage>(&buf[..len]) {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg, src).await {
                            tracing::error!("Error handling data message from {}: {}", src, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to deserialize data message from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_message(&self, msg: DataMessage, src: SocketAddr) -> Result<()> {
        match msg {
            DataMessage::Gossip { from, entries } => {
                let cutoff = self.retention_cutoff();
                let changed = self.map.merge_all(
                    entries
                        .into_iter()
                        .filter(|(_, entry)| entry.version >= cutoff),
                );
                if !changed.is_empty() {
                    tracing::debug!("Gossip from {} changed {} key(s)", from, changed.len());
                    self.notify(changed);
                }
            }

            DataMessage::Write {
                from,
                ack_id,
                key,
                entry,
            } => {
                if entry.version >= self.retention_cutoff()
                    && self.map.merge_entry(key.clone(), entry)
                {
                    tracing::debug!("Write from {} changed {}", from, key);
                    self.notify(vec![key]);
                }

                let reply = bincode::serialize(&DataMessage::WriteAck { ack_id })?;
                self.socket.send_to(&reply, src).await?;
            }

            DataMessage::WriteAck { ack_id } => {
                self.handle_write_ack(ack_id, src);
            }
        }

        Ok(())
    }

    fn handle_write_ack(&self, ack_id: u64, src: SocketAddr) {
        let completed = match self.pending.get_mut(&ack_id) {
            Some(mut pending) => {
                pending.acked_by.insert(src);
                pending.acked_by.len() >= pending.required
            }
            None => {
                tracing::trace!("Late ack {} from {}", ack_id, src);
                false
            }
        };

        if completed && let Some((_, pending)) = self.pending.remove(&ack_id) {
            let _ = pending.done.send(());
        }
    }
}
