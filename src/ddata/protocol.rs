//! Replicator Wire Protocol
//!
//! Messages exchanged between `GossipReplicator`s over UDP, encoded with bincode.
//!
//! - `Gossip`: full-state push to one random peer per round (anti-entropy),
//!   split over as many datagrams as the map needs.
//! - `Write`/`WriteAck`: direct replication of one key when a write asks for
//!   more than local consistency.

use serde::{Deserialize, Serialize};

use super::crdt::Versioned;
use super::types::ClusterAddress;

/// Largest datagram the replicator will read.
pub const MAX_DATAGRAM: usize = 65_536;

/// Largest payload the replicator will send, below the IPv4 UDP limit of 65 507 bytes.
pub const MAX_PAYLOAD: usize = 60_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DataMessage {
    Gossip {
        from: ClusterAddress,
        entries: Vec<(ClusterAddress, Versioned)>,
    },

    Write {
        from: ClusterAddress,
        ack_id: u64,
        key: ClusterAddress,
        entry: Versioned,
    },

    WriteAck {
        ack_id: u64,
    },
}

/// Encodes a full-state push as `Gossip` datagrams of at most `limit` bytes each.
///
/// Entries are packed greedily in the given order. An entry that does not fit
/// into a datagram on its own is left out and its key returned in `oversized`.
pub fn encode_gossip(
    from: &ClusterAddress,
    entries: Vec<(ClusterAddress, Versioned)>,
    limit: usize,
) -> bincode::Result<GossipBatches> {
    // bincode lays a `Vec` out as a fixed length prefix followed by its
    // elements, so a message size is the empty message plus each entry.
    let header = bincode::serialized_size(&DataMessage::Gossip {
        from: from.clone(),
        entries: Vec::new(),
    })? as usize;

    let mut batches = GossipBatches::default();
    let mut batch = Vec::new();
    let mut size = header;

    for entry in entries {
        let entry_size = bincode::serialized_size(&entry)? as usize;
        if header + entry_size > limit {
            batches.oversized.push(entry.0);
            continue;
        }
        if size + entry_size > limit {
            batches.push(from, std::mem::take(&mut batch))?;
            size = header;
        }
        size += entry_size;
        batch.push(entry);
    }

    if !batch.is_empty() {
        batches.push(from, batch)?;
    }
    Ok(batches)
}

#[derive(Debug, Default)]
pub struct GossipBatches {
    pub datagrams: Vec<Vec<u8>>,
    pub oversized: Vec<ClusterAddress>,
}

impl GossipBatches {
    fn push(
        &mut self,
        from: &ClusterAddress,
        entries: Vec<(ClusterAddress, Versioned)>,
    ) -> bincode::Result<()> {
        let encoded = bincode::serialize(&DataMessage::Gossip {
            from: from.clone(),
            entries,
        })?;
        self.datagrams.push(encoded);
        Ok(())
    }
}
