//! Replicated Store Tests
//!
//! ## Test Scopes
//! - **CRDT**: merge precedence, idempotence, commutativity and tombstones.
//! - **Consistency**: acknowledgement counts per level.
//! - **Protocol**: splitting a full-state push over several datagrams.
//! - **In-memory replicator**: notifications, injected failures, gossip rounds.
//! - **Gossip replicator**: acknowledged writes and anti-entropy over loopback UDP.

#[cfg(test)]
mod tests {
    use crate::ddata::crdt::{LwwMap, Versioned};
    use crate::ddata::gossip::GossipReplicator;
    use crate::ddata::memory::{InMemoryReplicator, gossip_round};
    use crate::ddata::protocol::{DataMessage, MAX_PAYLOAD, encode_gossip};
    use crate::ddata::store::{ReplicatedStore, StaticPeers};
    use crate::ddata::types::{AckUpdate, ClusterAddress, GroupedLabels, WriteConsistency};
    use crate::config::ReplicatorConfig;
    use crate::error::ReplicationError;
    use std::sync::Arc;
    use std::time::Duration;

    fn addr(a: &str) -> ClusterAddress {
        ClusterAddress::new(a)
    }

    fn update(group: Option<&str>, labels: &[&str]) -> AckUpdate {
        AckUpdate::new([GroupedLabels::new(group, labels.iter().copied())])
    }

    // ============================================================
    // LWW MAP TESTS
    // ============================================================

    #[test]
    fn test_put_always_advances_version() {
        let map = LwwMap::new();

        let first = map.put(addr("10"), update(None, &["a"]));
        let second = map.put(addr("10"), update(None, &["b"]));

        assert!(second.version > first.version);
        assert_eq!(map.table()[&addr("10")], update(None, &["b"]));
    }

    #[test]
    fn test_merge_keeps_newer_version() {
        let map = LwwMap::new();
        map.merge_entry(
            addr("10"),
            Versioned {
                version: 5,
                value: Some(update(None, &["new"])),
            },
        );

        let changed = map.merge_entry(
            addr("10"),
            Versioned {
                version: 3,
                value: Some(update(None, &["old"])),
            },
        );

        assert!(!changed, "older version must not replace a newer one");
        assert_eq!(map.table()[&addr("10")], update(None, &["new"]));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let map = LwwMap::new();
        let entry = Versioned {
            version: 7,
            value: Some(update(Some("g"), &["x"])),
        };

        assert!(map.merge_entry(addr("10"), entry.clone()));
        assert!(!map.merge_entry(addr("10"), entry));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_merge_is_commutative() {
        let a = Versioned {
            version: 4,
            value: Some(update(None, &["a"])),
        };
        let b = Versioned {
            version: 4,
            value: Some(update(None, &["b"])),
        };

        let left = LwwMap::new();
        left.merge_entry(addr("10"), a.clone());
        left.merge_entry(addr("10"), b.clone());

        let right = LwwMap::new();
        right.merge_entry(addr("10"), b);
        right.merge_entry(addr("10"), a);

        assert_eq!(left.get(&addr("10")), right.get(&addr("10")));
    }

    #[test]
    fn test_tombstone_wins_on_equal_version() {
        let map = LwwMap::new();
        map.merge_entry(
            addr("20"),
            Versioned {
                version: 9,
                value: Some(update(None, &["x"])),
            },
        );

        let changed = map.merge_entry(
            addr("20"),
            Versioned {
                version: 9,
                value: None,
            },
        );

        assert!(changed);
        assert!(map.table().is_empty());
    }

    #[test]
    fn test_remove_then_put_resurrects_key() {
        let map = LwwMap::new();
        let written = map.put(addr("10"), update(None, &["a"]));

        let tombstone = map.remove(&addr("10")).expect("key was live");
        assert_eq!(tombstone.version, written.version + 1);
        assert!(map.table().is_empty());

        // A second removal is a no-op.
        assert!(map.remove(&addr("10")).is_none());

        let rewritten = map.put(addr("10"), update(None, &["a"]));
        assert!(rewritten.version > tombstone.version);
        assert_eq!(map.table().len(), 1);
    }

    #[test]
    fn test_remove_unknown_key_is_noop() {
        let map = LwwMap::new();
        assert!(map.remove(&addr("99")).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn test_purge_drops_only_expired_tombstones() {
        let map = LwwMap::new();
        map.merge_entry(
            addr("10"),
            Versioned {
                version: 100,
                value: None,
            },
        );
        map.merge_entry(
            addr("20"),
            Versioned {
                version: 300,
                value: None,
            },
        );
        map.merge_entry(
            addr("30"),
            Versioned {
                version: 100,
                value: Some(update(None, &["a"])),
            },
        );

        let purged = map.purge_tombstones(200);

        assert_eq!(purged, vec![addr("10")]);
        assert!(map.get(&addr("10")).is_none());
        assert!(map.get(&addr("20")).is_some_and(|entry| entry.is_tombstone()));
        assert_eq!(map.table().len(), 1);
    }

    // ============================================================
    // WRITE CONSISTENCY TESTS
    // ============================================================

    #[test]
    fn test_required_acks_per_level() {
        assert_eq!(WriteConsistency::Local.required_acks(4), 0);
        assert_eq!(WriteConsistency::To { n: 1, timeout_ms: 10 }.required_acks(4), 0);
        assert_eq!(WriteConsistency::To { n: 3, timeout_ms: 10 }.required_acks(4), 2);
        // 5 nodes in total: majority is 3, so 2 remote acks.
        assert_eq!(WriteConsistency::Majority { timeout_ms: 10 }.required_acks(4), 2);
        assert_eq!(WriteConsistency::Majority { timeout_ms: 10 }.required_acks(0), 0);
        assert_eq!(WriteConsistency::All { timeout_ms: 10 }.required_acks(4), 4);
        assert_eq!(WriteConsistency::Local.timeout(), None);
    }

    // ============================================================
    // PROTOCOL TESTS
    // ============================================================

    /// A map whose full state is several times larger than one datagram.
    fn large_map(keys: usize) -> LwwMap {
        let map = LwwMap::new();
        for i in 0..keys {
            let label = format!("{:0>1000}", i);
            map.put(addr(&format!("node-{}", i)), update(None, &[label.as_str()]));
        }
        map
    }

    #[test]
    fn test_large_snapshot_is_split_into_datagrams() {
        let map = large_map(200);

        let batches = encode_gossip(&addr("10"), map.snapshot(), MAX_PAYLOAD).unwrap();

        assert!(batches.datagrams.len() > 1);
        assert!(batches.oversized.is_empty());
        assert!(batches.datagrams.iter().all(|d| d.len() <= MAX_PAYLOAD));

        let receiver = LwwMap::new();
        for datagram in &batches.datagrams {
            match bincode::deserialize::<DataMessage>(datagram).unwrap() {
                DataMessage::Gossip { from, entries } => {
                    assert_eq!(from, addr("10"));
                    receiver.merge_all(entries);
                }
                other => panic!("unexpected message {:?}", other),
            }
        }
        assert_eq!(receiver.table(), map.table());
    }

    #[test]
    fn test_entry_larger_than_datagram_is_skipped() {
        let map = large_map(3);
        let huge: Vec<String> = (0..100).map(|i| format!("{:0>1000}", i)).collect();
        let huge: Vec<&str> = huge.iter().map(String::as_str).collect();
        map.put(addr("huge"), update(None, &huge));

        let batches = encode_gossip(&addr("10"), map.snapshot(), MAX_PAYLOAD).unwrap();

        assert_eq!(batches.oversized, vec![addr("huge")]);
        assert_eq!(batches.datagrams.len(), 1);
    }

    #[test]
    fn test_empty_snapshot_encodes_nothing() {
        let batches = encode_gossip(&addr("10"), Vec::new(), MAX_PAYLOAD).unwrap();

        assert!(batches.datagrams.is_empty());
    }

    // ============================================================
    // IN-MEMORY REPLICATOR TESTS
    // ============================================================

    #[tokio::test]
    async fn test_in_memory_write_notifies_subscribers() {
        let store = InMemoryReplicator::new();
        let mut changes = store.subscribe_changes();

        store
            .write(addr("10"), update(None, &["a"]), WriteConsistency::Local)
            .await
            .unwrap();

        let changed = changes.recv().await.unwrap();
        assert_eq!(changed.keys, vec![addr("10")]);
        assert_eq!(store.table().len(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_injected_failure_leaves_map_untouched() {
        let store = InMemoryReplicator::new();
        store.set_fail_writes(true);

        let result = store
            .write(addr("10"), update(None, &["a"]), WriteConsistency::Local)
            .await;

        assert!(matches!(result, Err(ReplicationError::Transport(_))));
        assert!(store.table().is_empty());
    }

    #[tokio::test]
    async fn test_gossip_round_converges_all_replicas() {
        let replicas = vec![
            InMemoryReplicator::new(),
            InMemoryReplicator::new(),
            InMemoryReplicator::new(),
        ];

        for (i, replica) in replicas.iter().enumerate() {
            let key = addr(&format!("{}0", i + 1));
            let label = format!("label-{}", i);
            replica
                .write(key, update(None, &[label.as_str()]), WriteConsistency::Local)
                .await
                .unwrap();
        }

        assert!(gossip_round(&replicas) > 0);
        assert_eq!(gossip_round(&replicas), 0, "second round has nothing to do");

        let expected = replicas[0].table();
        assert_eq!(expected.len(), 3);
        for replica in &replicas {
            assert_eq!(replica.table(), expected);
        }
    }

    #[tokio::test]
    async fn test_remove_address_propagates_by_gossip() {
        let replicas = vec![InMemoryReplicator::new(), InMemoryReplicator::new()];
        replicas[1]
            .write(addr("20"), update(None, &["x"]), WriteConsistency::Local)
            .await
            .unwrap();
        gossip_round(&replicas);

        replicas[0]
            .remove_address(addr("20"), WriteConsistency::Local)
            .await
            .unwrap();
        gossip_round(&replicas);

        assert!(replicas[0].table().is_empty());
        assert!(replicas[1].table().is_empty());
    }

    // ============================================================
    // GOSSIP REPLICATOR TESTS
    // ============================================================

    async fn replicator_pair() -> (Arc<GossipReplicator>, Arc<GossipReplicator>) {
        let config = ReplicatorConfig {
            gossip_interval_ms: 50,
            ..ReplicatorConfig::default()
        };
        let peers_a = Arc::new(StaticPeers::default());
        let peers_b = Arc::new(StaticPeers::default());

        let a = GossipReplicator::new(
            "127.0.0.1:0".parse().unwrap(),
            addr("10"),
            peers_a.clone(),
            &config,
        )
        .await
        .unwrap();
        let b = GossipReplicator::new(
            "127.0.0.1:0".parse().unwrap(),
            addr("20"),
            peers_b.clone(),
            &config,
        )
        .await
        .unwrap();

        peers_a.add(b.local_addr().unwrap());
        peers_b.add(a.local_addr().unwrap());

        a.clone().start().await;
        b.clone().start().await;
        (a, b)
    }

    #[tokio::test]
    async fn test_acknowledged_write_reaches_peer() {
        let (a, b) = replicator_pair().await;

        a.write(
            addr("10"),
            update(Some("g"), &["ack-a"]),
            WriteConsistency::To {
                n: 2,
                timeout_ms: 2_000,
            },
        )
        .await
        .expect("peer should acknowledge");

        assert_eq!(b.table()[&addr("10")], update(Some("g"), &["ack-a"]));
    }

    #[tokio::test]
    async fn test_write_times_out_without_enough_replicas() {
        let (a, _b) = replicator_pair().await;

        let result = a
            .write(
                addr("10"),
                update(None, &["x"]),
                WriteConsistency::To {
                    n: 3,
                    timeout_ms: 300,
                },
            )
            .await;

        assert!(matches!(
            result,
            Err(ReplicationError::Timeout { required: 2, .. })
        ));
        // The local replica holds the write regardless.
        assert_eq!(a.table().len(), 1);
    }

    #[tokio::test]
    async fn test_background_gossip_spreads_local_writes() {
        let (a, b) = replicator_pair().await;
        let mut changes = b.subscribe_changes();

        a.write(addr("10"), update(None, &["spread"]), WriteConsistency::Local)
            .await
            .unwrap();

        let changed = tokio::time::timeout(Duration::from_secs(2), changes.recv())
            .await
            .expect("gossip should arrive")
            .unwrap();

        assert_eq!(changed.keys, vec![addr("10")]);
        assert_eq!(b.table()[&addr("10")], update(None, &["spread"]));
    }

    #[tokio::test]
    async fn test_background_gossip_spreads_table_larger_than_datagram() {
        let (a, b) = replicator_pair().await;

        for i in 0..150 {
            let label = format!("{:0>1000}", i);
            a.write(
                addr(&format!("node-{}", i)),
                update(None, &[label.as_str()]),
                WriteConsistency::Local,
            )
            .await
            .unwrap();
        }

        let mut converged = false;
        for _ in 0..100 {
            if b.table() == a.table() {
                converged = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(converged, "every key should reach the peer");
    }

    #[tokio::test]
    async fn test_entries_older_than_retention_are_refused() {
        let (_a, b) = replicator_pair().await;
        let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut changes = b.subscribe_changes();

        let gossip = DataMessage::Gossip {
            from: addr("99"),
            entries: vec![
                (
                    addr("old"),
                    Versioned {
                        version: 1,
                        value: Some(update(None, &["stale"])),
                    },
                ),
                (
                    addr("new"),
                    Versioned {
                        version: crate::ddata::crdt::now_ms(),
                        value: Some(update(None, &["fresh"])),
                    },
                ),
            ],
        };
        let encoded = bincode::serialize(&gossip).unwrap();
        sender
            .send_to(&encoded, b.local_addr().unwrap())
            .await
            .unwrap();

        let changed = tokio::time::timeout(Duration::from_secs(2), changes.recv())
            .await
            .expect("fresh entry should be merged")
            .unwrap();

        assert_eq!(changed.keys, vec![addr("new")]);
        assert!(!b.table().contains_key(&addr("old")));
    }
}
