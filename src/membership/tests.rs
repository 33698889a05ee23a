//! Membership Module Tests
//!
//! ## Test Scopes
//! - **Data Structures**: node identity, cluster addresses and wire messages.
//! - **Events**: which state transitions surface as `MembershipEvent`s.
//! - **Failure Detection**: `Alive -> Suspect -> Dead` driven by elapsed time.
//! - **Peer Source**: replication targets derived from the member table.

#[cfg(test)]
mod tests {
    use crate::config::MembershipConfig;
    use crate::ddata::store::PeerSource;
    use crate::ddata::types::ClusterAddress;
    use crate::membership::service::MembershipService;
    use crate::membership::types::{GossipMessage, MembershipEvent, Node, NodeId, NodeState};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio::sync::broadcast;

    fn node(id: &str, port: u16, state: NodeState, incarnation: u64) -> Node {
        Node {
            id: NodeId(id.to_string()),
            gossip_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            data_addr: SocketAddr::from(([127, 0, 0, 1], port + 1000)),
            state,
            incarnation,
            last_seen: None,
        }
    }

    async fn service() -> Arc<MembershipService> {
        let config = MembershipConfig {
            suspect_timeout_ms: 100,
            dead_timeout_ms: 200,
            ..MembershipConfig::default()
        };
        MembershipService::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:9999".parse().unwrap(),
            vec![],
            &config,
        )
        .await
        .expect("Failed to create service")
    }

    fn drain(events: &mut broadcast::Receiver<MembershipEvent>) -> Vec<MembershipEvent> {
        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        received
    }

    // ============================================================
    // DATA STRUCTURE TESTS
    // ============================================================

    #[test]
    fn test_node_id_is_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();

        assert_ne!(id1, id2, "Each NodeId should be unique");
    }

    #[test]
    fn test_node_address_is_gossip_address() {
        let member = node("n1", 5000, NodeState::Alive, 1);

        assert_eq!(member.address(), ClusterAddress::new("127.0.0.1:5000"));
    }

    #[test]
    fn test_node_serialization_skips_last_seen() {
        let mut member = node("test-node", 5000, NodeState::Suspect, 42);
        member.last_seen = Some(Instant::now());

        let encoded = bincode::serialize(&member).expect("Bincode serialization failed");
        let restored: Node = bincode::deserialize(&encoded).expect("Bincode deserialization failed");

        assert_eq!(restored.id, member.id);
        assert_eq!(restored.data_addr, member.data_addr);
        assert_eq!(restored.state, NodeState::Suspect);
        assert_eq!(restored.incarnation, 42);
        assert!(restored.last_seen.is_none());
    }

    #[test]
    fn test_gossip_ping_carries_data_address() {
        let msg = GossipMessage::Ping {
            from: NodeId("sender-node".to_string()),
            incarnation: 5,
            data_addr: "127.0.0.1:6000".parse().unwrap(),
        };

        let encoded = bincode::serialize(&msg).expect("Failed to serialize Ping");
        let decoded: GossipMessage =
            bincode::deserialize(&encoded).expect("Failed to deserialize Ping");

        if let GossipMessage::Ping {
            from,
            incarnation,
            data_addr,
        } = decoded
        {
            assert_eq!(from.0, "sender-node");
            assert_eq!(incarnation, 5);
            assert_eq!(data_addr.port(), 6000);
        } else {
            panic!("Wrong message type");
        }
    }

    // ============================================================
    // MEMBERSHIP SERVICE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_membership_service_creation() {
        let service = service().await;

        assert_eq!(service.members.len(), 1);
        let alive = service.get_alive_members();
        assert_eq!(alive.len(), 1);
        assert_eq!(alive[0].id, service.local_node.id);
        assert_ne!(service.local_node.gossip_addr.port(), 0);
        assert_eq!(service.address(), service.local_node.address());
        assert!(service.peers().is_empty());
    }

    #[tokio::test]
    async fn test_membership_get_member() {
        let service = service().await;

        let member = service.get_member(&service.local_node.id);
        assert_eq!(member.map(|m| m.id), Some(service.local_node.id.clone()));
        assert!(service.get_member(&NodeId("non-existent".to_string())).is_none());
    }

    #[tokio::test]
    async fn test_join_emits_member_up() {
        let service = service().await;
        let mut events = service.subscribe_events();
        let joiner = node("joiner", 5001, NodeState::Alive, 1);

        service
            .handle_message(GossipMessage::Join { node: joiner.clone() }, joiner.gossip_addr)
            .await
            .unwrap();

        assert_eq!(drain(&mut events), vec![MembershipEvent::MemberUp(joiner.address())]);
        assert_eq!(service.peers(), vec![joiner.data_addr]);
    }

    #[tokio::test]
    async fn test_merge_emits_transitions() {
        let service = service().await;
        let mut events = service.subscribe_events();
        let member = node("n1", 5001, NodeState::Alive, 1);

        service.merge_member(member.clone());
        service.merge_member(node("n1", 5001, NodeState::Suspect, 2));
        service.merge_member(node("n1", 5001, NodeState::Dead, 3));
        service.merge_member(node("n1", 5001, NodeState::Alive, 4));

        assert_eq!(
            drain(&mut events),
            vec![
                MembershipEvent::MemberUp(member.address()),
                MembershipEvent::MemberUnreachable(member.address()),
                MembershipEvent::MemberRemoved(member.address()),
                MembershipEvent::MemberUp(member.address()),
            ]
        );
    }

    #[tokio::test]
    async fn test_dead_report_at_same_incarnation_removes() {
        let service = service().await;
        service.merge_member(node("n1", 5001, NodeState::Alive, 3));
        let mut events = service.subscribe_events();

        service.merge_member(node("n1", 5001, NodeState::Dead, 3));

        assert_eq!(
            drain(&mut events),
            vec![MembershipEvent::MemberRemoved(
                node("n1", 5001, NodeState::Dead, 3).address()
            )]
        );
        assert!(service.peers().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_dead_member_is_ignored() {
        let service = service().await;
        let mut events = service.subscribe_events();

        service.merge_member(node("ghost", 5001, NodeState::Dead, 1));

        assert!(drain(&mut events).is_empty());
        assert_eq!(service.members.len(), 1);
    }

    #[tokio::test]
    async fn test_gossip_never_overrides_local_node() {
        let service = service().await;
        let mut local = service.local_node.clone();
        local.state = NodeState::Dead;
        local.incarnation = 99;

        service.merge_member(local);

        let stored = service.get_member(&service.local_node.id).unwrap();
        assert_eq!(stored.state, NodeState::Alive);
    }

    // ============================================================
    // FAILURE DETECTION TESTS
    // ============================================================

    #[tokio::test]
    async fn test_failure_detection_suspects_then_removes() {
        let service = service().await;
        let member = node("n1", 5001, NodeState::Alive, 1);
        service.merge_member(member.clone());
        let mut events = service.subscribe_events();
        let start = Instant::now();

        // ARRANGE: no contact for longer than the suspect timeout
        let messages = service.detect_failures(start + Duration::from_millis(150));

        // ASSERT
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0], GossipMessage::Suspect { ref node_id, .. } if node_id.0 == "n1"));
        assert_eq!(
            drain(&mut events),
            vec![MembershipEvent::MemberUnreachable(member.address())]
        );

        // ACT: still silent past the dead timeout
        let messages = service.detect_failures(start + Duration::from_millis(400));

        // ASSERT
        assert!(messages.is_empty());
        assert_eq!(
            drain(&mut events),
            vec![MembershipEvent::MemberRemoved(member.address())]
        );
        assert_eq!(service.get_member(&member.id).unwrap().state, NodeState::Dead);
    }

    #[tokio::test]
    async fn test_failure_detection_spares_recent_members() {
        let service = service().await;
        service.merge_member(node("n1", 5001, NodeState::Alive, 1));
        let mut events = service.subscribe_events();

        let messages = service.detect_failures(Instant::now());

        assert!(messages.is_empty());
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_suspected_member_refutes_with_alive() {
        let service = service().await;
        let member = node("n1", 5001, NodeState::Alive, 1);
        service.merge_member(member.clone());
        service
            .handle_message(
                GossipMessage::Suspect {
                    node_id: member.id.clone(),
                    incarnation: 1,
                },
                member.gossip_addr,
            )
            .await
            .unwrap();
        assert_eq!(service.get_member(&member.id).unwrap().state, NodeState::Suspect);

        service
            .handle_message(
                GossipMessage::Alive {
                    node_id: member.id.clone(),
                    incarnation: 2,
                },
                member.gossip_addr,
            )
            .await
            .unwrap();

        let stored = service.get_member(&member.id).unwrap();
        assert_eq!(stored.state, NodeState::Alive);
        assert_eq!(stored.incarnation, 2);
    }

    #[tokio::test]
    async fn test_local_suspicion_bumps_incarnation() {
        let service = service().await;

        service
            .handle_message(
                GossipMessage::Suspect {
                    node_id: service.local_node.id.clone(),
                    incarnation: 1,
                },
                "127.0.0.1:5001".parse().unwrap(),
            )
            .await
            .unwrap();

        let local = service.get_member(&service.local_node.id).unwrap();
        assert_eq!(local.state, NodeState::Alive);
        assert_eq!(local.incarnation, 2);
    }

    // ============================================================
    // DISCOVERY OVER UDP
    // ============================================================

    #[tokio::test]
    async fn test_two_services_discover_each_other() {
        let config = MembershipConfig {
            gossip_interval_ms: 50,
            ..MembershipConfig::default()
        };
        let seed = MembershipService::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:9001".parse().unwrap(),
            vec![],
            &config,
        )
        .await
        .unwrap();
        seed.clone().start().await;

        let joiner = MembershipService::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:9002".parse().unwrap(),
            vec![seed.local_node.gossip_addr],
            &config,
        )
        .await
        .unwrap();
        joiner.clone().start().await;

        let mut converged = false;
        for _ in 0..40 {
            if seed.members.len() == 2 && joiner.members.len() == 2 {
                converged = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert!(converged, "services should learn about each other");
        let seed_data: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        assert_eq!(joiner.peers(), vec![seed_data]);
    }
}
