use anyhow::Result;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{RwLock, broadcast};
use tracing::info;

use super::types::{GossipMessage, MembershipEvent, Node, NodeId, NodeState};
use crate::config::MembershipConfig;
use crate::ddata::store::PeerSource;
use crate::ddata::types::ClusterAddress;

const EVENT_BUFFER: usize = 256;

pub struct MembershipService {
    pub local_node: Node,
    pub members: Arc<DashMap<NodeId, Node>>,
    socket: Arc<UdpSocket>,
    incarnation: Arc<RwLock<u64>>,
    events: broadcast::Sender<MembershipEvent>,
    config: MembershipConfig,
}

impl MembershipService {
    pub async fn new(
        bind_addr: SocketAddr,
        data_addr: SocketAddr,
        seed_nodes: Vec<SocketAddr>,
        config: &MembershipConfig,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let incarnation_counter = Arc::new(RwLock::new(1));
        let current_inc = *incarnation_counter.read().await;
        let local_node = Node {
            id: NodeId::new(),
            gossip_addr: socket.local_addr()?,
            data_addr,
            state: NodeState::Alive,
            incarnation: current_inc,
            last_seen: Some(Instant::now()),
        };
        let members = Arc::new(DashMap::new());
        members.insert(local_node.id.clone(), local_node.clone());
        if !seed_nodes.is_empty() {
            info!("Joining cluster via {} seed node(s)", seed_nodes.len());

            for seed_node in seed_nodes.iter() {
                let msg = GossipMessage::Join {
                    node: local_node.clone(),
                };

                let encoded = bincode::serialize(&msg)?;
                socket.send_to(&encoded, seed_node).await?;
                info!("Sent join request to {}", seed_node);
            }
        }

        let (events, _) = broadcast::channel(EVENT_BUFFER);

        Ok(Arc::new(Self {
            local_node,
            members,
            socket: Arc::new(socket),
            incarnation: incarnation_counter,
            events,
            config: config.clone(),
        }))
    }

    pub async fn start(self: Arc<Self>) {
        tracing::info!("Starting membership service on {}", self.local_node.gossip_addr);

        let _gossip_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.gossip_loop().await;
            })
        };

        let _receive_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.receive_loop().await;
            })
        };

        let _failure_detection_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.failure_detection_loop().await;
            })
        };

        tracing::info!("All background tasks started");
    }

    /// The cluster address of this node.
    pub fn address(&self) -> ClusterAddress {
        self.local_node.address()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    pub fn get_member(&self, id: &NodeId) -> Option<Node> {
        self.members.get(id).map(|entry| entry.value().clone())
    }

    pub fn get_alive_members(&self) -> Vec<Node> {
        self.members
            .iter()
            .filter(|entry| entry.value().state == NodeState::Alive)
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn emit(&self, event: MembershipEvent) {
        tracing::debug!("Membership event: {:?}", event);
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.gossip_interval());

        loop {
            interval.tick().await;

            let alive_members: Vec<Node> = self
                .members
                .iter()
                .filter(|entry| {
                    entry.value().id != self.local_node.id
                        && entry.value().state == NodeState::Alive
                })
                .map(|entry| entry.value().clone())
                .collect();

            if alive_members.is_empty() {
                continue;
            }

            let target = {
                use rand::Rng;
                let idx = rand::thread_rng().gen_range(0..alive_members.len());
                &alive_members[idx]
            };

            let incarnation = *self.incarnation.read().await;
            let msg = GossipMessage::Ping {
                from: self.local_node.id.clone(),
                incarnation,
                data_addr: self.local_node.data_addr,
            };

            if let Ok(encoded) = bincode::serialize(&msg) {
                if let Err(e) = self.socket.send_to(&encoded, target.gossip_addr).await {
                    tracing::warn!("Failed to send ping to {:?}: {}", target.id, e);
                } else {
                    tracing::trace!("Sent ping to {:?}", target.id);
                }
            } else {
                tracing::error!("Failed to serialize GossipMessage::Ping");
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg, src).await {
                            tracing::error!("Error handling message from {}: {}", src, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to deserialize message from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    pub(crate) async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) -> Result<()> {
        match msg {
            GossipMessage::Ping {
                from,
                incarnation,
                data_addr,
            } => {
                self.handle_ping(from, incarnation, data_addr, src).await?;
            }

            GossipMessage::Ack {
                from,
                incarnation,
                members,
            } => {
                self.handle_ack(from, incarnation, members);
            }

            GossipMessage::Join { node } => {
                self.handle_join(node);
            }

            GossipMessage::Suspect {
                node_id,
                incarnation,
            } => {
                self.handle_suspect(node_id, incarnation).await;
            }

            GossipMessage::Alive {
                node_id,
                incarnation,
            } => {
                self.handle_alive(node_id, incarnation);
            }
        }

        Ok(())
    }

    async fn handle_ping(
        &self,
        from: NodeId,
        from_incarnation: u64,
        data_addr: SocketAddr,
        src: SocketAddr,
    ) -> Result<()> {
        tracing::trace!("Received ping from {:?}", from);

        let discovered = match self.members.get_mut(&from) {
            Some(mut member) => {
                member.last_seen = Some(Instant::now());

                if from_incarnation > member.incarnation {
                    member.incarnation = from_incarnation;
                }
                None
            }
            None => {
                tracing::info!("Discovered new member via ping: {:?} at {}", from, src);

                let new_node = Node {
                    id: from.clone(),
                    gossip_addr: src,
                    data_addr,
                    state: NodeState::Alive,
                    incarnation: from_incarnation,
                    last_seen: Some(Instant::now()),
                };
                let address = new_node.address();
                self.members.insert(new_node.id.clone(), new_node);
                Some(address)
            }
        };

        if let Some(address) = discovered {
            self.emit(MembershipEvent::MemberUp(address));
        }

        let all_members: Vec<Node> = self
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let my_incarnation = *self.incarnation.read().await;
        let reply = GossipMessage::Ack {
            from: self.local_node.id.clone(),
            incarnation: my_incarnation,
            members: all_members,
        };

        let encoded = bincode::serialize(&reply)?;
        self.socket.send_to(&encoded, src).await?;

        tracing::trace!("Sent ack to {:?} with {} members", from, self.members.len());

        Ok(())
    }

    fn handle_ack(&self, from: NodeId, from_incarnation: u64, members: Vec<Node>) {
        tracing::trace!(
            "Received ack from {:?} (inc={}) with {} members",
            from,
            from_incarnation,
            members.len()
        );

        if let Some(mut member) = self.members.get_mut(&from) {
            member.last_seen = Some(Instant::now());
            if from_incarnation > member.incarnation {
                member.incarnation = from_incarnation;
            }
        }

        for member in members {
            self.merge_member(member);
        }
    }

    pub(crate) fn merge_member(&self, new_member: Node) {
        // Only this node speaks for itself.
        if new_member.id == self.local_node.id {
            return;
        }

        let event = match self.members.get_mut(&new_member.id) {
            Some(mut existing) => {
                if new_member.incarnation > existing.incarnation {
                    tracing::debug!(
                        "Updating {:?}: inc {} -> {}",
                        new_member.id,
                        existing.incarnation,
                        new_member.incarnation,
                    );

                    let previous = existing.state;
                    existing.state = new_member.state;
                    existing.incarnation = new_member.incarnation;
                    existing.last_seen = Some(Instant::now());
                    transition_event(previous, new_member.state, existing.address())
                } else if new_member.incarnation == existing.incarnation
                    && new_member.state == NodeState::Alive
                    && existing.state == NodeState::Suspect
                {
                    tracing::info!("{:?} refuted suspicion", new_member.id);
                    existing.state = NodeState::Alive;
                    existing.last_seen = Some(Instant::now());
                    None
                } else if new_member.state == NodeState::Dead && existing.state != NodeState::Dead {
                    tracing::info!("{:?} reported dead by a peer", new_member.id);
                    existing.state = NodeState::Dead;
                    Some(MembershipEvent::MemberRemoved(existing.address()))
                } else {
                    None
                }
            }
            None => {
                if new_member.state == NodeState::Dead {
                    return;
                }

                tracing::info!(
                    "Discovered new member: {:?} at {}",
                    new_member.id,
                    new_member.gossip_addr
                );

                let mut member_with_timestamp = new_member;
                member_with_timestamp.last_seen = Some(Instant::now());
                let address = member_with_timestamp.address();

                self.members
                    .insert(member_with_timestamp.id.clone(), member_with_timestamp);
                Some(MembershipEvent::MemberUp(address))
            }
        };

        if let Some(event) = event {
            self.emit(event);
        }
    }

    async fn handle_suspect(&self, node_id: NodeId, incarnation: u64) {
        if node_id == self.local_node.id {
            let my_incarnation = {
                let mut inc = self.incarnation.write().await;
                if incarnation < *inc {
                    return;
                }
                *inc = incarnation + 1;
                *inc
            };

            tracing::info!("Refuting suspicion of {:?} with inc={}", node_id, my_incarnation);

            if let Some(mut local) = self.members.get_mut(&node_id) {
                local.incarnation = my_incarnation;
                local.state = NodeState::Alive;
                local.last_seen = Some(Instant::now());
            }

            self.broadcast_message(GossipMessage::Alive {
                node_id,
                incarnation: my_incarnation,
            })
            .await;
            return;
        }

        let event = match self.members.get_mut(&node_id) {
            Some(mut existing) => {
                if incarnation >= existing.incarnation && existing.state == NodeState::Alive {
                    tracing::info!(
                        "Node {:?} at {} suspected",
                        existing.id,
                        existing.gossip_addr
                    );
                    existing.state = NodeState::Suspect;
                    existing.incarnation = incarnation;
                    existing.last_seen = Some(Instant::now());
                    Some(MembershipEvent::MemberUnreachable(existing.address()))
                } else {
                    None
                }
            }
            None => {
                tracing::debug!("Suspected node {:?} doesn't exist", node_id);
                None
            }
        };

        if let Some(event) = event {
            self.emit(event);
        }
    }

    fn handle_alive(&self, node_id: NodeId, incarnation: u64) {
        let event = match self.members.get_mut(&node_id) {
            Some(mut existing) => {
                if incarnation > existing.incarnation {
                    tracing::info!(
                        "Node {:?} at {} is now Alive (inc={})",
                        existing.id,
                        existing.gossip_addr,
                        incarnation
                    );
                    let previous = existing.state;
                    existing.state = NodeState::Alive;
                    existing.incarnation = incarnation;
                    existing.last_seen = Some(Instant::now());
                    transition_event(previous, NodeState::Alive, existing.address())
                } else {
                    None
                }
            }
            None => {
                tracing::debug!("Alive message for unknown node {:?}", node_id);
                None
            }
        };

        if let Some(event) = event {
            self.emit(event);
        }
    }

    fn handle_join(&self, mut node: Node) {
        tracing::info!("Node {:?} joining cluster at {}", node.id, node.gossip_addr);

        node.last_seen = Some(Instant::now());
        node.state = NodeState::Alive;
        let address = node.address();

        let previous = self.members.insert(node.id.clone(), node);

        tracing::info!("Cluster size now: {}", self.members.len());

        if previous.is_none_or(|previous| previous.state == NodeState::Dead) {
            self.emit(MembershipEvent::MemberUp(address));
        }
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.failure_detection_interval());

        loop {
            interval.tick().await;

            let messages_to_broadcast = self.detect_failures(Instant::now());

            for msg in messages_to_broadcast {
                self.broadcast_message(msg).await;
            }
        }
    }

    /// Advances member states by the time elapsed since they were last seen.
    ///
    /// Returns the suspicion messages to disseminate.
    pub(crate) fn detect_failures(&self, now: Instant) -> Vec<GossipMessage> {
        let mut messages_to_broadcast = Vec::new();
        let mut events = Vec::new();

        for mut entry in self.members.iter_mut() {
            let member = entry.value_mut();

            if member.id == self.local_node.id {
                continue;
            }

            let Some(last_seen) = member.last_seen else {
                member.last_seen = Some(now);
                continue;
            };
            let elapsed = now.saturating_duration_since(last_seen);

            match member.state {
                NodeState::Alive => {
                    if elapsed > self.config.suspect_timeout() {
                        tracing::warn!(
                            "Node {:?} suspected (no contact for {:?})",
                            member.id,
                            elapsed
                        );

                        member.state = NodeState::Suspect;
                        messages_to_broadcast.push(GossipMessage::Suspect {
                            node_id: member.id.clone(),
                            incarnation: member.incarnation,
                        });
                        events.push(MembershipEvent::MemberUnreachable(member.address()));
                    }
                }

                NodeState::Suspect => {
                    if elapsed > self.config.dead_timeout() {
                        tracing::warn!(
                            "Node {:?} declared DEAD (no contact for {:?})",
                            member.id,
                            elapsed
                        );

                        member.state = NodeState::Dead;
                        events.push(MembershipEvent::MemberRemoved(member.address()));
                    }
                }

                NodeState::Dead => {}
            }
        }

        if !events.is_empty() {
            tracing::info!(
                "Cluster size now: {} alive nodes",
                self.get_alive_members().len()
            );
        }
        for event in events {
            self.emit(event);
        }

        messages_to_broadcast
    }

    async fn broadcast_message(&self, msg: GossipMessage) {
        let Ok(encoded) = bincode::serialize(&msg) else {
            tracing::error!("Failed to serialize {:?}", msg);
            return;
        };

        let targets: Vec<(NodeId, SocketAddr)> = self
            .members
            .iter()
            .filter(|entry| {
                entry.value().id != self.local_node.id && entry.value().state == NodeState::Alive
            })
            .map(|entry| (entry.value().id.clone(), entry.value().gossip_addr))
            .collect();

        for (id, addr) in targets {
            if let Err(e) = self.socket.send_to(&encoded, addr).await {
                tracing::warn!("Failed to broadcast to {:?}: {}", id, e);
            }
        }
    }
}

/// Replication targets: data addresses of every remote member not declared dead.
impl PeerSource for MembershipService {
    fn peers(&self) -> Vec<SocketAddr> {
        self.members
            .iter()
            .filter(|entry| {
                entry.value().id != self.local_node.id && entry.value().state != NodeState::Dead
            })
            .map(|entry| entry.value().data_addr)
            .collect()
    }
}

fn transition_event(
    previous: NodeState,
    current: NodeState,
    address: ClusterAddress,
) -> Option<MembershipEvent> {
    match (previous, current) {
        (NodeState::Alive, NodeState::Suspect) => Some(MembershipEvent::MemberUnreachable(address)),
        (NodeState::Alive | NodeState::Suspect, NodeState::Dead) => {
            Some(MembershipEvent::MemberRemoved(address))
        }
        (NodeState::Dead, NodeState::Alive | NodeState::Suspect) => {
            Some(MembershipEvent::MemberUp(address))
        }
        _ => None,
    }
}
