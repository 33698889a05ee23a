//! Membership Monitor
//!
//! Bridges membership events into the registry. When a member is removed its
//! published claims are dropped from the replicated store and the coordinator
//! rebuilds its remote view, which makes the departed node's labels
//! reclaimable.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use super::types::MembershipEvent;
use crate::ddata::store::ReplicatedStore;
use crate::ddata::types::{ClusterAddress, WriteConsistency};
use crate::registry::handle::RegistryHandle;

pub struct MembershipMonitor {
    own_address: ClusterAddress,
    store: Arc<dyn ReplicatedStore>,
    registry: RegistryHandle,
}

impl MembershipMonitor {
    pub fn new(store: Arc<dyn ReplicatedStore>, registry: RegistryHandle) -> Self {
        Self {
            own_address: registry.address().clone(),
            store,
            registry,
        }
    }

    /// Consumes `events` until the channel closes or the coordinator stops.
    pub fn spawn(self, mut events: broadcast::Receiver<MembershipEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if !self.handle_event(event).await {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Membership monitor lagged, skipped {} event(s)", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::info!("Membership monitor on {} stopped", self.own_address);
        })
    }

    /// Returns `false` once the coordinator is gone.
    pub async fn handle_event(&self, event: MembershipEvent) -> bool {
        match event {
            MembershipEvent::MemberUp(address) => {
                tracing::info!("Member {} is up", address);
                true
            }

            MembershipEvent::MemberUnreachable(address) => {
                tracing::info!("Member {} is unreachable", address);
                true
            }

            MembershipEvent::MemberRemoved(address) if address == self.own_address => {
                tracing::warn!("This node ({}) was reported removed, keeping own claims", address);
                true
            }

            MembershipEvent::MemberRemoved(address) => {
                tracing::info!("Member {} removed, dropping its claims", address);

                if let Err(e) = self
                    .store
                    .remove_address(address.clone(), WriteConsistency::Local)
                    .await
                {
                    tracing::error!("Failed to drop claims of {}: {}", address, e);
                }

                self.registry.member_removed(address).await.is_ok()
            }
        }
    }
}
