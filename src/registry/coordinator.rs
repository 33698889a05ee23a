//! Registry Coordinator
//!
//! The per-node control loop. It owns the local claim index, the remote view
//! and the liveness watches, and is the only code that mutates them. Every
//! input (requests, ticks, store changes, membership removals, terminations,
//! write completions) arrives as a [`Command`] on one mpsc inbox and is handled
//! to completion before the next one; nothing in here awaits the network.
//!
//! ## Protocol
//! - **Declare**: accepted iff both the local index and the remote view allow
//!   it. Acceptance updates the index, starts a liveness watch and acks.
//! - **Remove / Terminated**: drop the subscriber's claims and its watch.
//! - **Tick**: publish the index snapshot under the own address.
//! - **Changed / MemberRemoved**: rebuild the remote view from the store.
//!
//! A local acceptance that a smaller-address node later contradicts is not
//! undone. It is only reported through a warning; resolving it for real would
//! need a consensus layer.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::handle::RegistryHandle;
use super::index::LocalClaimIndex;
use super::liveness::LivenessTracker;
use super::remote::RemoteView;
use super::types::{Declaration, SubAck, SubscriberId};
use crate::config::RegistryConfig;
use crate::ddata::store::ReplicatedStore;
use crate::ddata::types::{AckUpdate, ClusterAddress, StoreChanged};
use crate::error::{RegistryError, ReplicationError};

/// Messages processed by the coordinator loop.
#[derive(Debug)]
pub(crate) enum Command {
    Declare {
        declaration: Declaration,
        reply: oneshot::Sender<Result<SubAck, RegistryError>>,
    },
    Remove {
        subscriber: SubscriberId,
        reply: oneshot::Sender<()>,
    },
    Terminated {
        subscriber: SubscriberId,
        watch_id: u64,
    },
    Tick,
    Flush {
        reply: oneshot::Sender<Result<(), ReplicationError>>,
    },
    WriteCompleted {
        update: AckUpdate,
        result: Result<(), ReplicationError>,
        reply: Option<oneshot::Sender<Result<(), ReplicationError>>>,
    },
    Changed {
        keys: Vec<ClusterAddress>,
    },
    MemberRemoved {
        address: ClusterAddress,
    },
    Refresh {
        reply: oneshot::Sender<()>,
    },
}

pub struct AckCoordinator {
    own_address: ClusterAddress,
    config: RegistryConfig,
    store: Arc<dyn ReplicatedStore>,
    local: LocalClaimIndex,
    remote: RemoteView,
    liveness: LivenessTracker,
    /// Keys of local claims already reported as lost races.
    lost_races: BTreeSet<String>,
    inbox: mpsc::WeakSender<Command>,
}

impl AckCoordinator {
    /// Starts the coordinator loop together with its ticker and change forwarder.
    ///
    /// The loop stops once every [`RegistryHandle`] has been dropped.
    pub fn spawn(
        own_address: ClusterAddress,
        config: RegistryConfig,
        store: Arc<dyn ReplicatedStore>,
    ) -> (RegistryHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(config.inbox_capacity.max(1));
        let inbox = sender.downgrade();

        // Subscribe before the first table read so no change falls in between.
        let changes = store.subscribe_changes();
        let update_interval = config.update_interval();
        let coordinator = Self::new(own_address.clone(), config, store, inbox.clone());

        let helpers = vec![
            spawn_ticker(inbox.clone(), update_interval),
            spawn_change_forwarder(inbox, changes),
        ];
        let task = tokio::spawn(coordinator.run(receiver, helpers));

        (RegistryHandle::new(sender, own_address), task)
    }

    pub(crate) fn new(
        own_address: ClusterAddress,
        config: RegistryConfig,
        store: Arc<dyn ReplicatedStore>,
        inbox: mpsc::WeakSender<Command>,
    ) -> Self {
        let remote = RemoteView::from_table(&store.table(), &own_address);

        Self {
            own_address,
            config,
            store,
            local: LocalClaimIndex::new(),
            remote,
            liveness: LivenessTracker::new(inbox.clone()),
            lost_races: BTreeSet::new(),
            inbox,
        }
    }

    async fn run(mut self, mut receiver: mpsc::Receiver<Command>, helpers: Vec<JoinHandle<()>>) {
        tracing::info!("Ack registry coordinator started on {}", self.own_address);

        while let Some(command) = receiver.recv().await {
            self.handle(command);
        }

        for helper in helpers {
            helper.abort();
        }
        tracing::info!("Ack registry coordinator on {} stopped", self.own_address);
    }

    pub(crate) fn handle(&mut self, command: Command) {
        match command {
            Command::Declare { declaration, reply } => {
                let result = self.declare(declaration);
                let _ = reply.send(result);
            }

            Command::Remove { subscriber, reply } => {
                self.remove_subscriber(&subscriber);
                let _ = reply.send(());
            }

            Command::Terminated {
                subscriber,
                watch_id,
            } => {
                if self.liveness.is_current(&subscriber, watch_id) {
                    tracing::info!("Subscriber {} terminated, releasing its labels", subscriber);
                    self.remove_subscriber(&subscriber);
                } else {
                    tracing::trace!("Ignoring stale termination of {}", subscriber);
                }
            }

            Command::Tick => self.tick(),

            Command::Flush { reply } => {
                let update = self.local.snapshot_grouped_by_value();
                self.publish(update, Some(reply));
            }

            Command::WriteCompleted {
                update,
                result,
                reply,
            } => self.write_completed(update, result, reply),

            Command::Changed { keys } => {
                tracing::debug!("Replicated claims changed for {} key(s)", keys.len());
                self.refresh_remote_view();
            }

            Command::MemberRemoved { address } => {
                tracing::info!("Member {} removed, dropping its claims from the remote view", address);
                self.refresh_remote_view();
            }

            Command::Refresh { reply } => {
                self.refresh_remote_view();
                let _ = reply.send(());
            }
        }
    }

    fn declare(&mut self, declaration: Declaration) -> Result<SubAck, RegistryError> {
        declaration.validate()?;

        if !self.is_allowed_locally(&declaration) || !self.is_allowed_remotely(&declaration) {
            tracing::debug!(
                "Rejected declaration of {:?} (group {:?}) by {}",
                declaration.labels,
                declaration.group,
                declaration.subscriber.id()
            );
            return Err(declaration.uniqueness_violation());
        }

        let subscriber = declaration.subscriber.id().clone();
        self.local.put(
            subscriber.clone(),
            declaration.group.clone(),
            declaration.labels.clone(),
        );
        self.liveness.watch(&declaration.subscriber);

        tracing::debug!(
            "Accepted declaration of {:?} (group {:?}) by {}",
            declaration.labels,
            declaration.group,
            subscriber
        );

        Ok(SubAck {
            declaration,
            responder: self.own_address.clone(),
        })
    }

    fn is_allowed_locally(&self, declaration: &Declaration) -> bool {
        match &declaration.group {
            Some(group) => self
                .local
                .labels_of_group(group)
                .is_none_or(|labels| labels == &declaration.labels),
            None => !declaration
                .labels
                .iter()
                .any(|label| self.local.is_claimed_by_other(label, declaration.subscriber.id())),
        }
    }

    fn is_allowed_remotely(&self, declaration: &Declaration) -> bool {
        self.remote
            .allows(declaration.group.as_deref(), &declaration.labels)
    }

    fn remove_subscriber(&mut self, subscriber: &SubscriberId) {
        let removed = self.local.remove_subscriber(subscriber);
        self.liveness.unwatch(subscriber);

        if let Some(claim) = removed {
            tracing::debug!(
                "Released {:?} (group {:?}) of {}",
                claim.labels,
                claim.group,
                subscriber
            );
        }
    }

    /// Publishes the full snapshot, even when it equals the previous one, so
    /// a key tombstoned by a peer reappears on the next tick.
    fn tick(&mut self) {
        let update = self.local.snapshot_grouped_by_value();
        self.publish(update, None);
    }

    /// Starts a write and routes its completion back through the inbox.
    fn publish(
        &mut self,
        update: AckUpdate,
        reply: Option<oneshot::Sender<Result<(), ReplicationError>>>,
    ) {
        tracing::debug!(
            "Publishing {} claim entries for {}",
            update.entries.len(),
            self.own_address
        );

        let write = self.store.write(
            self.own_address.clone(),
            update.clone(),
            self.config.write_consistency,
        );
        let inbox = self.inbox.clone();

        tokio::spawn(async move {
            let result = write.await;
            match inbox.upgrade() {
                Some(inbox) => {
                    let _ = inbox
                        .send(Command::WriteCompleted {
                            update,
                            result,
                            reply,
                        })
                        .await;
                }
                None => {
                    if let Err(e) = result {
                        tracing::error!("Failed to update local claims after shutdown: {}", e);
                    }
                }
            }
        });
    }

    fn write_completed(
        &mut self,
        update: AckUpdate,
        result: Result<(), ReplicationError>,
        reply: Option<oneshot::Sender<Result<(), ReplicationError>>>,
    ) {
        match &result {
            Ok(()) => tracing::trace!(
                "Stored {} claim entries for {}",
                update.entries.len(),
                self.own_address
            ),
            Err(e) => {
                // The next tick resends the full snapshot.
                tracing::error!("Failed to update local claims in replicated store: {}", e);
            }
        }

        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    fn refresh_remote_view(&mut self) {
        self.remote = RemoteView::from_table(&self.store.table(), &self.own_address);
        tracing::debug!(
            "Remote view now holds {} group(s) and {} label(s)",
            self.remote.group_count(),
            self.remote.label_count()
        );
        self.report_lost_races();
    }

    /// Warns about local claims contradicted by a remote node of smaller address.
    fn report_lost_races(&mut self) {
        let mut lost = BTreeSet::new();

        for (group, labels) in self.local.groups() {
            if let Some(owner) = self.remote.group(group)
                && &owner.labels != labels
                && owner.address < self.own_address
            {
                let key = format!("group:{}", group);
                if !self.lost_races.contains(&key) {
                    tracing::warn!(
                        "Local group '{}' {:?} conflicts with {:?} declared by {}",
                        group,
                        labels,
                        owner.labels,
                        owner.address
                    );
                }
                lost.insert(key);
            }
        }

        for label in self.local.ungrouped_labels() {
            if let Some(owner) = self.remote.label_owner(label)
                && *owner < self.own_address
            {
                let key = format!("label:{}", label);
                if !self.lost_races.contains(&key) {
                    tracing::warn!("Local label '{}' is also claimed by {}", label, owner);
                }
                lost.insert(key);
            }
        }

        self.lost_races = lost;
    }

    pub fn own_address(&self) -> &ClusterAddress {
        &self.own_address
    }

    pub fn local(&self) -> &LocalClaimIndex {
        &self.local
    }

    pub fn remote(&self) -> &RemoteView {
        &self.remote
    }

    pub fn liveness(&self) -> &LivenessTracker {
        &self.liveness
    }

    pub fn lost_races(&self) -> &BTreeSet<String> {
        &self.lost_races
    }
}

fn spawn_ticker(inbox: mpsc::WeakSender<Command>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let Some(inbox) = inbox.upgrade() else {
                break;
            };
            if inbox.send(Command::Tick).await.is_err() {
                break;
            }
        }
    })
}

fn spawn_change_forwarder(
    inbox: mpsc::WeakSender<Command>,
    mut changes: broadcast::Receiver<StoreChanged>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let command = match changes.recv().await {
                Ok(changed) => Command::Changed { keys: changed.keys },
                Err(RecvError::Lagged(skipped)) => {
                    // The view is rebuilt from the full table, so one refresh covers the gap.
                    tracing::warn!("Change forwarder lagged, skipped {} notification(s)", skipped);
                    Command::Changed { keys: Vec::new() }
                }
                Err(RecvError::Closed) => break,
            };

            let Some(inbox) = inbox.upgrade() else {
                break;
            };
            if inbox.send(command).await.is_err() {
                break;
            }
        }
    })
}
