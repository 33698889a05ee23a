use tokio::sync::{mpsc, oneshot};

use super::coordinator::Command;
use super::types::{Declaration, SubAck, Subscriber, SubscriberId};
use crate::ddata::types::ClusterAddress;
use crate::error::{RegistryError, ReplicationError};

/// Cloneable entry point into a running coordinator.
///
/// All requests are queued on the coordinator inbox and answered in arrival
/// order. Once every handle is dropped the coordinator shuts down.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    inbox: mpsc::Sender<Command>,
    address: ClusterAddress,
}

impl RegistryHandle {
    pub(crate) fn new(inbox: mpsc::Sender<Command>, address: ClusterAddress) -> Self {
        Self { inbox, address }
    }

    /// The cluster address of the node this handle talks to.
    pub fn address(&self) -> &ClusterAddress {
        &self.address
    }

    /// Claims `labels` for `subscriber`, optionally as a member of `group`.
    pub async fn declare<I, S>(
        &self,
        subscriber: &Subscriber,
        group: Option<&str>,
        labels: I,
    ) -> Result<SubAck, RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.submit(Declaration::new(subscriber, group, labels)).await
    }

    pub async fn submit(&self, declaration: Declaration) -> Result<SubAck, RegistryError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Declare { declaration, reply }).await?;
        response.await.map_err(|_| RegistryError::Closed)?
    }

    /// Releases every claim of `subscriber`. Unknown subscribers are ignored.
    pub async fn remove(&self, subscriber: &SubscriberId) -> Result<(), RegistryError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Remove {
            subscriber: subscriber.clone(),
            reply,
        })
        .await?;
        response.await.map_err(|_| RegistryError::Closed)
    }

    /// Publishes the current local claims now and waits for the write.
    pub async fn flush(&self) -> Result<(), RegistryError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Flush { reply }).await?;
        let result: Result<(), ReplicationError> =
            response.await.map_err(|_| RegistryError::Closed)?;
        Ok(result?)
    }

    /// Rebuilds the remote view from the store before answering.
    pub async fn refresh(&self) -> Result<(), RegistryError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Refresh { reply }).await?;
        response.await.map_err(|_| RegistryError::Closed)
    }

    /// Tells the coordinator that `address` has left the cluster.
    pub async fn member_removed(&self, address: ClusterAddress) -> Result<(), RegistryError> {
        self.send(Command::MemberRemoved { address }).await
    }

    async fn send(&self, command: Command) -> Result<(), RegistryError> {
        self.inbox
            .send(command)
            .await
            .map_err(|_| RegistryError::Closed)
    }
}
