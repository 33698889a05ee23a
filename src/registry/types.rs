use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tokio::sync::watch;

use crate::ddata::types::{ClusterAddress, GroupedLabels};
use crate::error::RegistryError;

/// Identity of one registrant; all claims are keyed by it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(pub String);

impl SubscriberId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A subscriber as seen by the registry: its identity plus a liveness signal.
///
/// The signal fires when the paired [`SubscriberLifetime`] is dropped, which is
/// how the connection layer reports that a subscriber went away.
#[derive(Debug, Clone)]
pub struct Subscriber {
    id: SubscriberId,
    alive: watch::Receiver<()>,
}

/// Owning side of a subscriber's liveness signal.
#[derive(Debug)]
pub struct SubscriberLifetime {
    id: SubscriberId,
    _alive: watch::Sender<()>,
}

impl Subscriber {
    pub fn new() -> (Self, SubscriberLifetime) {
        Self::with_id(SubscriberId::new())
    }

    pub fn with_id(id: SubscriberId) -> (Self, SubscriberLifetime) {
        let (sender, alive) = watch::channel(());
        (
            Self {
                id: id.clone(),
                alive,
            },
            SubscriberLifetime {
                id,
                _alive: sender,
            },
        )
    }

    pub fn id(&self) -> &SubscriberId {
        &self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.has_changed().is_ok()
    }

    /// Whether both handles observe the same lifetime.
    pub(crate) fn shares_lifetime(&self, other: &Subscriber) -> bool {
        self.alive.same_channel(&other.alive)
    }

    /// Resolves once the subscriber's lifetime has ended.
    pub(crate) async fn terminated(mut self) {
        while self.alive.changed().await.is_ok() {}
    }
}

impl PartialEq for Subscriber {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Subscriber {}

impl SubscriberLifetime {
    pub fn id(&self) -> &SubscriberId {
        &self.id
    }

    /// Ends the subscriber's lifetime. Dropping has the same effect.
    pub fn terminate(self) {}
}

/// A request to claim `labels`, optionally as part of `group`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub subscriber: Subscriber,
    pub group: Option<String>,
    pub labels: BTreeSet<String>,
}

impl Declaration {
    pub fn new<I, S>(subscriber: &Subscriber, group: Option<&str>, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            subscriber: subscriber.clone(),
            group: group.map(str::to_string),
            labels: labels.into_iter().map(Into::into).collect(),
        }
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if let Some(group) = &self.group
            && group.is_empty()
        {
            return Err(RegistryError::InvalidDeclaration(
                "group name must not be empty".to_string(),
            ));
        }
        if self.labels.iter().any(String::is_empty) {
            return Err(RegistryError::InvalidDeclaration(
                "acknowledgement labels must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn uniqueness_violation(&self) -> RegistryError {
        RegistryError::UniquenessViolation {
            group: self.group.clone(),
            labels: self.labels.clone(),
        }
    }

    pub fn grouped_labels(&self) -> GroupedLabels {
        GroupedLabels {
            group: self.group.clone(),
            labels: self.labels.clone(),
        }
    }
}

/// Positive answer to a declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    /// The accepted declaration, echoed back.
    pub declaration: Declaration,
    /// Node whose coordinator accepted it.
    pub responder: ClusterAddress,
}
