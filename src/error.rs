//! Error types for the registry and the replication layer.

use std::collections::BTreeSet;

use thiserror::Error;

/// Failures reported to callers of the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The declaration conflicts with a local claim or with the cached remote view.
    #[error("acknowledgement labels {labels:?} (group {group:?}) are not unique in the cluster")]
    UniquenessViolation {
        group: Option<String>,
        labels: BTreeSet<String>,
    },

    #[error("invalid declaration: {0}")]
    InvalidDeclaration(String),

    #[error("registry coordinator is no longer running")]
    Closed,

    #[error(transparent)]
    Replication(#[from] ReplicationError),
}

/// Failures of a write into the replicated store.
///
/// These never reach `declare` callers; the tick path logs them and the next
/// tick publishes a fresh snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicationError {
    #[error("write timed out after {acked} of {required} replica acknowledgements")]
    Timeout { acked: usize, required: usize },

    #[error("replication transport failed: {0}")]
    Transport(String),

    #[error("replicator is shut down")]
    Closed,
}

impl From<anyhow::Error> for ReplicationError {
    fn from(err: anyhow::Error) -> Self {
        ReplicationError::Transport(err.to_string())
    }
}
