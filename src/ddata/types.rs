use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Totally ordered identity of a cluster node.
///
/// Used as the key of the replicated map and for tie-breaking group conflicts.
/// Never used for routing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterAddress(pub String);

impl ClusterAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }
}

impl From<SocketAddr> for ClusterAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl fmt::Display for ClusterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One `(group?, labels)` pair published by a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupedLabels {
    pub group: Option<String>,
    pub labels: BTreeSet<String>,
}

impl GroupedLabels {
    pub fn new<I, S>(group: Option<&str>, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            group: group.map(str::to_string),
            labels: labels.into_iter().map(Into::into).collect(),
        }
    }
}

/// The full claim set of one node, replicated under that node's address.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AckUpdate {
    pub entries: BTreeSet<GroupedLabels>,
}

impl AckUpdate {
    pub fn new(entries: impl IntoIterator<Item = GroupedLabels>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Merged view of every live key in the replicated map, ordered by address.
pub type ClaimTable = BTreeMap<ClusterAddress, AckUpdate>;

/// How many replicas must hold a write before it completes.
///
/// Counts include the local replica, so `To { n: 1, .. }` behaves like `Local`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "level", rename_all = "snake_case")]
pub enum WriteConsistency {
    Local,
    To { n: usize, timeout_ms: u64 },
    Majority { timeout_ms: u64 },
    All { timeout_ms: u64 },
}

impl WriteConsistency {
    /// Acknowledgements needed from remote replicas given `peers` remote members.
    pub fn required_acks(&self, peers: usize) -> usize {
        match self {
            WriteConsistency::Local => 0,
            WriteConsistency::To { n, .. } => n.saturating_sub(1),
            WriteConsistency::Majority { .. } => (peers + 1) / 2,
            WriteConsistency::All { .. } => peers,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        match self {
            WriteConsistency::Local => None,
            WriteConsistency::To { timeout_ms, .. }
            | WriteConsistency::Majority { timeout_ms }
            | WriteConsistency::All { timeout_ms } => Some(Duration::from_millis(*timeout_ms)),
        }
    }
}

/// Notification that the merged state changed for the listed keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChanged {
    pub keys: Vec<ClusterAddress>,
}
