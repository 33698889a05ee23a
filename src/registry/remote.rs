//! Remote View
//!
//! A node's cached, advisory picture of every other node's claims. It is
//! rebuilt from the full merged table on each change and never patched.
//!
//! Group conflicts are settled by ascending cluster address: the table is
//! walked in address order and the first definition of a group is kept. Every
//! node that sees the same table therefore ends up with the same view.

use std::collections::{BTreeSet, HashMap};

use crate::ddata::types::{ClaimTable, ClusterAddress};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteView {
    groups: HashMap<String, GroupOwner>,
    labels: HashMap<String, ClusterAddress>,
}

/// The winning definition of a group and the node it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupOwner {
    pub address: ClusterAddress,
    pub labels: BTreeSet<String>,
}

impl RemoteView {
    /// Builds the view from `table`, skipping the entry of `own_address`.
    pub fn from_table(table: &ClaimTable, own_address: &ClusterAddress) -> Self {
        let mut view = RemoteView::default();

        // BTreeMap iteration is ascending by address.
        for (address, update) in table.iter().filter(|(address, _)| *address != own_address) {
            for entry in &update.entries {
                if let Some(group) = &entry.group {
                    view.groups
                        .entry(group.clone())
                        .or_insert_with(|| GroupOwner {
                            address: address.clone(),
                            labels: entry.labels.clone(),
                        });
                }
                for label in &entry.labels {
                    view.labels
                        .entry(label.clone())
                        .or_insert_with(|| address.clone());
                }
            }
        }

        view
    }

    /// Mirrors the local check against the remote claims.
    pub fn allows(&self, group: Option<&str>, labels: &BTreeSet<String>) -> bool {
        match group {
            Some(group) => self
                .labels_of_group(group)
                .is_none_or(|remote| remote == labels),
            None => !labels.iter().any(|label| self.contains_label(label)),
        }
    }

    pub fn group(&self, group: &str) -> Option<&GroupOwner> {
        self.groups.get(group)
    }

    pub fn labels_of_group(&self, group: &str) -> Option<&BTreeSet<String>> {
        self.groups.get(group).map(|owner| &owner.labels)
    }

    pub fn contains_label(&self, label: &str) -> bool {
        self.labels.contains_key(label)
    }

    /// Smallest address claiming `label`.
    pub fn label_owner(&self, label: &str) -> Option<&ClusterAddress> {
        self.labels.get(label)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn label_count(&self) -> usize {
        self.labels.len()
    }
}
