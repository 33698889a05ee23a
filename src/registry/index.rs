//! Local Claim Index
//!
//! Bidirectional index of this node's claims: `subscriber -> (group?, labels)`
//! plus the derived `label -> subscribers` and `group -> labels` lookups used
//! during validation. Pure data structure; validation happens in the
//! coordinator before `put` is called.

use std::collections::{BTreeSet, HashMap, HashSet};

use super::types::SubscriberId;
use crate::ddata::types::{AckUpdate, GroupedLabels};

#[derive(Debug, Default)]
pub struct LocalClaimIndex {
    claims: HashMap<SubscriberId, GroupedLabels>,
    label_owners: HashMap<String, HashSet<SubscriberId>>,
    groups: HashMap<String, GroupMembers>,
}

#[derive(Debug)]
struct GroupMembers {
    labels: BTreeSet<String>,
    members: HashSet<SubscriberId>,
}

impl LocalClaimIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the claim of `subscriber`.
    pub fn put(&mut self, subscriber: SubscriberId, group: Option<String>, labels: BTreeSet<String>) {
        self.remove_subscriber(&subscriber);

        for label in &labels {
            self.label_owners
                .entry(label.clone())
                .or_default()
                .insert(subscriber.clone());
        }

        if let Some(name) = &group {
            let entry = self
                .groups
                .entry(name.clone())
                .or_insert_with(|| GroupMembers {
                    labels: labels.clone(),
                    members: HashSet::new(),
                });
            entry.labels = labels.clone();
            entry.members.insert(subscriber.clone());
        }

        self.claims
            .insert(subscriber, GroupedLabels { group, labels });
    }

    /// Drops every index entry of `subscriber`. Unknown subscribers are ignored.
    pub fn remove_subscriber(&mut self, subscriber: &SubscriberId) -> Option<GroupedLabels> {
        let claim = self.claims.remove(subscriber)?;

        for label in &claim.labels {
            if let Some(owners) = self.label_owners.get_mut(label) {
                owners.remove(subscriber);
                if owners.is_empty() {
                    self.label_owners.remove(label);
                }
            }
        }

        if let Some(name) = &claim.group
            && let Some(group) = self.groups.get_mut(name)
        {
            group.members.remove(subscriber);
            if group.members.is_empty() {
                self.groups.remove(name);
            }
        }

        Some(claim)
    }

    pub fn contains_label(&self, label: &str) -> bool {
        self.label_owners.contains_key(label)
    }

    /// Whether some subscriber other than `subscriber` holds `label`.
    pub fn is_claimed_by_other(&self, label: &str, subscriber: &SubscriberId) -> bool {
        self.label_owners
            .get(label)
            .is_some_and(|owners| owners.iter().any(|owner| owner != subscriber))
    }

    pub fn labels_of_group(&self, group: &str) -> Option<&BTreeSet<String>> {
        self.groups.get(group).map(|group| &group.labels)
    }

    pub fn get(&self, subscriber: &SubscriberId) -> Option<&GroupedLabels> {
        self.claims.get(subscriber)
    }

    pub fn claims(&self) -> impl Iterator<Item = (&SubscriberId, &GroupedLabels)> {
        self.claims.iter()
    }

    pub fn groups(&self) -> impl Iterator<Item = (&String, &BTreeSet<String>)> {
        self.groups.iter().map(|(name, group)| (name, &group.labels))
    }

    pub fn ungrouped_labels(&self) -> impl Iterator<Item = &String> {
        self.claims
            .values()
            .filter(|claim| claim.group.is_none())
            .flat_map(|claim| claim.labels.iter())
    }

    /// The claim set to publish: one entry per group, one per ungrouped subscriber.
    pub fn snapshot_grouped_by_value(&self) -> AckUpdate {
        let grouped = self.groups.iter().map(|(name, group)| GroupedLabels {
            group: Some(name.clone()),
            labels: group.labels.clone(),
        });
        let ungrouped = self
            .claims
            .values()
            .filter(|claim| claim.group.is_none())
            .cloned();

        AckUpdate::new(grouped.chain(ungrouped))
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}
