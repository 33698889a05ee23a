//! Subscriber Liveness Tracker
//!
//! One watch task per declared subscriber. When the subscriber's lifetime
//! ends the task posts `Terminated` into the coordinator inbox. Watches carry
//! an id so a termination that raced with a removal (or with a later
//! re-declaration) is recognised as stale and ignored.

use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::coordinator::Command;
use super::types::{Subscriber, SubscriberId};

pub struct LivenessTracker {
    watches: HashMap<SubscriberId, Watch>,
    next_watch_id: u64,
    inbox: mpsc::WeakSender<Command>,
}

struct Watch {
    id: u64,
    subscriber: Subscriber,
    task: JoinHandle<()>,
}

impl LivenessTracker {
    pub(crate) fn new(inbox: mpsc::WeakSender<Command>) -> Self {
        Self {
            watches: HashMap::new(),
            next_watch_id: 1,
            inbox,
        }
    }

    /// Starts watching `subscriber`. Returns `false` if this handle's lifetime
    /// is already watched; a new lifetime under a known id replaces the old watch.
    pub fn watch(&mut self, subscriber: &Subscriber) -> bool {
        if let Some(existing) = self.watches.get(subscriber.id()) {
            if existing.subscriber.shares_lifetime(subscriber) {
                return false;
            }
            tracing::debug!("Subscriber {} re-declared with a new lifetime", subscriber.id());
            self.unwatch(subscriber.id());
        }

        let watch_id = self.next_watch_id;
        self.next_watch_id += 1;

        let inbox = self.inbox.clone();
        let watched = subscriber.clone();
        let task = tokio::spawn(async move {
            let subscriber = watched.id().clone();
            watched.terminated().await;

            if let Some(inbox) = inbox.upgrade() {
                let _ = inbox
                    .send(Command::Terminated {
                        subscriber,
                        watch_id,
                    })
                    .await;
            }
        });

        self.watches.insert(
            subscriber.id().clone(),
            Watch {
                id: watch_id,
                subscriber: subscriber.clone(),
                task,
            },
        );
        true
    }

    /// Stops watching `subscriber`. Returns `false` if it was not watched.
    pub fn unwatch(&mut self, subscriber: &SubscriberId) -> bool {
        match self.watches.remove(subscriber) {
            Some(watch) => {
                watch.task.abort();
                true
            }
            None => false,
        }
    }

    /// Whether `watch_id` is the live watch of `subscriber`.
    pub fn is_current(&self, subscriber: &SubscriberId, watch_id: u64) -> bool {
        self.watches
            .get(subscriber)
            .is_some_and(|watch| watch.id == watch_id)
    }

    pub fn is_watching(&self, subscriber: &SubscriberId) -> bool {
        self.watches.contains_key(subscriber)
    }

    pub fn len(&self) -> usize {
        self.watches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }
}

impl Drop for LivenessTracker {
    fn drop(&mut self) {
        for (_, watch) in self.watches.drain() {
            watch.task.abort();
        }
    }
}
