//! Subscription registry: topic filter -> set of consumers
//!
//! Pure bookkeeping. The registry reports which transitions happened
//! (first consumer for a filter, last consumer gone) and the session turns
//! those into transport subscribe and unsubscribe calls.
//!
//! Entries exist only while they have at least one consumer. Snapshots are
//! copy-on-write: taking one is an `Arc` clone, and the next mutation copies
//! the map only if a snapshot is still alive.

use super::consumer::ConsumerHandle;
use crate::protocol::topics::{matches_segments, TOPIC_SEPARATOR};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

type FilterMap = HashMap<String, HashSet<ConsumerHandle>>;

/// Outcome of registering a consumer under a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// First consumer for the filter; the entry was created
    EntryCreated,
    /// Filter already present; consumer added to it
    ConsumerAdded,
    /// Consumer was already registered under the filter
    AlreadyRegistered,
}

/// Outcome of removing a consumer from a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    /// Last consumer removed; the entry was deleted
    EntryRemoved,
    /// Consumer removed, others remain
    ConsumerRemoved,
    /// Filter/consumer pair was not registered
    NotRegistered,
}

/// Filter -> consumer-set map
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Arc<FilterMap>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, filter: &str) -> bool {
        self.entries.contains_key(filter)
    }

    pub fn is_registered(&self, filter: &str, consumer: &ConsumerHandle) -> bool {
        self.entries
            .get(filter)
            .is_some_and(|consumers| consumers.contains(consumer))
    }

    /// Add `consumer` under `filter` with set semantics
    pub fn insert(&mut self, filter: &str, consumer: ConsumerHandle) -> SubscribeOutcome {
        let entries = Arc::make_mut(&mut self.entries);
        match entries.get_mut(filter) {
            Some(consumers) => {
                if consumers.insert(consumer) {
                    SubscribeOutcome::ConsumerAdded
                } else {
                    SubscribeOutcome::AlreadyRegistered
                }
            }
            None => {
                entries.insert(filter.to_string(), HashSet::from([consumer]));
                SubscribeOutcome::EntryCreated
            }
        }
    }

    /// Remove `consumer` from `filter`, deleting the entry when it empties
    pub fn remove(&mut self, filter: &str, consumer: &ConsumerHandle) -> UnsubscribeOutcome {
        if !self.is_registered(filter, consumer) {
            return UnsubscribeOutcome::NotRegistered;
        }

        let entries = Arc::make_mut(&mut self.entries);
        let now_empty = match entries.get_mut(filter) {
            Some(consumers) => {
                consumers.remove(consumer);
                consumers.is_empty()
            }
            None => return UnsubscribeOutcome::NotRegistered,
        };

        if now_empty {
            entries.remove(filter);
            UnsubscribeOutcome::EntryRemoved
        } else {
            UnsubscribeOutcome::ConsumerRemoved
        }
    }

    /// Registered filters in no particular order
    pub fn filters(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consistent view of the registry at this moment
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            entries: Arc::clone(&self.entries),
        }
    }
}

/// Immutable registry view handed to the dispatcher
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    entries: Arc<FilterMap>,
}

impl RegistrySnapshot {
    pub fn filters(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn consumers(&self, filter: &str) -> Option<&HashSet<ConsumerHandle>> {
        self.entries.get(filter)
    }

    /// Union of the consumers of every filter matching `topic`, each once
    pub fn matching_consumers(&self, topic: &str) -> HashSet<ConsumerHandle> {
        let topic_segments: Vec<&str> = topic.split(TOPIC_SEPARATOR).collect();
        let mut matched = HashSet::new();

        for (filter, consumers) in self.entries.iter() {
            let filter_segments: Vec<&str> = filter.split(TOPIC_SEPARATOR).collect();
            if matches_segments(&topic_segments, &filter_segments) {
                matched.extend(consumers.iter().cloned());
            }
        }

        matched
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
