//! Sharded local subscription registry.
//!
//! Maps topics to subscription entries. Topics are partitioned across
//! independently locked shards so parallel subscribe/unsubscribe/dispatch
//! traffic on unrelated topics never contends. A reverse index from
//! subscriber id to its placements makes whole-handle removal cheap when a
//! subscriber dies.

use crate::error::Error;
use crate::subscriber::Subscriber;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

/// Route a topic to one of `shards` partitions.
pub(crate) fn partition(topic: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    topic.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

/// One subscription: a handle plus the value attached at subscribe time.
///
/// The value is opaque to the registry; custom dispatchers interpret it
/// (e.g. a pre-encoded frame for fastlane delivery).
#[derive(Debug, Clone)]
pub struct Subscription {
    /// The subscribed handle.
    pub subscriber: Subscriber,
    /// Subscription-scoped payload, empty unless attached.
    pub value: Bytes,
}

type Shard = RwLock<HashMap<String, Vec<Subscription>>>;

/// Sharded topic → subscriptions map.
pub struct Registry {
    shards: Box<[Shard]>,
    placements: DashMap<u64, HashSet<(usize, String)>>,
}

impl Registry {
    /// Create a registry with `shards` partitions.
    pub fn new(shards: usize) -> Self {
        let shards = shards.max(1);
        Registry {
            shards: (0..shards).map(|_| RwLock::new(HashMap::new())).collect(),
            placements: DashMap::new(),
        }
    }

    /// Add a subscription for `subscriber` on `topic`.
    ///
    /// Duplicate subscriptions are allowed and each produces its own
    /// delivery. Fails with [`Error::DeadHandle`] if the handle's mailbox is
    /// already gone.
    pub fn subscribe(
        &self,
        topic: &str,
        subscriber: &Subscriber,
        value: Bytes,
    ) -> Result<(), Error> {
        if subscriber.is_closed() {
            return Err(Error::DeadHandle);
        }
        let idx = partition(topic, self.shards.len());
        {
            let mut shard = self.shards[idx].write();
            shard
                .entry(topic.to_string())
                .or_default()
                .push(Subscription {
                    subscriber: subscriber.clone(),
                    value,
                });
        }
        self.placements
            .entry(subscriber.id())
            .or_default()
            .insert((idx, topic.to_string()));
        tracing::trace!(topic = %topic, subscriber = subscriber.id(), "subscribed");
        Ok(())
    }

    /// Remove every subscription of `subscriber` on `topic`. Idempotent.
    pub fn unsubscribe(&self, topic: &str, subscriber: &Subscriber) {
        let idx = partition(topic, self.shards.len());
        {
            let mut shard = self.shards[idx].write();
            if let Some(entries) = shard.get_mut(topic) {
                entries.retain(|e| e.subscriber != *subscriber);
                if entries.is_empty() {
                    shard.remove(topic);
                }
            }
        }
        if let Some(mut placements) = self.placements.get_mut(&subscriber.id()) {
            placements.remove(&(idx, topic.to_string()));
        }
        self.placements
            .remove_if(&subscriber.id(), |_, set| set.is_empty());
    }

    /// Remove every subscription of `subscriber` across all topics.
    pub fn unsubscribe_all(&self, subscriber: &Subscriber) {
        let Some((_, placements)) = self.placements.remove(&subscriber.id()) else {
            return;
        };
        for (idx, topic) in placements {
            let mut shard = self.shards[idx].write();
            if let Some(entries) = shard.get_mut(&topic) {
                entries.retain(|e| e.subscriber != *subscriber);
                if entries.is_empty() {
                    shard.remove(&topic);
                }
            }
        }
        tracing::trace!(subscriber = subscriber.id(), "unsubscribed from all topics");
    }

    /// Run `sink` over the current subscriptions of `topic`.
    ///
    /// The sink observes a consistent snapshot: it runs under the shard read
    /// lock, so an `unsubscribe` on the same shard cannot return while a
    /// dispatch that observed the subscription is still handing off
    /// messages. Sinks must be O(entries) with bounded per-entry cost.
    ///
    /// Handles found dead afterwards are reaped from every shard they touch.
    pub fn dispatch<F: FnOnce(&[Subscription])>(&self, topic: &str, sink: F) {
        let idx = partition(topic, self.shards.len());
        let dead: Vec<Subscriber> = {
            let shard = self.shards[idx].read();
            let Some(entries) = shard.get(topic) else {
                return;
            };
            sink(entries.as_slice());
            entries
                .iter()
                .filter(|e| e.subscriber.is_closed())
                .map(|e| e.subscriber.clone())
                .collect()
        };
        for subscriber in dead {
            tracing::debug!(subscriber = subscriber.id(), "reaping dead subscriber");
            self.unsubscribe_all(&subscriber);
        }
    }

    /// Number of subscriptions currently held for `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let idx = partition(topic, self.shards.len());
        self.shards[idx]
            .read()
            .get(topic)
            .map(|e| e.len())
            .unwrap_or(0)
    }

    /// Number of topics with at least one subscription.
    pub fn topic_count(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }
}
