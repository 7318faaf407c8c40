//! Shard-local replicated-set state.
//!
//! One `ShardState` is the replica owned by a single shard worker. It holds
//! the locally-tracked entries, the entries learned from peers, a per-peer
//! clock high-watermark, and the per-peer queues of deltas not yet shipped.
//! Merging is idempotent by clock: a delta at or below the sender's
//! watermark is discarded, so replay and reorder of heartbeats cannot change
//! the observed set. Gaps in the delta stream are detected against the
//! sender's advertised clock and repaired with a full state transfer.

use super::{Clock, Diff, Presence, ShardRef, TrackRef};
use crate::error::Error;
use crate::subscriber::Subscriber;
use crate::transport::NodeName;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Identity of a peer shard: its node plus its incarnation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Replica {
    pub(crate) node: NodeName,
    pub(crate) shard: ShardRef,
}

/// One replicated mutation, tagged with the owner's clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum Delta {
    Join {
        topic: String,
        key: String,
        meta: Bytes,
        clock: Clock,
    },
    Leave {
        topic: String,
        key: String,
        clock: Clock,
    },
}

impl Delta {
    pub(crate) fn clock(&self) -> Clock {
        match self {
            Delta::Join { clock, .. } | Delta::Leave { clock, .. } => *clock,
        }
    }
}

/// A locally-owned entry as shipped in a full state transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireEntry {
    pub(crate) topic: String,
    pub(crate) key: String,
    pub(crate) meta: Bytes,
    pub(crate) clock: Clock,
}

struct Entry {
    key: String,
    meta: Bytes,
    owner: ShardRef,
    owner_node: NodeName,
    clock: Clock,
    /// Present only on locally-owned entries; monitored for liveness.
    handle: Option<Subscriber>,
}

struct ReplicaInfo {
    node: NodeName,
    /// Highest delta clock applied from this replica.
    clock: Clock,
    last_heard: Instant,
    suspect: bool,
}

/// Result of merging a heartbeat.
pub(crate) struct MergeOutcome {
    pub(crate) diff: Diff,
    /// The delta stream had a gap (or was withheld); pull a full transfer.
    pub(crate) request_transfer: bool,
    /// First heartbeat from this incarnation.
    pub(crate) first_contact: bool,
}

pub(crate) struct ShardState {
    replica: Replica,
    clock: Clock,
    values: HashMap<String, Vec<Entry>>,
    replicas: HashMap<ShardRef, ReplicaInfo>,
    by_node: HashMap<NodeName, ShardRef>,
    pending: HashMap<ShardRef, Vec<Delta>>,
}

impl ShardState {
    pub(crate) fn new(node: NodeName) -> Self {
        ShardState {
            replica: Replica {
                node,
                shard: ShardRef::generate(),
            },
            clock: 0,
            values: HashMap::new(),
            replicas: HashMap::new(),
            by_node: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    pub(crate) fn replica(&self) -> &Replica {
        &self.replica
    }

    pub(crate) fn clock(&self) -> Clock {
        self.clock
    }

    pub(crate) fn replica_for_node(&self, node: &NodeName) -> Option<ShardRef> {
        self.by_node.get(node).copied()
    }

    pub(crate) fn size(&self) -> usize {
        self.values.values().map(Vec::len).sum()
    }

    fn next_clock(&mut self) -> Clock {
        self.clock += 1;
        self.clock
    }

    /// Append a delta to every peer's pending queue.
    fn queue(&mut self, delta: Delta) {
        for queue in self.pending.values_mut() {
            queue.push(delta.clone());
        }
    }

    /// Drain the pending queue for one peer.
    pub(crate) fn take_pending(&mut self, peer: ShardRef) -> Vec<Delta> {
        self.pending
            .get_mut(&peer)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    // =========================================================================
    // Local mutations
    // =========================================================================

    pub(crate) fn track(
        &mut self,
        handle: Subscriber,
        topic: &str,
        key: &str,
        meta: Bytes,
    ) -> Result<TrackRef, Error> {
        let own = self.replica.shard;
        let exists = self
            .values
            .get(topic)
            .is_some_and(|entries| entries.iter().any(|e| e.owner == own && e.key == key));
        if exists {
            return Err(Error::AlreadyTracked {
                topic: topic.to_string(),
                key: key.to_string(),
            });
        }

        let clock = self.next_clock();
        self.values
            .entry(topic.to_string())
            .or_default()
            .push(Entry {
                key: key.to_string(),
                meta: meta.clone(),
                owner: own,
                owner_node: self.replica.node.clone(),
                clock,
                handle: Some(handle),
            });
        self.queue(Delta::Join {
            topic: topic.to_string(),
            key: key.to_string(),
            meta,
            clock,
        });
        Ok(TrackRef { owner: own, clock })
    }

    /// Remove a locally-owned entry, returning its metadata.
    pub(crate) fn untrack(&mut self, topic: &str, key: &str) -> Option<Bytes> {
        let own = self.replica.shard;
        let entry = {
            let entries = self.values.get_mut(topic)?;
            let pos = entries.iter().position(|e| e.owner == own && e.key == key)?;
            let entry = entries.remove(pos);
            let emptied = entries.is_empty();
            if emptied {
                self.values.remove(topic);
            }
            entry
        };
        let clock = self.next_clock();
        self.queue(Delta::Leave {
            topic: topic.to_string(),
            key: key.to_string(),
            clock,
        });
        Some(entry.meta)
    }

    /// Remove every locally-owned entry belonging to `handle_id`.
    pub(crate) fn untrack_all(&mut self, handle_id: u64) -> Vec<(String, String, Bytes)> {
        self.untrack_local_where(|entry| {
            entry.handle.as_ref().is_some_and(|h| h.id() == handle_id)
        })
    }

    /// Remove every locally-owned entry whose handle has died.
    pub(crate) fn reap_dead_handles(&mut self) -> Vec<(String, String, Bytes)> {
        self.untrack_local_where(|entry| entry.handle.as_ref().is_some_and(|h| h.is_closed()))
    }

    /// Remove every locally-owned entry (graceful shutdown).
    pub(crate) fn leave_all_local(&mut self) -> Vec<(String, String, Bytes)> {
        self.untrack_local_where(|_| true)
    }

    fn untrack_local_where(
        &mut self,
        pred: impl Fn(&Entry) -> bool,
    ) -> Vec<(String, String, Bytes)> {
        let own = self.replica.shard;
        let mut targets = Vec::new();
        for (topic, entries) in &self.values {
            for entry in entries {
                if entry.owner == own && pred(entry) {
                    targets.push((topic.clone(), entry.key.clone()));
                }
            }
        }
        let mut removed = Vec::new();
        for (topic, key) in targets {
            if let Some(meta) = self.untrack(&topic, &key) {
                removed.push((topic, key, meta));
            }
        }
        removed
    }

    /// Replace the metadata of a locally-owned entry via `mutate`.
    ///
    /// Replicates as a leave plus a join, each with a fresh clock.
    pub(crate) fn update(
        &mut self,
        topic: &str,
        key: &str,
        mutate: impl FnOnce(Bytes) -> Bytes,
    ) -> Result<(TrackRef, Bytes, Bytes), Error> {
        let own = self.replica.shard;
        let not_tracked = || Error::NotTracked {
            topic: topic.to_string(),
            key: key.to_string(),
        };
        let (old_meta, handle) = {
            let entries = self.values.get_mut(topic).ok_or_else(not_tracked)?;
            let pos = entries
                .iter()
                .position(|e| e.owner == own && e.key == key)
                .ok_or_else(not_tracked)?;
            let entry = entries.remove(pos);
            (entry.meta, entry.handle)
        };

        let clock = self.next_clock();
        self.queue(Delta::Leave {
            topic: topic.to_string(),
            key: key.to_string(),
            clock,
        });

        let new_meta = mutate(old_meta.clone());
        let clock = self.next_clock();
        self.values
            .entry(topic.to_string())
            .or_default()
            .push(Entry {
                key: key.to_string(),
                meta: new_meta.clone(),
                owner: own,
                owner_node: self.replica.node.clone(),
                clock,
                handle,
            });
        self.queue(Delta::Join {
            topic: topic.to_string(),
            key: key.to_string(),
            meta: new_meta.clone(),
            clock,
        });
        Ok((TrackRef { owner: own, clock }, old_meta, new_meta))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub(crate) fn list(&self, topic: &str) -> Vec<(String, Bytes)> {
        let mut out: Vec<(String, Bytes)> = self
            .values
            .get(topic)
            .map(|entries| {
                entries
                    .iter()
                    .map(|e| (e.key.clone(), e.meta.clone()))
                    .collect()
            })
            .unwrap_or_default();
        out.sort();
        out
    }

    pub(crate) fn get_by_key(&self, topic: &str, key: &str) -> Vec<(NodeName, Bytes)> {
        self.values
            .get(topic)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.key == key)
                    .map(|e| (e.owner_node.clone(), e.meta.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Locally-owned entries, for a full state transfer.
    pub(crate) fn local_entries(&self) -> Vec<WireEntry> {
        let own = self.replica.shard;
        let mut out = Vec::new();
        for (topic, entries) in &self.values {
            for entry in entries {
                if entry.owner == own {
                    out.push(WireEntry {
                        topic: topic.clone(),
                        key: entry.key.clone(),
                        meta: entry.meta.clone(),
                        clock: entry.clock,
                    });
                }
            }
        }
        out
    }

    // =========================================================================
    // Replica bookkeeping
    // =========================================================================

    /// Record contact from a replica, adopting a new incarnation if needed.
    ///
    /// A new incarnation from a node we already knew purges the old one's
    /// entries first (the old shard is gone; its clock line died with it).
    pub(crate) fn note_peer(&mut self, from: &Replica, now: Instant) -> (Diff, bool) {
        if let Some(info) = self.replicas.get_mut(&from.shard) {
            info.last_heard = now;
            info.suspect = false;
            return (Diff::default(), false);
        }

        let mut diff = Diff::default();
        if let Some(old) = self.by_node.get(&from.node).copied() {
            tracing::info!(
                node = %from.node,
                old_replica = %old,
                new_replica = %from.shard,
                "replica incarnation changed, purging stale entries"
            );
            diff = self.purge_replica(old);
        }
        self.by_node.insert(from.node.clone(), from.shard);
        self.replicas.insert(
            from.shard,
            ReplicaInfo {
                node: from.node.clone(),
                clock: 0,
                last_heard: now,
                suspect: false,
            },
        );
        self.pending.insert(from.shard, Vec::new());
        tracing::debug!(node = %from.node, replica = %from.shard, "replica up");
        (diff, true)
    }

    /// Drop a replica and everything it owned.
    pub(crate) fn purge_replica(&mut self, shard: ShardRef) -> Diff {
        let mut diff = Diff::default();
        let mut emptied = Vec::new();
        for (topic, entries) in self.values.iter_mut() {
            let mut i = 0;
            while i < entries.len() {
                if entries[i].owner == shard {
                    let entry = entries.remove(i);
                    diff.push_leave(
                        topic,
                        Presence {
                            key: entry.key,
                            meta: entry.meta,
                            node: entry.owner_node,
                        },
                    );
                } else {
                    i += 1;
                }
            }
            if entries.is_empty() {
                emptied.push(topic.clone());
            }
        }
        for topic in emptied {
            self.values.remove(&topic);
        }
        if let Some(info) = self.replicas.remove(&shard) {
            if self.by_node.get(&info.node) == Some(&shard) {
                self.by_node.remove(&info.node);
            }
        }
        self.pending.remove(&shard);
        diff
    }

    /// Handle a transport-level node-down: purge every replica of that node.
    pub(crate) fn peer_down(&mut self, node: &NodeName) -> Diff {
        match self.by_node.get(node).copied() {
            Some(shard) => {
                tracing::info!(node = %node, replica = %shard, "peer node down, purging entries");
                self.purge_replica(shard)
            }
            None => Diff::default(),
        }
    }

    /// Purge replicas silent past `permdown` and mark those past `down`.
    pub(crate) fn check_deadlines(
        &mut self,
        now: Instant,
        down: Duration,
        permdown: Duration,
    ) -> Diff {
        let expired: Vec<ShardRef> = self
            .replicas
            .iter()
            .filter(|(_, info)| now.duration_since(info.last_heard) >= permdown)
            .map(|(shard, _)| *shard)
            .collect();

        let mut diff = Diff::default();
        for shard in expired {
            if let Some(info) = self.replicas.get(&shard) {
                tracing::info!(
                    replica = %shard,
                    node = %info.node,
                    "replica permanently down, purging entries"
                );
            }
            diff.extend(self.purge_replica(shard));
        }

        for (shard, info) in self.replicas.iter_mut() {
            if !info.suspect && now.duration_since(info.last_heard) >= down {
                info.suspect = true;
                tracing::warn!(replica = %shard, node = %info.node, "replica silent past down_period");
            }
        }
        diff
    }

    // =========================================================================
    // Merge
    // =========================================================================

    /// Merge a heartbeat from a peer.
    ///
    /// Deltas at or below the peer's watermark are discarded. The stream is
    /// applied only while contiguous; a hole (a lost earlier heartbeat) or a
    /// withheld batch leaves the watermark behind the advertised clock and
    /// flags a transfer instead of risking a missed leave.
    pub(crate) fn merge_heartbeat(
        &mut self,
        from: &Replica,
        clock: Clock,
        deltas: Option<Vec<Delta>>,
        now: Instant,
    ) -> MergeOutcome {
        let (mut diff, first_contact) = self.note_peer(from, now);
        let mut watermark = self.replicas.get(&from.shard).map_or(0, |info| info.clock);
        let mut request_transfer = false;

        match deltas {
            None => {
                if clock > watermark {
                    request_transfer = true;
                }
            }
            Some(mut batch) => {
                batch.sort_by_key(|d| d.clock());
                batch.retain(|d| d.clock() > watermark);
                for delta in batch {
                    if delta.clock() != watermark + 1 {
                        request_transfer = true;
                        break;
                    }
                    watermark = delta.clock();
                    self.apply_delta(from, delta, &mut diff);
                }
                if let Some(info) = self.replicas.get_mut(&from.shard) {
                    info.clock = watermark;
                }
                if watermark < clock {
                    request_transfer = true;
                }
            }
        }

        MergeOutcome {
            diff,
            request_transfer,
            first_contact,
        }
    }

    fn apply_delta(&mut self, from: &Replica, delta: Delta, diff: &mut Diff) {
        match delta {
            Delta::Join {
                topic,
                key,
                meta,
                clock,
            } => {
                let entries = self.values.entry(topic.clone()).or_default();
                if let Some(pos) = entries
                    .iter()
                    .position(|e| e.owner == from.shard && e.key == key)
                {
                    let old = entries.remove(pos);
                    diff.push_leave(
                        &topic,
                        Presence {
                            key: old.key,
                            meta: old.meta,
                            node: old.owner_node,
                        },
                    );
                }
                entries.push(Entry {
                    key: key.clone(),
                    meta: meta.clone(),
                    owner: from.shard,
                    owner_node: from.node.clone(),
                    clock,
                    handle: None,
                });
                diff.push_join(
                    &topic,
                    Presence {
                        key,
                        meta,
                        node: from.node.clone(),
                    },
                );
            }
            Delta::Leave { topic, key, .. } => {
                let Some(entries) = self.values.get_mut(&topic) else {
                    return;
                };
                let Some(pos) = entries
                    .iter()
                    .position(|e| e.owner == from.shard && e.key == key)
                else {
                    return;
                };
                let old = entries.remove(pos);
                let emptied = entries.is_empty();
                if emptied {
                    self.values.remove(&topic);
                }
                diff.push_leave(
                    &topic,
                    Presence {
                        key: old.key,
                        meta: old.meta,
                        node: old.owner_node,
                    },
                );
            }
        }
    }

    /// Replace everything owned by `from` with a full state push.
    pub(crate) fn apply_transfer(
        &mut self,
        from: &Replica,
        clock: Clock,
        entries: Vec<WireEntry>,
        now: Instant,
    ) -> Diff {
        let (mut diff, _first_contact) = self.note_peer(from, now);

        let mut old: HashMap<(String, String), (Bytes, Clock)> = HashMap::new();
        let mut emptied = Vec::new();
        for (topic, list) in self.values.iter_mut() {
            let mut i = 0;
            while i < list.len() {
                if list[i].owner == from.shard {
                    let entry = list.remove(i);
                    old.insert((topic.clone(), entry.key), (entry.meta, entry.clock));
                } else {
                    i += 1;
                }
            }
            if list.is_empty() {
                emptied.push(topic.clone());
            }
        }
        for topic in emptied {
            self.values.remove(&topic);
        }

        for wire in entries {
            match old.remove(&(wire.topic.clone(), wire.key.clone())) {
                Some((meta, entry_clock)) if entry_clock == wire.clock && meta == wire.meta => {
                    self.insert_remote(from, &wire);
                }
                Some((meta, _)) => {
                    diff.push_leave(
                        &wire.topic,
                        Presence {
                            key: wire.key.clone(),
                            meta,
                            node: from.node.clone(),
                        },
                    );
                    diff.push_join(
                        &wire.topic,
                        Presence {
                            key: wire.key.clone(),
                            meta: wire.meta.clone(),
                            node: from.node.clone(),
                        },
                    );
                    self.insert_remote(from, &wire);
                }
                None => {
                    diff.push_join(
                        &wire.topic,
                        Presence {
                            key: wire.key.clone(),
                            meta: wire.meta.clone(),
                            node: from.node.clone(),
                        },
                    );
                    self.insert_remote(from, &wire);
                }
            }
        }

        for ((topic, key), (meta, _)) in old {
            diff.push_leave(
                &topic,
                Presence {
                    key,
                    meta,
                    node: from.node.clone(),
                },
            );
        }

        if let Some(info) = self.replicas.get_mut(&from.shard) {
            info.clock = clock;
            info.last_heard = now;
        }
        diff
    }

    fn insert_remote(&mut self, from: &Replica, wire: &WireEntry) {
        self.values
            .entry(wire.topic.clone())
            .or_default()
            .push(Entry {
                key: wire.key.clone(),
                meta: wire.meta.clone(),
                owner: from.shard,
                owner_node: from.node.clone(),
                clock: wire.clock,
                handle: None,
            });
    }
}
