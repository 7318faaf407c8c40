//! Presence tracker: an eventually-consistent replicated set of
//! `(topic, key, metadata)` entries.
//!
//! Each node runs `pool_size` shard workers. A shard owns the entries
//! tracked locally for its slice of the topic space, replicates them to the
//! matching shard on every peer through periodic heartbeats carrying deltas,
//! and surfaces incremental join/leave diffs to a user handler. Replica
//! death is detected by heartbeat silence (permdown) or a transport
//! down-event; either purges the dead replica's entries.

mod shard;
mod state;

use crate::error::Error;
use crate::registry::partition;
use crate::subscriber::Subscriber;
use crate::transport::{ClusterTransport, NodeName};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use self::shard::Command;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Per-shard monotonic delta counter.
pub type Clock = u64;

/// Identity of one shard incarnation.
///
/// Regenerated randomly whenever a shard (re)starts, so peers treat a
/// restarted shard as a brand-new replica and reap the old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardRef(u128);

impl ShardRef {
    pub(crate) fn generate() -> Self {
        ShardRef(rand::random())
    }
}

impl fmt::Display for ShardRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0 as u32)
    }
}

/// Reference returned by a successful `track`, tagging the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackRef {
    /// The shard incarnation owning the entry.
    pub owner: ShardRef,
    /// The clock value assigned to the entry.
    pub clock: Clock,
}

/// One presence change inside a [`Diff`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    /// The tracked key (e.g. a user id).
    pub key: String,
    /// The metadata attached to the entry.
    pub meta: Bytes,
    /// The node that owns the entry.
    pub node: NodeName,
}

/// Joins and leaves observed for one topic.
#[derive(Debug, Clone, Default)]
pub struct TopicDiff {
    /// Entries that appeared.
    pub joins: Vec<Presence>,
    /// Entries that disappeared.
    pub leaves: Vec<Presence>,
}

/// Incremental presence changes, grouped by topic.
#[derive(Debug, Clone, Default)]
pub struct Diff {
    /// Changes per topic; only topics with at least one change appear.
    pub topics: HashMap<String, TopicDiff>,
}

impl Diff {
    /// Whether the diff carries no changes.
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub(crate) fn push_join(&mut self, topic: &str, presence: Presence) {
        self.topics
            .entry(topic.to_string())
            .or_default()
            .joins
            .push(presence);
    }

    pub(crate) fn push_leave(&mut self, topic: &str, presence: Presence) {
        self.topics
            .entry(topic.to_string())
            .or_default()
            .leaves
            .push(presence);
    }

    pub(crate) fn extend(&mut self, other: Diff) {
        for (topic, changes) in other.topics {
            let slot = self.topics.entry(topic).or_default();
            slot.joins.extend(changes.joins);
            slot.leaves.extend(changes.leaves);
        }
    }
}

/// Per-shard user callback contract.
///
/// One handler instance is created per shard (and per shard restart); the
/// instance is threaded through every [`TrackerHandler::handle_diff`] call,
/// so it can carry accumulated state.
#[async_trait]
pub trait TrackerHandler: Send + Sized + 'static {
    /// Arguments handed to [`TrackerHandler::init`] on every shard start.
    type Args: Clone + Send + Sync + 'static;

    /// Build the handler state for one shard incarnation.
    async fn init(args: Self::Args) -> Self;

    /// Observe an incremental presence diff.
    async fn handle_diff(&mut self, diff: Diff);
}

/// Handler that ignores all diffs.
pub struct NoopHandler;

#[async_trait]
impl TrackerHandler for NoopHandler {
    type Args = ();

    async fn init(_args: ()) -> Self {
        NoopHandler
    }

    async fn handle_diff(&mut self, _diff: Diff) {}
}

/// Configuration for starting a tracker instance.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Instance name, unique per node. Names the shard endpoints.
    pub name: String,
    /// Number of tracker shards.
    pub pool_size: usize,
    /// Heartbeat / anti-entropy interval.
    pub broadcast_period: Duration,
    /// Silent periods before a replica is logged as suspect.
    pub max_silent_periods: u32,
    /// Soft-down threshold, informational only.
    pub down_period: Duration,
    /// Silence after which a replica is considered permanently down and its
    /// entries are purged.
    pub permdown_period: Duration,
}

impl TrackerConfig {
    /// Configuration with defaults: a single shard, 1.5 s heartbeats and a
    /// permdown of `2 × broadcast_period × max_silent_periods` (24 s).
    pub fn new(name: impl Into<String>) -> Self {
        let broadcast_period = Duration::from_millis(1500);
        let max_silent_periods = 8;
        TrackerConfig {
            name: name.into(),
            pool_size: 1,
            broadcast_period,
            max_silent_periods,
            down_period: broadcast_period * max_silent_periods,
            permdown_period: broadcast_period * max_silent_periods * 2,
        }
    }

    /// Set the heartbeat interval, rescaling the derived down and permdown
    /// thresholds.
    pub fn with_broadcast_period(mut self, period: Duration) -> Self {
        self.broadcast_period = period;
        self.down_period = period * self.max_silent_periods;
        self.permdown_period = period * self.max_silent_periods * 2;
        self
    }

    /// Set the number of shards.
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("name must not be empty".into()));
        }
        if self.pool_size == 0 {
            return Err(Error::InvalidConfig("pool_size must be nonzero".into()));
        }
        if self.broadcast_period.is_zero() {
            return Err(Error::InvalidConfig(
                "broadcast_period must be nonzero".into(),
            ));
        }
        if self.permdown_period < self.broadcast_period {
            return Err(Error::InvalidConfig(
                "permdown_period must cover at least one broadcast_period".into(),
            ));
        }
        Ok(())
    }
}

struct TrackerInner {
    node: NodeName,
    shards: Vec<mpsc::UnboundedSender<Command>>,
}

/// Handle to a running tracker instance.
///
/// Operations are routed to the shard owning `hash(topic) % pool_size`; the
/// handle is cheap to clone.
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<TrackerInner>,
}

impl Tracker {
    /// Start a tracker on the given transport.
    ///
    /// Spawns `pool_size` supervised shard workers; each creates its own
    /// handler via `H::init(args)`. Must run inside a tokio runtime.
    pub fn start<H: TrackerHandler>(
        config: TrackerConfig,
        transport: Arc<dyn ClusterTransport>,
        args: H::Args,
    ) -> Result<Tracker, Error> {
        config.validate()?;
        let node = transport.this_node();
        let config = Arc::new(config);
        let mut shards = Vec::with_capacity(config.pool_size);

        for index in 0..config.pool_size {
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let (net_tx, net_rx) = mpsc::unbounded_channel();
            transport.register(&shard::shard_endpoint(&config.name, index), net_tx);
            let peer_rx = transport.monitor();
            shards.push(cmd_tx);
            tokio::spawn(shard::supervise::<H>(
                Arc::clone(&config),
                index,
                Arc::clone(&transport),
                args.clone(),
                cmd_rx,
                net_rx,
                peer_rx,
            ));
        }

        Ok(Tracker {
            inner: Arc::new(TrackerInner { node, shards }),
        })
    }

    /// The name of the node this tracker runs on.
    pub fn node_name(&self) -> NodeName {
        self.inner.node.clone()
    }

    /// Track `(topic, key)` with metadata, owned by `handle`.
    ///
    /// The handle is monitored: if its mailbox is dropped, the entry is
    /// untracked on the next heartbeat tick. Fails with
    /// [`Error::AlreadyTracked`] if this node already tracks the pair.
    pub async fn track<M: Serialize>(
        &self,
        handle: &Subscriber,
        topic: &str,
        key: &str,
        meta: &M,
    ) -> Result<TrackRef, Error> {
        let meta = postcard::to_allocvec(meta)
            .map(Bytes::from)
            .map_err(|e| Error::Encoding(e.to_string()))?;
        self.call(topic, |reply| Command::Track {
            handle: handle.clone(),
            topic: topic.to_string(),
            key: key.to_string(),
            meta,
            reply,
        })
        .await?
    }

    /// Remove the locally-owned entry for `(topic, key)`. Idempotent.
    pub async fn untrack(&self, topic: &str, key: &str) -> Result<(), Error> {
        self.call(topic, |reply| Command::Untrack {
            topic: topic.to_string(),
            key: key.to_string(),
            reply,
        })
        .await
    }

    /// Remove every locally-owned entry belonging to `handle`.
    pub async fn untrack_all(&self, handle: &Subscriber) -> Result<(), Error> {
        for shard in &self.inner.shards {
            let (tx, rx) = oneshot::channel();
            shard
                .send(Command::UntrackAll {
                    handle_id: handle.id(),
                    reply: tx,
                })
                .map_err(|_| Error::ShardDown)?;
            rx.await.map_err(|_| Error::ShardDown)?;
        }
        Ok(())
    }

    /// Replace the metadata of a locally-owned entry.
    ///
    /// `mutate` receives the current encoded metadata and returns the new
    /// encoding; the change replicates as a leave plus a join with a fresh
    /// clock. Fails with [`Error::NotTracked`] if the pair is not tracked
    /// here.
    pub async fn update(
        &self,
        topic: &str,
        key: &str,
        mutate: impl FnOnce(Bytes) -> Bytes + Send + 'static,
    ) -> Result<TrackRef, Error> {
        self.call(topic, |reply| Command::Update {
            topic: topic.to_string(),
            key: key.to_string(),
            mutate: Box::new(mutate),
            reply,
        })
        .await?
    }

    /// All known entries for `topic`, local and replicated, sorted by key.
    pub async fn list(&self, topic: &str) -> Result<Vec<(String, Bytes)>, Error> {
        self.call(topic, |reply| Command::List {
            topic: topic.to_string(),
            reply,
        })
        .await
    }

    /// All entries for `(topic, key)` with the owning node of each.
    pub async fn get_by_key(
        &self,
        topic: &str,
        key: &str,
    ) -> Result<Vec<(NodeName, Bytes)>, Error> {
        self.call(topic, |reply| Command::GetByKey {
            topic: topic.to_string(),
            key: key.to_string(),
            reply,
        })
        .await
    }

    /// Total number of entries across all shards.
    pub async fn size(&self) -> Result<usize, Error> {
        let mut total = 0;
        for shard in &self.inner.shards {
            let (tx, rx) = oneshot::channel();
            shard
                .send(Command::Size { reply: tx })
                .map_err(|_| Error::ShardDown)?;
            total += rx.await.map_err(|_| Error::ShardDown)?;
        }
        Ok(total)
    }

    /// Stop all shards, broadcasting leaves for every locally-owned entry so
    /// peers do not wait out the permdown period.
    pub async fn graceful_shutdown(&self) -> Result<(), Error> {
        for shard in &self.inner.shards {
            let (tx, rx) = oneshot::channel();
            shard
                .send(Command::Shutdown { reply: tx })
                .map_err(|_| Error::ShardDown)?;
            rx.await.map_err(|_| Error::ShardDown)?;
        }
        Ok(())
    }

    async fn call<T>(
        &self,
        topic: &str,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, Error> {
        let index = partition(topic, self.inner.shards.len());
        let (tx, rx) = oneshot::channel();
        self.inner.shards[index]
            .send(command(tx))
            .map_err(|_| Error::ShardDown)?;
        rx.await.map_err(|_| Error::ShardDown)
    }
}
