//! PubSub facade: the stable surface over registry and adapter.
//!
//! A [`PubSub`] is a cheap cloneable handle. Broadcast payloads are
//! postcard-encoded from any `Serialize` message; `*_raw` variants take
//! pre-encoded bytes for callers that manage their own framing.

use crate::adapter::{Adapter, PoolAdapter};
use crate::dispatch::{Dispatcher, Dispatchers, DEFAULT_DISPATCHER};
use crate::error::Error;
use crate::registry::Registry;
use crate::subscriber::Subscriber;
use crate::transport::{ClusterTransport, NodeName};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;

/// Configuration for starting a PubSub instance.
#[derive(Debug, Clone)]
pub struct PubSubConfig {
    /// Instance name, unique per node. Names the adapter endpoints.
    pub name: String,
    /// Number of adapter receive shards.
    pub pool_size: usize,
    /// Number of shards used when sending. Must be ≤ `pool_size`.
    pub broadcast_pool_size: usize,
    /// Number of registry shards.
    pub registry_size: usize,
}

impl PubSubConfig {
    /// Configuration with defaults: one adapter shard per 4 cores,
    /// `broadcast_pool_size` and `registry_size` equal to `pool_size`.
    pub fn new(name: impl Into<String>) -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let pool_size = (cores / 4).max(1);
        PubSubConfig {
            name: name.into(),
            pool_size,
            broadcast_pool_size: pool_size,
            registry_size: pool_size,
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("name must not be empty".into()));
        }
        if self.pool_size == 0 || self.registry_size == 0 || self.broadcast_pool_size == 0 {
            return Err(Error::InvalidConfig("pool sizes must be nonzero".into()));
        }
        if self.broadcast_pool_size > self.pool_size {
            return Err(Error::InvalidConfig(format!(
                "broadcast_pool_size {} exceeds pool_size {}",
                self.broadcast_pool_size, self.pool_size
            )));
        }
        Ok(())
    }
}

/// Write-once instance metadata, shared by facade and adapter.
#[derive(Debug)]
pub(crate) struct Instance {
    pub(crate) name: String,
    pub(crate) node: NodeName,
    pub(crate) pool_size: usize,
    pub(crate) broadcast_pool_size: usize,
    pub(crate) registry_size: usize,
}

/// Handle to a running PubSub instance.
#[derive(Clone)]
pub struct PubSub {
    meta: Arc<Instance>,
    registry: Arc<Registry>,
    dispatchers: Arc<Dispatchers>,
    adapter: Arc<dyn Adapter>,
}

impl PubSub {
    /// Start a PubSub instance on the given transport.
    ///
    /// Registers the adapter's receiver endpoints and spawns their loops,
    /// so this must run inside a tokio runtime.
    pub fn start(
        config: PubSubConfig,
        transport: Arc<dyn ClusterTransport>,
    ) -> Result<PubSub, Error> {
        config.validate()?;
        let (meta, registry, dispatchers) = Self::assemble(config, &transport);
        let adapter: Arc<dyn Adapter> = PoolAdapter::start(
            Arc::clone(&meta),
            Arc::clone(&registry),
            Arc::clone(&dispatchers),
            transport,
        );
        Ok(PubSub {
            meta,
            registry,
            dispatchers,
            adapter,
        })
    }

    /// Start with a custom broadcast plane instead of the default
    /// [`PoolAdapter`].
    ///
    /// The adapter covers cross-node fan-out only. Its receive path should
    /// hand remote frames back through
    /// [`PubSub::local_broadcast_raw_via`] with the dispatcher id carried on
    /// the wire.
    pub fn start_with_adapter(
        config: PubSubConfig,
        transport: Arc<dyn ClusterTransport>,
        adapter: Arc<dyn Adapter>,
    ) -> Result<PubSub, Error> {
        config.validate()?;
        let (meta, registry, dispatchers) = Self::assemble(config, &transport);
        Ok(PubSub {
            meta,
            registry,
            dispatchers,
            adapter,
        })
    }

    fn assemble(
        config: PubSubConfig,
        transport: &Arc<dyn ClusterTransport>,
    ) -> (Arc<Instance>, Arc<Registry>, Arc<Dispatchers>) {
        let meta = Arc::new(Instance {
            name: config.name,
            node: transport.this_node(),
            pool_size: config.pool_size,
            broadcast_pool_size: config.broadcast_pool_size,
            registry_size: config.registry_size,
        });
        let registry = Arc::new(Registry::new(meta.registry_size));
        let dispatchers = Arc::new(Dispatchers::new());
        (meta, registry, dispatchers)
    }

    /// The name of the node this instance runs on.
    pub fn node_name(&self) -> NodeName {
        self.meta.node.clone()
    }

    /// Register a custom dispatcher under `id`.
    ///
    /// The id travels on cross-node forwards, so the same dispatcher must be
    /// registered on every node of the cluster.
    pub fn register_dispatcher(&self, id: &str, dispatcher: impl Dispatcher) {
        self.dispatchers.register(id, Arc::new(dispatcher));
    }

    /// The local subscription registry of this instance.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Subscribe a handle to a topic.
    pub fn subscribe(&self, topic: &str, subscriber: &Subscriber) -> Result<(), Error> {
        self.registry.subscribe(topic, subscriber, Bytes::new())
    }

    /// Subscribe with a subscription-scoped value visible to custom
    /// dispatchers (e.g. a pre-encoded fastlane frame).
    pub fn subscribe_with(
        &self,
        topic: &str,
        subscriber: &Subscriber,
        value: Bytes,
    ) -> Result<(), Error> {
        self.registry.subscribe(topic, subscriber, value)
    }

    /// Remove every subscription of the handle on `topic`. Idempotent.
    pub fn unsubscribe(&self, topic: &str, subscriber: &Subscriber) {
        self.registry.unsubscribe(topic, subscriber);
    }

    /// Remove every subscription of the handle across all topics.
    pub fn unsubscribe_all(&self, subscriber: &Subscriber) {
        self.registry.unsubscribe_all(subscriber);
    }

    // =========================================================================
    // Broadcasts
    // =========================================================================

    /// Broadcast a message to all subscribers of `topic` on every node.
    pub fn broadcast<M: Serialize>(&self, topic: &str, message: &M) -> Result<(), Error> {
        self.broadcast_raw(topic, encode(message)?)
    }

    /// Broadcast to every subscriber except `from` on this node.
    ///
    /// Remote nodes do not filter: no subscriber there can equal the local
    /// sender handle.
    pub fn broadcast_from<M: Serialize>(
        &self,
        from: &Subscriber,
        topic: &str,
        message: &M,
    ) -> Result<(), Error> {
        self.broadcast_from_raw(from, topic, encode(message)?)
    }

    /// Broadcast to local subscribers only.
    pub fn local_broadcast<M: Serialize>(&self, topic: &str, message: &M) -> Result<(), Error> {
        self.local_broadcast_raw(topic, encode(message)?);
        Ok(())
    }

    /// Broadcast to local subscribers only, excluding `from`.
    pub fn local_broadcast_from<M: Serialize>(
        &self,
        from: &Subscriber,
        topic: &str,
        message: &M,
    ) -> Result<(), Error> {
        self.dispatch_local(DEFAULT_DISPATCHER, topic, Some(from), encode(message)?);
        Ok(())
    }

    /// Broadcast to the subscribers of a single remote node.
    ///
    /// No local dispatch happens; `target` must not be this node.
    pub fn direct_broadcast<M: Serialize>(
        &self,
        target: &NodeName,
        topic: &str,
        message: &M,
    ) -> Result<(), Error> {
        self.adapter
            .direct_broadcast(target, topic, encode(message)?, DEFAULT_DISPATCHER)
    }

    /// Cluster-wide broadcast of a pre-encoded payload.
    pub fn broadcast_raw(&self, topic: &str, payload: Bytes) -> Result<(), Error> {
        self.broadcast_raw_via(DEFAULT_DISPATCHER, topic, payload)
    }

    /// Cluster-wide broadcast through a named dispatcher.
    pub fn broadcast_raw_via(
        &self,
        dispatcher: &str,
        topic: &str,
        payload: Bytes,
    ) -> Result<(), Error> {
        self.adapter.broadcast(topic, payload.clone(), dispatcher)?;
        self.dispatch_local(dispatcher, topic, None, payload);
        Ok(())
    }

    /// Cluster-wide broadcast of a pre-encoded payload, excluding `from`
    /// locally.
    pub fn broadcast_from_raw(
        &self,
        from: &Subscriber,
        topic: &str,
        payload: Bytes,
    ) -> Result<(), Error> {
        self.broadcast_from_raw_via(DEFAULT_DISPATCHER, from, topic, payload)
    }

    /// As [`PubSub::broadcast_from_raw`], through a named dispatcher.
    pub fn broadcast_from_raw_via(
        &self,
        dispatcher: &str,
        from: &Subscriber,
        topic: &str,
        payload: Bytes,
    ) -> Result<(), Error> {
        self.adapter.broadcast(topic, payload.clone(), dispatcher)?;
        self.dispatch_local(dispatcher, topic, Some(from), payload);
        Ok(())
    }

    /// Node-local broadcast of a pre-encoded payload.
    pub fn local_broadcast_raw(&self, topic: &str, payload: Bytes) {
        self.dispatch_local(DEFAULT_DISPATCHER, topic, None, payload);
    }

    /// Node-local broadcast through a named dispatcher.
    pub fn local_broadcast_raw_via(&self, dispatcher: &str, topic: &str, payload: Bytes) {
        self.dispatch_local(dispatcher, topic, None, payload);
    }

    /// Single-node broadcast of a pre-encoded payload through a named
    /// dispatcher.
    pub fn direct_broadcast_raw_via(
        &self,
        dispatcher: &str,
        target: &NodeName,
        topic: &str,
        payload: Bytes,
    ) -> Result<(), Error> {
        self.adapter.direct_broadcast(target, topic, payload, dispatcher)
    }

    fn dispatch_local(
        &self,
        dispatcher: &str,
        topic: &str,
        from: Option<&Subscriber>,
        payload: Bytes,
    ) {
        let dispatcher = self.dispatchers.resolve(dispatcher);
        self.registry.dispatch(topic, |entries| {
            dispatcher.dispatch(entries, from, &payload);
        });
    }
}

/// Postcard-encode a broadcast payload.
fn encode<M: Serialize>(message: &M) -> Result<Bytes, Error> {
    postcard::to_allocvec(message)
        .map(Bytes::from)
        .map_err(|e| Error::Encoding(e.to_string()))
}
