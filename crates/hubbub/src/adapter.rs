//! Broadcast plane: cluster-wide fan-out of topic messages.
//!
//! The default [`PoolAdapter`] registers `pool_size` receiver endpoints on
//! its node and forwards every broadcast to the matching endpoint on each
//! peer. Sends go to `hash(topic) % broadcast_pool_size` while receivers
//! exist for all of `0..pool_size`, which is what makes a rolling pool-size
//! change safe: a cluster partially rolled out to a larger pool keeps
//! sending on the smaller pool every node supports, and grown nodes receive
//! on both.

use crate::dispatch::Dispatchers;
use crate::error::Error;
use crate::pubsub::Instance;
use crate::registry::{partition, Registry};
use crate::transport::{ClusterTransport, NodeName};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A broadcast plane implementation for one PubSub instance.
///
/// Local delivery is not the adapter's job; the facade dispatches locally
/// after a successful cluster fan-out.
pub trait Adapter: Send + Sync + 'static {
    /// Name of the node this adapter runs on.
    fn node_name(&self) -> NodeName;

    /// Fan `payload` out to every peer's receiver shard for `topic`.
    fn broadcast(&self, topic: &str, payload: Bytes, dispatcher: &str) -> Result<(), Error>;

    /// Fan `payload` out to a single named peer.
    fn direct_broadcast(
        &self,
        target: &NodeName,
        topic: &str,
        payload: Bytes,
        dispatcher: &str,
    ) -> Result<(), Error>;
}

/// Cross-node fan-out frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Forward {
    topic: String,
    payload: Bytes,
    dispatcher: String,
    origin: NodeName,
}

fn endpoint(name: &str, index: usize) -> String {
    format!("{name}.{index}")
}

/// Default adapter: pool-sharded fan-out over the cluster transport.
pub struct PoolAdapter {
    meta: Arc<Instance>,
    transport: Arc<dyn ClusterTransport>,
}

impl PoolAdapter {
    /// Start the adapter: register receiver endpoints and spawn their loops.
    pub(crate) fn start(
        meta: Arc<Instance>,
        registry: Arc<Registry>,
        dispatchers: Arc<Dispatchers>,
        transport: Arc<dyn ClusterTransport>,
    ) -> Arc<Self> {
        for index in 0..meta.pool_size {
            let (tx, rx) = mpsc::unbounded_channel();
            transport.register(&endpoint(&meta.name, index), tx);
            tokio::spawn(receive_loop(
                index,
                rx,
                Arc::clone(&registry),
                Arc::clone(&dispatchers),
            ));
        }
        tracing::debug!(
            name = %meta.name,
            node = %transport.this_node(),
            pool_size = meta.pool_size,
            broadcast_pool_size = meta.broadcast_pool_size,
            "pubsub adapter started"
        );
        Arc::new(PoolAdapter { meta, transport })
    }

    fn encode(&self, topic: &str, payload: Bytes, dispatcher: &str) -> Result<Bytes, Error> {
        let forward = Forward {
            topic: topic.to_string(),
            payload,
            dispatcher: dispatcher.to_string(),
            origin: self.transport.this_node(),
        };
        postcard::to_allocvec(&forward)
            .map(Bytes::from)
            .map_err(|e| Error::Encoding(e.to_string()))
    }

    fn send_endpoint(&self, topic: &str) -> String {
        endpoint(
            &self.meta.name,
            partition(topic, self.meta.broadcast_pool_size),
        )
    }
}

impl Adapter for PoolAdapter {
    fn node_name(&self) -> NodeName {
        self.transport.this_node()
    }

    fn broadcast(&self, topic: &str, payload: Bytes, dispatcher: &str) -> Result<(), Error> {
        let frame = self.encode(topic, payload, dispatcher)?;
        let endpoint = self.send_endpoint(topic);
        for peer in self.transport.list_peers() {
            self.transport.send_async(&peer, &endpoint, frame.clone());
        }
        Ok(())
    }

    fn direct_broadcast(
        &self,
        target: &NodeName,
        topic: &str,
        payload: Bytes,
        dispatcher: &str,
    ) -> Result<(), Error> {
        if *target == self.transport.this_node() {
            return Err(Error::UnknownPeer(target.clone()));
        }
        if !self.transport.list_peers().contains(target) {
            return Err(Error::TransportUnreachable(target.clone()));
        }
        let frame = self.encode(topic, payload, dispatcher)?;
        let endpoint = self.send_endpoint(topic);
        self.transport.send_async(target, &endpoint, frame);
        Ok(())
    }
}

/// One receiver shard: decode forwards and dispatch them locally.
///
/// Remote-originated broadcasts carry no sender, so dispatchers always see
/// `from = None` here.
async fn receive_loop(
    index: usize,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    registry: Arc<Registry>,
    dispatchers: Arc<Dispatchers>,
) {
    while let Some(frame) = rx.recv().await {
        let forward: Forward = match postcard::from_bytes(&frame) {
            Ok(forward) => forward,
            Err(err) => {
                tracing::warn!(shard = index, error = %err, "dropping malformed forward");
                continue;
            }
        };
        tracing::trace!(
            shard = index,
            topic = %forward.topic,
            origin = %forward.origin,
            "dispatching remote broadcast"
        );
        let dispatcher = dispatchers.resolve(&forward.dispatcher);
        registry.dispatch(&forward.topic, |entries| {
            dispatcher.dispatch(entries, None, &forward.payload);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_names() {
        assert_eq!(endpoint("chat", 0), "chat.0");
        assert_eq!(endpoint("chat", 7), "chat.7");
    }

    #[test]
    fn test_send_shard_respects_broadcast_pool() {
        // With a broadcast pool of 1, every topic maps to shard 0 even
        // though receivers exist for a larger pool.
        for topic in ["a", "room:1", "room:2", "zzz"] {
            assert_eq!(partition(topic, 1), 0);
        }
    }

    #[test]
    fn test_forward_roundtrip() {
        let forward = Forward {
            topic: "room:1".into(),
            payload: Bytes::from_static(b"hi"),
            dispatcher: "default".into(),
            origin: "a".into(),
        };
        let bytes = postcard::to_allocvec(&forward).unwrap();
        let decoded: Forward = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.topic, forward.topic);
        assert_eq!(decoded.payload, forward.payload);
        assert_eq!(decoded.dispatcher, forward.dispatcher);
        assert_eq!(decoded.origin, forward.origin);
    }
}
