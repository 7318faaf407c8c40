//! Cluster transport abstraction.
//!
//! The fabric does not speak to the network itself. It relies on a substrate
//! that can name peer nodes, deliver a payload asynchronously to a named
//! endpoint on a peer, and report peers coming and going. `ClusterTransport`
//! is that seam; `LocalCluster` is the in-process implementation used by
//! tests and single-process embeddings.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Name of a node in the cluster.
///
/// Opaque to the fabric; compared by equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeName(String);

impl NodeName {
    /// Create a node name.
    pub fn new(name: impl Into<String>) -> Self {
        NodeName(name.into())
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeName {
    fn from(s: &str) -> Self {
        NodeName(s.to_string())
    }
}

impl From<String> for NodeName {
    fn from(s: String) -> Self {
        NodeName(s)
    }
}

/// Peer liveness events delivered to transport monitors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A peer node joined the cluster.
    Up(NodeName),
    /// A peer node left the cluster or died.
    Down(NodeName),
}

/// Abstract cluster substrate.
///
/// Delivery contract: `send_async` is at-most-once, never blocks and never
/// fails loudly; undeliverable payloads are dropped. Payloads from a single
/// sender to a single endpoint arrive in send order or not at all.
pub trait ClusterTransport: Send + Sync + 'static {
    /// The name of the node this transport instance belongs to.
    fn this_node(&self) -> NodeName;

    /// Current peers, excluding this node.
    fn list_peers(&self) -> Vec<NodeName>;

    /// Deliver `payload` to the named endpoint on `node`, best effort.
    fn send_async(&self, node: &NodeName, endpoint: &str, payload: Bytes);

    /// Register a named receiver endpoint on this node.
    ///
    /// Payloads addressed to `endpoint` are pushed into `sink`. Registering
    /// an existing name replaces the previous sink.
    fn register(&self, endpoint: &str, sink: mpsc::UnboundedSender<Bytes>);

    /// Remove a named receiver endpoint.
    fn unregister(&self, endpoint: &str);

    /// Subscribe to peer up/down events.
    fn monitor(&self) -> mpsc::UnboundedReceiver<PeerEvent>;
}

// =============================================================================
// In-process cluster
// =============================================================================

struct NodeSlot {
    endpoints: DashMap<String, mpsc::UnboundedSender<Bytes>>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<PeerEvent>>>,
}

impl NodeSlot {
    fn new() -> Self {
        NodeSlot {
            endpoints: DashMap::new(),
            watchers: Mutex::new(Vec::new()),
        }
    }

    fn notify(&self, event: &PeerEvent) {
        self.watchers
            .lock()
            .retain(|w| w.send(event.clone()).is_ok());
    }
}

/// An in-process cluster of nodes sharing one address space.
///
/// Every node minted from the same `LocalCluster` can reach every other via
/// [`ClusterTransport::send_async`]. Removing a node drops its endpoints and
/// emits [`PeerEvent::Down`] to all survivors, which is how tests simulate a
/// node crash.
#[derive(Clone, Default)]
pub struct LocalCluster {
    nodes: Arc<DashMap<NodeName, Arc<NodeSlot>>>,
}

impl LocalCluster {
    /// Create an empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node and return its transport.
    ///
    /// Existing nodes observe a [`PeerEvent::Up`] for the new name.
    pub fn node(&self, name: impl Into<NodeName>) -> Arc<LocalTransport> {
        let name = name.into();
        self.nodes.insert(name.clone(), Arc::new(NodeSlot::new()));

        let up = PeerEvent::Up(name.clone());
        for entry in self.nodes.iter() {
            if *entry.key() != name {
                entry.value().notify(&up);
            }
        }

        tracing::debug!(node = %name, "local cluster node added");
        Arc::new(LocalTransport {
            node: name,
            nodes: Arc::clone(&self.nodes),
        })
    }

    /// Remove a node, simulating its death.
    ///
    /// The node's endpoints are dropped (closing any receiver loops bound to
    /// them) and every remaining node observes a [`PeerEvent::Down`].
    pub fn remove(&self, name: &NodeName) {
        if self.nodes.remove(name).is_none() {
            return;
        }
        let down = PeerEvent::Down(name.clone());
        for entry in self.nodes.iter() {
            entry.value().notify(&down);
        }
        tracing::debug!(node = %name, "local cluster node removed");
    }

    /// Names of all live nodes.
    pub fn members(&self) -> Vec<NodeName> {
        self.nodes.iter().map(|e| e.key().clone()).collect()
    }
}

/// Transport handle for one node of a [`LocalCluster`].
pub struct LocalTransport {
    node: NodeName,
    nodes: Arc<DashMap<NodeName, Arc<NodeSlot>>>,
}

impl ClusterTransport for LocalTransport {
    fn this_node(&self) -> NodeName {
        self.node.clone()
    }

    fn list_peers(&self) -> Vec<NodeName> {
        self.nodes
            .iter()
            .map(|e| e.key().clone())
            .filter(|n| *n != self.node)
            .collect()
    }

    fn send_async(&self, node: &NodeName, endpoint: &str, payload: Bytes) {
        let Some(slot) = self.nodes.get(node) else {
            return;
        };
        let sink = slot.endpoints.get(endpoint).map(|s| s.clone());
        drop(slot);
        if let Some(sink) = sink {
            let _ = sink.send(payload);
        }
    }

    fn register(&self, endpoint: &str, sink: mpsc::UnboundedSender<Bytes>) {
        if let Some(slot) = self.nodes.get(&self.node) {
            slot.endpoints.insert(endpoint.to_string(), sink);
        }
    }

    fn unregister(&self, endpoint: &str) {
        if let Some(slot) = self.nodes.get(&self.node) {
            slot.endpoints.remove(endpoint);
        }
    }

    fn monitor(&self) -> mpsc::UnboundedReceiver<PeerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(slot) = self.nodes.get(&self.node) {
            slot.watchers.lock().push(tx);
        }
        rx
    }
}
