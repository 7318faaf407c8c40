//! Dispatcher protocol: per-broadcast local delivery strategies.
//!
//! A dispatcher receives the snapshot of a topic's subscriptions and the
//! payload, and decides how each subscriber is written to. Dispatchers are
//! registered per PubSub instance under a string id so a cross-node forward
//! can name one; the id must resolve on every node of the cluster.

use crate::registry::Subscription;
use crate::subscriber::Subscriber;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;

/// Id of the built-in dispatcher.
pub const DEFAULT_DISPATCHER: &str = "default";

/// A local delivery strategy.
///
/// `from` is the excluded sender, `None` on remote-originated broadcasts:
/// cross-node forwards never filter by sender. Implementations must not
/// block: work should be O(entries) with bounded per-entry cost, since
/// dispatch runs under the registry shard lock. Errors are the dispatcher's
/// own problem; nothing propagates to the broadcaster.
pub trait Dispatcher: Send + Sync + 'static {
    /// Deliver `payload` to `entries`.
    fn dispatch(&self, entries: &[Subscription], from: Option<&Subscriber>, payload: &Bytes);
}

/// Sends the payload to every handle, skipping the sender if given.
pub struct DefaultDispatcher;

impl Dispatcher for DefaultDispatcher {
    fn dispatch(&self, entries: &[Subscription], from: Option<&Subscriber>, payload: &Bytes) {
        for entry in entries {
            if from.is_some_and(|f| *f == entry.subscriber) {
                continue;
            }
            entry.subscriber.deliver(payload.clone());
        }
    }
}

/// Per-instance table of dispatchers, keyed by wire id.
pub(crate) struct Dispatchers {
    table: DashMap<String, Arc<dyn Dispatcher>>,
    default: Arc<dyn Dispatcher>,
}

impl Dispatchers {
    pub(crate) fn new() -> Self {
        let default: Arc<dyn Dispatcher> = Arc::new(DefaultDispatcher);
        let table: DashMap<String, Arc<dyn Dispatcher>> = DashMap::new();
        table.insert(DEFAULT_DISPATCHER.to_string(), Arc::clone(&default));
        Dispatchers { table, default }
    }

    pub(crate) fn register(&self, id: &str, dispatcher: Arc<dyn Dispatcher>) {
        self.table.insert(id.to_string(), dispatcher);
    }

    /// Resolve an id, falling back to the default dispatcher.
    ///
    /// An unknown id means a peer named a dispatcher this node does not
    /// carry (e.g. mid-deploy); traffic degrades to plain delivery.
    pub(crate) fn resolve(&self, id: &str) -> Arc<dyn Dispatcher> {
        match self.table.get(id) {
            Some(d) => Arc::clone(d.value()),
            None => {
                tracing::warn!(dispatcher = %id, "unknown dispatcher id, using default");
                Arc::clone(&self.default)
            }
        }
    }
}
