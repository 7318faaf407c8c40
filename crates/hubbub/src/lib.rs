//! # Hubbub - distributed pub/sub with presence tracking
//!
//! Hubbub is a publish/subscribe fabric for clusters of nodes: many
//! short-lived subscribers per node, cluster-wide fan-out of topic messages,
//! and an eventually-consistent replicated view of who is present on which
//! topic.
//!
//! # Overview
//!
//! Three subsystems cooperate:
//!
//! - **Registry**: a sharded, concurrent map from topic to subscribers,
//!   built for many parallel subscribe/unsubscribe operations and many
//!   concurrent dispatches.
//! - **Broadcast plane**: a pool-sharded fan-out path delivering a message
//!   to every local subscriber of a topic on every node, with exclude-sender
//!   and custom-dispatcher semantics and a safe pool-size migration
//!   protocol.
//! - **Tracker**: a replicated set of `(topic, key, metadata)` entries. Each
//!   node owns its local entries, learns peers' entries through periodic
//!   gossip and immediate delta broadcasts, detects peer death via
//!   heartbeats, and surfaces incremental join/leave diffs to a handler.
//!
//! The cluster substrate is abstract: anything that can name peers, deliver
//! a payload to a named endpoint on a peer, and report peers going up and
//! down implements [`transport::ClusterTransport`]. An in-process
//! [`transport::LocalCluster`] ships for tests and single-process setups.
//!
//! # Quick start
//!
//! ```no_run
//! use hubbub::prelude::*;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), hubbub::Error> {
//! let cluster = LocalCluster::new();
//! let transport: Arc<dyn ClusterTransport> = cluster.node("a");
//!
//! let pubsub = PubSub::start(PubSubConfig::new("chat"), transport)?;
//! let (subscriber, mut mailbox) = Subscriber::new();
//!
//! pubsub.subscribe("room:lobby", &subscriber)?;
//! pubsub.broadcast("room:lobby", &"hello".to_string())?;
//! assert_eq!(mailbox.recv_as::<String>().await.unwrap(), "hello");
//! # Ok(())
//! # }
//! ```
//!
//! # Presence
//!
//! ```no_run
//! use hubbub::prelude::*;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), hubbub::Error> {
//! let cluster = LocalCluster::new();
//! let transport: Arc<dyn ClusterTransport> = cluster.node("a");
//!
//! let tracker = Tracker::start::<NoopHandler>(
//!     TrackerConfig::new("presence"),
//!     transport,
//!     (),
//! )?;
//!
//! let (handle, _mailbox) = Subscriber::new();
//! tracker.track(&handle, "room:lobby", "user:42", &"meta").await?;
//! let present = tracker.list("room:lobby").await?;
//! assert_eq!(present.len(), 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod adapter;
pub mod dispatch;
pub mod error;
pub mod pubsub;
pub mod registry;
pub mod subscriber;
pub mod tracker;
pub mod transport;

pub use error::Error;
pub use pubsub::{PubSub, PubSubConfig};
pub use subscriber::{Mailbox, Subscriber};
pub use tracker::{Tracker, TrackerConfig, TrackerHandler};
pub use transport::{ClusterTransport, LocalCluster, NodeName};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::dispatch::{Dispatcher, DEFAULT_DISPATCHER};
    pub use crate::error::Error;
    pub use crate::pubsub::{PubSub, PubSubConfig};
    pub use crate::subscriber::{Mailbox, Subscriber};
    pub use crate::tracker::{
        Diff, NoopHandler, Presence, TopicDiff, TrackRef, Tracker, TrackerConfig, TrackerHandler,
    };
    pub use crate::transport::{ClusterTransport, LocalCluster, NodeName, PeerEvent};
}
