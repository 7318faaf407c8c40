//! Error types for pub/sub and tracker operations.

use crate::transport::NodeName;
use thiserror::Error;

/// Errors surfaced by the pub/sub facade and the tracker.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration is inconsistent (e.g. `broadcast_pool_size > pool_size`).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The subscriber handle was already dead at call time.
    #[error("subscriber handle is dead")]
    DeadHandle,

    /// A `(topic, key)` pair is already tracked by this node.
    #[error("already tracked: key {key:?} on topic {topic:?}")]
    AlreadyTracked {
        /// The topic of the colliding entry.
        topic: String,
        /// The key of the colliding entry.
        key: String,
    },

    /// No local entry exists for the `(topic, key)` pair.
    #[error("not tracked: key {key:?} on topic {topic:?}")]
    NotTracked {
        /// The topic that was looked up.
        topic: String,
        /// The key that was looked up.
        key: String,
    },

    /// The target node is not a valid peer for this operation.
    #[error("unknown peer: {0}")]
    UnknownPeer(NodeName),

    /// The transport has no route to the target node.
    #[error("transport unreachable: {0}")]
    TransportUnreachable(NodeName),

    /// Message payload serialization failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The tracker shard serving this request has terminated.
    #[error("tracker shard is down")]
    ShardDown,
}
