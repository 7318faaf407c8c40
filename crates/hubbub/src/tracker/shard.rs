//! Tracker shard worker and its supervisor loop.
//!
//! A shard is a single task owning one [`ShardState`]. It serializes the
//! operations routed to it (commands from the facade, frames from the
//! transport, peer events) and runs the anti-entropy protocol: every
//! `broadcast_period` (jittered ±25 % so nodes desynchronize) it gossips its
//! pending deltas to `ln(peers) + 1` random peers and checks replica
//! deadlines. The supervisor restarts a panicked shard with empty state and
//! a fresh incarnation ref; peers re-replicate their views into it.

use super::state::{Delta, Replica, ShardState, WireEntry};
use super::{Clock, Diff, Presence, TrackRef, TrackerConfig, TrackerHandler};
use crate::error::Error;
use crate::subscriber::Subscriber;
use crate::transport::{ClusterTransport, NodeName, PeerEvent};
use bytes::Bytes;
use futures::FutureExt;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// Heartbeats carrying more deltas than this withhold them and let the
/// receiver pull a full state transfer instead.
const DELTA_BUDGET: usize = 512;

pub(crate) fn shard_endpoint(name: &str, index: usize) -> String {
    format!("{name}.shard{index}")
}

pub(crate) type MetaFn = Box<dyn FnOnce(Bytes) -> Bytes + Send>;

/// Operations routed to a shard by the tracker facade.
pub(crate) enum Command {
    Track {
        handle: Subscriber,
        topic: String,
        key: String,
        meta: Bytes,
        reply: oneshot::Sender<Result<TrackRef, Error>>,
    },
    Untrack {
        topic: String,
        key: String,
        reply: oneshot::Sender<()>,
    },
    UntrackAll {
        handle_id: u64,
        reply: oneshot::Sender<()>,
    },
    Update {
        topic: String,
        key: String,
        mutate: MetaFn,
        reply: oneshot::Sender<Result<TrackRef, Error>>,
    },
    List {
        topic: String,
        reply: oneshot::Sender<Vec<(String, Bytes)>>,
    },
    GetByKey {
        topic: String,
        key: String,
        reply: oneshot::Sender<Vec<(NodeName, Bytes)>>,
    },
    Size {
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Wire frames exchanged between counterpart shards.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum ShardMessage {
    Heartbeat {
        from: Replica,
        clock: Clock,
        /// `None` when the pending delta blew the size budget; the receiver
        /// falls back to a full transfer.
        deltas: Option<Vec<Delta>>,
    },
    TransferRequest {
        from: Replica,
    },
    TransferReply {
        from: Replica,
        clock: Clock,
        entries: Vec<WireEntry>,
    },
}

/// Run one shard slot, restarting the worker on panic.
///
/// The command and transport channels outlive restarts; only the state (and
/// with it the incarnation ref) is rebuilt, so peers see a crashed shard
/// come back as a new replica.
pub(crate) async fn supervise<H: TrackerHandler>(
    config: Arc<TrackerConfig>,
    index: usize,
    transport: Arc<dyn ClusterTransport>,
    args: H::Args,
    mut cmds: mpsc::UnboundedReceiver<Command>,
    mut net: mpsc::UnboundedReceiver<Bytes>,
    mut peers: mpsc::UnboundedReceiver<PeerEvent>,
) {
    loop {
        let handler = H::init(args.clone()).await;
        let mut shard = Shard {
            state: ShardState::new(transport.this_node()),
            config: Arc::clone(&config),
            index,
            transport: Arc::clone(&transport),
            handler,
            next_tick: tokio::time::Instant::now() + jittered(config.broadcast_period),
            monitoring: true,
        };
        let run = AssertUnwindSafe(shard.run(&mut cmds, &mut net, &mut peers)).catch_unwind();
        match run.await {
            Ok(()) => break,
            Err(_panic) => {
                tracing::error!(
                    name = %config.name,
                    shard = index,
                    "tracker shard crashed, restarting with fresh state"
                );
            }
        }
    }
    transport.unregister(&shard_endpoint(&config.name, index));
}

struct Shard<H: TrackerHandler> {
    state: ShardState,
    config: Arc<TrackerConfig>,
    index: usize,
    transport: Arc<dyn ClusterTransport>,
    handler: H,
    next_tick: tokio::time::Instant,
    monitoring: bool,
}

impl<H: TrackerHandler> Shard<H> {
    async fn run(
        &mut self,
        cmds: &mut mpsc::UnboundedReceiver<Command>,
        net: &mut mpsc::UnboundedReceiver<Bytes>,
        peers: &mut mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        tracing::debug!(
            name = %self.config.name,
            shard = self.index,
            replica = %self.state.replica().shard,
            "tracker shard started"
        );
        loop {
            let deadline = self.next_tick;
            tokio::select! {
                cmd = cmds.recv() => match cmd {
                    Some(cmd) => {
                        if !self.on_command(cmd).await {
                            return;
                        }
                    }
                    None => return,
                },
                frame = net.recv() => match frame {
                    Some(frame) => self.on_frame(frame).await,
                    None => {
                        tracing::debug!(
                            name = %self.config.name,
                            shard = self.index,
                            "transport endpoint closed, stopping shard"
                        );
                        return;
                    }
                },
                event = peers.recv(), if self.monitoring => match event {
                    Some(event) => self.on_peer_event(event).await,
                    None => self.monitoring = false,
                },
                _ = tokio::time::sleep_until(deadline) => self.on_tick().await,
            }
        }
    }

    fn node(&self) -> NodeName {
        self.state.replica().node.clone()
    }

    /// Handle a facade command; returns `false` on shutdown.
    async fn on_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Track {
                handle,
                topic,
                key,
                meta,
                reply,
            } => {
                let result = self.state.track(handle, &topic, &key, meta.clone());
                if result.is_ok() {
                    let mut diff = Diff::default();
                    diff.push_join(
                        &topic,
                        Presence {
                            key,
                            meta,
                            node: self.node(),
                        },
                    );
                    self.flush_deltas();
                    self.emit(diff).await;
                }
                let _ = reply.send(result);
            }
            Command::Untrack { topic, key, reply } => {
                if let Some(meta) = self.state.untrack(&topic, &key) {
                    let mut diff = Diff::default();
                    diff.push_leave(
                        &topic,
                        Presence {
                            key,
                            meta,
                            node: self.node(),
                        },
                    );
                    self.flush_deltas();
                    self.emit(diff).await;
                }
                let _ = reply.send(());
            }
            Command::UntrackAll { handle_id, reply } => {
                let removed = self.state.untrack_all(handle_id);
                self.emit_leaves(removed).await;
                let _ = reply.send(());
            }
            Command::Update {
                topic,
                key,
                mutate,
                reply,
            } => match self.state.update(&topic, &key, mutate) {
                Ok((track_ref, old_meta, new_meta)) => {
                    let mut diff = Diff::default();
                    diff.push_leave(
                        &topic,
                        Presence {
                            key: key.clone(),
                            meta: old_meta,
                            node: self.node(),
                        },
                    );
                    diff.push_join(
                        &topic,
                        Presence {
                            key,
                            meta: new_meta,
                            node: self.node(),
                        },
                    );
                    self.flush_deltas();
                    self.emit(diff).await;
                    let _ = reply.send(Ok(track_ref));
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            Command::List { topic, reply } => {
                let _ = reply.send(self.state.list(&topic));
            }
            Command::GetByKey { topic, key, reply } => {
                let _ = reply.send(self.state.get_by_key(&topic, &key));
            }
            Command::Size { reply } => {
                let _ = reply.send(self.state.size());
            }
            Command::Shutdown { reply } => {
                let left = self.state.leave_all_local();
                if !left.is_empty() {
                    self.flush_deltas();
                }
                tracing::debug!(
                    name = %self.config.name,
                    shard = self.index,
                    left = left.len(),
                    "tracker shard shut down"
                );
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn on_frame(&mut self, frame: Bytes) {
        let message: ShardMessage = match postcard::from_bytes(&frame) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(
                    name = %self.config.name,
                    shard = self.index,
                    error = %err,
                    "dropping malformed shard message"
                );
                return;
            }
        };
        match message {
            ShardMessage::Heartbeat {
                from,
                clock,
                deltas,
            } => {
                if from.node == self.state.replica().node {
                    return;
                }
                let outcome = self
                    .state
                    .merge_heartbeat(&from, clock, deltas, Instant::now());
                if outcome.first_contact {
                    // Introduce ourselves so the peer learns our entries
                    // without waiting for our next tick.
                    self.send_heartbeat(&from.node);
                }
                if outcome.request_transfer {
                    self.send(
                        &from.node,
                        &ShardMessage::TransferRequest {
                            from: self.state.replica().clone(),
                        },
                    );
                }
                self.emit(outcome.diff).await;
            }
            ShardMessage::TransferRequest { from } => {
                let (diff, _first_contact) = self.state.note_peer(&from, Instant::now());
                tracing::debug!(
                    name = %self.config.name,
                    shard = self.index,
                    node = %from.node,
                    "answering state transfer request"
                );
                let reply = ShardMessage::TransferReply {
                    from: self.state.replica().clone(),
                    clock: self.state.clock(),
                    entries: self.state.local_entries(),
                };
                self.send(&from.node, &reply);
                self.emit(diff).await;
            }
            ShardMessage::TransferReply {
                from,
                clock,
                entries,
            } => {
                let diff = self
                    .state
                    .apply_transfer(&from, clock, entries, Instant::now());
                self.emit(diff).await;
            }
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Up(node) => {
                tracing::debug!(
                    name = %self.config.name,
                    shard = self.index,
                    node = %node,
                    "peer up"
                );
                self.send_heartbeat(&node);
            }
            PeerEvent::Down(node) => {
                let diff = self.state.peer_down(&node);
                self.emit(diff).await;
            }
        }
    }

    async fn on_tick(&mut self) {
        let removed = self.state.reap_dead_handles();
        self.emit_leaves(removed).await;

        let diff = self.state.check_deadlines(
            Instant::now(),
            self.config.down_period,
            self.config.permdown_period,
        );
        self.emit(diff).await;

        for node in self.gossip_peers() {
            self.send_heartbeat(&node);
        }
        self.next_tick = tokio::time::Instant::now() + jittered(self.config.broadcast_period);
    }

    /// Anti-entropy fan-out: `ln(peers) + 1` random peers.
    fn gossip_peers(&self) -> Vec<NodeName> {
        let peers = self.transport.list_peers();
        if peers.is_empty() {
            return peers;
        }
        let fanout = ((peers.len() as f64).ln().ceil() as usize + 1).min(peers.len());
        let mut rng = rand::thread_rng();
        peers.choose_multiple(&mut rng, fanout).cloned().collect()
    }

    /// Push pending deltas to every peer right away instead of waiting for
    /// the next tick.
    fn flush_deltas(&mut self) {
        for node in self.transport.list_peers() {
            self.send_heartbeat(&node);
        }
    }

    fn send_heartbeat(&mut self, node: &NodeName) {
        let deltas = match self.state.replica_for_node(node) {
            Some(peer) => {
                let pending = self.state.take_pending(peer);
                if pending.len() > DELTA_BUDGET {
                    tracing::debug!(
                        node = %node,
                        dropped = pending.len(),
                        "pending delta over budget, peer will pull a transfer"
                    );
                    None
                } else {
                    Some(pending)
                }
            }
            None => Some(Vec::new()),
        };
        let message = ShardMessage::Heartbeat {
            from: self.state.replica().clone(),
            clock: self.state.clock(),
            deltas,
        };
        self.send(node, &message);
    }

    fn send(&self, node: &NodeName, message: &ShardMessage) {
        match postcard::to_allocvec(message) {
            Ok(frame) => self.transport.send_async(
                node,
                &shard_endpoint(&self.config.name, self.index),
                Bytes::from(frame),
            ),
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode shard message");
            }
        }
    }

    async fn emit_leaves(&mut self, removed: Vec<(String, String, Bytes)>) {
        if removed.is_empty() {
            return;
        }
        let node = self.node();
        let mut diff = Diff::default();
        for (topic, key, meta) in removed {
            diff.push_leave(
                &topic,
                Presence {
                    key,
                    meta,
                    node: node.clone(),
                },
            );
        }
        self.flush_deltas();
        self.emit(diff).await;
    }

    async fn emit(&mut self, diff: Diff) {
        if !diff.is_empty() {
            self.handler.handle_diff(diff).await;
        }
    }
}

fn jittered(period: Duration) -> Duration {
    period.mul_f64(rand::thread_rng().gen_range(0.75..1.25))
}
