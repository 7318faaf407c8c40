//! End-to-end tracker tests over an in-process cluster.

use async_trait::async_trait;
use bytes::Bytes;
use hubbub::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

/// Handler that forwards every diff into a channel for assertions.
struct SinkHandler {
    tx: mpsc::UnboundedSender<Diff>,
}

#[async_trait]
impl TrackerHandler for SinkHandler {
    type Args = mpsc::UnboundedSender<Diff>;

    async fn init(tx: Self::Args) -> Self {
        SinkHandler { tx }
    }

    async fn handle_diff(&mut self, diff: Diff) {
        let _ = self.tx.send(diff);
    }
}

fn config() -> TrackerConfig {
    TrackerConfig::new("presence").with_broadcast_period(Duration::from_millis(25))
}

fn start(cluster: &LocalCluster, node: &str) -> (Tracker, mpsc::UnboundedReceiver<Diff>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let transport: Arc<dyn ClusterTransport> = cluster.node(node);
    let (tx, rx) = mpsc::unbounded_channel();
    let tracker = Tracker::start::<SinkHandler>(config(), transport, tx).expect("tracker starts");
    (tracker, rx)
}

fn meta_of(value: &str) -> Bytes {
    Bytes::from(postcard::to_allocvec(&value).unwrap())
}

fn decode_meta(meta: &Bytes) -> String {
    postcard::from_bytes(meta).expect("valid meta")
}

async fn wait_for_list(tracker: &Tracker, topic: &str, expected: usize) -> Vec<(String, Bytes)> {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let list = tracker.list(topic).await.expect("shard alive");
        if list.len() == expected {
            return list;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "timed out waiting for {expected} entries on {topic:?}, have {}",
                list.len()
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Pull diffs until one contains a leave (or join) for `(topic, key)`.
async fn wait_for_change(
    rx: &mut mpsc::UnboundedReceiver<Diff>,
    topic: &str,
    key: &str,
    join: bool,
) -> Presence {
    let scan = async {
        loop {
            let diff = rx.recv().await.expect("handler alive");
            if let Some(topic_diff) = diff.topics.get(topic) {
                let changes = if join {
                    &topic_diff.joins
                } else {
                    &topic_diff.leaves
                };
                if let Some(change) = changes.iter().find(|p| p.key == key) {
                    return change.clone();
                }
            }
        }
    };
    tokio::time::timeout(WAIT, scan)
        .await
        .expect("timed out waiting for diff")
}

#[tokio::test]
async fn test_track_list_and_get_by_key() {
    let cluster = LocalCluster::new();
    let (tracker, _diffs) = start(&cluster, "a");
    let (handle, _mailbox) = Subscriber::new();

    tracker
        .track(&handle, "room:1", "user:42", &"meta")
        .await
        .unwrap();

    let list = tracker.list("room:1").await.unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].0, "user:42");
    assert_eq!(decode_meta(&list[0].1), "meta");

    let by_key = tracker.get_by_key("room:1", "user:42").await.unwrap();
    assert_eq!(by_key.len(), 1);
    assert_eq!(by_key[0].0, NodeName::from("a"));
    assert_eq!(tracker.size().await.unwrap(), 1);
}

#[tokio::test]
async fn test_track_twice_is_already_tracked() {
    let cluster = LocalCluster::new();
    let (tracker, _diffs) = start(&cluster, "a");
    let (handle, _mailbox) = Subscriber::new();

    tracker.track(&handle, "t", "u", &"m").await.unwrap();
    assert!(matches!(
        tracker.track(&handle, "t", "u", &"m").await,
        Err(Error::AlreadyTracked { .. })
    ));

    // Untrack then re-track succeeds, and untrack stays idempotent.
    tracker.untrack("t", "u").await.unwrap();
    tracker.untrack("t", "u").await.unwrap();
    tracker.track(&handle, "t", "u", &"m").await.unwrap();
}

#[tokio::test]
async fn test_entry_replicates_to_peer() {
    let cluster = LocalCluster::new();
    let (tracker_a, _diffs_a) = start(&cluster, "a");
    let (tracker_b, mut diffs_b) = start(&cluster, "b");
    let (handle, _mailbox) = Subscriber::new();

    tracker_a
        .track(&handle, "room:1", "user:42", &"meta")
        .await
        .unwrap();

    let list = wait_for_list(&tracker_b, "room:1", 1).await;
    assert_eq!(list[0].0, "user:42");
    assert_eq!(decode_meta(&list[0].1), "meta");

    // The peer's handler observed the join.
    let join = wait_for_change(&mut diffs_b, "room:1", "user:42", true).await;
    assert_eq!(join.node, NodeName::from("a"));
    assert_eq!(decode_meta(&join.meta), "meta");
}

#[tokio::test]
async fn test_node_death_emits_leaves_on_peers() {
    let cluster = LocalCluster::new();
    let (tracker_a, _diffs_a) = start(&cluster, "a");
    let (tracker_b, mut diffs_b) = start(&cluster, "b");
    let (handle, _mailbox) = Subscriber::new();

    tracker_a
        .track(&handle, "room:1", "user:42", &"meta")
        .await
        .unwrap();
    wait_for_list(&tracker_b, "room:1", 1).await;

    cluster.remove(&NodeName::from("a"));

    let leave = wait_for_change(&mut diffs_b, "room:1", "user:42", false).await;
    assert_eq!(leave.node, NodeName::from("a"));
    assert_eq!(decode_meta(&leave.meta), "meta");
    wait_for_list(&tracker_b, "room:1", 0).await;
}

#[tokio::test]
async fn test_update_replicates_new_meta() {
    let cluster = LocalCluster::new();
    let (tracker_a, _diffs_a) = start(&cluster, "a");
    let (tracker_b, mut diffs_b) = start(&cluster, "b");
    let (handle, _mailbox) = Subscriber::new();

    let first = tracker_a.track(&handle, "t", "u", &"old").await.unwrap();
    wait_for_list(&tracker_b, "t", 1).await;

    let second = tracker_a
        .update("t", "u", |_| meta_of("new"))
        .await
        .unwrap();
    assert!(second.clock > first.clock);

    let join = wait_for_change(&mut diffs_b, "t", "u", true).await;
    // Skip the original join if it races in first.
    let join = if decode_meta(&join.meta) == "old" {
        wait_for_change(&mut diffs_b, "t", "u", true).await
    } else {
        join
    };
    assert_eq!(decode_meta(&join.meta), "new");

    let list = wait_for_list(&tracker_b, "t", 1).await;
    assert_eq!(decode_meta(&list[0].1), "new");

    assert!(matches!(
        tracker_a.update("t", "missing", |m| m).await,
        Err(Error::NotTracked { .. })
    ));
}

#[tokio::test]
async fn test_untrack_all_clears_peer_views() {
    let cluster = LocalCluster::new();
    let (tracker_a, _diffs_a) = start(&cluster, "a");
    let (tracker_b, _diffs_b) = start(&cluster, "b");
    let (handle, _mailbox) = Subscriber::new();
    let (other, _other_mailbox) = Subscriber::new();

    tracker_a.track(&handle, "t:1", "u", &"m").await.unwrap();
    tracker_a.track(&handle, "t:2", "u", &"m").await.unwrap();
    tracker_a.track(&other, "t:1", "v", &"m").await.unwrap();
    wait_for_list(&tracker_b, "t:1", 2).await;
    wait_for_list(&tracker_b, "t:2", 1).await;

    tracker_a.untrack_all(&handle).await.unwrap();

    let remaining = wait_for_list(&tracker_b, "t:1", 1).await;
    assert_eq!(remaining[0].0, "v");
    wait_for_list(&tracker_b, "t:2", 0).await;
}

#[tokio::test]
async fn test_dead_handle_is_untracked() {
    let cluster = LocalCluster::new();
    let (tracker_a, _diffs_a) = start(&cluster, "a");
    let (tracker_b, mut diffs_b) = start(&cluster, "b");
    let (handle, mailbox) = Subscriber::new();

    tracker_a.track(&handle, "t", "u", &"m").await.unwrap();
    wait_for_list(&tracker_b, "t", 1).await;

    // The owner dies; the next tick reaps the entry and peers see a leave.
    drop(mailbox);
    wait_for_change(&mut diffs_b, "t", "u", false).await;
    wait_for_list(&tracker_a, "t", 0).await;
    wait_for_list(&tracker_b, "t", 0).await;
}

#[tokio::test]
async fn test_graceful_shutdown_leaves_without_permdown() {
    let cluster = LocalCluster::new();

    // A permdown far beyond the test's horizon proves the leaves come from
    // the shutdown broadcast, not from timeout-driven purging.
    let mut slow_permdown = config();
    slow_permdown.permdown_period = Duration::from_secs(600);

    let transport_a: Arc<dyn ClusterTransport> = cluster.node("a");
    let (tx_a, _diffs_a) = mpsc::unbounded_channel();
    let tracker_a =
        Tracker::start::<SinkHandler>(slow_permdown.clone(), transport_a, tx_a).unwrap();

    let transport_b: Arc<dyn ClusterTransport> = cluster.node("b");
    let (tx_b, mut diffs_b) = mpsc::unbounded_channel();
    let tracker_b = Tracker::start::<SinkHandler>(slow_permdown, transport_b, tx_b).unwrap();

    let (handle, _mailbox) = Subscriber::new();
    tracker_a.track(&handle, "t", "u", &"m").await.unwrap();
    wait_for_list(&tracker_b, "t", 1).await;

    tracker_a.graceful_shutdown().await.unwrap();

    wait_for_change(&mut diffs_b, "t", "u", false).await;
    wait_for_list(&tracker_b, "t", 0).await;

    // The stopped tracker rejects further operations.
    assert!(matches!(
        tracker_a.track(&handle, "t", "u2", &"m").await,
        Err(Error::ShardDown)
    ));
}

#[tokio::test]
async fn test_three_nodes_converge() {
    let cluster = LocalCluster::new();
    let (tracker_a, _da) = start(&cluster, "a");
    let (tracker_b, _db) = start(&cluster, "b");
    let (tracker_c, _dc) = start(&cluster, "c");
    let (ha, _ma) = Subscriber::new();
    let (hb, _mb) = Subscriber::new();
    let (hc, _mc) = Subscriber::new();

    tracker_a.track(&ha, "room", "user:a", &"a").await.unwrap();
    tracker_b.track(&hb, "room", "user:b", &"b").await.unwrap();
    tracker_c.track(&hc, "room", "user:c", &"c").await.unwrap();

    let list_a = wait_for_list(&tracker_a, "room", 3).await;
    let list_b = wait_for_list(&tracker_b, "room", 3).await;
    let list_c = wait_for_list(&tracker_c, "room", 3).await;

    assert_eq!(list_a, list_b);
    assert_eq!(list_b, list_c);
    let keys: Vec<&str> = list_a.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["user:a", "user:b", "user:c"]);
}

#[tokio::test]
async fn test_same_key_on_two_nodes_coexists() {
    let cluster = LocalCluster::new();
    let (tracker_a, _da) = start(&cluster, "a");
    let (tracker_b, _db) = start(&cluster, "b");
    let (ha, _ma) = Subscriber::new();
    let (hb, _mb) = Subscriber::new();

    tracker_a.track(&ha, "t", "shared", &"from-a").await.unwrap();
    tracker_b.track(&hb, "t", "shared", &"from-b").await.unwrap();

    wait_for_list(&tracker_a, "t", 2).await;
    let by_key = tracker_a.get_by_key("t", "shared").await.unwrap();
    let mut owners: Vec<NodeName> = by_key.into_iter().map(|(node, _)| node).collect();
    owners.sort();
    assert_eq!(owners, vec![NodeName::from("a"), NodeName::from("b")]);
}

#[tokio::test]
async fn test_multi_shard_tracker_routes_by_topic() {
    let cluster = LocalCluster::new();
    let transport: Arc<dyn ClusterTransport> = cluster.node("a");
    let (tx, _rx) = mpsc::unbounded_channel();
    let tracker =
        Tracker::start::<SinkHandler>(config().with_pool_size(4), transport, tx).unwrap();
    let (handle, _mailbox) = Subscriber::new();

    for i in 0..16 {
        let topic = format!("room:{i}");
        tracker
            .track(&handle, &topic, "user", &"m")
            .await
            .unwrap();
    }
    assert_eq!(tracker.size().await.unwrap(), 16);
    for i in 0..16 {
        let topic = format!("room:{i}");
        assert_eq!(tracker.list(&topic).await.unwrap().len(), 1);
    }
}
