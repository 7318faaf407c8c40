//! Subscriber handles and mailboxes.
//!
//! A [`Subscriber`] is the identity of a receiving endpoint: a process-wide
//! unique id plus the sending half of an unbounded channel. The paired
//! [`Mailbox`] is the receiving half. Delivery is a non-blocking hand-off;
//! a slow subscriber buffers in its own mailbox and is responsible for
//! draining it. Dropping the mailbox kills the handle; the registry and the
//! tracker notice the closed channel and reap the dead subscriptions.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a message-receiving endpoint.
///
/// Cheap to clone; all clones share the same identity. Two handles compare
/// equal iff they came from the same [`Subscriber::new`] call.
#[derive(Clone)]
pub struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl Subscriber {
    /// Create a subscriber handle and its mailbox.
    pub fn new() -> (Subscriber, Mailbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = Subscriber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        };
        (sub, Mailbox { rx })
    }

    /// The unique id of this handle.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the mailbox has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Enqueue a payload, ignoring a closed mailbox.
    ///
    /// This is the hand-off dispatchers use: non-blocking, unbounded, and
    /// silent on a dead handle (the registry reaps those separately).
    pub fn deliver(&self, payload: Bytes) {
        let _ = self.tx.send(payload);
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subscriber({})", self.id)
    }
}

impl PartialEq for Subscriber {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Subscriber {}

impl Hash for Subscriber {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Receiving half of a subscriber handle.
pub struct Mailbox {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl Mailbox {
    /// Wait for the next payload. `None` once every handle clone is gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Wait up to `timeout` for the next payload.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Bytes> {
        tokio::time::timeout(timeout, self.rx.recv()).await.ok()?
    }

    /// Pop a payload without waiting.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next payload and postcard-decode it.
    ///
    /// Payloads broadcast through the typed facade operations are postcard
    /// frames; this is the matching receive side. Undecodable payloads yield
    /// `None`.
    pub async fn recv_as<T: DeserializeOwned>(&mut self) -> Option<T> {
        let payload = self.rx.recv().await?;
        postcard::from_bytes(&payload).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_identity_is_per_handle() {
        let (a, _ma) = Subscriber::new();
        let (b, _mb) = Subscriber::new();
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[tokio::test]
    async fn test_deliver_and_recv() {
        let (sub, mut mailbox) = Subscriber::new();
        sub.deliver(Bytes::from_static(b"one"));
        sub.deliver(Bytes::from_static(b"two"));

        assert_eq!(mailbox.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(mailbox.recv().await.unwrap(), Bytes::from_static(b"two"));
        assert!(mailbox.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_closed_after_mailbox_drop() {
        let (sub, mailbox) = Subscriber::new();
        assert!(!sub.is_closed());
        drop(mailbox);
        assert!(sub.is_closed());
        // Delivery to a dead handle is a silent no-op.
        sub.deliver(Bytes::from_static(b"lost"));
    }
}
