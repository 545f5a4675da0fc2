//! Pending request table keyed by message ref.
//!
//! Each entry is settled exactly once: either the dispatcher takes it when a
//! matching reply arrives, or the waiter evicts it when its timer fires.
//! Both paths go through [`CorrelationTable::take`] under the socket lock, so
//! whichever runs first wins and the other finds the slot empty.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

use super::frame::MessageRef;

/// What a pending entry is waiting on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingKind {
    /// A join; a successful reply registers `topic`.
    Join {
        /// Topic being joined.
        topic: String,
    },
    /// A plain correlated push.
    Request,
}

/// One outstanding client frame awaiting its reply.
#[derive(Debug)]
pub struct PendingRequest {
    /// What the reply settles.
    pub kind: PendingKind,
    reply_tx: oneshot::Sender<Value>,
}

impl PendingRequest {
    /// Hand the reply payload to the waiter. A waiter that already gave up is
    /// not an error.
    pub fn complete(self, payload: Value) {
        let _ = self.reply_tx.send(payload);
    }

    /// Whether the waiter has been dropped.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.reply_tx.is_closed()
    }
}

/// Ref counter plus the pending request table.
///
/// The counter lives as long as the socket; clearing the table on disconnect
/// never rewinds it.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    last_ref: u64,
    pending: HashMap<MessageRef, PendingRequest>,
}

impl CorrelationTable {
    /// Create an empty table whose first ref will be `"1"`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh ref.
    pub fn next_ref(&mut self) -> MessageRef {
        self.last_ref += 1;
        MessageRef::from(self.last_ref)
    }

    /// Register a pending entry for `reference` and return its reply receiver.
    pub fn insert(&mut self, reference: MessageRef, kind: PendingKind) -> oneshot::Receiver<Value> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .pending
            .insert(reference.clone(), PendingRequest { kind, reply_tx })
            .is_some()
        {
            log::warn!("[Correlation] Ref {reference} re-registered, previous waiter dropped");
        }
        reply_rx
    }

    /// Remove and return the entry for `reference`, if it is still pending.
    pub fn take(&mut self, reference: &MessageRef) -> Option<PendingRequest> {
        self.pending.remove(reference)
    }

    /// Whether `reference` is still pending.
    #[must_use]
    pub fn contains(&self, reference: &MessageRef) -> bool {
        self.pending.contains_key(reference)
    }

    /// Drop entries whose waiter has gone away. Returns how many were removed.
    pub fn evict_abandoned(&mut self) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, entry| !entry.is_abandoned());
        before - self.pending.len()
    }

    /// Drop every pending entry; their waiters observe a closed channel.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_refs_are_monotonic_and_unique() {
        let mut table = CorrelationTable::new();
        let refs: Vec<MessageRef> = (0..100).map(|_| table.next_ref()).collect();
        assert_eq!(refs[0].as_str(), "1");
        assert_eq!(refs[99].as_str(), "100");
        let unique: HashSet<_> = refs.iter().collect();
        assert_eq!(unique.len(), refs.len());
    }

    #[test]
    fn test_clear_does_not_rewind_counter() {
        let mut table = CorrelationTable::new();
        let first = table.next_ref();
        let _rx = table.insert(first, PendingKind::Request);
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.next_ref().as_str(), "2");
    }

    #[test]
    fn test_take_settles_once() {
        let mut table = CorrelationTable::new();
        let reference = table.next_ref();
        let mut rx = table.insert(reference.clone(), PendingKind::Request);

        let entry = table.take(&reference).expect("pending entry");
        entry.complete(json!({"ok": true}));
        assert_eq!(rx.try_recv().unwrap(), json!({"ok": true}));

        assert!(table.take(&reference).is_none());
        assert!(!table.contains(&reference));
    }

    #[test]
    fn test_evict_abandoned_waiters() {
        let mut table = CorrelationTable::new();
        let kept = table.next_ref();
        let _kept_rx = table.insert(kept.clone(), PendingKind::Request);
        let dropped = table.next_ref();
        drop(table.insert(
            dropped.clone(),
            PendingKind::Join {
                topic: "room:1".to_string(),
            },
        ));

        assert_eq!(table.evict_abandoned(), 1);
        assert!(table.contains(&kept));
        assert!(!table.contains(&dropped));
    }

    #[tokio::test]
    async fn test_clear_closes_waiters() {
        let mut table = CorrelationTable::new();
        let reference = table.next_ref();
        let rx = table.insert(reference, PendingKind::Request);
        table.clear();
        assert!(rx.await.is_err());
    }
}
