//! Inbound frame routing.
//!
//! Routing is split in two phases, the same way the connection loop handles
//! any user callback: [`route`] runs under the socket lock and decides what
//! happens to a frame, then [`invoke`] runs the chosen callbacks after the
//! lock is released, so callbacks may push, register, or leave freely.

use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::Value;

use super::correlation::{CorrelationTable, PendingKind};
use super::frame::{Frame, MessageRef, ReplyStatus};
use super::registry::{Callback, TopicRegistry};

/// Why a frame reached nobody.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Topic is not joined.
    UnknownTopic,
    /// Topic is joined but nothing listens for the event.
    NoCallbacks,
}

/// Routing decision for one inbound frame.
pub enum Dispatch {
    /// Frame settled a pending request.
    Replied {
        /// Ref of the settled request.
        reference: MessageRef,
        /// Topic registered as a side effect of a successful join reply.
        joined: Option<String>,
    },
    /// Frame should be handed to these callbacks, in order.
    Deliver {
        /// Callbacks snapshot.
        callbacks: Vec<Callback>,
        /// Payload to pass each callback.
        payload: Value,
    },
    /// Frame is discarded.
    Dropped(DropReason),
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Replied { reference, joined } => f
                .debug_struct("Replied")
                .field("reference", reference)
                .field("joined", joined)
                .finish(),
            Self::Deliver { callbacks, .. } => f
                .debug_struct("Deliver")
                .field("callbacks", &callbacks.len())
                .finish_non_exhaustive(),
            Self::Dropped(reason) => f.debug_tuple("Dropped").field(reason).finish(),
        }
    }
}

/// Decide where `frame` goes, mutating the tables as needed.
///
/// A reply whose ref is pending settles that entry and nothing else. Any
/// other frame, including a reply with a stale or unknown ref, is routed by
/// topic and event.
pub fn route(registry: &mut TopicRegistry, correlation: &mut CorrelationTable, frame: Frame) -> Dispatch {
    if frame.is_reply() {
        if let Some(reference) = frame.reference.as_ref() {
            if let Some(entry) = correlation.take(reference) {
                let joined = match &entry.kind {
                    PendingKind::Join { topic } if entry.is_abandoned() => {
                        log::debug!("[Dispatch] Join reply for {topic} arrived after waiter left");
                        None
                    }
                    PendingKind::Join { topic } => {
                        match ReplyStatus::from_payload(frame.payload.clone()) {
                            ReplyStatus::Ok(_) => {
                                registry.insert(topic);
                                Some(topic.clone())
                            }
                            ReplyStatus::Error(_) => None,
                        }
                    }
                    PendingKind::Request => None,
                };
                let reference = reference.clone();
                entry.complete(frame.payload);
                return Dispatch::Replied { reference, joined };
            }
        }
        log::trace!(
            "[Dispatch] Reply with unmatched ref {:?} on {}",
            frame.reference.as_ref().map(MessageRef::as_str),
            frame.topic
        );
    }

    if !registry.contains(&frame.topic) {
        return Dispatch::Dropped(DropReason::UnknownTopic);
    }
    let callbacks = registry.callbacks_for(&frame.topic, &frame.event);
    if callbacks.is_empty() {
        return Dispatch::Dropped(DropReason::NoCallbacks);
    }
    Dispatch::Deliver {
        callbacks,
        payload: frame.payload,
    }
}

/// Run every callback with `payload`. A panicking callback is logged and
/// does not stop the rest. Returns the number of callbacks that panicked.
pub fn invoke(callbacks: &[Callback], payload: &Value) -> usize {
    let mut failures = 0;
    for (index, callback) in callbacks.iter().enumerate() {
        if catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
            failures += 1;
            log::error!("[Dispatch] Callback #{index} panicked, continuing with the rest");
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn reply(topic: &str, reference: &str, payload: Value) -> Frame {
        Frame {
            topic: topic.to_string(),
            event: "phx_reply".to_string(),
            payload,
            reference: Some(MessageRef::from(reference)),
        }
    }

    fn broadcast(topic: &str, event: &str, payload: Value) -> Frame {
        Frame {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            reference: None,
        }
    }

    #[test]
    fn test_join_reply_registers_topic() {
        let mut registry = TopicRegistry::new();
        let mut table = CorrelationTable::new();
        let reference = table.next_ref();
        let mut rx = table.insert(
            reference.clone(),
            PendingKind::Join {
                topic: "room:1".to_string(),
            },
        );
        assert!(!registry.contains("room:1"));

        let outcome = route(
            &mut registry,
            &mut table,
            reply("room:1", reference.as_str(), json!({"status": "ok", "response": {}})),
        );

        assert!(matches!(outcome, Dispatch::Replied { joined: Some(ref t), .. } if t == "room:1"));
        assert!(registry.contains("room:1"));
        assert!(table.is_empty());
        assert_eq!(rx.try_recv().unwrap()["status"], "ok");
    }

    #[test]
    fn test_join_error_reply_does_not_register() {
        let mut registry = TopicRegistry::new();
        let mut table = CorrelationTable::new();
        let reference = table.next_ref();
        let _rx = table.insert(
            reference.clone(),
            PendingKind::Join {
                topic: "room:1".to_string(),
            },
        );

        let outcome = route(
            &mut registry,
            &mut table,
            reply("room:1", reference.as_str(), json!({"status": "error", "response": {}})),
        );

        assert!(matches!(outcome, Dispatch::Replied { joined: None, .. }));
        assert!(!registry.contains("room:1"));
    }

    #[test]
    fn test_abandoned_join_reply_does_not_register() {
        let mut registry = TopicRegistry::new();
        let mut table = CorrelationTable::new();
        let reference = table.next_ref();
        drop(table.insert(
            reference.clone(),
            PendingKind::Join {
                topic: "room:1".to_string(),
            },
        ));

        route(&mut registry, &mut table, reply("room:1", reference.as_str(), json!({})));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unmatched_reply_has_no_side_effects() {
        let mut registry = TopicRegistry::new();
        let mut table = CorrelationTable::new();
        registry.insert("room:1");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        registry.register(
            "room:1",
            "msg",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let pending = table.next_ref();
        let _rx = table.insert(pending.clone(), PendingKind::Request);

        let outcome = route(&mut registry, &mut table, reply("room:1", "999", json!({})));

        assert!(matches!(outcome, Dispatch::Dropped(DropReason::NoCallbacks)));
        assert!(table.contains(&pending));
        assert_eq!(registry.names(), vec!["room:1".to_string()]);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_second_reply_with_same_ref_is_not_correlated() {
        let mut registry = TopicRegistry::new();
        let mut table = CorrelationTable::new();
        let reference = table.next_ref();
        let _rx = table.insert(reference.clone(), PendingKind::Request);

        let first = route(&mut registry, &mut table, reply("t", reference.as_str(), json!(1)));
        let second = route(&mut registry, &mut table, reply("t", reference.as_str(), json!(2)));

        assert!(matches!(first, Dispatch::Replied { .. }));
        assert!(matches!(second, Dispatch::Dropped(DropReason::UnknownTopic)));
    }

    #[test]
    fn test_event_for_unknown_topic_dropped() {
        let mut registry = TopicRegistry::new();
        let mut table = CorrelationTable::new();
        let outcome = route(&mut registry, &mut table, broadcast("room:9", "msg", json!({})));
        assert!(matches!(outcome, Dispatch::Dropped(DropReason::UnknownTopic)));
    }

    #[test]
    fn test_event_delivers_payload_to_callbacks() {
        let mut registry = TopicRegistry::new();
        let mut table = CorrelationTable::new();
        registry.insert("room:1");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry.register(
            "room:1",
            "msg",
            Arc::new(move |payload| sink.lock().unwrap().push(payload.clone())),
        );

        let Dispatch::Deliver { callbacks, payload } =
            route(&mut registry, &mut table, broadcast("room:1", "msg", json!({"text": "hi"})))
        else {
            panic!("expected delivery");
        };
        assert_eq!(invoke(&callbacks, &payload), 0);
        assert_eq!(*seen.lock().unwrap(), vec![json!({"text": "hi"})]);
    }

    #[test]
    fn test_panicking_callback_is_isolated() {
        let hits = Arc::new(AtomicUsize::new(0));
        let before = Arc::clone(&hits);
        let after = Arc::clone(&hits);
        let callbacks: Vec<Callback> = vec![
            Arc::new(move |_| {
                before.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(|_| panic!("callback failure")),
            Arc::new(move |_| {
                after.fetch_add(1, Ordering::SeqCst);
            }),
        ];

        assert_eq!(invoke(&callbacks, &Value::Null), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
