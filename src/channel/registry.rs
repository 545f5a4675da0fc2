//! Joined topics and their event callbacks.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

/// Event callback. Shared so dispatch can snapshot the list and release the
/// socket lock before calling into user code.
pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// A joined topic: event name to callbacks in registration order.
#[derive(Default)]
pub struct Topic {
    callbacks: HashMap<String, Vec<Callback>>,
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<&str, usize> = self
            .callbacks
            .iter()
            .map(|(event, list)| (event.as_str(), list.len()))
            .collect();
        f.debug_struct("Topic").field("callbacks", &counts).finish()
    }
}

impl Topic {
    /// Callbacks for `event`, empty if none are registered.
    #[must_use]
    pub fn callbacks(&self, event: &str) -> &[Callback] {
        self.callbacks.get(event).map_or(&[], Vec::as_slice)
    }
}

/// Set of topics this client is currently joined to.
#[derive(Debug, Default)]
pub struct TopicRegistry {
    topics: HashMap<String, Topic>,
}

impl TopicRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `topic` joined with an empty callback table.
    ///
    /// Re-joining a topic discards its previous callbacks.
    pub fn insert(&mut self, topic: &str) {
        if self.topics.insert(topic.to_string(), Topic::default()).is_some() {
            log::debug!("[Registry] Rejoined {topic}, previous callbacks dropped");
        }
    }

    /// Forget `topic` and all its callbacks. Returns whether it was joined.
    pub fn remove(&mut self, topic: &str) -> bool {
        self.topics.remove(topic).is_some()
    }

    /// Register a callback. Returns `false` (and stores nothing) when the
    /// topic is not joined.
    pub fn register(&mut self, topic: &str, event: &str, callback: Callback) -> bool {
        let Some(entry) = self.topics.get_mut(topic) else {
            return false;
        };
        entry
            .callbacks
            .entry(event.to_string())
            .or_default()
            .push(callback);
        true
    }

    /// Snapshot of callbacks for `(topic, event)`; empty when either is unknown.
    #[must_use]
    pub fn callbacks_for(&self, topic: &str, event: &str) -> Vec<Callback> {
        self.topics
            .get(topic)
            .map(|t| t.callbacks(event).to_vec())
            .unwrap_or_default()
    }

    /// Whether `topic` is joined.
    #[must_use]
    pub fn contains(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// Joined topic names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop every topic.
    pub fn clear(&mut self) {
        self.topics.clear();
    }

    /// Number of joined topics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    /// Whether no topic is joined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}
