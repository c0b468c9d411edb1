//! Subscription Registry
//!
//! Topic → callback bookkeeping for the connection manager. Every entry is a
//! *desired* subscription; the `confirmed` flag records whether the broker has
//! acknowledged it on the current connection. Subscriptions requested while
//! offline are simply unconfirmed entries, replayed on the next connect.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::signal::FeedSignal;

/// Callback invoked with `(topic, signal)` for every message on a topic
pub type SignalCallback = Arc<dyn Fn(&str, FeedSignal) + Send + Sync>;

struct Entry {
    callback: SignalCallback,
    confirmed: bool,
    seq: u64,
}

/// Desired subscriptions keyed by topic, at most one callback each
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

impl SubscriptionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the callback for a topic.
    ///
    /// Returns `true` when the topic was not registered before. Replacing a
    /// callback keeps the topic's position and confirmation.
    pub fn upsert(&mut self, topic: &str, callback: SignalCallback) -> bool {
        if let Some(entry) = self.entries.get_mut(topic) {
            entry.callback = callback;
            return false;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            topic.to_string(),
            Entry {
                callback,
                confirmed: false,
                seq,
            },
        );
        true
    }

    /// Remove a topic, returning whether it was registered
    pub fn remove(&mut self, topic: &str) -> bool {
        self.entries.remove(topic).is_some()
    }

    /// Whether a callback is registered for the topic
    pub fn has(&self, topic: &str) -> bool {
        self.entries.contains_key(topic)
    }

    /// The callback registered for a topic
    pub fn callback(&self, topic: &str) -> Option<SignalCallback> {
        self.entries.get(topic).map(|e| Arc::clone(&e.callback))
    }

    /// Snapshot of `(topic, callback)` pairs in registration order
    pub fn entries(&self) -> Vec<(String, SignalCallback)> {
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_by_key(|(_, e)| e.seq);
        entries
            .into_iter()
            .map(|(topic, e)| (topic.clone(), Arc::clone(&e.callback)))
            .collect()
    }

    /// Registered topics in registration order
    pub fn topics(&self) -> Vec<String> {
        self.sorted_topics(|_| true)
    }

    /// Topics not yet acknowledged by the broker, in registration order
    pub fn pending(&self) -> Vec<String> {
        self.sorted_topics(|e| !e.confirmed)
    }

    /// Record a broker acknowledgement; returns false for unknown topics
    pub fn mark_confirmed(&mut self, topic: &str) -> bool {
        match self.entries.get_mut(topic) {
            Some(entry) => {
                entry.confirmed = true;
                true
            }
            None => false,
        }
    }

    /// Return a topic to the desired-but-unconfirmed state
    pub fn mark_unconfirmed(&mut self, topic: &str) {
        if let Some(entry) = self.entries.get_mut(topic) {
            entry.confirmed = false;
        }
    }

    /// Forget every acknowledgement (connection lost or replaced)
    pub fn reset_confirmations(&mut self) {
        for entry in self.entries.values_mut() {
            entry.confirmed = false;
        }
    }

    /// Whether the broker has acknowledged the topic on the current connection
    pub fn is_confirmed(&self, topic: &str) -> bool {
        self.entries.get(topic).is_some_and(|e| e.confirmed)
    }

    /// Number of registered topics
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no topics are registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sorted_topics(&self, keep: impl Fn(&Entry) -> bool) -> Vec<String> {
        let mut topics: Vec<_> = self.entries.iter().filter(|entry| keep(entry.1)).collect();
        topics.sort_by_key(|(_, e)| e.seq);
        topics.into_iter().map(|(topic, _)| topic.clone()).collect()
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("topics", &self.topics())
            .field("pending", &self.pending())
            .finish()
    }
}
