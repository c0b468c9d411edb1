//! Feed Board
//!
//! Ordered list of feeds bound to a connection manager. Every feed is a
//! manager subscription; the board applies delivered signals and connection
//! state to its feeds and republishes them as [`FeedUpdate`]s.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::broadcast;

use super::{Feed, FeedError, FeedUpdate};
use crate::config::FeedConfig;
use crate::connection::{validate_topic, ConnectionManager, ConnectionState, ListenerId};
use crate::signal::FeedSignal;

const UPDATE_CAPACITY: usize = 256;

struct BoardInner {
    feeds: Vec<Feed>,
    manager: Option<ConnectionManager>,
    listener: Option<ListenerId>,
}

impl Drop for BoardInner {
    // The last handle is gone; release what the board holds on the manager.
    fn drop(&mut self) {
        let Some(manager) = self.manager.take() else {
            return;
        };
        if let Some(listener) = self.listener.take() {
            manager.remove_status_listener(listener);
        }
        for feed in &self.feeds {
            manager.unsubscribe(&feed.topic);
        }
        tracing::debug!(feeds = self.feeds.len(), "Dropped board released its feeds");
    }
}

/// Cheaply cloneable handle to the feed list
#[derive(Clone)]
pub struct FeedBoard {
    inner: Arc<Mutex<BoardInner>>,
    updates: broadcast::Sender<FeedUpdate>,
}

impl Default for FeedBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedBoard {
    /// An empty, detached board
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(BoardInner {
                feeds: Vec::new(),
                manager: None,
                listener: None,
            })),
            updates,
        }
    }

    /// Build a board from persisted feeds, skipping invalid or repeated entries
    pub fn from_feed_configs(configs: &[FeedConfig]) -> Self {
        let board = Self::new();
        for config in configs {
            if let Err(err) = board.add_feed(&config.topic, Some(&config.label)) {
                tracing::warn!(topic = %config.topic, error = %err, "Skipping saved feed");
            }
        }
        board
    }

    /// The feed list in its persisted form
    pub fn to_feed_configs(&self) -> Vec<FeedConfig> {
        self.lock()
            .feeds
            .iter()
            .map(|feed| FeedConfig {
                topic: feed.topic.clone(),
                label: feed.label.clone(),
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, BoardInner> {
        lock_inner(&self.inner)
    }

    /// Receive every feed and connection change from now on
    pub fn updates(&self) -> broadcast::Receiver<FeedUpdate> {
        self.updates.subscribe()
    }

    /// Add a feed for `topic`; the label defaults to the topic.
    ///
    /// When the board is attached, the feed is subscribed immediately.
    pub fn add_feed(&self, topic: &str, label: Option<&str>) -> Result<Feed, FeedError> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(FeedError::EmptyTopic);
        }
        validate_topic(topic)?;

        let (feed, manager) = {
            let mut inner = self.lock();
            if inner.feeds.iter().any(|f| f.topic == topic) {
                return Err(FeedError::Duplicate(topic.to_string()));
            }

            let mut feed = Feed::new(topic, label.unwrap_or_default().trim());
            if let Some(manager) = inner.manager.as_ref() {
                feed.apply_connection(manager.status());
            }
            inner.feeds.push(feed.clone());
            (feed, inner.manager.clone())
        };

        tracing::info!(topic = %feed.topic, label = %feed.label, "Feed added");
        if let Some(manager) = manager {
            self.subscribe_feed(&manager, &feed.topic)?;
        }
        Ok(feed)
    }

    /// Remove the feed for `topic`; returns whether it existed
    pub fn remove_feed(&self, topic: &str) -> bool {
        let manager = {
            let mut inner = self.lock();
            let before = inner.feeds.len();
            inner.feeds.retain(|f| f.topic != topic);
            if inner.feeds.len() == before {
                return false;
            }
            inner.manager.clone()
        };

        if let Some(manager) = manager {
            manager.unsubscribe(topic);
        }
        tracing::info!(topic = %topic, "Feed removed");
        true
    }

    /// Remove every feed
    pub fn clear(&self) {
        let (feeds, manager) = {
            let mut inner = self.lock();
            (std::mem::take(&mut inner.feeds), inner.manager.clone())
        };

        if let Some(manager) = manager {
            for feed in &feeds {
                manager.unsubscribe(&feed.topic);
            }
        }
        tracing::info!(removed = feeds.len(), "Feeds cleared");
    }

    /// Feed topics in board order
    pub fn topics(&self) -> Vec<String> {
        self.lock().feeds.iter().map(|f| f.topic.clone()).collect()
    }

    /// Current state of every feed, in board order
    pub fn snapshot(&self) -> Vec<Feed> {
        self.lock().feeds.clone()
    }

    /// Current state of one feed
    pub fn feed(&self, topic: &str) -> Option<Feed> {
        self.lock().feeds.iter().find(|f| f.topic == topic).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().feeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().feeds.is_empty()
    }

    /// Bind the board to `manager`: subscribe every feed and follow its status.
    ///
    /// A board is attached to at most one manager; attaching again detaches
    /// from the previous one first.
    pub fn attach(&self, manager: &ConnectionManager) {
        self.detach();

        let weak = Arc::downgrade(&self.inner);
        let updates = self.updates.clone();
        let listener = manager.on_status_change(move |state| {
            apply_connection(&weak, &updates, state);
        });

        let topics = {
            let mut inner = self.lock();
            inner.manager = Some(manager.clone());
            inner.listener = Some(listener);
            let state = manager.status();
            for feed in inner.feeds.iter_mut() {
                feed.apply_connection(state);
            }
            inner.feeds.iter().map(|f| f.topic.clone()).collect::<Vec<_>>()
        };

        for topic in &topics {
            if let Err(err) = self.subscribe_feed(manager, topic) {
                tracing::warn!(topic = %topic, error = %err, "Feed could not be subscribed");
            }
        }
    }

    /// Unsubscribe every feed and stop following the manager
    pub fn detach(&self) {
        let (manager, listener, topics) = {
            let mut inner = self.lock();
            let topics: Vec<String> = inner.feeds.iter().map(|f| f.topic.clone()).collect();
            (inner.manager.take(), inner.listener.take(), topics)
        };

        let Some(manager) = manager else {
            return;
        };
        if let Some(listener) = listener {
            manager.remove_status_listener(listener);
        }
        for topic in &topics {
            manager.unsubscribe(topic);
        }
    }

    fn subscribe_feed(&self, manager: &ConnectionManager, topic: &str) -> Result<bool, FeedError> {
        let weak = Arc::downgrade(&self.inner);
        let updates = self.updates.clone();
        let active = manager.subscribe(topic, move |topic: &str, signal: FeedSignal| {
            apply_signal(&weak, &updates, topic, signal);
        })?;
        Ok(active)
    }
}

fn lock_inner(inner: &Mutex<BoardInner>) -> MutexGuard<'_, BoardInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

fn apply_signal(
    inner: &Weak<Mutex<BoardInner>>,
    updates: &broadcast::Sender<FeedUpdate>,
    topic: &str,
    signal: FeedSignal,
) {
    let Some(inner) = inner.upgrade() else {
        return;
    };

    let update = {
        let mut inner = lock_inner(&inner);
        let Some(feed) = inner.feeds.iter_mut().find(|f| f.topic == topic) else {
            return;
        };
        feed.apply_signal(&signal);

        match signal {
            FeedSignal::Reading(reading) => FeedUpdate::Reading {
                label: feed.label.clone(),
                reading,
            },
            FeedSignal::NoSignal => FeedUpdate::NoData {
                topic: feed.topic.clone(),
                label: feed.label.clone(),
            },
        }
    };

    // No receivers is fine; the board state is still updated.
    let _ = updates.send(update);
}

fn apply_connection(
    inner: &Weak<Mutex<BoardInner>>,
    updates: &broadcast::Sender<FeedUpdate>,
    state: ConnectionState,
) {
    let Some(inner) = inner.upgrade() else {
        return;
    };

    for feed in lock_inner(&inner).feeds.iter_mut() {
        feed.apply_connection(state);
    }
    let _ = updates.send(FeedUpdate::Connection { state });
}
