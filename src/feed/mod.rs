//! Feeds
//!
//! The dashboard side of a subscription: one feed per gauge, keyed by topic,
//! with a display label and what the gauge currently shows.
//!
//! ## Architecture
//!
//! - **Feed**: topic, label, status and last reading
//! - **FeedBoard**: the ordered feed list; subscribes feeds through the
//!   connection manager and republishes every change on a broadcast channel
//! - **FeedUpdate**: what subscribers to the board receive

mod board;

pub use board::FeedBoard;

use serde::Serialize;
use thiserror::Error;

use crate::connection::{ConnectionState, SubscriptionError};
use crate::signal::{FeedSignal, Reading};

/// What a gauge is showing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    /// Nothing received yet
    #[default]
    Waiting,
    /// Showing a received value
    Live,
    /// The last payload carried no number
    NoData,
    /// The broker connection is down
    Disconnected,
}

/// One gauge on the board
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Feed {
    pub topic: String,
    pub label: String,
    pub status: FeedStatus,
    pub last_reading: Option<Reading>,
}

impl Feed {
    /// A waiting feed; an empty label falls back to the topic
    pub fn new(topic: impl Into<String>, label: impl Into<String>) -> Self {
        let topic = topic.into();
        let label = label.into();
        let label = if label.trim().is_empty() {
            topic.clone()
        } else {
            label
        };
        Self {
            topic,
            label,
            status: FeedStatus::Waiting,
            last_reading: None,
        }
    }

    /// Apply one delivered signal
    pub fn apply_signal(&mut self, signal: &FeedSignal) {
        match signal {
            FeedSignal::Reading(reading) => {
                self.status = FeedStatus::Live;
                self.last_reading = Some(reading.clone());
            }
            FeedSignal::NoSignal => self.status = FeedStatus::NoData,
        }
    }

    /// Apply a connection state change
    pub fn apply_connection(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                self.status = if self.last_reading.is_some() {
                    FeedStatus::Live
                } else {
                    FeedStatus::Waiting
                };
            }
            ConnectionState::Disconnected | ConnectionState::Errored => {
                self.status = FeedStatus::Disconnected;
            }
            ConnectionState::Connecting => {}
        }
    }
}

/// Change published by a [`FeedBoard`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedUpdate {
    /// A feed received a value
    Reading { label: String, reading: Reading },
    /// A feed received a payload without a number
    NoData { topic: String, label: String },
    /// The broker connection changed state
    Connection { state: ConnectionState },
}

/// Errors from editing the feed list
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("Please enter a topic")]
    EmptyTopic,

    #[error("A feed for topic '{0}' already exists")]
    Duplicate(String),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
}
