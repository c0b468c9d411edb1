//! Reading and signal types delivered to feed subscribers.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A single normalized observation for a topic
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    /// Topic the payload arrived on
    pub topic: String,
    /// Extracted value at full precision (always finite)
    pub value: f64,
    /// When the payload was received
    pub observed_at: DateTime<Utc>,
}

impl Reading {
    /// Create a reading observed now
    pub fn new(topic: impl Into<String>, value: f64) -> Self {
        Self::at(topic, value, Utc::now())
    }

    /// Create a reading with an explicit observation time
    pub fn at(topic: impl Into<String>, value: f64, observed_at: DateTime<Utc>) -> Self {
        debug_assert!(value.is_finite(), "readings must carry finite values");
        Self {
            topic: topic.into(),
            value,
            observed_at,
        }
    }

    /// Value rounded to one decimal place for display
    pub fn display_value(&self) -> f64 {
        (self.value * 10.0).round() / 10.0
    }
}

/// Outcome handed to a subscriber for every inbound message on its topic.
///
/// A subscriber that has never been called has never received data; `NoSignal`
/// means a payload arrived but carried no usable number.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedSignal {
    /// The payload yielded a numeric value
    Reading(Reading),
    /// The payload had no extractable numeric value
    NoSignal,
}

impl FeedSignal {
    /// The reading, if this signal carries one
    pub fn reading(&self) -> Option<&Reading> {
        match self {
            FeedSignal::Reading(reading) => Some(reading),
            FeedSignal::NoSignal => None,
        }
    }

    /// Whether this is the no-signal outcome
    pub fn is_no_signal(&self) -> bool {
        matches!(self, FeedSignal::NoSignal)
    }
}
