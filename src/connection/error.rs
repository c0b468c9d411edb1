//! Subscription error types and topic validation.

use thiserror::Error;

/// Longest topic name the MQTT wire format can carry
pub const MAX_TOPIC_LEN: usize = 65_535;

/// Errors returned synchronously from `subscribe`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// Topic was empty or only whitespace
    #[error("Topic must not be empty")]
    EmptyTopic,

    /// Topic contained a `+` or `#` wildcard
    #[error("Topic '{0}' contains a wildcard; feeds subscribe to exact topics")]
    Wildcard(String),

    /// Topic exceeded the wire limit
    #[error("Topic is {0} bytes long (limit: {})", MAX_TOPIC_LEN)]
    TooLong(usize),

    /// Topic contained a character brokers reject
    #[error("Topic contains an invalid character")]
    InvalidCharacter,
}

/// Check that a topic is a non-empty, exact, broker-addressable name
pub fn validate_topic(topic: &str) -> Result<(), SubscriptionError> {
    if topic.trim().is_empty() {
        return Err(SubscriptionError::EmptyTopic);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(SubscriptionError::TooLong(topic.len()));
    }
    if topic.contains('\0') {
        return Err(SubscriptionError::InvalidCharacter);
    }
    if topic.contains(['+', '#']) {
        return Err(SubscriptionError::Wildcard(topic.to_string()));
    }
    Ok(())
}
