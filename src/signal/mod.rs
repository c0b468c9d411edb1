//! Feed Signals
//!
//! Turns raw broker payloads into the numeric signal a gauge displays.
//!
//! ## Components
//!
//! - **Reading**: one finite numeric observation for a topic
//! - **FeedSignal**: what a subscriber is handed per message (a reading or no signal)
//! - **PayloadNormalizer**: pure payload → number extraction with a configurable
//!   field-priority list

mod normalizer;
mod reading;

pub use normalizer::{Normalized, PayloadNormalizer, DEFAULT_FIELD_PRIORITY};
pub use reading::{FeedSignal, Reading};
