//! Payload Normalizer
//!
//! Extracts one numeric value from whatever a publisher put on the wire.
//!
//! ## Algorithm
//!
//! 1. A JSON number is accepted as-is.
//! 2. A JSON object is searched for the configured priority fields in order.
//!    The first present field holding a number (or a string that parses cleanly
//!    as one) wins. When none of the priority fields is present, every field is
//!    scanned in document order and the first numeric value is taken.
//! 3. Anything that is not JSON is trimmed and parsed as a float.
//! 4. Everything else, including non-finite results, is `NoSignal`.
//!
//! Values are returned at full precision; rounding is left to the display.

use serde_json::{Map, Value};

/// Field names checked before falling back to a full scan
pub const DEFAULT_FIELD_PRIORITY: [&str; 4] = ["temperature", "temp", "value", "data"];

/// Result of normalizing one payload
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Normalized {
    /// A finite numeric value was found
    Value(f64),
    /// No numeric value could be extracted
    NoSignal,
}

impl Normalized {
    /// The extracted value, if any
    pub fn value(self) -> Option<f64> {
        match self {
            Normalized::Value(v) => Some(v),
            Normalized::NoSignal => None,
        }
    }
}

impl From<Option<f64>> for Normalized {
    fn from(value: Option<f64>) -> Self {
        value.map_or(Normalized::NoSignal, Normalized::Value)
    }
}

/// Stateless payload → number extraction
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadNormalizer {
    field_priority: Vec<String>,
}

impl Default for PayloadNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_FIELD_PRIORITY.iter().map(|f| f.to_string()).collect())
    }
}

impl PayloadNormalizer {
    /// Create a normalizer with a custom field priority list
    pub fn new(field_priority: Vec<String>) -> Self {
        Self { field_priority }
    }

    /// Field names searched before the fallback scan
    pub fn field_priority(&self) -> &[String] {
        &self.field_priority
    }

    /// Normalize a raw payload as received from the broker
    pub fn normalize(&self, payload: &[u8]) -> Normalized {
        match std::str::from_utf8(payload) {
            Ok(text) => self.normalize_text(text),
            Err(_) => Normalized::NoSignal,
        }
    }

    /// Normalize a textual payload
    pub fn normalize_text(&self, text: &str) -> Normalized {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => self.normalize_value(&value),
            Err(_) => parse_number(text).into(),
        }
    }

    /// Normalize an already-decoded JSON value
    pub fn normalize_value(&self, value: &Value) -> Normalized {
        match value {
            Value::Number(n) => n.as_f64().filter(|v| v.is_finite()).into(),
            Value::String(s) => parse_number(s).into(),
            Value::Object(record) => self.from_record(record),
            _ => Normalized::NoSignal,
        }
    }

    fn from_record(&self, record: &Map<String, Value>) -> Normalized {
        let mut found_priority_field = false;

        for field in &self.field_priority {
            if let Some(value) = record.get(field) {
                found_priority_field = true;
                if let Some(number) = scalar_number(value) {
                    return Normalized::Value(number);
                }
            }
        }

        // A conventional field that is present but unusable means the payload
        // was meant to carry a reading and didn't.
        if found_priority_field {
            return Normalized::NoSignal;
        }

        record.values().find_map(scalar_number).into()
    }
}

fn scalar_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => parse_number(s),
        _ => None,
    }
}

fn parse_number(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|v| v.is_finite())
}
