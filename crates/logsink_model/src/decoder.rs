//! Payload decoder.
//!
//! Payloads are JSON objects of the form
//!
//! ```json
//! {"id": 1, "name": "alpha", "timestamp": "2024-01-01T00:00:00Z"}
//! ```
//!
//! All three fields are required (`null` counts as missing) and unknown
//! fields are ignored. Decoding is pure and never panics.

use crate::class::{Classify, ErrorClass};
use crate::dead_letter::FailureReason;
use crate::event::DecodedEvent;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

/// Why a payload could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The bytes are not JSON.
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),

    /// The JSON value is not an object.
    #[error("payload is not a JSON object")]
    NotAnObject,

    /// A required field is absent or null.
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    /// A field has the wrong JSON type.
    #[error("field `{field}` has the wrong type, expected {expected}")]
    WrongType {
        /// Field name.
        field: &'static str,
        /// Expected type.
        expected: &'static str,
    },

    /// The timestamp is not RFC 3339.
    #[error("field `timestamp` is not an RFC 3339 time: {0}")]
    InvalidTimestamp(String),

    /// The name is empty or whitespace.
    #[error("field `name` is empty")]
    EmptyName,
}

impl DecodeError {
    /// Dead-letter reason for this failure.
    pub fn reason(&self) -> FailureReason {
        FailureReason::MalformedPayload
    }
}

impl Classify for DecodeError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Permanent
    }
}

/// Decodes a raw payload into a validated event.
pub fn decode(raw: &[u8]) -> Result<DecodedEvent, DecodeError> {
    let value: Value =
        serde_json::from_slice(raw).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
    let Value::Object(fields) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let id = required(&fields, "id")?
        .as_i64()
        .ok_or(DecodeError::WrongType {
            field: "id",
            expected: "a 64-bit integer",
        })?;

    let name = required(&fields, "name")?
        .as_str()
        .ok_or(DecodeError::WrongType {
            field: "name",
            expected: "a string",
        })?;
    if name.trim().is_empty() {
        return Err(DecodeError::EmptyName);
    }

    let timestamp = required(&fields, "timestamp")?
        .as_str()
        .ok_or(DecodeError::WrongType {
            field: "timestamp",
            expected: "a string",
        })?;
    let timestamp = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|e| DecodeError::InvalidTimestamp(e.to_string()))?
        .with_timezone(&Utc);

    Ok(DecodedEvent {
        id,
        name: name.to_owned(),
        timestamp,
    })
}

fn required<'a>(fields: &'a Map<String, Value>, name: &'static str) -> Result<&'a Value, DecodeError> {
    match fields.get(name) {
        None | Some(Value::Null) => Err(DecodeError::MissingField(name)),
        Some(value) => Ok(value),
    }
}
