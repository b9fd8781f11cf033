//! Structured update payloads.
//!
//! A payload is a JSON object. Once a packet is built its payload is frozen
//! behind an [`Arc`]: the dispatch loop holds one reference and every
//! recipient it forwards to holds its own, so the tree is freed only after
//! the last recipient lets go of it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

/// A payload shared between the dispatch loop and its recipients.
pub type SharedPayload = Arc<Payload>;

/// Payload errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    /// Payloads must be JSON objects.
    #[error("Payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// A JSON object payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Map<String, Value>);

impl Payload {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a payload from an arbitrary JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error unless `value` is an object.
    pub fn from_value(value: Value) -> Result<Self, PayloadError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Err(PayloadError::NotAnObject("null")),
            Value::Bool(_) => Err(PayloadError::NotAnObject("bool")),
            Value::Number(_) => Err(PayloadError::NotAnObject("number")),
            Value::String(_) => Err(PayloadError::NotAnObject("string")),
            Value::Array(_) => Err(PayloadError::NotAnObject("array")),
        }
    }

    /// Set a named unsigned integer field, replacing any previous value.
    pub fn set_u64(&mut self, name: impl Into<String>, value: u64) {
        self.0.insert(name.into(), Value::from(value));
    }

    /// Read a named unsigned integer field.
    #[must_use]
    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.0.get(name).and_then(Value::as_u64)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    #[must_use]
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Freeze the payload for sharing.
    #[must_use]
    pub fn share(self) -> SharedPayload {
        Arc::new(self)
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Payload {
    type Error = PayloadError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}
