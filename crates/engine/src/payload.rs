//! Payload builders
//!
//! A mutation is read-modify-write: the worker reads the current entity, a
//! [`PayloadBuilder`] combines it with the item's desired state, and the result
//! is written back.

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid payload: {0}")]
pub struct PayloadError(pub String);

/// Builds the write body from the current entity and the desired state
pub trait PayloadBuilder: Send + Sync {
    /// Whether the current entity must be read before writing
    fn needs_current(&self) -> bool {
        true
    }

    fn build(&self, current: &Value, desired: &Value) -> Result<Value, PayloadError>;
}

/// Overlay the desired top-level fields onto the current entity
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeFields;

impl PayloadBuilder for MergeFields {
    fn build(&self, current: &Value, desired: &Value) -> Result<Value, PayloadError> {
        let Value::Object(desired) = desired else {
            return Err(PayloadError("desired_state must be a JSON object".into()));
        };
        let mut merged = match current {
            Value::Object(current) => current.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(PayloadError(format!(
                    "current entity is not an object: {other}"
                )))
            }
        };
        for (key, value) in desired {
            merged.insert(key.clone(), value.clone());
        }
        Ok(Value::Object(merged))
    }
}

/// Send the desired state unchanged, skipping the read
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaceWith;

impl PayloadBuilder for ReplaceWith {
    fn needs_current(&self) -> bool {
        false
    }

    fn build(&self, _current: &Value, desired: &Value) -> Result<Value, PayloadError> {
        Ok(desired.clone())
    }
}

/// Parse a GET body; an empty body is `null`
pub(crate) fn parse_current(body: &str) -> Result<Value, PayloadError> {
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(body).map_err(|e| PayloadError(format!("unreadable entity: {e}")))
}
