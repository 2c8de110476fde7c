//! Payload hydration for replay scenarios.
//!
//! When a history is read back from storage, the original typed event is not
//! statically known; only its kind and a serialized field payload survive.
//! [`hydrate`] reconstructs an [`Event`] from that pair so the stream can be
//! fed to [`Aggregate::load_from_history`](crate::Aggregate::load_from_history).

use serde_json::Value;

use crate::error::HydrateError;
use crate::event::Event;

/// Reconstruct an [`Event`] from a kind name and a serialized JSON payload.
///
/// Every top-level field of the parsed payload is carried onto the freshly
/// created event. An empty or `null` payload hydrates to a field-less event.
///
/// # Arguments
///
/// * `kind` - The event's type-identity tag.
/// * `payload` - Serialized JSON object of the event's fields.
///
/// # Errors
///
/// Returns [`HydrateError::Parse`] if the payload is not valid JSON, or
/// [`HydrateError::NotAnObject`] if it parses to a scalar or array.
pub fn hydrate(kind: &str, payload: &str) -> Result<Event, HydrateError> {
    if payload.trim().is_empty() {
        return Ok(Event::named(kind));
    }

    let value: Value = serde_json::from_str(payload)?;
    match value {
        Value::Null => Ok(Event::named(kind)),
        Value::Object(_) => Ok(Event::new(kind, value)),
        other => Err(HydrateError::NotAnObject {
            found: json_type_name(&other),
        }),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
