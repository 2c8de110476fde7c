//! Engine-level event records and the typed-event bridge.
//!
//! An [`Event`] is the unit the aggregate engine moves around: a type-identity
//! tag (`kind`) plus a JSON payload of fields. Domain code usually works with
//! strongly typed event enums and crosses into engine events through
//! [`Event::encode`] / [`Event::decode`]; replay input annotated with
//! persistence metadata arrives as [`EventNode`]s.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named, immutable record of something that happened.
///
/// Identity is the `kind` tag: two events are "the same kind" when their tags
/// match. Field values are only ever compared when an expectation explicitly
/// asks for field inclusion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    kind: String,
    data: Value,
}

impl Event {
    /// Create an event with a payload.
    ///
    /// # Arguments
    ///
    /// * `kind` - The type-identity tag (e.g. `"Created"`).
    /// * `data` - JSON payload carrying the event's fields.
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// Create a field-less event (payload is JSON null).
    pub fn named(kind: impl Into<String>) -> Self {
        Self::new(kind, Value::Null)
    }

    /// The type-identity tag.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The JSON payload. `Value::Null` for field-less events.
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Whether `other` carries the same type-identity tag.
    pub fn same_kind(&self, other: &Event) -> bool {
        self.kind == other.kind
    }

    /// Encode a typed domain event into an engine [`Event`].
    ///
    /// The domain event must use `#[serde(tag = "kind", content = "data")]`
    /// adjacently tagged serialization. The `"kind"` field becomes
    /// [`Event::kind`] and the remaining payload becomes [`Event::data`]
    /// (null for unit variants).
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the domain event cannot be serialized.
    pub fn encode<T: Serialize>(domain: &T) -> serde_json::Result<Self> {
        let value = serde_json::to_value(domain)?;
        let obj = value
            .as_object()
            .expect("adjacently tagged enum must serialize to a JSON object");

        let kind = obj["kind"]
            .as_str()
            .expect("adjacently tagged enum must have a string 'kind' field")
            .to_string();

        // Data may be absent for unit variants.
        let data = obj.get("data").cloned().unwrap_or(Value::Null);

        Ok(Self { kind, data })
    }

    /// Decode this event back into a typed domain event.
    ///
    /// Rebuilds the adjacently tagged JSON object (`"kind"` + `"data"`)
    /// and deserializes it into `T`.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if `T` does not recognize this event's
    /// kind or payload shape.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        let tagged = if self.data.is_null() {
            serde_json::json!({ "kind": self.kind })
        } else {
            serde_json::json!({ "kind": self.kind, "data": self.data })
        };
        serde_json::from_value(tagged)
    }
}

/// Persistence metadata attached to a replayed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Storage-assigned identifier of the event record.
    pub id: String,
    /// Zero-based position of the event within its stream.
    pub index: u64,
}

/// An [`Event`] wrapped with persistence metadata.
///
/// Used only as an alternate replay input format, for histories read back
/// from a store that annotates each record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventNode {
    /// The wrapped event.
    pub event: Event,
    /// Storage metadata for the wrapped event.
    pub metadata: NodeMetadata,
}

impl EventNode {
    /// Wrap an event with its storage id and stream index.
    pub fn new(event: Event, id: impl Into<String>, index: u64) -> Self {
        Self {
            event,
            metadata: NodeMetadata {
                id: id.into(),
                index,
            },
        }
    }
}
