//! Crate-level error types.

/// Error returned when hydrating an event from a serialized payload fails.
#[derive(Debug, thiserror::Error)]
pub enum HydrateError {
    /// The payload is not valid JSON.
    #[error("payload is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    /// The payload parsed, but is not a JSON object.
    ///
    /// Hydration copies top-level fields onto a named event, so scalar or
    /// array payloads have no field structure to copy.
    #[error("payload must be a JSON object, got {found}")]
    NotAnObject {
        /// JSON type name of the offending payload (e.g. "array").
        found: &'static str,
    },
}
