//! Aggregate identifier generation.

use uuid::Uuid;

/// Generate a globally unique, lexicographically sortable identifier.
///
/// Identifiers are UUID v7 values: a millisecond timestamp prefix followed by
/// random bits, so ids allocated later sort after ids allocated earlier and
/// collisions are negligible under concurrent allocation.
///
/// Used by [`Aggregate::new`](crate::Aggregate::new) when the caller does not
/// supply an id.
pub fn next_id() -> String {
    Uuid::now_v7().to_string()
}
