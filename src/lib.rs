//! In-memory event-sourced aggregates, plus a fluent expectation chain for
//! asserting over the events they produce.

mod aggregate;
pub use aggregate::{Aggregate, FailureHandler, Handler, HandlerTable, Model};
mod error;
pub use error::HydrateError;
mod event;
pub use event::{Event, EventNode, NodeMetadata};
mod expect;
pub use expect::{Expectation, PendingOp};
mod hydrate;
pub use hydrate::hydrate;
mod ident;
pub use ident::next_id;
