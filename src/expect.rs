//! Fluent expectation chain over an aggregate's uncommitted events.
//!
//! An [`Expectation`] is built around a fixed aggregate, accumulates
//! declarative flags and target events across chained calls, and evaluates
//! them against the aggregate's current uncommitted-event buffer the moment
//! [`event`](Expectation::event) / [`events`](Expectation::events) is called.
//! Failures panic with the actual and expected values, attributed to the
//! test call site.
//!
//! ```
//! use eventloom::{Aggregate, Event, HandlerTable, Model};
//! use serde_json::json;
//!
//! #[derive(Default)]
//! struct Lamp {
//!     on: bool,
//! }
//!
//! impl Model for Lamp {
//!     fn handlers() -> HandlerTable<Self> {
//!         HandlerTable::new().on("SwitchedOn", |lamp, _event| lamp.on = true)
//!     }
//! }
//!
//! let mut lamp: Aggregate<Lamp> = Aggregate::new();
//! lamp.expect()
//!     .when(|agg| -> Result<(), std::convert::Infallible> {
//!         agg.apply(Event::named("SwitchedOn"));
//!         Ok(())
//!     })
//!     .first()
//!     .event(Event::named("SwitchedOn"));
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use crate::aggregate::{Aggregate, Model};
use crate::event::Event;

/// A suspending operation accepted by [`Expectation::after`].
///
/// Boxes a closure that borrows the aggregate and returns a boxed future
/// tied to that borrow, so the chain can await operations strictly
/// sequentially.
pub type PendingOp<M, E> =
    Box<dyn for<'a> FnOnce(&'a mut Aggregate<M>) -> Pin<Box<dyn Future<Output = Result<(), E>> + 'a>>>;

/// The accumulated evaluation modes of one chain.
#[derive(Debug, Clone, Copy, Default)]
struct Flags {
    has: bool,
    first: bool,
    last: bool,
    one: bool,
    exactly: bool,
    excludes: bool,
    throws: bool,
    debug: bool,
}

/// A stateful assertion chain bound to one aggregate.
///
/// Flags accumulate and persist across chained calls; they are never cleared
/// within one chain. [`and`](Expectation::and) starts a fresh chain against
/// the same aggregate.
pub struct Expectation<'a, M: Model> {
    aggregate: &'a mut Aggregate<M>,
    flags: Flags,
    targets: Vec<Event>,
    expected_count: Option<usize>,
    error_substring: Option<String>,
    captured_error: Option<String>,
    matched: Option<Event>,
}

impl<'a, M: Model> Expectation<'a, M> {
    /// Start a chain over the given aggregate.
    pub fn on(aggregate: &'a mut Aggregate<M>) -> Self {
        Self {
            aggregate,
            flags: Flags::default(),
            targets: Vec::new(),
            expected_count: None,
            error_substring: None,
            captured_error: None,
            matched: None,
        }
    }

    /// Run an operation against the aggregate.
    ///
    /// The operation is expected to call methods that internally `apply`
    /// events. With [`throws`](Expectation::throws) armed, a returned error
    /// is captured for a later [`with`](Expectation::with) check and a
    /// success is itself a failure; otherwise an error escalates immediately.
    #[track_caller]
    #[must_use]
    pub fn when<F, E>(mut self, op: F) -> Self
    where
        F: FnOnce(&mut Aggregate<M>) -> Result<(), E>,
        E: fmt::Display,
    {
        if self.flags.throws {
            match op(self.aggregate) {
                Ok(()) => panic!("expected the operation to fail, but it succeeded"),
                Err(error) => self.captured_error = Some(error.to_string()),
            }
        } else if let Err(error) = op(self.aggregate) {
            panic!("operation failed: {error}");
        }
        self
    }

    /// Run suspending operations against the aggregate, strictly in order.
    ///
    /// Each operation is awaited to completion before the next one starts;
    /// the list is never run concurrently. With
    /// [`throws`](Expectation::throws) armed, the first error stops the
    /// remaining operations and is captured; a fully successful run is
    /// itself a failure.
    pub async fn after<E>(mut self, ops: Vec<PendingOp<M, E>>) -> Self
    where
        E: fmt::Display,
    {
        if self.flags.throws {
            let mut captured = None;
            for op in ops {
                if let Err(error) = op(self.aggregate).await {
                    captured = Some(error.to_string());
                    break;
                }
            }
            match captured {
                Some(message) => self.captured_error = Some(message),
                None => panic!("expected the operations to fail, but they all succeeded"),
            }
        } else {
            for op in ops {
                if let Err(error) = op(self.aggregate).await {
                    panic!("operation failed: {error}");
                }
            }
        }
        self
    }

    /// Replay an event stream into the aggregate via
    /// [`Aggregate::load_from_history`].
    #[must_use]
    pub fn loads(self, events: Vec<Event>) -> Self {
        self.aggregate.load_from_history(events);
        self
    }

    /// Set the expected error-message substring.
    ///
    /// With [`throws`](Expectation::throws) armed, immediately checks the
    /// captured failure message for the substring, case-insensitively.
    #[track_caller]
    pub fn with(mut self, substring: impl Into<String>) -> Self {
        self.error_substring = Some(substring.into());
        if self.flags.throws {
            let expected = self
                .error_substring
                .as_deref()
                .expect("substring was just stored");
            match self.captured_error.as_deref() {
                None => panic!("no failure captured to match '{expected}' against"),
                Some(captured) => {
                    if !captured.to_lowercase().contains(&expected.to_lowercase()) {
                        panic!(
                            "expected failure message containing '{expected}', found '{captured}'"
                        );
                    }
                }
            }
        }
        self
    }

    /// Arm the at-least-once mode (also the default).
    #[must_use]
    pub fn has(mut self) -> Self {
        self.flags.has = true;
        self
    }

    /// Arm the first-event check for the next evaluation.
    #[must_use]
    pub fn first(mut self) -> Self {
        self.flags.first = true;
        self
    }

    /// Arm the last-event check for the next evaluation.
    #[must_use]
    pub fn last(mut self) -> Self {
        self.flags.last = true;
        self
    }

    /// Arm the exactly-once mode for the next evaluation.
    #[must_use]
    pub fn one(mut self) -> Self {
        self.flags.one = true;
        self
    }

    /// Arm the absence check: targets must not occur in the buffer at all.
    #[must_use]
    pub fn excludes(mut self) -> Self {
        self.flags.excludes = true;
        self
    }

    /// Arm failure capture for the next `when`/`after` operation.
    #[must_use]
    pub fn throws(mut self) -> Self {
        self.flags.throws = true;
        self
    }

    /// Arm diagnostic printing of the buffer and targets before evaluation.
    ///
    /// Does not alter the pass/fail outcome.
    #[must_use]
    pub fn debug(mut self) -> Self {
        self.flags.debug = true;
        self
    }

    /// Set the occurrence-count expectation and arm the exact-count mode.
    #[must_use]
    pub fn exactly(mut self, count: usize) -> Self {
        self.expected_count = Some(count);
        self.flags.exactly = true;
        self
    }

    /// Record a target event and immediately evaluate the armed flags
    /// against the uncommitted buffer.
    ///
    /// # Panics
    ///
    /// Panics with the actual and expected values on any mismatch.
    #[track_caller]
    pub fn event(self, target: Event) -> Self {
        self.events(vec![target])
    }

    /// Record target events and immediately evaluate the armed flags
    /// against the uncommitted buffer.
    ///
    /// Targets accumulate across calls within one chain; every recorded
    /// target participates in each evaluation.
    ///
    /// # Panics
    ///
    /// Panics with the actual and expected values on any mismatch.
    #[track_caller]
    pub fn events(mut self, targets: Vec<Event>) -> Self {
        self.targets.extend(targets);
        self.assert_event();
        self
    }

    /// Check field values on the most recently matched event.
    ///
    /// The matched event is the final buffer event when
    /// [`last`](Expectation::last) is armed, otherwise the first buffer
    /// event whose kind matches the latest target. Expected fields are given
    /// as a JSON object; an array-valued expectation passes when the event's
    /// array contains every expected element (subset, not exact equality).
    ///
    /// # Panics
    ///
    /// Panics naming the offending field with its actual and expected values.
    #[track_caller]
    pub fn includes(self, fields: Value) -> Self {
        let event = self
            .matched
            .as_ref()
            .unwrap_or_else(|| panic!("no event matched yet; assert an event before includes()"));
        let expected_fields = fields
            .as_object()
            .unwrap_or_else(|| panic!("includes() takes a JSON object of expected fields"));

        for (name, expected) in expected_fields {
            let actual = event
                .data()
                .get(name)
                .unwrap_or_else(|| panic!("event '{}' has no field '{name}'", event.kind()));

            let matches = match (expected.as_array(), actual.as_array()) {
                (Some(expected_items), Some(actual_items)) => expected_items
                    .iter()
                    .all(|item| actual_items.contains(item)),
                _ => actual == expected,
            };
            if !matches {
                panic!(
                    "field '{name}' on '{}': expected {expected}, found {actual}",
                    event.kind()
                );
            }
        }
        self
    }

    /// Start a fresh chain against the same aggregate, dropping all
    /// accumulated flags, targets, and expectations.
    #[must_use]
    pub fn and(self) -> Self {
        Expectation::on(self.aggregate)
    }

    /// No-op passthrough for readable chains.
    #[must_use]
    pub fn that(self) -> Self {
        self
    }

    /// No-op passthrough for readable chains.
    #[must_use]
    pub fn it(self) -> Self {
        self
    }

    /// Terminal accessor: hand back the underlying aggregate for
    /// escape-hatch inspection.
    pub fn aggregate(self) -> &'a mut Aggregate<M> {
        self.aggregate
    }

    #[track_caller]
    fn assert_event(&mut self) {
        if self.flags.debug {
            self.render();
        }

        let buffer = self.aggregate.uncommitted_events();
        if buffer.is_empty() {
            panic!(
                "no uncommitted events to evaluate (targets: {:?})",
                kinds(&self.targets)
            );
        }

        // Absence check short-circuits every other mode.
        if self.flags.excludes {
            for target in &self.targets {
                let count = occurrences(buffer, target.kind());
                if count > 0 {
                    panic!("expected no '{}' events, found {count}", target.kind());
                }
            }
            return;
        }

        if self.flags.exactly {
            let expected = self
                .expected_count
                .expect("exactly(n) always sets the expected count");
            for target in &self.targets {
                let count = occurrences(buffer, target.kind());
                if count != expected {
                    panic!(
                        "expected exactly {expected} '{}' events, found {count}",
                        target.kind()
                    );
                }
            }
        }

        if self.flags.one {
            for target in &self.targets {
                match occurrences(buffer, target.kind()) {
                    1 => {}
                    0 => panic!("expected exactly one '{}' event, found none", target.kind()),
                    count => {
                        panic!("expected exactly one '{}' event, found {count}", target.kind())
                    }
                }
            }
        }

        if self.flags.first {
            let first = &buffer[0];
            for target in &self.targets {
                if !first.same_kind(target) {
                    panic!(
                        "expected first event to be '{}', found '{}'",
                        target.kind(),
                        first.kind()
                    );
                }
            }
        }

        if self.flags.last {
            let last = buffer.last().expect("buffer checked non-empty above");
            for target in &self.targets {
                if !last.same_kind(target) {
                    panic!(
                        "expected last event to be '{}', found '{}'",
                        target.kind(),
                        last.kind()
                    );
                }
            }
        }

        if self.flags.has || (!self.flags.one && !self.flags.exactly) {
            for target in &self.targets {
                if occurrences(buffer, target.kind()) == 0 {
                    panic!(
                        "expected a '{}' event, found none (buffer: {:?})",
                        target.kind(),
                        kinds(buffer)
                    );
                }
            }
        }

        // Remember which event the evaluation resolved to for includes().
        self.matched = if self.flags.last {
            buffer.last().cloned()
        } else {
            self.targets.last().and_then(|target| {
                buffer.iter().find(|event| event.same_kind(target)).cloned()
            })
        };
    }

    fn render(&self) {
        let buffer = self.aggregate.uncommitted_events();
        eprintln!("uncommitted events ({}):", buffer.len());
        for (index, event) in buffer.iter().enumerate() {
            eprintln!("  [{index}] {} {}", event.kind(), event.data());
        }
        eprintln!("targets ({}): {:?}", self.targets.len(), kinds(&self.targets));
        eprintln!("flags: {:?}", self.flags);
    }
}

fn occurrences(buffer: &[Event], kind: &str) -> usize {
    buffer.iter().filter(|event| event.kind() == kind).count()
}

fn kinds(events: &[Event]) -> Vec<&str> {
    events.iter().map(Event::kind).collect()
}
