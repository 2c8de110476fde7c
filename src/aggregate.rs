//! Aggregate engine: state, event buffers, replay, and failure delegation.
//!
//! An [`Aggregate`] owns a projected state (`M: Model`) and the ordered
//! buffers of events that produced it. Operations defined by the domain call
//! [`apply`](Aggregate::apply), which records the event and routes it through
//! the model's [`HandlerTable`]; an external persistence collaborator reads
//! [`uncommitted_events`](Aggregate::uncommitted_events), stores them, and
//! calls [`commit`](Aggregate::commit).

use std::collections::HashMap;
use std::fmt;

use crate::event::{Event, EventNode};
use crate::expect::Expectation;

/// A state-mutation handler: applies one event to the model.
pub type Handler<M> = fn(&mut M, &Event);

/// Callback invoked by [`Aggregate::fail`] when a failure handler is installed.
pub type FailureHandler = Box<dyn FnMut(&(dyn std::error::Error + Send + Sync + 'static)) + Send>;

/// Mapping from event kind to state-mutation handler.
///
/// Built once at aggregate-definition time by [`Model::handlers`]. Lookup is
/// by exact kind only; there is no inheritance-aware or fuzzy matching.
///
/// # Examples
///
/// ```
/// use eventloom::{Event, HandlerTable};
///
/// #[derive(Default)]
/// struct Lamp {
///     on: bool,
/// }
///
/// let table: HandlerTable<Lamp> = HandlerTable::new()
///     .on("SwitchedOn", |lamp: &mut Lamp, _event| lamp.on = true)
///     .on("SwitchedOff", |lamp: &mut Lamp, _event| lamp.on = false);
/// assert_eq!(table.len(), 2);
/// ```
pub struct HandlerTable<M> {
    entries: HashMap<&'static str, Handler<M>>,
}

impl<M> HandlerTable<M> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register the handler for an event kind.
    ///
    /// Registering the same kind twice keeps the last handler.
    #[must_use]
    pub fn on(mut self, kind: &'static str, handler: Handler<M>) -> Self {
        self.entries.insert(kind, handler);
        self
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no handlers.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn get(&self, kind: &str) -> Option<Handler<M>> {
        self.entries.get(kind).copied()
    }
}

impl<M> Default for HandlerTable<M> {
    fn default() -> Self {
        Self::new()
    }
}

// Manual `Debug`: deriving would put an unnecessary `M: Debug` bound on the
// impl, and the handler pointers are not informative anyway.
impl<M> fmt::Debug for HandlerTable<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&str> = self.entries.keys().copied().collect();
        kinds.sort_unstable();
        f.debug_struct("HandlerTable").field("kinds", &kinds).finish()
    }
}

/// The contract an aggregate's state type implements.
///
/// The implementing type is the projected state itself, built by routing
/// events through the table returned from [`handlers`](Model::handlers).
/// The engine never reads fields off the state; all mutation flows through
/// registered handlers.
pub trait Model: Default {
    /// The handler table for this model, built once per aggregate.
    fn handlers() -> HandlerTable<Self>
    where
        Self: Sized;

    /// Produce a condensed-state event for compacted future replay.
    ///
    /// The default supports no snapshots and returns `None`. A model that
    /// overrides this should also register a handler for the snapshot's kind,
    /// so a stored snapshot can be fed back as the first element of a later
    /// [`Aggregate::load_from_history`] call.
    fn snapshot(&self) -> Option<Event> {
        None
    }
}

/// The unit owning state and the history of events that produced it.
///
/// Holds the current projected state, an ordered buffer of events applied
/// since the last commit, and append-only records of replayed history. The
/// aggregate is *clean* while the uncommitted buffer is empty and *dirty*
/// otherwise; [`commit`](Aggregate::commit) and
/// [`uncommit`](Aggregate::uncommit) return it to clean. Replay never touches
/// the uncommitted buffer.
pub struct Aggregate<M: Model> {
    id: String,
    state: M,
    uncommitted: Vec<Event>,
    loaded: Vec<Event>,
    loaded_nodes: Vec<EventNode>,
    handlers: HandlerTable<M>,
    failure_handler: Option<FailureHandler>,
}

impl<M: Model> Aggregate<M> {
    /// Create a fresh aggregate with a generated sortable id.
    pub fn new() -> Self {
        Self::with_id(crate::ident::next_id())
    }

    /// Create a fresh aggregate with an externally supplied id.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: M::default(),
            uncommitted: Vec::new(),
            loaded: Vec::new(),
            loaded_nodes: Vec::new(),
            handlers: M::handlers(),
            failure_handler: None,
        }
    }

    /// The aggregate's identifier, immutable after construction.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The current projected state.
    ///
    /// There is deliberately no mutable counterpart: state changes only by
    /// applying events.
    pub fn state(&self) -> &M {
        &self.state
    }

    /// Events applied since the last [`commit`](Aggregate::commit) /
    /// [`uncommit`](Aggregate::uncommit), in application order.
    pub fn uncommitted_events(&self) -> &[Event] {
        &self.uncommitted
    }

    /// Full replay history accumulated across all
    /// [`load_from_history`](Aggregate::load_from_history) calls.
    pub fn loaded_events(&self) -> &[Event] {
        &self.loaded
    }

    /// Replay record accumulated across all
    /// [`load_from_event_nodes`](Aggregate::load_from_event_nodes) calls.
    pub fn loaded_event_nodes(&self) -> &[EventNode] {
        &self.loaded_nodes
    }

    /// Whether any applied events are awaiting commit.
    pub fn is_dirty(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    /// Record an event and dispatch it to its handler.
    ///
    /// The event is appended to the uncommitted buffer and routed through the
    /// model's handler table. An event with no registered handler is not an
    /// error: it is recorded, and state is left unchanged.
    pub fn apply(&mut self, event: Event) {
        tracing::debug!(aggregate_id = %self.id, kind = event.kind(), "event applied");
        self.dispatch(&event);
        self.uncommitted.push(event);
    }

    /// Clear the uncommitted buffer after its contents have been durably
    /// persisted by an external collaborator.
    ///
    /// Idempotent: committing an empty buffer is a no-op.
    pub fn commit(&mut self) {
        tracing::debug!(
            aggregate_id = %self.id,
            count = self.uncommitted.len(),
            "events committed"
        );
        self.uncommitted.clear();
    }

    /// Clear the uncommitted buffer without persisting, discarding its
    /// contents (e.g. after a failed operation).
    ///
    /// Mechanically identical to [`commit`](Aggregate::commit) today; a
    /// distinct operation carrying the discard intent.
    pub fn uncommit(&mut self) {
        tracing::debug!(
            aggregate_id = %self.id,
            count = self.uncommitted.len(),
            "events discarded"
        );
        self.uncommitted.clear();
    }

    /// Rebuild state by re-dispatching a past event sequence.
    ///
    /// Each event is routed to its handler in order and appended to the
    /// loaded-events record. Safe to call multiple times; the record
    /// accumulates rather than resetting. Never touches the uncommitted
    /// buffer.
    pub fn load_from_history(&mut self, events: Vec<Event>) {
        tracing::debug!(aggregate_id = %self.id, count = events.len(), "history replayed");
        for event in events {
            self.dispatch(&event);
            self.loaded.push(event);
        }
    }

    /// Rebuild state from metadata-annotated history.
    ///
    /// Each node's event is dispatched exactly once and recorded in both the
    /// loaded-events and loaded-nodes records. Never touches the uncommitted
    /// buffer.
    pub fn load_from_event_nodes(&mut self, nodes: Vec<EventNode>) {
        tracing::debug!(aggregate_id = %self.id, count = nodes.len(), "node history replayed");
        for node in nodes {
            self.dispatch(&node.event);
            self.loaded.push(node.event.clone());
            self.loaded_nodes.push(node);
        }
    }

    /// Produce a condensed-state event, if the model supports snapshots.
    ///
    /// Never invoked by the engine itself; exposed for an external
    /// persistence collaborator to call, store, and feed back into a future
    /// [`load_from_history`](Aggregate::load_from_history) /
    /// [`load_from_event_nodes`](Aggregate::load_from_event_nodes) call.
    pub fn snapshot(&self) -> Option<Event> {
        self.state.snapshot()
    }

    /// Install a failure callback, replacing any previous one.
    ///
    /// Exists so a persistence/locking collaborator can register
    /// unlock-on-error behavior without the aggregate knowing about locking.
    pub fn set_failure_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&(dyn std::error::Error + Send + Sync + 'static)) + Send + 'static,
    {
        self.failure_handler = Some(Box::new(handler));
    }

    /// Escalate a failure.
    ///
    /// If a failure handler is installed, it is invoked with the error and
    /// `Ok(())` is returned (the handler may choose to panic to re-raise).
    /// With no handler installed, the error is handed back to the caller.
    ///
    /// # Errors
    ///
    /// Returns `error` unchanged when no failure handler is installed.
    pub fn fail<E>(&mut self, error: E) -> Result<(), E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match self.failure_handler.as_mut() {
            Some(handler) => {
                handler(&error);
                Ok(())
            }
            None => Err(error),
        }
    }

    /// Start an expectation chain over this aggregate's uncommitted events.
    pub fn expect(&mut self) -> Expectation<'_, M> {
        Expectation::on(self)
    }

    fn dispatch(&mut self, event: &Event) {
        match self.handlers.get(event.kind()) {
            Some(handler) => handler(&mut self.state, event),
            None => {
                tracing::trace!(kind = event.kind(), "no handler registered, state unchanged");
            }
        }
    }
}

impl<M: Model> Default for Aggregate<M> {
    fn default() -> Self {
        Self::new()
    }
}

// Manual `Debug` because the failure handler is an opaque callback and the
// buffers can be large; lengths are enough to situate a log line.
impl<M: Model> fmt::Debug for Aggregate<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregate")
            .field("id", &self.id)
            .field("uncommitted_events", &self.uncommitted.len())
            .field("loaded_events", &self.loaded.len())
            .field("loaded_event_nodes", &self.loaded_nodes.len())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::test_fixtures::{add_task, complete_task, create_board, TaskBoard};
    use super::*;
    use crate::event::EventNode;

    #[test]
    fn new_aggregate_is_clean_and_empty() {
        let aggregate: Aggregate<TaskBoard> = Aggregate::new();
        assert!(!aggregate.is_dirty());
        assert!(aggregate.uncommitted_events().is_empty());
        assert!(aggregate.loaded_events().is_empty());
        assert!(aggregate.loaded_event_nodes().is_empty());
        assert_eq!(aggregate.state(), &TaskBoard::default());
    }

    #[test]
    fn generated_ids_are_unique_per_aggregate() {
        let a: Aggregate<TaskBoard> = Aggregate::new();
        let b: Aggregate<TaskBoard> = Aggregate::new();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn with_id_keeps_the_supplied_id() {
        let aggregate: Aggregate<TaskBoard> = Aggregate::with_id("board-7");
        assert_eq!(aggregate.id(), "board-7");
    }

    #[test]
    fn apply_records_in_order_and_mutates_state() {
        let mut aggregate: Aggregate<TaskBoard> = Aggregate::new();
        aggregate.apply(Event::new("Created", json!({ "id": "id-01" })));
        aggregate.apply(Event::new("TaskAdded", json!({ "title": "write docs" })));

        assert_eq!(aggregate.uncommitted_events().len(), 2);
        assert_eq!(aggregate.uncommitted_events()[0].kind(), "Created");
        assert_eq!(aggregate.uncommitted_events()[1].kind(), "TaskAdded");
        assert_eq!(aggregate.state().id, "id-01");
        assert_eq!(aggregate.state().open, vec!["write docs".to_owned()]);
    }

    #[test]
    fn apply_with_no_handler_records_but_leaves_state_unchanged() {
        let mut aggregate: Aggregate<TaskBoard> = Aggregate::new();
        let before = aggregate.state().clone();
        aggregate.apply(Event::new("Audited", json!({ "by": "nobody" })));

        assert_eq!(aggregate.uncommitted_events().len(), 1);
        assert_eq!(aggregate.state(), &before);
    }

    #[test]
    fn commit_clears_the_buffer_and_is_idempotent() {
        let mut aggregate: Aggregate<TaskBoard> = Aggregate::new();
        create_board(&mut aggregate, "id-01").unwrap();
        add_task(&mut aggregate, "a").unwrap();
        assert!(aggregate.is_dirty());

        aggregate.commit();
        assert!(aggregate.uncommitted_events().is_empty());
        assert!(!aggregate.is_dirty());

        aggregate.commit();
        assert!(aggregate.uncommitted_events().is_empty());
    }

    #[test]
    fn uncommit_discards_without_touching_state() {
        let mut aggregate: Aggregate<TaskBoard> = Aggregate::new();
        add_task(&mut aggregate, "a").unwrap();

        aggregate.uncommit();
        assert!(aggregate.uncommitted_events().is_empty());
        // State keeps the already-applied mutation; uncommit only drops
        // the pending record.
        assert_eq!(aggregate.state().open, vec!["a".to_owned()]);

        aggregate.uncommit();
        assert!(aggregate.uncommitted_events().is_empty());
    }

    #[test]
    fn load_from_history_rebuilds_state_without_dirtying() {
        let mut aggregate: Aggregate<TaskBoard> = Aggregate::new();
        aggregate.load_from_history(vec![
            Event::new("Created", json!({ "id": "id-01" })),
            Event::new("TaskAdded", json!({ "title": "a" })),
            Event::new("TaskCompleted", json!({ "title": "a" })),
        ]);

        assert!(aggregate.uncommitted_events().is_empty());
        assert!(!aggregate.is_dirty());
        assert_eq!(aggregate.loaded_events().len(), 3);
        assert_eq!(aggregate.state().id, "id-01");
        assert!(aggregate.state().open.is_empty());
        assert_eq!(aggregate.state().done, vec!["a".to_owned()]);
    }

    #[test]
    fn load_from_history_accumulates_across_calls() {
        let mut aggregate: Aggregate<TaskBoard> = Aggregate::new();
        aggregate.load_from_history(vec![Event::new("Created", json!({ "id": "id-01" }))]);
        aggregate.load_from_history(vec![
            Event::new("TaskAdded", json!({ "title": "a" })),
            Event::new("TaskAdded", json!({ "title": "b" })),
        ]);

        assert_eq!(aggregate.loaded_events().len(), 3);
        assert_eq!(aggregate.loaded_events()[0].kind(), "Created");
        assert_eq!(aggregate.loaded_events()[2].data()["title"], "b");
    }

    #[test]
    fn load_from_event_nodes_dispatches_each_event_once() {
        let mut aggregate: Aggregate<TaskBoard> = Aggregate::new();
        aggregate.load_from_event_nodes(vec![
            EventNode::new(Event::new("TaskAdded", json!({ "title": "a" })), "evt-1", 0),
            EventNode::new(Event::new("TaskAdded", json!({ "title": "b" })), "evt-2", 1),
        ]);

        // Single dispatch per node: each title appears exactly once.
        assert_eq!(aggregate.state().open, vec!["a".to_owned(), "b".to_owned()]);
        assert_eq!(aggregate.loaded_events().len(), 2);
        assert_eq!(aggregate.loaded_event_nodes().len(), 2);
        assert_eq!(aggregate.loaded_event_nodes()[1].metadata.id, "evt-2");
        assert!(aggregate.uncommitted_events().is_empty());
    }

    #[test]
    fn snapshot_roundtrips_through_history_replay() {
        let mut original: Aggregate<TaskBoard> = Aggregate::new();
        create_board(&mut original, "id-01").unwrap();
        add_task(&mut original, "a").unwrap();
        add_task(&mut original, "b").unwrap();
        complete_task(&mut original, "a").unwrap();

        let snapshot = original.snapshot().expect("TaskBoard supports snapshots");
        assert_eq!(snapshot.kind(), "BoardSnapshot");

        let mut restored: Aggregate<TaskBoard> = Aggregate::with_id(original.id());
        restored.load_from_history(vec![snapshot]);
        assert_eq!(restored.state(), original.state());
        assert!(restored.uncommitted_events().is_empty());
    }

    #[test]
    fn default_model_has_no_snapshot() {
        #[derive(Default)]
        struct Plain;
        impl Model for Plain {
            fn handlers() -> HandlerTable<Self> {
                HandlerTable::new()
            }
        }

        let aggregate: Aggregate<Plain> = Aggregate::new();
        assert!(aggregate.snapshot().is_none());
    }

    #[test]
    fn fail_without_handler_returns_the_error() {
        use super::test_fixtures::BoardError;

        let mut aggregate: Aggregate<TaskBoard> = Aggregate::new();
        let result = aggregate.fail(BoardError::EmptyTitle);
        let err = result.expect_err("no handler installed");
        assert_eq!(err.to_string(), "task title must not be empty");
    }

    #[test]
    fn fail_with_handler_routes_the_error() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        use super::test_fixtures::BoardError;

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_by_handler = Arc::clone(&seen);

        let mut aggregate: Aggregate<TaskBoard> = Aggregate::new();
        aggregate.set_failure_handler(move |_error| {
            seen_by_handler.fetch_add(1, Ordering::SeqCst);
        });

        aggregate
            .fail(BoardError::EmptyTitle)
            .expect("handler should absorb the error");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn last_installed_failure_handler_wins() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        use super::test_fixtures::BoardError;

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let first_clone = Arc::clone(&first);
        let second_clone = Arc::clone(&second);

        let mut aggregate: Aggregate<TaskBoard> = Aggregate::new();
        aggregate.set_failure_handler(move |_error| {
            first_clone.fetch_add(1, Ordering::SeqCst);
        });
        aggregate.set_failure_handler(move |_error| {
            second_clone.fetch_add(1, Ordering::SeqCst);
        });

        aggregate
            .fail(BoardError::EmptyTitle)
            .expect("handler should absorb the error");
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn replay_does_not_affect_dirtiness() {
        let mut aggregate: Aggregate<TaskBoard> = Aggregate::new();
        add_task(&mut aggregate, "pending").unwrap();
        assert!(aggregate.is_dirty());

        aggregate.load_from_history(vec![Event::new("TaskAdded", json!({ "title": "old" }))]);
        assert!(aggregate.is_dirty());
        assert_eq!(aggregate.uncommitted_events().len(), 1);
    }

    #[test]
    fn handler_table_last_registration_wins() {
        let table: HandlerTable<TaskBoard> = HandlerTable::new()
            .on("Created", |board: &mut TaskBoard, _event| board.id = "first".into())
            .on("Created", |board: &mut TaskBoard, _event| board.id = "second".into());
        assert_eq!(table.len(), 1);

        let mut board = TaskBoard::default();
        let handler = table.get("Created").expect("handler registered");
        handler(&mut board, &Event::named("Created"));
        assert_eq!(board.id, "second");
    }

    #[test]
    fn debug_output_shows_buffer_lengths() {
        let mut aggregate: Aggregate<TaskBoard> = Aggregate::with_id("board-1");
        add_task(&mut aggregate, "a").unwrap();
        let rendered = format!("{aggregate:?}");
        assert!(rendered.contains("board-1"));
        assert!(rendered.contains("uncommitted_events: 1"));
    }
}
