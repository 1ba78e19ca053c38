//! Storage contract consumed by the aggregators. The persistence engine
//! itself lives behind these traits; aggregation logic never depends on
//! a concrete backend's query-builder shapes.

use astro_core::error::AstroResult;
use astro_core::event::Event;
use astro_core::types::{Ack, Assignment, EventFilter, Experiment, TimeWindow};

/// Durable append-only event log.
pub trait EventStore: Send + Sync {
    /// Append a validated event. Idempotent on `event_id`: a duplicate
    /// append performs no second write and returns the original Ack.
    fn append(&self, event: Event) -> AstroResult<Ack>;

    /// Append a batch, returning one Ack per event in input order.
    fn append_batch(&self, events: Vec<Event>) -> AstroResult<Vec<Ack>> {
        events.into_iter().map(|e| self.append(e)).collect()
    }

    /// Events matching `filter` within the half-open `window`, ordered by
    /// `occurred_at` ascending. Finite for any bounded window; reads a
    /// consistent snapshot (no partially-written events).
    fn query_range(&self, filter: &EventFilter, window: &TimeWindow) -> AstroResult<Vec<Event>>;
}

/// Unique-constrained assignment table. Uniqueness on
/// `(experiment_key, subject_id)` makes concurrent first-time
/// assignment linearizable without application-level locking.
pub trait AssignmentStore: Send + Sync {
    /// Insert unless a row already exists for the same
    /// `(experiment_key, subject_id)`. Returns the surviving row, which
    /// under a race is the winner's, not necessarily the argument.
    fn insert_if_absent(&self, assignment: Assignment) -> AstroResult<Assignment>;

    fn get(&self, experiment_key: &str, subject_id: &str) -> AstroResult<Option<Assignment>>;

    fn count_for_experiment(&self, experiment_key: &str) -> AstroResult<u64>;
}

/// Experiment definitions, mutated only through lifecycle transitions.
pub trait ExperimentStore: Send + Sync {
    fn put(&self, experiment: Experiment) -> AstroResult<()>;

    fn get(&self, experiment_key: &str) -> AstroResult<Option<Experiment>>;

    fn list(&self) -> AstroResult<Vec<Experiment>>;
}
