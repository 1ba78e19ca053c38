//! In-memory reference store backed by DashMap.
//!
//! Production: replace with PostgreSQL (sqlx) or similar ACID store
//! behind the same traits. The DashMap entry API stands in for the
//! database's unique constraints.

use astro_core::error::AstroResult;
use astro_core::event::Event;
use astro_core::types::{Ack, Assignment, EventFilter, Experiment, TimeWindow};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::contract::{AssignmentStore, EventStore, ExperimentStore};

struct StoredEvent {
    event: Event,
    ack: Ack,
}

/// Thread-safe in-memory store for events, assignments, and experiments.
pub struct MemoryStore {
    events: DashMap<Uuid, StoredEvent>,
    assignments: DashMap<(String, String), Assignment>,
    experiments: DashMap<String, Experiment>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            events: DashMap::new(),
            assignments: DashMap::new(),
            experiments: DashMap::new(),
        }
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore for MemoryStore {
    fn append(&self, event: Event) -> AstroResult<Ack> {
        match self.events.entry(event.event_id) {
            Entry::Occupied(existing) => {
                metrics::counter!("store.events_deduplicated").increment(1);
                debug!(event_id = %event.event_id, "Duplicate append ignored");
                Ok(existing.get().ack.clone())
            }
            Entry::Vacant(slot) => {
                let ack = Ack {
                    event_id: event.event_id,
                    recorded_at: Utc::now(),
                };
                slot.insert(StoredEvent {
                    event,
                    ack: ack.clone(),
                });
                metrics::counter!("store.events_appended").increment(1);
                Ok(ack)
            }
        }
    }

    fn query_range(&self, filter: &EventFilter, window: &TimeWindow) -> AstroResult<Vec<Event>> {
        let mut matched: Vec<Event> = self
            .events
            .iter()
            .filter(|entry| {
                let event = &entry.value().event;
                window.contains(event.occurred_at) && filter.matches(event)
            })
            .map(|entry| entry.value().event.clone())
            .collect();

        // Tie-break on event_id so scans are restartable with a stable order.
        matched.sort_by(|a, b| {
            a.occurred_at
                .cmp(&b.occurred_at)
                .then_with(|| a.event_id.cmp(&b.event_id))
        });
        Ok(matched)
    }
}

impl AssignmentStore for MemoryStore {
    fn insert_if_absent(&self, assignment: Assignment) -> AstroResult<Assignment> {
        let key = (
            assignment.experiment_key.clone(),
            assignment.subject_id.clone(),
        );
        match self.assignments.entry(key) {
            Entry::Occupied(existing) => {
                metrics::counter!("store.assignment_conflicts").increment(1);
                Ok(existing.get().clone())
            }
            Entry::Vacant(slot) => {
                slot.insert(assignment.clone());
                metrics::counter!("store.assignments_created").increment(1);
                Ok(assignment)
            }
        }
    }

    fn get(&self, experiment_key: &str, subject_id: &str) -> AstroResult<Option<Assignment>> {
        let key = (experiment_key.to_string(), subject_id.to_string());
        Ok(self.assignments.get(&key).map(|a| a.clone()))
    }

    fn count_for_experiment(&self, experiment_key: &str) -> AstroResult<u64> {
        Ok(self
            .assignments
            .iter()
            .filter(|entry| entry.key().0 == experiment_key)
            .count() as u64)
    }
}

impl ExperimentStore for MemoryStore {
    fn put(&self, experiment: Experiment) -> AstroResult<()> {
        self.experiments
            .insert(experiment.experiment_key.clone(), experiment);
        Ok(())
    }

    fn get(&self, experiment_key: &str) -> AstroResult<Option<Experiment>> {
        Ok(self.experiments.get(experiment_key).map(|e| e.clone()))
    }

    fn list(&self) -> AstroResult<Vec<Experiment>> {
        Ok(self.experiments.iter().map(|e| e.value().clone()).collect())
    }
}
