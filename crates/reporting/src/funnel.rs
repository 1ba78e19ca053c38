//! Funnel analysis over the event log with strict stage semantics.

use astro_core::error::AstroResult;
use astro_core::types::{
    AlertKind, CohortFilter, DataQualityAlert, EventFilter, FunnelDefinition, FunnelSnapshot,
    FunnelStage, TimeWindow,
};
use astro_store::EventStore;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// Computes funnel snapshots. A subject is credited at a stage only when
/// its event log covers that stage and every preceding one within the
/// window; there is no skip-ahead credit.
pub struct FunnelAnalyzer {
    events: Arc<dyn EventStore>,
}

impl FunnelAnalyzer {
    pub fn new(events: Arc<dyn EventStore>) -> Self {
        Self { events }
    }

    pub fn compute_funnel(
        &self,
        definition: &FunnelDefinition,
        cohort: &CohortFilter,
        window: &TimeWindow,
    ) -> AstroResult<FunnelSnapshot> {
        let filter = EventFilter::for_funnel_stages(definition.stages.clone());
        let events = self.events.query_range(&filter, window)?;

        // Cohort filtering happens before stage evaluation so drop-off
        // percentages are relative to the cohort denominator.
        let eligible = match &cohort.first_seen {
            Some(range) => Some(self.subjects_first_seen_within(range)?),
            None => None,
        };

        let stage_index: HashMap<&str, usize> = definition
            .stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.as_str(), i))
            .collect();
        let mut stage_subjects: Vec<HashSet<&str>> = vec![HashSet::new(); definition.stages.len()];

        for event in &events {
            if let Some(eligible) = &eligible {
                if !eligible.contains(event.subject_id.as_str()) {
                    continue;
                }
            }
            let Some(stage) = &event.funnel_stage else {
                continue;
            };
            if let Some(&i) = stage_index.get(stage.as_str()) {
                stage_subjects[i].insert(event.subject_id.as_str());
            }
        }

        // Strict semantics: carry forward the intersection of all stages
        // reached so far.
        let mut counts: Vec<u64> = Vec::with_capacity(definition.stages.len());
        let mut qualified: Option<HashSet<&str>> = None;
        for subjects in &stage_subjects {
            let next = match qualified.take() {
                None => subjects.clone(),
                Some(prev) => prev.intersection(subjects).copied().collect(),
            };
            counts.push(next.len() as u64);
            qualified = Some(next);
        }

        let anomalies = verify_monotonic(&definition.name, &counts);

        let stages = definition
            .stages
            .iter()
            .enumerate()
            .map(|(i, stage_name)| FunnelStage {
                stage_name: stage_name.clone(),
                subject_count: counts[i],
                drop_off_rate_from_previous: if i == 0 || counts[i - 1] == 0 {
                    0.0
                } else {
                    1.0 - counts[i] as f64 / counts[i - 1] as f64
                },
            })
            .collect();

        Ok(FunnelSnapshot {
            funnel_name: definition.name.clone(),
            stages,
            anomalies,
            computed_at: Utc::now(),
        })
    }

    /// Subjects whose earliest event across the whole log falls inside
    /// `range` (the product's signup proxy).
    fn subjects_first_seen_within(&self, range: &TimeWindow) -> AstroResult<HashSet<String>> {
        let lookback = TimeWindow::new(DateTime::<Utc>::MIN_UTC, range.end);
        let events = self.events.query_range(&EventFilter::default(), &lookback)?;

        let mut earliest: HashMap<String, DateTime<Utc>> = HashMap::new();
        for event in events {
            earliest
                .entry(event.subject_id)
                .and_modify(|at| {
                    if event.occurred_at < *at {
                        *at = event.occurred_at;
                    }
                })
                .or_insert(event.occurred_at);
        }

        Ok(earliest
            .into_iter()
            .filter(|(_, at)| range.contains(*at))
            .map(|(subject, _)| subject)
            .collect())
    }
}

/// Non-increasing stage counts are an invariant of strict funnel
/// counting; a violation means the counts came from somewhere buggy
/// (storage pushdown, bad ingestion) and is surfaced, never corrected.
fn verify_monotonic(funnel_name: &str, counts: &[u64]) -> Vec<DataQualityAlert> {
    let mut anomalies = Vec::new();
    for (i, pair) in counts.windows(2).enumerate() {
        if pair[1] > pair[0] {
            metrics::counter!("funnel.monotonicity_violations").increment(1);
            warn!(
                funnel_name,
                stage = i + 1,
                previous = pair[0],
                current = pair[1],
                "Funnel stage count exceeds its predecessor"
            );
            anomalies.push(DataQualityAlert {
                kind: AlertKind::NonMonotonicFunnel,
                subject_id: None,
                detail: format!(
                    "stage {} count {} exceeds stage {} count {}",
                    i + 1,
                    pair[1],
                    i,
                    pair[0]
                ),
            });
        }
    }
    anomalies
}

#[cfg(test)]
mod tests {
    use super::*;
    use astro_core::event::{Event, EventType};
    use astro_store::MemoryStore;
    use chrono::Duration;
    use uuid::Uuid;

    fn definition() -> FunnelDefinition {
        FunnelDefinition {
            name: "subscription".to_string(),
            stages: vec![
                "viewed".to_string(),
                "added_to_cart".to_string(),
                "purchased".to_string(),
            ],
        }
    }

    fn put_step(store: &MemoryStore, subject: &str, stage: &str, minutes_ago: i64) {
        store
            .append(Event {
                event_id: Uuid::new_v4(),
                subject_id: subject.to_string(),
                event_type: EventType::FunnelStep,
                experiment_key: None,
                variant_key: None,
                funnel_stage: Some(stage.to_string()),
                occurred_at: Utc::now() - Duration::minutes(minutes_ago),
                properties: Default::default(),
            })
            .unwrap();
    }

    fn window() -> TimeWindow {
        TimeWindow::new(Utc::now() - Duration::days(7), Utc::now())
    }

    #[test]
    fn test_drop_off_rates_across_three_stages() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..100 {
            put_step(&store, &format!("u{i}"), "viewed", 120);
        }
        for i in 0..40 {
            put_step(&store, &format!("u{i}"), "added_to_cart", 90);
        }
        for i in 0..10 {
            put_step(&store, &format!("u{i}"), "purchased", 60);
        }

        let analyzer = FunnelAnalyzer::new(store);
        let snapshot = analyzer
            .compute_funnel(&definition(), &CohortFilter::default(), &window())
            .unwrap();

        let counts: Vec<u64> = snapshot.stages.iter().map(|s| s.subject_count).collect();
        assert_eq!(counts, vec![100, 40, 10]);

        let rates: Vec<f64> = snapshot
            .stages
            .iter()
            .map(|s| s.drop_off_rate_from_previous)
            .collect();
        assert_eq!(rates[0], 0.0);
        assert!((rates[1] - 0.6).abs() < 1e-9);
        assert!((rates[2] - 0.75).abs() < 1e-9);
        assert!(snapshot.anomalies.is_empty());
    }

    #[test]
    fn test_no_skip_ahead_credit() {
        let store = Arc::new(MemoryStore::new());
        // u1 walks the funnel; u2 jumps straight to purchase.
        put_step(&store, "u1", "viewed", 90);
        put_step(&store, "u1", "added_to_cart", 80);
        put_step(&store, "u1", "purchased", 70);
        put_step(&store, "u2", "purchased", 60);

        let analyzer = FunnelAnalyzer::new(store);
        let snapshot = analyzer
            .compute_funnel(&definition(), &CohortFilter::default(), &window())
            .unwrap();

        let counts: Vec<u64> = snapshot.stages.iter().map(|s| s.subject_count).collect();
        assert_eq!(counts, vec![1, 1, 1]);
    }

    #[test]
    fn test_counts_are_monotone_non_increasing() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..20 {
            put_step(&store, &format!("u{i}"), "viewed", 120);
            if i % 2 == 0 {
                put_step(&store, &format!("u{i}"), "added_to_cart", 90);
            }
            if i % 5 == 0 {
                put_step(&store, &format!("u{i}"), "purchased", 60);
            }
        }

        let analyzer = FunnelAnalyzer::new(store);
        let snapshot = analyzer
            .compute_funnel(&definition(), &CohortFilter::default(), &window())
            .unwrap();

        for pair in snapshot.stages.windows(2) {
            assert!(pair[0].subject_count >= pair[1].subject_count);
        }
    }

    #[test]
    fn test_empty_funnel_yields_zero_counts_and_zero_rates() {
        let store = Arc::new(MemoryStore::new());
        let analyzer = FunnelAnalyzer::new(store);
        let snapshot = analyzer
            .compute_funnel(&definition(), &CohortFilter::default(), &window())
            .unwrap();

        for stage in &snapshot.stages {
            assert_eq!(stage.subject_count, 0);
            assert_eq!(stage.drop_off_rate_from_previous, 0.0);
        }
    }

    #[test]
    fn test_cohort_filter_applies_before_stage_evaluation() {
        let store = Arc::new(MemoryStore::new());
        // Old subject: first seen 30 days ago, active in the funnel now.
        put_step(&store, "veteran", "viewed", 60 * 24 * 30);
        put_step(&store, "veteran", "viewed", 60);
        // New subject: first seen inside the cohort range.
        put_step(&store, "newcomer", "viewed", 90);

        let cohort = CohortFilter {
            first_seen: Some(TimeWindow::new(
                Utc::now() - Duration::days(2),
                Utc::now(),
            )),
        };
        let analyzer = FunnelAnalyzer::new(store);
        let snapshot = analyzer
            .compute_funnel(&definition(), &cohort, &window())
            .unwrap();

        assert_eq!(snapshot.stages[0].subject_count, 1);
    }

    #[test]
    fn test_verify_monotonic_flags_bad_counts() {
        let anomalies = verify_monotonic("broken", &[10, 15, 5]);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AlertKind::NonMonotonicFunnel);
    }
}
