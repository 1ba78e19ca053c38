//! A/B test aggregation over the event log.

use astro_core::config::CountingMode;
use astro_core::error::{AstroError, AstroResult};
use astro_core::event::EventType;
use astro_core::types::{
    ABTestResult, AlertKind, DataQualityAlert, EventFilter, TimeWindow, VariantResult,
};
use astro_store::{EventStore, ExperimentStore};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Computes per-variant impression/conversion results from stored
/// events. Derived output only; the event log stays the source of truth.
pub struct ResultAggregator {
    events: Arc<dyn EventStore>,
    experiments: Arc<dyn ExperimentStore>,
    counting: CountingMode,
}

#[derive(Default)]
struct SubjectTrack {
    first_impression: Option<DateTime<Utc>>,
    raw_impressions: u64,
    counted_conversions: u64,
    converted: bool,
}

impl ResultAggregator {
    pub fn new(
        events: Arc<dyn EventStore>,
        experiments: Arc<dyn ExperimentStore>,
        counting: CountingMode,
    ) -> Self {
        Self {
            events,
            experiments,
            counting,
        }
    }

    /// Aggregate one experiment over a time window. Counting is
    /// per-distinct-subject unless configured for raw events. A
    /// conversion only counts at or after the subject's earliest
    /// impression for that variant; earlier conversions are
    /// instrumentation errors, excluded and surfaced as anomalies.
    pub fn compute_result(
        &self,
        experiment_key: &str,
        window: &TimeWindow,
    ) -> AstroResult<ABTestResult> {
        let experiment = self
            .experiments
            .get(experiment_key)?
            .ok_or_else(|| AstroError::ExperimentNotFound(experiment_key.to_string()))?;

        let filter = EventFilter::for_experiment(
            experiment_key,
            vec![EventType::Impression, EventType::Conversion],
        );
        let events = self.events.query_range(&filter, window)?;

        // First pass: earliest impression per (variant, subject).
        let mut tracks: HashMap<(String, String), SubjectTrack> = HashMap::new();
        for event in &events {
            if event.event_type != EventType::Impression {
                continue;
            }
            let Some(variant) = &event.variant_key else {
                continue;
            };
            let track = tracks
                .entry((variant.clone(), event.subject_id.clone()))
                .or_default();
            track.raw_impressions += 1;
            if track.first_impression.is_none() {
                track.first_impression = Some(event.occurred_at);
            }
        }

        // Second pass: conversions against the earliest impression. Ties
        // on occurred_at count; strictly earlier conversions do not.
        let mut anomalies = Vec::new();
        for event in &events {
            if event.event_type != EventType::Conversion {
                continue;
            }
            let Some(variant) = &event.variant_key else {
                continue;
            };
            let key = (variant.clone(), event.subject_id.clone());
            match tracks.get_mut(&key) {
                Some(track) if track.first_impression.is_some_and(|fi| event.occurred_at >= fi) => {
                    track.counted_conversions += 1;
                    track.converted = true;
                }
                _ => {
                    metrics::counter!("abtest.conversion_anomalies").increment(1);
                    warn!(
                        experiment_key,
                        subject_id = %event.subject_id,
                        variant = %variant,
                        occurred_at = %event.occurred_at,
                        "Conversion precedes the subject's first impression, excluded"
                    );
                    anomalies.push(DataQualityAlert {
                        kind: AlertKind::ConversionBeforeImpression,
                        subject_id: Some(event.subject_id.clone()),
                        detail: format!(
                            "conversion for variant '{variant}' at {} has no prior impression in window",
                            event.occurred_at
                        ),
                    });
                }
            }
        }

        // A subject exposed under more than one variant points at a
        // broken assignment upstream; flag it, keep counting.
        let mut variants_seen: HashMap<&str, u64> = HashMap::new();
        for (_, subject) in tracks.keys() {
            *variants_seen.entry(subject.as_str()).or_default() += 1;
        }
        for (subject, seen) in variants_seen {
            if seen > 1 {
                metrics::counter!("abtest.duplicate_assignments").increment(1);
                warn!(
                    experiment_key,
                    subject_id = subject,
                    variants = seen,
                    "Subject has impressions under multiple variants"
                );
                anomalies.push(DataQualityAlert {
                    kind: AlertKind::DuplicateAssignment,
                    subject_id: Some(subject.to_string()),
                    detail: format!("impressions recorded under {seen} variants"),
                });
            }
        }

        let mut variants = Vec::with_capacity(experiment.variants.len());
        let mut total_impressions = 0u64;
        for variant in &experiment.variants {
            let (impressions, conversions) = match self.counting {
                CountingMode::DistinctSubjects => tracks
                    .iter()
                    .filter(|((v, _), _)| v == &variant.key)
                    .fold((0u64, 0u64), |(imp, conv), (_, track)| {
                        (imp + 1, conv + u64::from(track.converted))
                    }),
                CountingMode::RawEvents => tracks
                    .iter()
                    .filter(|((v, _), _)| v == &variant.key)
                    .fold((0u64, 0u64), |(imp, conv), (_, track)| {
                        (imp + track.raw_impressions, conv + track.counted_conversions)
                    }),
            };
            total_impressions += impressions;
            variants.push(VariantResult {
                name: variant.key.clone(),
                impressions,
                conversions,
                conversion_rate: if impressions > 0 {
                    conversions as f64 / impressions as f64
                } else {
                    0.0
                },
            });
        }

        Ok(ABTestResult {
            test_name: experiment.experiment_key,
            variants,
            insufficient_data: total_impressions == 0,
            anomalies,
            computed_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ExperimentManager;
    use astro_core::event::Event;
    use astro_core::types::Variant;
    use astro_store::MemoryStore;
    use chrono::Duration;
    use uuid::Uuid;

    fn setup(counting: CountingMode) -> (Arc<MemoryStore>, ResultAggregator) {
        let store = Arc::new(MemoryStore::new());
        let manager = ExperimentManager::new(store.clone());
        manager
            .create(
                "checkout_cta",
                "Checkout CTA",
                vec![
                    Variant {
                        key: "control".to_string(),
                        weight: 1.0,
                    },
                    Variant {
                        key: "bold".to_string(),
                        weight: 1.0,
                    },
                ],
            )
            .unwrap();
        manager.start("checkout_cta").unwrap();
        let aggregator = ResultAggregator::new(store.clone(), store.clone(), counting);
        (store, aggregator)
    }

    fn put_event(
        store: &MemoryStore,
        subject: &str,
        event_type: EventType,
        variant: &str,
        minutes_ago: i64,
    ) {
        store
            .append(Event {
                event_id: Uuid::new_v4(),
                subject_id: subject.to_string(),
                event_type,
                experiment_key: Some("checkout_cta".to_string()),
                variant_key: Some(variant.to_string()),
                funnel_stage: None,
                occurred_at: Utc::now() - Duration::minutes(minutes_ago),
                properties: Default::default(),
            })
            .unwrap();
    }

    fn window() -> TimeWindow {
        TimeWindow::new(Utc::now() - Duration::hours(2), Utc::now())
    }

    fn variant<'a>(result: &'a ABTestResult, name: &str) -> &'a VariantResult {
        result.variants.iter().find(|v| v.name == name).unwrap()
    }

    #[test]
    fn test_ten_impressions_three_conversions() {
        let (store, aggregator) = setup(CountingMode::DistinctSubjects);
        for i in 0..10 {
            put_event(&store, &format!("u{i}"), EventType::Impression, "bold", 60);
        }
        for i in 0..3 {
            put_event(&store, &format!("u{i}"), EventType::Conversion, "bold", 30);
        }

        let result = aggregator.compute_result("checkout_cta", &window()).unwrap();
        let bold = variant(&result, "bold");
        assert_eq!(bold.impressions, 10);
        assert_eq!(bold.conversions, 3);
        assert!((bold.conversion_rate - 0.3).abs() < f64::EPSILON);
        assert!(!result.insufficient_data);
        assert!(result.anomalies.is_empty());
    }

    #[test]
    fn test_repeat_impressions_do_not_inflate_distinct_counts() {
        let (store, aggregator) = setup(CountingMode::DistinctSubjects);
        for _ in 0..5 {
            put_event(&store, "u1", EventType::Impression, "control", 60);
        }
        put_event(&store, "u1", EventType::Conversion, "control", 30);

        let result = aggregator.compute_result("checkout_cta", &window()).unwrap();
        let control = variant(&result, "control");
        assert_eq!(control.impressions, 1);
        assert_eq!(control.conversions, 1);
        assert!((control.conversion_rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_raw_event_counting_mode() {
        let (store, aggregator) = setup(CountingMode::RawEvents);
        for _ in 0..5 {
            put_event(&store, "u1", EventType::Impression, "control", 60);
        }
        put_event(&store, "u1", EventType::Conversion, "control", 30);

        let result = aggregator.compute_result("checkout_cta", &window()).unwrap();
        let control = variant(&result, "control");
        assert_eq!(control.impressions, 5);
        assert_eq!(control.conversions, 1);
    }

    #[test]
    fn test_conversion_before_impression_excluded_and_flagged() {
        let (store, aggregator) = setup(CountingMode::DistinctSubjects);
        put_event(&store, "u1", EventType::Conversion, "bold", 90);
        put_event(&store, "u1", EventType::Impression, "bold", 60);

        let result = aggregator.compute_result("checkout_cta", &window()).unwrap();
        let bold = variant(&result, "bold");
        assert_eq!(bold.impressions, 1);
        assert_eq!(bold.conversions, 0);
        assert_eq!(result.anomalies.len(), 1);
        assert_eq!(
            result.anomalies[0].kind,
            AlertKind::ConversionBeforeImpression,
        );
    }

    #[test]
    fn test_conversion_at_identical_timestamp_counts() {
        let (store, aggregator) = setup(CountingMode::DistinctSubjects);
        let at = Utc::now() - Duration::minutes(45);
        for event_type in [EventType::Impression, EventType::Conversion] {
            store
                .append(Event {
                    event_id: Uuid::new_v4(),
                    subject_id: "u1".to_string(),
                    event_type,
                    experiment_key: Some("checkout_cta".to_string()),
                    variant_key: Some("bold".to_string()),
                    funnel_stage: None,
                    occurred_at: at,
                    properties: Default::default(),
                })
                .unwrap();
        }

        let result = aggregator.compute_result("checkout_cta", &window()).unwrap();
        let bold = variant(&result, "bold");
        assert_eq!(bold.conversions, 1);
        assert!(result.anomalies.is_empty());
    }

    #[test]
    fn test_empty_window_yields_zeroes_not_error() {
        let (_, aggregator) = setup(CountingMode::DistinctSubjects);
        let result = aggregator.compute_result("checkout_cta", &window()).unwrap();

        assert!(result.insufficient_data);
        for v in &result.variants {
            assert_eq!(v.impressions, 0);
            assert_eq!(v.conversions, 0);
            assert_eq!(v.conversion_rate, 0.0);
        }
    }

    #[test]
    fn test_subject_exposed_under_two_variants_is_flagged() {
        let (store, aggregator) = setup(CountingMode::DistinctSubjects);
        put_event(&store, "u1", EventType::Impression, "control", 60);
        put_event(&store, "u1", EventType::Impression, "bold", 50);

        let result = aggregator.compute_result("checkout_cta", &window()).unwrap();
        assert_eq!(result.anomalies.len(), 1);
        assert_eq!(result.anomalies[0].kind, AlertKind::DuplicateAssignment);
        // Best-effort counts still come back.
        assert_eq!(variant(&result, "control").impressions, 1);
        assert_eq!(variant(&result, "bold").impressions, 1);
    }

    #[test]
    fn test_conversion_rate_stays_in_bounds() {
        let (store, aggregator) = setup(CountingMode::DistinctSubjects);
        put_event(&store, "u1", EventType::Impression, "bold", 60);
        for _ in 0..4 {
            put_event(&store, "u1", EventType::Conversion, "bold", 30);
        }

        let result = aggregator.compute_result("checkout_cta", &window()).unwrap();
        for v in &result.variants {
            assert!((0.0..=1.0).contains(&v.conversion_rate));
        }
    }
}
