//! Cohort retention: how many subjects come back in the periods after
//! they are first seen.

use astro_core::error::AstroResult;
use astro_core::types::{CohortPeriod, EventFilter, RetentionReport, RetentionRow, TimeWindow};
use astro_store::EventStore;
use chrono::{Datelike, Duration, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Computes retention curves from the event log. The cohort key is the
/// period in which a subject was first seen; any event in a later period
/// counts the subject as retained for that period.
pub struct RetentionAnalyzer {
    events: Arc<dyn EventStore>,
}

impl RetentionAnalyzer {
    pub fn new(events: Arc<dyn EventStore>) -> Self {
        Self { events }
    }

    pub fn compute_retention(
        &self,
        period: CohortPeriod,
        num_periods: u32,
        window: &TimeWindow,
    ) -> AstroResult<RetentionReport> {
        let events = self.events.query_range(&EventFilter::default(), window)?;

        // Events arrive sorted ascending, so the first sighting wins.
        let mut first_seen: HashMap<&str, NaiveDate> = HashMap::new();
        for event in &events {
            first_seen
                .entry(event.subject_id.as_str())
                .or_insert_with(|| bucket_date(event.occurred_at.date_naive(), period));
        }

        let mut cohorts: BTreeMap<NaiveDate, (HashSet<&str>, Vec<HashSet<&str>>)> = BTreeMap::new();
        for (&subject, &cohort_date) in &first_seen {
            cohorts
                .entry(cohort_date)
                .or_insert_with(|| (HashSet::new(), vec![HashSet::new(); num_periods as usize]))
                .0
                .insert(subject);
        }

        for event in &events {
            let subject = event.subject_id.as_str();
            let Some(&cohort_date) = first_seen.get(subject) else {
                continue;
            };
            let bucket = bucket_date(event.occurred_at.date_naive(), period);
            let offset = periods_between(cohort_date, bucket, period);
            if offset >= 1 && offset <= num_periods as i64 {
                if let Some((_, retained)) = cohorts.get_mut(&cohort_date) {
                    retained[(offset - 1) as usize].insert(subject);
                }
            }
        }

        let rows = cohorts
            .into_iter()
            .map(|(cohort_date, (initial, retained))| RetentionRow {
                cohort_date,
                initial_size: initial.len() as u64,
                retention_rates: retained
                    .iter()
                    .map(|set| {
                        if initial.is_empty() {
                            0.0
                        } else {
                            set.len() as f64 / initial.len() as f64
                        }
                    })
                    .collect(),
            })
            .collect();

        Ok(RetentionReport {
            period,
            rows,
            computed_at: Utc::now(),
        })
    }
}

fn bucket_date(date: NaiveDate, period: CohortPeriod) -> NaiveDate {
    match period {
        CohortPeriod::Daily => date,
        CohortPeriod::Weekly => {
            date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
        }
        CohortPeriod::Monthly => date.with_day(1).unwrap_or(date),
    }
}

fn periods_between(cohort: NaiveDate, bucket: NaiveDate, period: CohortPeriod) -> i64 {
    match period {
        CohortPeriod::Daily => (bucket - cohort).num_days(),
        CohortPeriod::Weekly => (bucket - cohort).num_days() / 7,
        CohortPeriod::Monthly => {
            i64::from(bucket.year() - cohort.year()) * 12
                + i64::from(bucket.month() as i32 - cohort.month() as i32)
        }
    }
}
