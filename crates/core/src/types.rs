use crate::event::EventType;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Experiments ────────────────────────────────────────────────────────

/// A/B test definition. The variant list is frozen once the experiment
/// enters `Running`; changing it mid-flight would invalidate every
/// assignment made so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub experiment_key: String,
    pub name: String,
    pub variants: Vec<Variant>,
    pub status: ExperimentStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub key: String,
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Concluded,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Running => "running",
            Self::Concluded => "concluded",
        }
    }
}

/// Durable binding of a subject to a variant. Unique per
/// `(experiment_key, subject_id)`; never rewritten once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub experiment_key: String,
    pub subject_id: String,
    pub variant_key: String,
    pub assigned_at: DateTime<Utc>,
}

// ─── Ingestion ──────────────────────────────────────────────────────────

/// Acknowledgement of a durable event append. A duplicate append of the
/// same `event_id` returns a clone of the first Ack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ack {
    pub event_id: Uuid,
    pub recorded_at: DateTime<Utc>,
}

// ─── Derived results ────────────────────────────────────────────────────

/// Per-variant A/B test outcome. Derived from the event log on demand,
/// never authoritative state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ABTestResult {
    pub test_name: String,
    pub variants: Vec<VariantResult>,
    /// True when no variant saw any impressions in the window, so the
    /// zeroed rates should not be read as "0% converts".
    pub insufficient_data: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anomalies: Vec<DataQualityAlert>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantResult {
    pub name: String,
    pub impressions: u64,
    pub conversions: u64,
    pub conversion_rate: f64,
}

/// Ordered list of funnel stages by event stage identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelDefinition {
    pub name: String,
    pub stages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelSnapshot {
    pub funnel_name: String,
    pub stages: Vec<FunnelStage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anomalies: Vec<DataQualityAlert>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelStage {
    pub stage_name: String,
    pub subject_count: u64,
    pub drop_off_rate_from_previous: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CohortPeriod {
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionReport {
    pub period: CohortPeriod,
    pub rows: Vec<RetentionRow>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionRow {
    pub cohort_date: NaiveDate,
    pub initial_size: u64,
    pub retention_rates: Vec<f64>,
}

// ─── Query shapes ───────────────────────────────────────────────────────

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Rolling window ending now.
    pub fn trailing_days(days: i64) -> Self {
        let end = Utc::now();
        Self {
            start: end - Duration::days(days),
            end,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

/// Attribute-equality filter applied by `query_range`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub event_types: Option<Vec<EventType>>,
    pub experiment_key: Option<String>,
    pub variant_key: Option<String>,
    pub funnel_stages: Option<Vec<String>>,
}

impl EventFilter {
    pub fn for_experiment(experiment_key: &str, event_types: Vec<EventType>) -> Self {
        Self {
            event_types: Some(event_types),
            experiment_key: Some(experiment_key.to_string()),
            ..Default::default()
        }
    }

    pub fn for_funnel_stages(stages: Vec<String>) -> Self {
        Self {
            event_types: Some(vec![EventType::FunnelStep]),
            funnel_stages: Some(stages),
            ..Default::default()
        }
    }

    pub fn matches(&self, event: &crate::event::Event) -> bool {
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(key) = &self.experiment_key {
            if event.experiment_key.as_deref() != Some(key.as_str()) {
                return false;
            }
        }
        if let Some(key) = &self.variant_key {
            if event.variant_key.as_deref() != Some(key.as_str()) {
                return false;
            }
        }
        if let Some(stages) = &self.funnel_stages {
            match &event.funnel_stage {
                Some(stage) if stages.contains(stage) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Subject population filter evaluated before aggregation, so that
/// percentages are relative to the cohort denominator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CohortFilter {
    /// Restrict to subjects first seen within this range (the product's
    /// signup proxy).
    pub first_seen: Option<TimeWindow>,
}

impl CohortFilter {
    pub fn is_unrestricted(&self) -> bool {
        self.first_seen.is_none()
    }
}

// ─── Data quality ───────────────────────────────────────────────────────

/// Read-time anomaly surfaced alongside best-effort results. These mark
/// likely instrumentation bugs upstream and are never auto-corrected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataQualityAlert {
    pub kind: AlertKind,
    pub subject_id: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ConversionBeforeImpression,
    NonMonotonicFunnel,
    DuplicateAssignment,
}
