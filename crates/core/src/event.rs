//! Canonical analytics event schema and the ingestion-boundary validator.

use crate::error::ValidationError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Behavioral event emitted by product instrumentation. Immutable once
/// stored; `event_id` is the global deduplication key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub event_id: Uuid,
    pub subject_id: String,
    pub event_type: EventType,
    pub experiment_key: Option<String>,
    pub variant_key: Option<String>,
    pub funnel_stage: Option<String>,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub properties: HashMap<String, PropertyValue>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Impression,
    Conversion,
    FunnelStep,
    Custom,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Impression => "impression",
            Self::Conversion => "conversion",
            Self::FunnelStep => "funnel_step",
            Self::Custom => "custom",
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "impression" => Ok(Self::Impression),
            "conversion" => Ok(Self::Conversion),
            "funnel_step" => Ok(Self::FunnelStep),
            "custom" => Ok(Self::Custom),
            _ => Err(()),
        }
    }
}

/// Scalar property attached to an event. Deliberately closed: nested
/// payloads are rejected at the boundary rather than modeled here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PropertyValue {
    Flag(bool),
    Number(f64),
    Timestamp(DateTime<Utc>),
    Text(String),
}

impl PropertyValue {
    /// Coerce a JSON value into a scalar property. Strings that parse as
    /// RFC 3339 timestamps become `Timestamp`; null, arrays, and objects
    /// are not representable.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Self::Flag(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(Self::Number),
            serde_json::Value::String(s) => match DateTime::parse_from_rfc3339(s) {
                Ok(ts) => Some(Self::Timestamp(ts.with_timezone(&Utc))),
                Err(_) => Some(Self::Text(s.clone())),
            },
            _ => None,
        }
    }
}

/// Wire-shape event as submitted by instrumentation, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawEvent {
    pub event_id: Option<Uuid>,
    pub subject_id: Option<String>,
    pub event_type: Option<String>,
    pub experiment_key: Option<String>,
    pub variant_key: Option<String>,
    pub funnel_stage: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
}

/// Validate a raw event into the canonical schema. Pure: no I/O, no
/// clock mutation; `max_future_skew` bounds how far ahead of the server
/// clock an `occurred_at` may sit before it is treated as abuse.
pub fn validate(raw: RawEvent, max_future_skew: Duration) -> Result<Event, ValidationError> {
    let event_id = raw
        .event_id
        .ok_or(ValidationError::MissingField("event_id"))?;
    let subject_id = match raw.subject_id {
        Some(s) if !s.trim().is_empty() => s,
        _ => return Err(ValidationError::MissingField("subject_id")),
    };
    let type_str = raw
        .event_type
        .ok_or(ValidationError::MissingField("event_type"))?;
    let event_type = type_str
        .parse::<EventType>()
        .map_err(|_| ValidationError::UnknownEventType(type_str))?;
    let occurred_at = raw
        .occurred_at
        .ok_or(ValidationError::MissingField("occurred_at"))?;

    let ahead = occurred_at.signed_duration_since(Utc::now());
    if ahead > max_future_skew {
        return Err(ValidationError::TimestampTooFarAhead {
            minutes_ahead: ahead.num_minutes(),
            max_minutes: max_future_skew.num_minutes(),
        });
    }

    match event_type {
        EventType::Impression | EventType::Conversion => {
            if raw.experiment_key.is_none() || raw.variant_key.is_none() {
                return Err(ValidationError::MissingExperimentScope {
                    event_type: event_type.as_str().to_string(),
                });
            }
        }
        EventType::FunnelStep => {
            if raw.funnel_stage.is_none() {
                return Err(ValidationError::MissingFunnelStage);
            }
        }
        EventType::Custom => {}
    }

    let mut properties = HashMap::with_capacity(raw.properties.len());
    for (key, value) in raw.properties {
        let scalar = PropertyValue::from_json(&value)
            .ok_or_else(|| ValidationError::NonScalarProperty(key.clone()))?;
        properties.insert(key, scalar);
    }

    Ok(Event {
        event_id,
        subject_id,
        event_type,
        experiment_key: raw.experiment_key,
        variant_key: raw.variant_key,
        funnel_stage: raw.funnel_stage,
        occurred_at,
        properties,
    })
}
