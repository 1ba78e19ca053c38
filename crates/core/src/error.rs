use thiserror::Error;

pub type AstroResult<T> = Result<T, AstroError>;

#[derive(Error, Debug)]
pub enum AstroError {
    #[error("Event validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Experiment '{experiment_key}' is not active (status: {status})")]
    ExperimentNotActive {
        experiment_key: String,
        status: String,
    },

    #[error("Experiment not found: {0}")]
    ExperimentNotFound(String),

    #[error("Variants of experiment '{0}' cannot change once it is running")]
    VariantsImmutable(String),

    #[error("Invalid experiment transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Experiment configuration error: {0}")]
    ExperimentConfig(String),

    #[error("Funnel not registered: {0}")]
    FunnelNotFound(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Reasons an incoming raw event is rejected at the ingestion boundary.
/// Rejected events never reach the store; the caller corrects and retries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("{event_type} events require experiment_key and variant_key")]
    MissingExperimentScope { event_type: String },

    #[error("funnel_step events require funnel_stage")]
    MissingFunnelStage,

    #[error("occurred_at is {minutes_ahead}m in the future (max skew: {max_minutes}m)")]
    TimestampTooFarAhead {
        minutes_ahead: i64,
        max_minutes: i64,
    },

    #[error("property '{0}' is not a scalar value")]
    NonScalarProperty(String),
}
