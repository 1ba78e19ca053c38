//! Experiment lifecycle management: draft, running, concluded.

use astro_core::error::{AstroError, AstroResult};
use astro_core::types::{Experiment, ExperimentStatus, Variant};
use astro_store::ExperimentStore;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

/// Admin-facing experiment manager. All mutation happens through
/// lifecycle transitions; an existing experiment's variant list is only
/// editable while it is still a draft.
pub struct ExperimentManager {
    store: Arc<dyn ExperimentStore>,
}

impl ExperimentManager {
    pub fn new(store: Arc<dyn ExperimentStore>) -> Self {
        Self { store }
    }

    /// Create a draft experiment with the given variants.
    pub fn create(
        &self,
        experiment_key: &str,
        name: &str,
        variants: Vec<Variant>,
    ) -> AstroResult<Experiment> {
        validate_variants(&variants)?;
        if self.store.get(experiment_key)?.is_some() {
            return Err(AstroError::ExperimentConfig(format!(
                "experiment '{experiment_key}' already exists"
            )));
        }

        let now = Utc::now();
        let experiment = Experiment {
            experiment_key: experiment_key.to_string(),
            name: name.to_string(),
            variants,
            status: ExperimentStatus::Draft,
            started_at: None,
            ended_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.put(experiment.clone())?;
        info!(experiment_key, "Experiment created");
        Ok(experiment)
    }

    /// Replace the variant list of a draft. Running and concluded
    /// experiments reject this: edits would invalidate prior assignments.
    pub fn update_variants(
        &self,
        experiment_key: &str,
        variants: Vec<Variant>,
    ) -> AstroResult<Experiment> {
        validate_variants(&variants)?;
        let mut experiment = self.require(experiment_key)?;
        if experiment.status != ExperimentStatus::Draft {
            return Err(AstroError::VariantsImmutable(experiment_key.to_string()));
        }
        experiment.variants = variants;
        experiment.updated_at = Utc::now();
        self.store.put(experiment.clone())?;
        Ok(experiment)
    }

    pub fn start(&self, experiment_key: &str) -> AstroResult<Experiment> {
        let mut experiment = self.require(experiment_key)?;
        if experiment.status != ExperimentStatus::Draft {
            return Err(AstroError::InvalidTransition {
                from: experiment.status.as_str().to_string(),
                to: ExperimentStatus::Running.as_str().to_string(),
            });
        }
        let now = Utc::now();
        experiment.status = ExperimentStatus::Running;
        experiment.started_at = Some(now);
        experiment.updated_at = now;
        self.store.put(experiment.clone())?;
        info!(experiment_key, "Experiment started");
        Ok(experiment)
    }

    pub fn conclude(&self, experiment_key: &str) -> AstroResult<Experiment> {
        let mut experiment = self.require(experiment_key)?;
        if experiment.status != ExperimentStatus::Running {
            return Err(AstroError::InvalidTransition {
                from: experiment.status.as_str().to_string(),
                to: ExperimentStatus::Concluded.as_str().to_string(),
            });
        }
        let now = Utc::now();
        experiment.status = ExperimentStatus::Concluded;
        experiment.ended_at = Some(now);
        experiment.updated_at = now;
        self.store.put(experiment.clone())?;
        info!(experiment_key, "Experiment concluded");
        Ok(experiment)
    }

    pub fn get(&self, experiment_key: &str) -> AstroResult<Option<Experiment>> {
        self.store.get(experiment_key)
    }

    pub fn list(&self) -> AstroResult<Vec<Experiment>> {
        self.store.list()
    }

    fn require(&self, experiment_key: &str) -> AstroResult<Experiment> {
        self.store
            .get(experiment_key)?
            .ok_or_else(|| AstroError::ExperimentNotFound(experiment_key.to_string()))
    }
}

fn validate_variants(variants: &[Variant]) -> AstroResult<()> {
    if variants.len() < 2 {
        return Err(AstroError::ExperimentConfig(
            "an experiment needs at least 2 variants".to_string(),
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for variant in variants {
        if !seen.insert(variant.key.as_str()) {
            return Err(AstroError::ExperimentConfig(format!(
                "duplicate variant key '{}'",
                variant.key
            )));
        }
        if !variant.weight.is_finite() || variant.weight <= 0.0 {
            return Err(AstroError::ExperimentConfig(format!(
                "variant '{}' has non-positive weight",
                variant.key
            )));
        }
    }
    Ok(())
}
