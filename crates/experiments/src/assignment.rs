//! Deterministic variant assignment with stability under races.

use astro_core::error::{AstroError, AstroResult};
use astro_core::types::{Assignment, Experiment, ExperimentStatus};
use astro_store::{AssignmentStore, ExperimentStore};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

/// Assigns subjects to variants. A subject's variant for a given
/// experiment never changes once recorded; every downstream statistic
/// depends on that.
pub struct AssignmentService {
    experiments: Arc<dyn ExperimentStore>,
    assignments: Arc<dyn AssignmentStore>,
}

impl AssignmentService {
    pub fn new(experiments: Arc<dyn ExperimentStore>, assignments: Arc<dyn AssignmentStore>) -> Self {
        Self {
            experiments,
            assignments,
        }
    }

    /// Return the subject's variant, creating the assignment on first
    /// contact. Concurrent first-time calls race on the store's unique
    /// constraint; exactly one insert wins and every caller returns the
    /// surviving row's variant.
    pub fn assign(&self, experiment_key: &str, subject_id: &str) -> AstroResult<String> {
        if let Some(existing) = self.assignments.get(experiment_key, subject_id)? {
            return Ok(existing.variant_key);
        }

        let experiment = self
            .experiments
            .get(experiment_key)?
            .ok_or_else(|| AstroError::ExperimentNotFound(experiment_key.to_string()))?;
        if experiment.status != ExperimentStatus::Running {
            return Err(AstroError::ExperimentNotActive {
                experiment_key: experiment_key.to_string(),
                status: experiment.status.as_str().to_string(),
            });
        }

        let variant_key = pick_variant(&experiment, subject_id)
            .ok_or_else(|| {
                AstroError::ExperimentConfig(format!(
                    "experiment '{experiment_key}' has no variants"
                ))
            })?
            .to_string();
        let surviving = self.assignments.insert_if_absent(Assignment {
            experiment_key: experiment_key.to_string(),
            subject_id: subject_id.to_string(),
            variant_key: variant_key.clone(),
            assigned_at: Utc::now(),
        })?;

        if surviving.variant_key != variant_key {
            metrics::counter!("assignments.race_adopted").increment(1);
        }
        debug!(
            experiment_key,
            subject_id,
            variant = %surviving.variant_key,
            "Variant assigned"
        );
        Ok(surviving.variant_key)
    }

    pub fn assignment_count(&self, experiment_key: &str) -> AstroResult<u64> {
        self.assignments.count_for_experiment(experiment_key)
    }
}

/// Deterministic assignment: hash `(experiment_key, subject_id)` into
/// `[0, 1)` and walk the cumulative variant weights. SHA-256 rather than
/// the stdlib hasher so the bucket is stable across processes and
/// releases.
fn pick_variant<'a>(experiment: &'a Experiment, subject_id: &str) -> Option<&'a str> {
    let point = hash_unit_interval(&experiment.experiment_key, subject_id);
    let total: f64 = experiment.variants.iter().map(|v| v.weight).sum();

    let mut cumulative = 0.0;
    for variant in &experiment.variants {
        cumulative += variant.weight / total;
        if point < cumulative {
            return Some(&variant.key);
        }
    }
    // Rounding can leave the last sliver uncovered.
    experiment.variants.last().map(|v| v.key.as_str())
}

pub(crate) fn hash_unit_interval(experiment_key: &str, subject_id: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(experiment_key.as_bytes());
    hasher.update(b":");
    hasher.update(subject_id.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix) as f64 / (u64::MAX as f64 + 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use astro_core::types::Variant;
    use astro_store::MemoryStore;
    use crate::manager::ExperimentManager;

    fn setup() -> (Arc<MemoryStore>, ExperimentManager, AssignmentService) {
        let store = Arc::new(MemoryStore::new());
        let manager = ExperimentManager::new(store.clone());
        let service = AssignmentService::new(store.clone(), store.clone());
        (store, manager, service)
    }

    fn variants(keys: &[&str]) -> Vec<Variant> {
        keys.iter()
            .map(|k| Variant {
                key: k.to_string(),
                weight: 1.0,
            })
            .collect()
    }

    #[test]
    fn test_hash_is_stable_and_in_unit_interval() {
        let a = hash_unit_interval("checkout_cta", "u1");
        let b = hash_unit_interval("checkout_cta", "u1");
        assert_eq!(a, b);
        assert!((0.0..1.0).contains(&a));
        assert_ne!(a, hash_unit_interval("checkout_cta", "u2"));
    }

    #[test]
    fn test_assign_is_idempotent() {
        let (_, manager, service) = setup();
        manager.create("exp", "Exp", variants(&["control", "bold"])).unwrap();
        manager.start("exp").unwrap();

        let first = service.assign("exp", "u1").unwrap();
        for _ in 0..10 {
            assert_eq!(service.assign("exp", "u1").unwrap(), first);
        }
        assert_eq!(service.assignment_count("exp").unwrap(), 1);
    }

    #[test]
    fn test_racing_calls_agree_on_one_assignment() {
        let (store, manager, _) = setup();
        manager
            .create("checkout_cta", "Checkout CTA", variants(&["control", "bold"]))
            .unwrap();
        manager.start("checkout_cta").unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                let service = AssignmentService::new(store.clone(), store);
                service.assign("checkout_cta", "u1").unwrap()
            }));
        }

        let outcomes: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(outcomes.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.count_for_experiment("checkout_cta").unwrap(), 1);
    }

    #[test]
    fn test_assignment_rejected_unless_running() {
        let (_, manager, service) = setup();
        manager.create("exp", "Exp", variants(&["a", "b"])).unwrap();

        assert!(matches!(
            service.assign("exp", "u1"),
            Err(AstroError::ExperimentNotActive { .. }),
        ));

        manager.start("exp").unwrap();
        service.assign("exp", "u1").unwrap();

        manager.conclude("exp").unwrap();
        assert!(matches!(
            service.assign("exp", "u2"),
            Err(AstroError::ExperimentNotActive { .. }),
        ));
        // Existing assignments still resolve after conclusion.
        assert!(service.assign("exp", "u1").is_ok());
    }

    #[test]
    fn test_unknown_experiment_rejected() {
        let (_, _, service) = setup();
        assert!(matches!(
            service.assign("ghost", "u1"),
            Err(AstroError::ExperimentNotFound(_)),
        ));
    }

    #[test]
    fn test_weighted_split_roughly_follows_weights() {
        let (_, manager, service) = setup();
        let weighted = vec![
            Variant {
                key: "control".to_string(),
                weight: 3.0,
            },
            Variant {
                key: "bold".to_string(),
                weight: 1.0,
            },
        ];
        manager.create("weighted", "Weighted", weighted).unwrap();
        manager.start("weighted").unwrap();

        let mut control = 0u32;
        for i in 0..1000 {
            if service.assign("weighted", &format!("subject-{i}")).unwrap() == "control" {
                control += 1;
            }
        }
        // 75% expected; generous tolerance keeps this deterministic-but-unfitted.
        assert!((650..850).contains(&control), "control count {control}");
    }
}
