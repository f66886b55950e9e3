//! Multi-objective scoring over independent per-objective arm statistics.
//!
//! conversion = Beta sample; ltv = P(conversion) x smoothed LTV;
//! revenue = P(conversion) x revenue per sample. Hybrid mode min-max
//! normalizes the objective scores of an arm and blends them with the
//! configured weights, renormalized over the objectives actually scored.

use crate::sampler::sample_beta;
use crate::thompson::pick_best;
use experiment_core::config::{ObjectiveConfig, ObjectiveMode, ObjectiveWeights};
use experiment_core::types::{ArmObjectiveStats, ObjectiveType};
use experiment_core::{ExperimentError, ExperimentResult, ExperimentStore};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

const TIE_EPS: f64 = 1e-12;

/// Scores of one arm: per objective, plus the blended value used for ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmScore {
    pub arm_id: Uuid,
    pub objectives: BTreeMap<ObjectiveType, f64>,
    pub combined: f64,
}

pub fn validate_weights(weights: &ObjectiveWeights) -> ExperimentResult<()> {
    for objective in ObjectiveType::ALL {
        let weight = weights.get(objective);
        if !weight.is_finite() || weight < 0.0 {
            return Err(ExperimentError::Validation(format!(
                "{objective} weight must be a non-negative number, got {weight}"
            )));
        }
    }
    Ok(())
}

pub fn score_objective<R: Rng + ?Sized>(rng: &mut R, stats: &ArmObjectiveStats) -> f64 {
    let p = sample_beta(rng, stats.alpha, stats.beta);
    match stats.objective {
        ObjectiveType::Conversion => p,
        ObjectiveType::Ltv => p * stats.avg_ltv,
        ObjectiveType::Revenue => p * stats.revenue_per_sample(),
    }
}

/// Min-max normalize into [0, 1]. A set whose values all tie is left unchanged.
pub fn normalize_scores(scores: &[f64]) -> Vec<f64> {
    let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if scores.is_empty() || !(max - min > TIE_EPS) {
        return scores.to_vec();
    }
    scores.iter().map(|s| (s - min) / (max - min)).collect()
}

/// Weighted sum of normalized scores. Weights are renormalized over the
/// objectives present; with no positive weight the conversion score is used.
pub fn blend(scores: &BTreeMap<ObjectiveType, f64>, weights: &ObjectiveWeights) -> f64 {
    let total: f64 = scores.keys().map(|o| weights.get(*o)).sum();
    if !(total > 0.0) {
        return scores.get(&ObjectiveType::Conversion).copied().unwrap_or(0.0);
    }
    let raw: Vec<f64> = scores.values().copied().collect();
    let normalized = normalize_scores(&raw);
    scores
        .keys()
        .zip(normalized)
        .map(|(objective, score)| weights.get(*objective) / total * score)
        .sum()
}

pub struct MultiObjectiveScorer {
    store: Arc<dyn ExperimentStore>,
    mode: ObjectiveMode,
    weights: ObjectiveWeights,
}

impl MultiObjectiveScorer {
    pub fn new(store: Arc<dyn ExperimentStore>, config: &ObjectiveConfig) -> ExperimentResult<Self> {
        validate_weights(&config.weights)?;
        Ok(Self {
            store,
            mode: config.mode,
            weights: config.weights,
        })
    }

    pub fn mode(&self) -> ObjectiveMode {
        self.mode
    }

    /// Objectives updated and scored under the current mode.
    pub fn tracked_objectives(&self) -> Vec<ObjectiveType> {
        if let Some(single) = self.mode.single() {
            return vec![single];
        }
        let weighted: Vec<ObjectiveType> = ObjectiveType::ALL
            .into_iter()
            .filter(|o| self.weights.get(*o) > 0.0)
            .collect();
        if weighted.is_empty() {
            vec![ObjectiveType::Conversion]
        } else {
            weighted
        }
    }

    pub async fn record_objective_reward(
        &self,
        arm_id: Uuid,
        objective: ObjectiveType,
        reward: f64,
    ) -> ExperimentResult<ArmObjectiveStats> {
        let stats = self.store.record_objective_outcome(arm_id, objective, reward).await?;
        debug!(
            arm_id = %arm_id,
            objective = %objective,
            reward = reward,
            samples = stats.samples,
            "Objective stats updated"
        );
        Ok(stats)
    }

    /// Update every tracked objective. In hybrid mode a failing objective is
    /// logged and skipped unless the store lacks objective support entirely.
    /// Returns the number of objectives updated.
    pub async fn record_reward(&self, arm_id: Uuid, reward: f64) -> ExperimentResult<usize> {
        if let Some(single) = self.mode.single() {
            self.record_objective_reward(arm_id, single, reward).await?;
            return Ok(1);
        }

        let mut updated = 0;
        for objective in self.tracked_objectives() {
            match self.record_objective_reward(arm_id, objective, reward).await {
                Ok(_) => updated += 1,
                Err(e) if e.is_unsupported() => return Err(e),
                Err(e) => {
                    warn!(arm_id = %arm_id, objective = %objective, error = %e, "Objective update failed");
                }
            }
        }
        Ok(updated)
    }

    async fn load_stats(&self, arm_id: Uuid) -> ExperimentResult<Vec<ArmObjectiveStats>> {
        let mut all = Vec::new();
        for objective in self.tracked_objectives() {
            let stats = self
                .store
                .get_objective_stats(arm_id, objective)
                .await?
                .unwrap_or_else(|| ArmObjectiveStats::new(arm_id, objective));
            all.push(stats);
        }
        Ok(all)
    }

    fn score_with<R: Rng + ?Sized>(&self, rng: &mut R, arm_id: Uuid, stats: &[ArmObjectiveStats]) -> ArmScore {
        let objectives: BTreeMap<ObjectiveType, f64> = stats
            .iter()
            .map(|s| (s.objective, score_objective(rng, s)))
            .collect();
        let combined = match self.mode.single() {
            Some(single) => objectives.get(&single).copied().unwrap_or(0.0),
            None => blend(&objectives, &self.weights),
        };
        ArmScore {
            arm_id,
            objectives,
            combined,
        }
    }

    /// One scoring draw for every arm of the experiment, in arm order.
    pub async fn get_objective_scores(&self, experiment_id: Uuid) -> ExperimentResult<Vec<ArmScore>> {
        let arms = self.store.get_arms(experiment_id).await?;
        if arms.is_empty() {
            return Err(ExperimentError::NotFound(format!(
                "no arms for experiment {experiment_id}"
            )));
        }
        let mut loaded = Vec::with_capacity(arms.len());
        for arm in &arms {
            loaded.push((arm.id, self.load_stats(arm.id).await?));
        }

        let mut rng = rand::thread_rng();
        Ok(loaded
            .iter()
            .map(|(arm_id, stats)| self.score_with(&mut rng, *arm_id, stats))
            .collect())
    }

    /// Arm with the highest combined score; ties go to the first arm.
    pub async fn select_best_arm(&self, experiment_id: Uuid) -> ExperimentResult<Uuid> {
        let scores = self.get_objective_scores(experiment_id).await?;
        let ranked: Vec<(Uuid, f64)> = scores.iter().map(|s| (s.arm_id, s.combined)).collect();
        pick_best(&ranked)
            .ok_or_else(|| ExperimentError::NotFound(format!("no arms for experiment {experiment_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::seeded_experiment;
    use experiment_core::MemoryStore;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config(mode: ObjectiveMode, conversion: f64, ltv: f64, revenue: f64) -> ObjectiveConfig {
        ObjectiveConfig {
            enabled: true,
            mode,
            weights: ObjectiveWeights {
                conversion,
                ltv,
                revenue,
            },
        }
    }

    #[test]
    fn test_normalized_scores_in_unit_range() {
        let normalized = normalize_scores(&[0.2, 35.0, 7.5]);
        assert!(normalized.iter().all(|s| (0.0..=1.0).contains(s)));
        assert_eq!(normalized[0], 0.0);
        assert_eq!(normalized[1], 1.0);
    }

    #[test]
    fn test_tied_scores_are_unchanged() {
        assert_eq!(normalize_scores(&[0.4, 0.4, 0.4]), vec![0.4, 0.4, 0.4]);
        assert_eq!(normalize_scores(&[3.0]), vec![3.0]);
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn test_blend_renormalizes_weights() {
        let weights = ObjectiveWeights {
            conversion: 1.0,
            ltv: 3.0,
            revenue: 100.0,
        };
        let scores = BTreeMap::from([(ObjectiveType::Conversion, 0.1), (ObjectiveType::Ltv, 50.0)]);
        // normalized: conversion 0, ltv 1; weights renormalized over the two present
        assert!((blend(&scores, &weights) - 0.75).abs() < 1e-12);

        let tied = BTreeMap::from([(ObjectiveType::Conversion, 0.3), (ObjectiveType::Ltv, 0.3)]);
        let blended = blend(&tied, &weights);
        assert!((0.0..=0.3 + 1e-12).contains(&blended));
    }

    #[test]
    fn test_blend_without_weight_uses_conversion() {
        let weights = ObjectiveWeights {
            conversion: 0.0,
            ltv: 0.0,
            revenue: 0.0,
        };
        let scores = BTreeMap::from([(ObjectiveType::Conversion, 0.42), (ObjectiveType::Revenue, 9.0)]);
        assert_eq!(blend(&scores, &weights), 0.42);
    }

    #[test]
    fn test_weight_validation() {
        let mut weights = ObjectiveWeights::default();
        assert!(validate_weights(&weights).is_ok());
        weights.ltv = -0.5;
        assert!(validate_weights(&weights).is_err());
        weights.ltv = f64::NAN;
        assert!(validate_weights(&weights).is_err());
    }

    #[test]
    fn test_value_scores_scale_with_probability() {
        let mut rng = StdRng::seed_from_u64(21);
        let mut stats = ArmObjectiveStats::new(Uuid::new_v4(), ObjectiveType::Ltv);
        for _ in 0..50 {
            stats.apply_reward(40.0);
        }
        for _ in 0..200 {
            let score = score_objective(&mut rng, &stats);
            assert!(score > 0.0 && score <= 40.0);
        }

        stats.objective = ObjectiveType::Revenue;
        let revenue = score_objective(&mut rng, &stats);
        assert!(revenue <= stats.revenue_per_sample());
    }

    #[tokio::test]
    async fn test_tracked_objectives_follow_mode() {
        let store = Arc::new(MemoryStore::new());
        let single = MultiObjectiveScorer::new(store.clone(), &config(ObjectiveMode::Ltv, 1.0, 0.0, 0.0)).unwrap();
        assert_eq!(single.tracked_objectives(), vec![ObjectiveType::Ltv]);

        let hybrid =
            MultiObjectiveScorer::new(store.clone(), &config(ObjectiveMode::Hybrid, 0.5, 0.0, 0.5)).unwrap();
        assert_eq!(
            hybrid.tracked_objectives(),
            vec![ObjectiveType::Conversion, ObjectiveType::Revenue]
        );

        let empty = MultiObjectiveScorer::new(store.clone(), &config(ObjectiveMode::Hybrid, 0.0, 0.0, 0.0)).unwrap();
        assert_eq!(empty.tracked_objectives(), vec![ObjectiveType::Conversion]);

        assert!(MultiObjectiveScorer::new(store, &config(ObjectiveMode::Hybrid, -1.0, 0.0, 0.0)).is_err());
    }

    #[tokio::test]
    async fn test_hybrid_reward_updates_weighted_objectives() {
        let (store, _, arms) = seeded_experiment(1).await;
        let scorer =
            MultiObjectiveScorer::new(store.clone(), &config(ObjectiveMode::Hybrid, 1.0, 2.0, 0.0)).unwrap();
        assert_eq!(scorer.record_reward(arms[0].id, 12.0).await.unwrap(), 2);

        let stats = store.list_objective_stats(arms[0].id).await.unwrap();
        let objectives: Vec<ObjectiveType> = stats.iter().map(|s| s.objective).collect();
        assert_eq!(objectives, vec![ObjectiveType::Conversion, ObjectiveType::Ltv]);
        assert_eq!(stats[1].avg_ltv, 12.0);
    }

    #[tokio::test]
    async fn test_revenue_mode_prefers_valuable_arm() {
        let (store, exp, arms) = seeded_experiment(2).await;
        let scorer =
            MultiObjectiveScorer::new(store.clone(), &config(ObjectiveMode::Revenue, 0.0, 0.0, 1.0)).unwrap();
        for _ in 0..100 {
            scorer.record_reward(arms[0].id, 1.0).await.unwrap();
            scorer.record_reward(arms[1].id, 50.0).await.unwrap();
        }
        for _ in 0..10 {
            assert_eq!(scorer.select_best_arm(exp).await.unwrap(), arms[1].id);
        }

        let scores = scorer.get_objective_scores(exp).await.unwrap();
        assert_eq!(scores.len(), 2);
        assert!(scores[1].objectives.contains_key(&ObjectiveType::Revenue));
    }

    #[tokio::test]
    async fn test_hybrid_on_unsupported_store() {
        let store = Arc::new(MemoryStore::core_only());
        let scorer = MultiObjectiveScorer::new(store, &config(ObjectiveMode::Hybrid, 1.0, 1.0, 1.0)).unwrap();
        let err = scorer.record_reward(Uuid::new_v4(), 1.0).await.unwrap_err();
        assert!(err.is_unsupported());
    }
}
