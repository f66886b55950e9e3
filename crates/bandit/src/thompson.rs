//! Thompson Sampling over per-arm Beta-Bernoulli posteriors, with sticky
//! per-user assignments.

use crate::best_effort::{cache_evict, cache_put, cached};
use crate::sampler::sample_beta;
use experiment_cache::Cache;
use experiment_core::config::BanditConfig;
use experiment_core::types::{Arm, ArmStats, Assignment};
use experiment_core::{ExperimentError, ExperimentResult, ExperimentStore};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Posterior summary for one arm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmSummary {
    pub arm: Arm,
    pub stats: ArmStats,
    pub conversion_rate: f64,
    pub expected_value: f64,
    pub credible_interval_lower: f64,
    pub credible_interval_upper: f64,
    pub traffic_share: f64,
}

pub struct ThompsonBandit {
    store: Arc<dyn ExperimentStore>,
    cache: Arc<dyn Cache>,
    assignment_ttl: chrono::Duration,
    stats_cache_ttl: Duration,
}

pub(crate) fn stats_key(arm_id: Uuid) -> String {
    format!("arm_stats:{arm_id}")
}

fn assignment_key(experiment_id: Uuid, user_id: &str) -> String {
    format!("assignment:{experiment_id}:{user_id}")
}

/// Highest sample wins; ties go to the arm seen first.
pub fn pick_best(samples: &[(Uuid, f64)]) -> Option<Uuid> {
    let mut best: Option<(Uuid, f64)> = None;
    for &(arm_id, sample) in samples {
        match best {
            Some((_, top)) if sample <= top => {}
            _ => best = Some((arm_id, sample)),
        }
    }
    best.map(|(arm_id, _)| arm_id)
}

impl ThompsonBandit {
    pub fn new(store: Arc<dyn ExperimentStore>, cache: Arc<dyn Cache>, config: &BanditConfig) -> Self {
        Self {
            store,
            cache,
            assignment_ttl: chrono::Duration::seconds(config.assignment_ttl_secs as i64),
            stats_cache_ttl: Duration::from_secs(config.stats_cache_ttl_secs),
        }
    }

    pub async fn register_arm(&self, arm: Arm) -> ExperimentResult<Arm> {
        self.store.create_arm(arm).await
    }

    /// Arms of an experiment; an experiment without arms is `NotFound`.
    pub async fn arms(&self, experiment_id: Uuid) -> ExperimentResult<Vec<Arm>> {
        let arms = self.store.get_arms(experiment_id).await?;
        if arms.is_empty() {
            return Err(ExperimentError::NotFound(format!(
                "no arms for experiment {experiment_id}"
            )));
        }
        Ok(arms)
    }

    /// Return the user's unexpired assignment, or sample every arm's posterior
    /// and assign the winner for the assignment TTL.
    pub async fn select_arm(&self, experiment_id: Uuid, user_id: &str) -> ExperimentResult<Uuid> {
        if let Some(assignment) = self.active_assignment(experiment_id, user_id).await? {
            debug!(
                experiment_id = %experiment_id,
                user_id = user_id,
                arm_id = %assignment.arm_id,
                "Sticky assignment reused"
            );
            return Ok(assignment.arm_id);
        }

        let arms = self.arms(experiment_id).await?;
        let mut posteriors = Vec::with_capacity(arms.len());
        for arm in &arms {
            let stats = self.get_arm_stats(arm.id).await?;
            posteriors.push((arm.id, stats.alpha, stats.beta));
        }

        let samples: Vec<(Uuid, f64)> = {
            let mut rng = rand::thread_rng();
            posteriors
                .iter()
                .map(|&(arm_id, alpha, beta)| (arm_id, sample_beta(&mut rng, alpha, beta)))
                .collect()
        };
        let arm_id = pick_best(&samples)
            .ok_or_else(|| ExperimentError::NotFound(format!("no arms for experiment {experiment_id}")))?;

        let assignment = Assignment::new(experiment_id, user_id, arm_id, self.assignment_ttl);
        self.store.save_assignment(&assignment).await?;
        self.cache_assignment(&assignment).await;

        metrics::counter!("bandit.selections").increment(1);
        debug!(
            experiment_id = %experiment_id,
            user_id = user_id,
            arm_id = %arm_id,
            "Arm selected by Thompson sampling"
        );
        Ok(arm_id)
    }

    async fn active_assignment(
        &self,
        experiment_id: Uuid,
        user_id: &str,
    ) -> ExperimentResult<Option<Assignment>> {
        let now = chrono::Utc::now();
        let key = assignment_key(experiment_id, user_id);
        if let Some(assignment) = cached::<Assignment>(self.cache.as_ref(), &key).await {
            if !assignment.is_expired(now) {
                return Ok(Some(assignment));
            }
        }

        match self.store.get_assignment(experiment_id, user_id).await? {
            Some(assignment) if !assignment.is_expired(now) => {
                self.cache_assignment(&assignment).await;
                Ok(Some(assignment))
            }
            _ => Ok(None),
        }
    }

    async fn cache_assignment(&self, assignment: &Assignment) {
        let remaining = (assignment.expires_at - chrono::Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let key = assignment_key(assignment.experiment_id, &assignment.user_id);
        cache_put(self.cache.as_ref(), &key, assignment, remaining).await;
    }

    /// Cache first, then the store, else the uniform prior.
    pub async fn get_arm_stats(&self, arm_id: Uuid) -> ExperimentResult<ArmStats> {
        let key = stats_key(arm_id);
        if let Some(stats) = cached::<ArmStats>(self.cache.as_ref(), &key).await {
            return Ok(stats);
        }
        match self.store.get_arm_stats(arm_id).await? {
            Some(stats) => {
                cache_put(self.cache.as_ref(), &key, &stats, self.stats_cache_ttl).await;
                Ok(stats)
            }
            None => Ok(ArmStats::new(arm_id)),
        }
    }

    /// Apply one observed reward. A positive reward counts as a conversion.
    pub async fn update_reward(
        &self,
        experiment_id: Uuid,
        arm_id: Uuid,
        reward: f64,
    ) -> ExperimentResult<ArmStats> {
        let stats = self.store.record_arm_outcome(arm_id, reward).await?;
        // Concurrent updates finish in any order; the next read repopulates
        cache_evict(self.cache.as_ref(), &stats_key(arm_id)).await;

        metrics::counter!("bandit.rewards").increment(1);
        debug!(
            experiment_id = %experiment_id,
            arm_id = %arm_id,
            reward = reward,
            samples = stats.samples,
            conversions = stats.conversions,
            "Arm stats updated"
        );
        Ok(stats)
    }

    /// Monte-Carlo estimate of each arm's probability of being best.
    pub async fn calculate_win_probability(
        &self,
        experiment_id: Uuid,
        simulations: usize,
    ) -> ExperimentResult<HashMap<Uuid, f64>> {
        let arms = self.arms(experiment_id).await?;
        let mut posteriors = Vec::with_capacity(arms.len());
        for arm in &arms {
            let stats = self.get_arm_stats(arm.id).await?;
            posteriors.push((arm.id, stats.alpha, stats.beta));
        }
        Ok(simulate_wins(&mut rand::thread_rng(), &posteriors, simulations))
    }

    pub async fn get_experiment_stats(&self, experiment_id: Uuid) -> ExperimentResult<Vec<ArmSummary>> {
        let arms = self.arms(experiment_id).await?;
        let mut stats = Vec::with_capacity(arms.len());
        for arm in &arms {
            stats.push(self.get_arm_stats(arm.id).await?);
        }
        let total: u64 = stats.iter().map(|s| s.samples).sum();
        let arm_count = arms.len();

        Ok(arms
            .into_iter()
            .zip(stats)
            .map(|(arm, stats)| {
                let (lower, upper) = stats.credible_interval();
                let traffic_share = if total > 0 {
                    stats.samples as f64 / total as f64
                } else {
                    1.0 / arm_count as f64
                };
                ArmSummary {
                    conversion_rate: stats.conversion_rate(),
                    expected_value: stats.mean(),
                    credible_interval_lower: lower,
                    credible_interval_upper: upper,
                    traffic_share,
                    arm,
                    stats,
                }
            })
            .collect())
    }
}

/// Tally which arm draws the highest sample across `simulations` joint draws.
pub fn simulate_wins<R: Rng + ?Sized>(
    rng: &mut R,
    posteriors: &[(Uuid, f64, f64)],
    simulations: usize,
) -> HashMap<Uuid, f64> {
    let mut wins: HashMap<Uuid, u64> = posteriors.iter().map(|(id, _, _)| (*id, 0)).collect();
    if simulations == 0 || posteriors.is_empty() {
        return wins.into_keys().map(|id| (id, 0.0)).collect();
    }

    let mut draws = Vec::with_capacity(posteriors.len());
    for _ in 0..simulations {
        draws.clear();
        draws.extend(
            posteriors
                .iter()
                .map(|&(arm_id, alpha, beta)| (arm_id, sample_beta(rng, alpha, beta))),
        );
        if let Some(winner) = pick_best(&draws) {
            *wins.entry(winner).or_insert(0) += 1;
        }
    }

    wins.into_iter()
        .map(|(id, count)| (id, count as f64 / simulations as f64))
        .collect()
}
