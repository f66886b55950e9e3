//! In-process [`ExperimentStore`] backed by DashMap.
//!
//! Every read-modify-write runs under the shard lock of the entry it touches,
//! so concurrent outcome recording for the same arm never loses an update.

use crate::error::{ExperimentError, ExperimentResult};
use crate::store::ExperimentStore;
use crate::types::{
    Arm, ArmObjectiveStats, ArmStats, Assignment, ConversionDetails, ConversionLink,
    LinUcbModel, ObjectiveType, PendingReward,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

pub struct MemoryStore {
    arms: DashMap<Uuid, Vec<Arm>>,
    arm_experiment: DashMap<Uuid, Uuid>,
    stats: DashMap<Uuid, ArmStats>,
    assignments: DashMap<(Uuid, String), Assignment>,
    models: DashMap<Uuid, LinUcbModel>,
    pending: DashMap<Uuid, PendingReward>,
    links: DashMap<Uuid, Vec<ConversionLink>>,
    objectives: DashMap<(Uuid, ObjectiveType), ArmObjectiveStats>,
    extensions: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_extensions(true)
    }

    /// A store serving arms, stats, assignments and models only. Delayed
    /// reward and objective calls report `Unsupported`.
    pub fn core_only() -> Self {
        Self::with_extensions(false)
    }

    fn with_extensions(extensions: bool) -> Self {
        Self {
            arms: DashMap::new(),
            arm_experiment: DashMap::new(),
            stats: DashMap::new(),
            assignments: DashMap::new(),
            models: DashMap::new(),
            pending: DashMap::new(),
            links: DashMap::new(),
            objectives: DashMap::new(),
            extensions,
        }
    }

    fn require(&self, capability: &str) -> ExperimentResult<()> {
        if self.extensions {
            Ok(())
        } else {
            Err(ExperimentError::Unsupported(capability.to_string()))
        }
    }

    fn require_arm(&self, arm_id: Uuid) -> ExperimentResult<()> {
        if self.arm_experiment.contains_key(&arm_id) {
            Ok(())
        } else {
            Err(ExperimentError::NotFound(format!("arm {arm_id}")))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_weight(weight: f64) -> ExperimentResult<()> {
    if weight.is_finite() && weight > 0.0 {
        Ok(())
    } else {
        Err(ExperimentError::Validation(format!(
            "arm weight must be positive, got {weight}"
        )))
    }
}

#[async_trait]
impl ExperimentStore for MemoryStore {
    async fn create_arm(&self, arm: Arm) -> ExperimentResult<Arm> {
        validate_weight(arm.weight)?;
        if self.arm_experiment.contains_key(&arm.id) {
            return Err(ExperimentError::Validation(format!(
                "arm {} already exists",
                arm.id
            )));
        }
        self.arm_experiment.insert(arm.id, arm.experiment_id);
        self.arms
            .entry(arm.experiment_id)
            .or_default()
            .push(arm.clone());
        Ok(arm)
    }

    async fn get_arms(&self, experiment_id: Uuid) -> ExperimentResult<Vec<Arm>> {
        Ok(self
            .arms
            .get(&experiment_id)
            .map(|arms| arms.clone())
            .unwrap_or_default())
    }

    async fn update_arm_weight(&self, arm_id: Uuid, weight: f64) -> ExperimentResult<Arm> {
        validate_weight(weight)?;
        let experiment_id = self
            .arm_experiment
            .get(&arm_id)
            .map(|e| *e)
            .ok_or_else(|| ExperimentError::NotFound(format!("arm {arm_id}")))?;
        let mut arms = self
            .arms
            .get_mut(&experiment_id)
            .ok_or_else(|| ExperimentError::NotFound(format!("experiment {experiment_id}")))?;
        let arm = arms
            .iter_mut()
            .find(|a| a.id == arm_id)
            .ok_or_else(|| ExperimentError::NotFound(format!("arm {arm_id}")))?;
        arm.weight = weight;
        Ok(arm.clone())
    }

    async fn get_arm_stats(&self, arm_id: Uuid) -> ExperimentResult<Option<ArmStats>> {
        Ok(self.stats.get(&arm_id).map(|s| s.clone()))
    }

    async fn record_arm_outcome(&self, arm_id: Uuid, reward: f64) -> ExperimentResult<ArmStats> {
        self.require_arm(arm_id)?;
        let mut entry = self
            .stats
            .entry(arm_id)
            .or_insert_with(|| ArmStats::new(arm_id));
        entry.apply_reward(reward);
        Ok(entry.clone())
    }

    async fn get_assignment(
        &self,
        experiment_id: Uuid,
        user_id: &str,
    ) -> ExperimentResult<Option<Assignment>> {
        Ok(self
            .assignments
            .get(&(experiment_id, user_id.to_string()))
            .map(|a| a.clone()))
    }

    async fn save_assignment(&self, assignment: &Assignment) -> ExperimentResult<()> {
        self.assignments.insert(
            (assignment.experiment_id, assignment.user_id.clone()),
            assignment.clone(),
        );
        Ok(())
    }

    async fn get_linucb_model(&self, arm_id: Uuid) -> ExperimentResult<Option<LinUcbModel>> {
        Ok(self.models.get(&arm_id).map(|m| m.clone()))
    }

    async fn save_linucb_model(&self, model: &LinUcbModel) -> ExperimentResult<()> {
        self.models.insert(model.arm_id, model.clone());
        Ok(())
    }

    async fn create_pending_reward(&self, pending: &PendingReward) -> ExperimentResult<()> {
        self.require("delayed rewards")?;
        self.pending.insert(pending.id, pending.clone());
        Ok(())
    }

    async fn get_pending_reward(&self, id: Uuid) -> ExperimentResult<Option<PendingReward>> {
        self.require("delayed rewards")?;
        Ok(self.pending.get(&id).map(|p| p.clone()))
    }

    async fn get_user_pending_rewards(
        &self,
        user_id: &str,
        experiment_id: Option<Uuid>,
    ) -> ExperimentResult<Vec<PendingReward>> {
        self.require("delayed rewards")?;
        let mut rewards: Vec<PendingReward> = self
            .pending
            .iter()
            .filter(|p| p.user_id == user_id)
            .filter(|p| experiment_id.map_or(true, |e| p.experiment_id == e))
            .map(|p| p.clone())
            .collect();
        rewards.sort_by(|a, b| b.assigned_at.cmp(&a.assigned_at));
        Ok(rewards)
    }

    async fn mark_pending_converted(
        &self,
        id: Uuid,
        conversion: &ConversionDetails,
    ) -> ExperimentResult<Option<PendingReward>> {
        self.require("delayed rewards")?;
        let mut pending = self
            .pending
            .get_mut(&id)
            .ok_or_else(|| ExperimentError::NotFound(format!("pending reward {id}")))?;
        if !pending.is_open(conversion.converted_at) {
            return Ok(None);
        }
        pending.converted = true;
        pending.conversion_value = Some(conversion.value);
        pending.conversion_currency = Some(conversion.currency.clone());
        pending.converted_at = Some(conversion.converted_at);
        pending.processed_at = Some(conversion.converted_at);
        Ok(Some(pending.clone()))
    }

    async fn mark_pending_processed(
        &self,
        id: Uuid,
        processed_at: DateTime<Utc>,
    ) -> ExperimentResult<Option<PendingReward>> {
        self.require("delayed rewards")?;
        let mut pending = self
            .pending
            .get_mut(&id)
            .ok_or_else(|| ExperimentError::NotFound(format!("pending reward {id}")))?;
        if pending.converted || pending.processed_at.is_some() {
            return Ok(None);
        }
        pending.processed_at = Some(processed_at);
        Ok(Some(pending.clone()))
    }

    async fn release_pending_claim(&self, id: Uuid) -> ExperimentResult<bool> {
        self.require("delayed rewards")?;
        let mut pending = self
            .pending
            .get_mut(&id)
            .ok_or_else(|| ExperimentError::NotFound(format!("pending reward {id}")))?;
        if pending.converted || pending.processed_at.is_none() {
            return Ok(false);
        }
        pending.processed_at = None;
        Ok(true)
    }

    async fn get_expired_pending_rewards(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> ExperimentResult<Vec<PendingReward>> {
        self.require("delayed rewards")?;
        let mut expired: Vec<PendingReward> = self
            .pending
            .iter()
            .filter(|p| !p.converted && p.processed_at.is_none() && p.is_expired(now))
            .map(|p| p.clone())
            .collect();
        expired.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        expired.truncate(limit);
        Ok(expired)
    }

    async fn create_conversion_link(&self, link: &ConversionLink) -> ExperimentResult<()> {
        self.require("delayed rewards")?;
        self.links
            .entry(link.pending_reward_id)
            .or_default()
            .push(link.clone());
        Ok(())
    }

    async fn get_conversion_links(
        &self,
        pending_reward_id: Uuid,
    ) -> ExperimentResult<Vec<ConversionLink>> {
        self.require("delayed rewards")?;
        Ok(self
            .links
            .get(&pending_reward_id)
            .map(|l| l.clone())
            .unwrap_or_default())
    }

    async fn get_objective_stats(
        &self,
        arm_id: Uuid,
        objective: ObjectiveType,
    ) -> ExperimentResult<Option<ArmObjectiveStats>> {
        self.require("objective statistics")?;
        Ok(self.objectives.get(&(arm_id, objective)).map(|s| s.clone()))
    }

    async fn record_objective_outcome(
        &self,
        arm_id: Uuid,
        objective: ObjectiveType,
        reward: f64,
    ) -> ExperimentResult<ArmObjectiveStats> {
        self.require("objective statistics")?;
        self.require_arm(arm_id)?;
        let mut entry = self
            .objectives
            .entry((arm_id, objective))
            .or_insert_with(|| ArmObjectiveStats::new(arm_id, objective));
        entry.apply_reward(reward);
        Ok(entry.clone())
    }

    async fn list_objective_stats(&self, arm_id: Uuid) -> ExperimentResult<Vec<ArmObjectiveStats>> {
        self.require("objective statistics")?;
        let mut stats: Vec<ArmObjectiveStats> = ObjectiveType::ALL
            .iter()
            .filter_map(|o| self.objectives.get(&(arm_id, *o)).map(|s| s.clone()))
            .collect();
        stats.sort_by_key(|s| s.objective);
        Ok(stats)
    }
}
