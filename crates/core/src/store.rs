//! Persistence boundary for arms, statistics, assignments and the optional
//! delayed-reward and multi-objective extensions.
//!
//! The extension methods are always present on [`ExperimentStore`]; backends
//! that cannot serve them keep the default bodies, which report
//! [`ExperimentError::Unsupported`] so callers can switch the feature off
//! instead of failing the request.

use crate::error::{ExperimentError, ExperimentResult};
use crate::types::{
    Arm, ArmObjectiveStats, ArmStats, Assignment, ConversionDetails, ConversionLink,
    LinUcbModel, ObjectiveType, PendingReward,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

fn unsupported<T>(capability: &str) -> ExperimentResult<T> {
    Err(ExperimentError::Unsupported(capability.to_string()))
}

#[async_trait]
pub trait ExperimentStore: Send + Sync {
    async fn create_arm(&self, arm: Arm) -> ExperimentResult<Arm>;

    /// Arms in creation order.
    async fn get_arms(&self, experiment_id: Uuid) -> ExperimentResult<Vec<Arm>>;

    async fn update_arm_weight(&self, arm_id: Uuid, weight: f64) -> ExperimentResult<Arm>;

    async fn get_arm_stats(&self, arm_id: Uuid) -> ExperimentResult<Option<ArmStats>>;

    /// Apply one reward to the arm's statistics as a single atomic
    /// read-modify-write and return the result.
    async fn record_arm_outcome(&self, arm_id: Uuid, reward: f64) -> ExperimentResult<ArmStats>;

    async fn get_assignment(
        &self,
        experiment_id: Uuid,
        user_id: &str,
    ) -> ExperimentResult<Option<Assignment>>;

    /// Insert or supersede the assignment for (experiment, user).
    async fn save_assignment(&self, assignment: &Assignment) -> ExperimentResult<()>;

    async fn get_linucb_model(&self, arm_id: Uuid) -> ExperimentResult<Option<LinUcbModel>>;

    async fn save_linucb_model(&self, model: &LinUcbModel) -> ExperimentResult<()>;

    // ─── Delayed rewards ────────────────────────────────────────────────

    async fn create_pending_reward(&self, _pending: &PendingReward) -> ExperimentResult<()> {
        unsupported("delayed rewards")
    }

    async fn get_pending_reward(&self, _id: Uuid) -> ExperimentResult<Option<PendingReward>> {
        unsupported("delayed rewards")
    }

    async fn get_user_pending_rewards(
        &self,
        _user_id: &str,
        _experiment_id: Option<Uuid>,
    ) -> ExperimentResult<Vec<PendingReward>> {
        unsupported("delayed rewards")
    }

    /// Convert a reward only if it is still open. Returns the updated record,
    /// or `None` when it was already converted, processed or expired.
    async fn mark_pending_converted(
        &self,
        _id: Uuid,
        _conversion: &ConversionDetails,
    ) -> ExperimentResult<Option<PendingReward>> {
        unsupported("delayed rewards")
    }

    /// Claim an unconverted reward for expiry processing. Returns `None` when
    /// another sweep already claimed it or it converted in the meantime.
    async fn mark_pending_processed(
        &self,
        _id: Uuid,
        _processed_at: DateTime<Utc>,
    ) -> ExperimentResult<Option<PendingReward>> {
        unsupported("delayed rewards")
    }

    /// Undo a claim taken by [`Self::mark_pending_processed`] so a later sweep
    /// retries the record. Returns `false` when there was no claim to release.
    async fn release_pending_claim(&self, _id: Uuid) -> ExperimentResult<bool> {
        unsupported("delayed rewards")
    }

    /// Unconverted, unprocessed rewards whose expiry is at or before `now`,
    /// oldest expiry first.
    async fn get_expired_pending_rewards(
        &self,
        _now: DateTime<Utc>,
        _limit: usize,
    ) -> ExperimentResult<Vec<PendingReward>> {
        unsupported("delayed rewards")
    }

    async fn create_conversion_link(&self, _link: &ConversionLink) -> ExperimentResult<()> {
        unsupported("delayed rewards")
    }

    async fn get_conversion_links(
        &self,
        _pending_reward_id: Uuid,
    ) -> ExperimentResult<Vec<ConversionLink>> {
        unsupported("delayed rewards")
    }

    // ─── Objectives ─────────────────────────────────────────────────────

    async fn get_objective_stats(
        &self,
        _arm_id: Uuid,
        _objective: ObjectiveType,
    ) -> ExperimentResult<Option<ArmObjectiveStats>> {
        unsupported("objective statistics")
    }

    /// Atomic counterpart of [`ArmObjectiveStats::apply_reward`].
    async fn record_objective_outcome(
        &self,
        _arm_id: Uuid,
        _objective: ObjectiveType,
        _reward: f64,
    ) -> ExperimentResult<ArmObjectiveStats> {
        unsupported("objective statistics")
    }

    async fn list_objective_stats(&self, _arm_id: Uuid) -> ExperimentResult<Vec<ArmObjectiveStats>> {
        unsupported("objective statistics")
    }
}
