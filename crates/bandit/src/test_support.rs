//! Fixtures shared by the unit tests of this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use experiment_cache::{Cache, CacheError, CacheResult};
use experiment_core::types::{
    Arm, ArmStats, Assignment, ConversionDetails, ConversionLink, LinUcbModel, PendingReward,
};
use experiment_core::{ExperimentError, ExperimentResult, ExperimentStore, MemoryStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Cache whose every call fails, as if the remote tier were down.
pub struct FailingCache;

#[async_trait]
impl Cache for FailingCache {
    async fn get_raw(&self, _key: &str) -> CacheResult<Option<String>> {
        Err(CacheError::Unavailable("cache offline".into()))
    }

    async fn set_raw(&self, _key: &str, _value: String, _ttl: Duration) -> CacheResult<()> {
        Err(CacheError::Unavailable("cache offline".into()))
    }

    async fn delete(&self, _key: &str) -> CacheResult<()> {
        Err(CacheError::Unavailable("cache offline".into()))
    }
}

pub fn failing_cache() -> Arc<dyn Cache> {
    Arc::new(FailingCache)
}

/// A store holding one experiment with `arms` arms, the first one the control.
pub async fn seeded_experiment(arms: usize) -> (Arc<MemoryStore>, Uuid, Vec<Arm>) {
    let store = Arc::new(MemoryStore::new());
    let experiment_id = Uuid::new_v4();
    let mut created = Vec::with_capacity(arms);
    for i in 0..arms {
        let arm = Arm::new(experiment_id, format!("arm-{i}"), i == 0);
        created.push(store.create_arm(arm).await.unwrap());
    }
    (store, experiment_id, created)
}

/// [`MemoryStore`] with switchable write failures. Objective calls are not
/// forwarded and report `Unsupported`.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub fail_links: AtomicBool,
    pub fail_outcomes: AtomicBool,
}

impl FlakyStore {
    pub fn set_fail_links(&self, fail: bool) {
        self.fail_links.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_outcomes(&self, fail: bool) {
        self.fail_outcomes.store(fail, Ordering::SeqCst);
    }
}

fn store_down<T>(what: &str) -> ExperimentResult<T> {
    Err(ExperimentError::Store(format!("{what}: connection reset")))
}

#[async_trait]
impl ExperimentStore for FlakyStore {
    async fn create_arm(&self, arm: Arm) -> ExperimentResult<Arm> {
        self.inner.create_arm(arm).await
    }

    async fn get_arms(&self, experiment_id: Uuid) -> ExperimentResult<Vec<Arm>> {
        self.inner.get_arms(experiment_id).await
    }

    async fn update_arm_weight(&self, arm_id: Uuid, weight: f64) -> ExperimentResult<Arm> {
        self.inner.update_arm_weight(arm_id, weight).await
    }

    async fn get_arm_stats(&self, arm_id: Uuid) -> ExperimentResult<Option<ArmStats>> {
        self.inner.get_arm_stats(arm_id).await
    }

    async fn record_arm_outcome(&self, arm_id: Uuid, reward: f64) -> ExperimentResult<ArmStats> {
        if self.fail_outcomes.load(Ordering::SeqCst) {
            return store_down("record_arm_outcome");
        }
        self.inner.record_arm_outcome(arm_id, reward).await
    }

    async fn get_assignment(
        &self,
        experiment_id: Uuid,
        user_id: &str,
    ) -> ExperimentResult<Option<Assignment>> {
        self.inner.get_assignment(experiment_id, user_id).await
    }

    async fn save_assignment(&self, assignment: &Assignment) -> ExperimentResult<()> {
        self.inner.save_assignment(assignment).await
    }

    async fn get_linucb_model(&self, arm_id: Uuid) -> ExperimentResult<Option<LinUcbModel>> {
        self.inner.get_linucb_model(arm_id).await
    }

    async fn save_linucb_model(&self, model: &LinUcbModel) -> ExperimentResult<()> {
        self.inner.save_linucb_model(model).await
    }

    async fn create_pending_reward(&self, pending: &PendingReward) -> ExperimentResult<()> {
        self.inner.create_pending_reward(pending).await
    }

    async fn get_pending_reward(&self, id: Uuid) -> ExperimentResult<Option<PendingReward>> {
        self.inner.get_pending_reward(id).await
    }

    async fn get_user_pending_rewards(
        &self,
        user_id: &str,
        experiment_id: Option<Uuid>,
    ) -> ExperimentResult<Vec<PendingReward>> {
        self.inner.get_user_pending_rewards(user_id, experiment_id).await
    }

    async fn mark_pending_converted(
        &self,
        id: Uuid,
        conversion: &ConversionDetails,
    ) -> ExperimentResult<Option<PendingReward>> {
        self.inner.mark_pending_converted(id, conversion).await
    }

    async fn mark_pending_processed(
        &self,
        id: Uuid,
        processed_at: DateTime<Utc>,
    ) -> ExperimentResult<Option<PendingReward>> {
        self.inner.mark_pending_processed(id, processed_at).await
    }

    async fn release_pending_claim(&self, id: Uuid) -> ExperimentResult<bool> {
        self.inner.release_pending_claim(id).await
    }

    async fn get_expired_pending_rewards(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> ExperimentResult<Vec<PendingReward>> {
        self.inner.get_expired_pending_rewards(now, limit).await
    }

    async fn create_conversion_link(&self, link: &ConversionLink) -> ExperimentResult<()> {
        if self.fail_links.load(Ordering::SeqCst) {
            return store_down("create_conversion_link");
        }
        self.inner.create_conversion_link(link).await
    }

    async fn get_conversion_links(
        &self,
        pending_reward_id: Uuid,
    ) -> ExperimentResult<Vec<ConversionLink>> {
        self.inner.get_conversion_links(pending_reward_id).await
    }
}

/// A [`FlakyStore`] seeded like [`seeded_experiment`].
pub async fn flaky_experiment(arms: usize) -> (Arc<FlakyStore>, Uuid, Vec<Arm>) {
    let store = Arc::new(FlakyStore::default());
    let experiment_id = Uuid::new_v4();
    let mut created = Vec::with_capacity(arms);
    for i in 0..arms {
        let arm = Arm::new(experiment_id, format!("arm-{i}"), i == 0);
        created.push(store.create_arm(arm).await.unwrap());
    }
    (store, experiment_id, created)
}
