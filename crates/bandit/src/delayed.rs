//! Delayed rewards: a pending record is opened at selection time and later
//! resolved by a conversion or expired into a non-conversion.
//!
//! Attribution is last-assignment-wins: a conversion resolves the user's most
//! recently assigned open reward, optionally scoped to one experiment.

use crate::best_effort::{cache_evict, cache_put, cached};
use crate::thompson::ThompsonBandit;
use chrono::{Duration, Utc};
use experiment_cache::Cache;
use experiment_core::config::DelayedRewardConfig;
use experiment_core::types::{ConversionDetails, ConversionLink, PendingReward};
use experiment_core::{ExperimentResult, ExperimentStore};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

fn pending_key(id: Uuid) -> String {
    format!("pending:{id}")
}

pub struct DelayedRewardTracker {
    store: Arc<dyn ExperimentStore>,
    cache: Arc<dyn Cache>,
    bandit: Arc<ThompsonBandit>,
    default_ttl: Duration,
    max_ttl: Duration,
}

impl DelayedRewardTracker {
    pub fn new(
        store: Arc<dyn ExperimentStore>,
        cache: Arc<dyn Cache>,
        bandit: Arc<ThompsonBandit>,
        config: &DelayedRewardConfig,
    ) -> Self {
        let max_ttl = Duration::hours(config.max_ttl_hours.max(1) as i64);
        let default_ttl = Duration::hours(config.default_ttl_hours.max(1) as i64).min(max_ttl);
        Self {
            store,
            cache,
            bandit,
            default_ttl,
            max_ttl,
        }
    }

    pub async fn record_pending_reward(
        &self,
        experiment_id: Uuid,
        arm_id: Uuid,
        user_id: &str,
    ) -> ExperimentResult<PendingReward> {
        self.record_pending_reward_with_ttl(experiment_id, arm_id, user_id, self.default_ttl)
            .await
    }

    /// As [`Self::record_pending_reward`], with a TTL clamped to the ceiling.
    /// A non-positive TTL uses the default.
    pub async fn record_pending_reward_with_ttl(
        &self,
        experiment_id: Uuid,
        arm_id: Uuid,
        user_id: &str,
        ttl: Duration,
    ) -> ExperimentResult<PendingReward> {
        let ttl = if ttl <= Duration::zero() {
            self.default_ttl
        } else {
            ttl.min(self.max_ttl)
        };
        let pending = PendingReward::new(experiment_id, arm_id, user_id, ttl);
        self.store.create_pending_reward(&pending).await?;

        let cache_ttl = ttl.to_std().unwrap_or_default();
        cache_put(self.cache.as_ref(), &pending_key(pending.id), &pending, cache_ttl).await;

        debug!(
            pending_id = %pending.id,
            experiment_id = %experiment_id,
            arm_id = %arm_id,
            user_id = user_id,
            expires_at = %pending.expires_at,
            "Pending reward recorded"
        );
        Ok(pending)
    }

    pub async fn get_pending_reward(&self, id: Uuid) -> ExperimentResult<Option<PendingReward>> {
        if let Some(pending) = cached::<PendingReward>(self.cache.as_ref(), &pending_key(id)).await {
            return Ok(Some(pending));
        }
        self.store.get_pending_reward(id).await
    }

    /// Newest assignment first.
    pub async fn get_user_pending_rewards(
        &self,
        user_id: &str,
        experiment_id: Option<Uuid>,
    ) -> ExperimentResult<Vec<PendingReward>> {
        self.store.get_user_pending_rewards(user_id, experiment_id).await
    }

    /// Resolve the user's most recent open reward with a conversion and link
    /// it to `transaction_id`. Returns `None` when nothing is open.
    pub async fn process_conversion(
        &self,
        transaction_id: &str,
        user_id: &str,
        value: f64,
        currency: &str,
        experiment_id: Option<Uuid>,
    ) -> ExperimentResult<Option<PendingReward>> {
        let now = Utc::now();
        let candidates = self.store.get_user_pending_rewards(user_id, experiment_id).await?;
        let conversion = ConversionDetails {
            value,
            currency: currency.to_string(),
            converted_at: now,
        };

        for candidate in candidates.iter().filter(|p| p.is_open(now)) {
            // Conditional update; a concurrent conversion or sweep may win
            let Some(converted) = self.store.mark_pending_converted(candidate.id, &conversion).await? else {
                continue;
            };

            let link = ConversionLink {
                pending_reward_id: converted.id,
                transaction_id: transaction_id.to_string(),
                linked_at: now,
            };
            // The reward is already converted; a lost link must not lose the credit
            if let Err(e) = self.store.create_conversion_link(&link).await {
                metrics::counter!("delayed.link_errors").increment(1);
                error!(
                    pending_id = %converted.id,
                    transaction_id = transaction_id,
                    error = %e,
                    "Conversion link not written"
                );
            }
            cache_evict(self.cache.as_ref(), &pending_key(converted.id)).await;

            metrics::counter!("delayed.conversions").increment(1);
            info!(
                pending_id = %converted.id,
                experiment_id = %converted.experiment_id,
                arm_id = %converted.arm_id,
                transaction_id = transaction_id,
                value = value,
                currency = currency,
                "Conversion attributed to pending reward"
            );
            return Ok(Some(converted));
        }

        info!(
            transaction_id = transaction_id,
            user_id = user_id,
            "No open pending reward for conversion"
        );
        Ok(None)
    }

    /// Expire up to `batch_size` overdue rewards as non-conversions.
    /// Each record is claimed before the bandit is updated, so concurrent
    /// sweeps never double count; a failed update releases the claim unless
    /// the arm no longer exists. Returns the number of rewards expired.
    pub async fn process_expired_rewards(&self, batch_size: usize) -> ExperimentResult<usize> {
        let now = Utc::now();
        let expired = self.store.get_expired_pending_rewards(now, batch_size).await?;
        let mut processed = 0;

        for pending in &expired {
            let claimed = match self.store.mark_pending_processed(pending.id, now).await {
                Ok(Some(claimed)) => claimed,
                Ok(None) => continue,
                Err(e) => {
                    metrics::counter!("delayed.expiry_errors").increment(1);
                    warn!(pending_id = %pending.id, error = %e, "Failed to claim expired reward");
                    continue;
                }
            };
            cache_evict(self.cache.as_ref(), &pending_key(claimed.id)).await;

            match self
                .bandit
                .update_reward(claimed.experiment_id, claimed.arm_id, 0.0)
                .await
            {
                Ok(_) => {
                    processed += 1;
                    metrics::counter!("delayed.expired").increment(1);
                }
                Err(e) => {
                    metrics::counter!("delayed.expiry_errors").increment(1);
                    warn!(
                        pending_id = %claimed.id,
                        arm_id = %claimed.arm_id,
                        error = %e,
                        "Failed to apply expired reward"
                    );
                    // A missing arm never recovers; anything else is retried next sweep
                    if !e.is_not_found() {
                        self.release_claim(claimed.id).await;
                    }
                }
            }
        }

        if !expired.is_empty() {
            info!(found = expired.len(), processed = processed, "Expired pending rewards swept");
        }
        Ok(processed)
    }

    async fn release_claim(&self, id: Uuid) {
        if let Err(e) = self.store.release_pending_claim(id).await {
            error!(pending_id = %id, error = %e, "Expired reward claim not released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{failing_cache, flaky_experiment, seeded_experiment};
    use experiment_cache::LocalCache;
    use experiment_core::config::BanditConfig;
    use experiment_core::types::Arm;
    use experiment_core::MemoryStore;

    fn tracker_over(store: Arc<MemoryStore>, cache: Arc<dyn Cache>) -> (DelayedRewardTracker, Arc<ThompsonBandit>) {
        let bandit = Arc::new(ThompsonBandit::new(store.clone(), cache.clone(), &BanditConfig::default()));
        let tracker = DelayedRewardTracker::new(store, cache, bandit.clone(), &DelayedRewardConfig::default());
        (tracker, bandit)
    }

    #[tokio::test]
    async fn test_conversion_round_trip() {
        let (store, exp, arms) = seeded_experiment(2).await;
        let (tracker, _) = tracker_over(store.clone(), Arc::new(LocalCache::default()));

        let pending = tracker.record_pending_reward(exp, arms[0].id, "u1").await.unwrap();
        let converted = tracker
            .process_conversion("tx-1", "u1", 19.99, "EUR", None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(converted.id, pending.id);
        assert!(converted.converted);
        assert_eq!(converted.conversion_value, Some(19.99));
        assert_eq!(converted.conversion_currency.as_deref(), Some("EUR"));

        let links = store.get_conversion_links(pending.id).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].transaction_id, "tx-1");

        let fresh = tracker.get_pending_reward(pending.id).await.unwrap().unwrap();
        assert!(fresh.converted);

        let again = tracker.process_conversion("tx-2", "u1", 5.0, "EUR", None).await.unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn test_latest_assignment_wins() {
        let (store, exp, arms) = seeded_experiment(2).await;
        let (tracker, _) = tracker_over(store, Arc::new(LocalCache::default()));

        let older = tracker.record_pending_reward(exp, arms[0].id, "u1").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let newer = tracker.record_pending_reward(exp, arms[1].id, "u1").await.unwrap();

        let first = tracker.process_conversion("tx-1", "u1", 1.0, "USD", None).await.unwrap();
        assert_eq!(first.map(|p| p.id), Some(newer.id));
        let second = tracker.process_conversion("tx-2", "u1", 1.0, "USD", None).await.unwrap();
        assert_eq!(second.map(|p| p.id), Some(older.id));
    }

    #[tokio::test]
    async fn test_conversion_scoped_to_experiment() {
        let (store, exp, arms) = seeded_experiment(1).await;
        let other_exp = Uuid::new_v4();
        let other_arm = store.create_arm(Arm::new(other_exp, "solo", true)).await.unwrap();
        let (tracker, _) = tracker_over(store, Arc::new(LocalCache::default()));

        let mine = tracker.record_pending_reward(exp, arms[0].id, "u1").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        tracker.record_pending_reward(other_exp, other_arm.id, "u1").await.unwrap();

        let resolved = tracker
            .process_conversion("tx", "u1", 3.0, "USD", Some(exp))
            .await
            .unwrap();
        assert_eq!(resolved.map(|p| p.id), Some(mine.id));
    }

    #[tokio::test]
    async fn test_unmatched_conversion_is_noop() {
        let (store, _, _) = seeded_experiment(1).await;
        let (tracker, _) = tracker_over(store, Arc::new(LocalCache::default()));
        let result = tracker.process_conversion("tx", "ghost", 9.0, "USD", None).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_expired_reward_counts_once_as_miss() {
        let (store, exp, arms) = seeded_experiment(1).await;
        let (tracker, bandit) = tracker_over(store.clone(), Arc::new(LocalCache::default()));

        let expired = PendingReward::new(exp, arms[0].id, "u1", Duration::seconds(-5));
        store.create_pending_reward(&expired).await.unwrap();
        tracker.record_pending_reward(exp, arms[0].id, "u2").await.unwrap();

        assert_eq!(tracker.process_expired_rewards(10).await.unwrap(), 1);
        let stats = bandit.get_arm_stats(arms[0].id).await.unwrap();
        assert_eq!((stats.samples, stats.conversions), (1, 0));
        assert_eq!(stats.beta, 2.0);

        let record = store.get_pending_reward(expired.id).await.unwrap().unwrap();
        assert!(record.processed_at.is_some());
        assert!(!record.converted);

        assert_eq!(tracker.process_expired_rewards(10).await.unwrap(), 0);
        assert_eq!(bandit.get_arm_stats(arms[0].id).await.unwrap().samples, 1);
    }

    #[tokio::test]
    async fn test_sweep_isolates_bad_records() {
        let (store, exp, arms) = seeded_experiment(1).await;
        let (tracker, _) = tracker_over(store.clone(), failing_cache());

        let orphan = PendingReward::new(exp, Uuid::new_v4(), "u1", Duration::seconds(-10));
        let good = PendingReward::new(exp, arms[0].id, "u2", Duration::seconds(-5));
        store.create_pending_reward(&orphan).await.unwrap();
        store.create_pending_reward(&good).await.unwrap();

        assert_eq!(tracker.process_expired_rewards(10).await.unwrap(), 1);
        assert_eq!(store.get_arm_stats(arms[0].id).await.unwrap().unwrap().samples, 1);

        // The orphan's arm is gone for good, so its claim is kept
        let orphan = store.get_pending_reward(orphan.id).await.unwrap().unwrap();
        assert!(orphan.processed_at.is_some());
        assert_eq!(tracker.process_expired_rewards(10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_conversion_survives_link_write_failure() {
        let (store, exp, arms) = flaky_experiment(1).await;
        let cache: Arc<dyn Cache> = Arc::new(LocalCache::default());
        let bandit = Arc::new(ThompsonBandit::new(store.clone(), cache.clone(), &BanditConfig::default()));
        let tracker = DelayedRewardTracker::new(store.clone(), cache, bandit, &DelayedRewardConfig::default());

        let pending = tracker.record_pending_reward(exp, arms[0].id, "u1").await.unwrap();
        store.set_fail_links(true);
        let converted = tracker
            .process_conversion("tx-1", "u1", 12.0, "USD", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(converted.id, pending.id);
        assert!(converted.converted);
        assert!(store.get_conversion_links(pending.id).await.unwrap().is_empty());

        store.set_fail_links(false);
        let retry = tracker.process_conversion("tx-1", "u1", 12.0, "USD", None).await.unwrap();
        assert!(retry.is_none());
    }

    #[tokio::test]
    async fn test_failed_expiry_update_is_retried() {
        let (store, exp, arms) = flaky_experiment(1).await;
        let cache: Arc<dyn Cache> = Arc::new(LocalCache::default());
        let bandit = Arc::new(ThompsonBandit::new(store.clone(), cache.clone(), &BanditConfig::default()));
        let tracker = DelayedRewardTracker::new(store.clone(), cache, bandit, &DelayedRewardConfig::default());

        let stale = PendingReward::new(exp, arms[0].id, "u1", Duration::seconds(-5));
        store.create_pending_reward(&stale).await.unwrap();

        store.set_fail_outcomes(true);
        assert_eq!(tracker.process_expired_rewards(10).await.unwrap(), 0);
        let record = store.get_pending_reward(stale.id).await.unwrap().unwrap();
        assert!(record.processed_at.is_none());

        store.set_fail_outcomes(false);
        assert_eq!(tracker.process_expired_rewards(10).await.unwrap(), 1);
        let stats = store.get_arm_stats(arms[0].id).await.unwrap().unwrap();
        assert_eq!((stats.samples, stats.conversions), (1, 0));
        assert_eq!(tracker.process_expired_rewards(10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ttl_is_clamped() {
        let (store, exp, arms) = seeded_experiment(1).await;
        let (tracker, _) = tracker_over(store, Arc::new(LocalCache::default()));

        let long = tracker
            .record_pending_reward_with_ttl(exp, arms[0].id, "u1", Duration::days(90))
            .await
            .unwrap();
        assert!(long.expires_at - long.assigned_at <= Duration::hours(720));

        let default = tracker
            .record_pending_reward_with_ttl(exp, arms[0].id, "u1", Duration::zero())
            .await
            .unwrap();
        assert_eq!(default.expires_at - default.assigned_at, Duration::hours(168));
    }

    #[tokio::test]
    async fn test_unsupported_store_is_reported() {
        let store = Arc::new(MemoryStore::core_only());
        let (tracker, _) = tracker_over(store, Arc::new(LocalCache::default()));
        let err = tracker
            .record_pending_reward(Uuid::new_v4(), Uuid::new_v4(), "u1")
            .await
            .unwrap_err();
        assert!(err.is_unsupported());
        assert!(tracker.process_expired_rewards(5).await.unwrap_err().is_unsupported());
    }
}
