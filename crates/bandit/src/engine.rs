//! Orchestrating engine: selection, reward recording and maintenance across
//! the bandit components enabled in configuration.

use crate::currency::{infer_currency, CurrencyNormalizer, RateSource};
use crate::delayed::DelayedRewardTracker;
use crate::linucb::ContextualSelector;
use crate::objectives::{ArmScore, MultiObjectiveScorer};
use crate::thompson::{ArmSummary, ThompsonBandit};
use crate::window::WindowAggregator;
use experiment_cache::{Cache, OrderedStore};
use experiment_core::config::SelectionStrategy;
use experiment_core::types::{Arm, ArmStats, PendingReward, UserContext, WindowStats};
use experiment_core::{AppConfig, ExperimentError, ExperimentResult, ExperimentStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What a single `record_reward` call managed to update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardOutcome {
    pub normalized_reward: f64,
    pub stats: ArmStats,
    pub contextual_updated: bool,
    pub window_recorded: bool,
    pub objectives_updated: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentStatistics {
    pub experiment_id: Uuid,
    pub arms: Vec<ArmSummary>,
    pub win_probabilities: HashMap<Uuid, f64>,
    pub window: Option<Vec<WindowStats>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentMetrics {
    pub experiment_id: Uuid,
    pub arm_count: usize,
    pub total_samples: u64,
    pub total_conversions: u64,
    pub total_revenue: f64,
    pub conversion_rate: f64,
    pub balance_index: f64,
    pub samples_per_arm: Vec<(Uuid, u64)>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub expired_processed: usize,
    pub rates_refreshed: usize,
    pub errors: Vec<String>,
}

/// How evenly traffic is spread: 1.0 for an even split (or no traffic),
/// 0.0 when every sample landed on one arm.
pub fn balance_index(samples: &[u64]) -> f64 {
    let arms = samples.len();
    let total: u64 = samples.iter().sum();
    if arms <= 1 || total == 0 {
        return 1.0;
    }
    let total = total as f64;
    let n = arms as f64;
    let expected = total / n;
    let deviation: f64 = samples.iter().map(|&s| (s as f64 - expected).abs()).sum();
    // Reached when one arm holds everything
    let max_deviation = 2.0 * total * (n - 1.0) / n;
    (1.0 - deviation / max_deviation).clamp(0.0, 1.0)
}

pub struct ExperimentEngine {
    store: Arc<dyn ExperimentStore>,
    strategy: SelectionStrategy,
    bandit: Arc<ThompsonBandit>,
    contextual: Option<ContextualSelector>,
    window: Option<WindowAggregator>,
    delayed: Option<DelayedRewardTracker>,
    objectives: Option<MultiObjectiveScorer>,
    currency: CurrencyNormalizer,
    expiry_batch_size: usize,
    win_simulations: usize,
}

impl ExperimentEngine {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn ExperimentStore>,
        cache: Arc<dyn Cache>,
        ordered: Arc<dyn OrderedStore>,
        rate_source: Option<Arc<dyn RateSource>>,
    ) -> ExperimentResult<Self> {
        // Enabling the contextual selector upgrades the default strategy
        let strategy = match config.bandit.strategy {
            SelectionStrategy::Thompson if config.contextual.enabled => SelectionStrategy::Contextual,
            other => other,
        };

        let bandit = Arc::new(ThompsonBandit::new(store.clone(), cache.clone(), &config.bandit));

        let contextual = (config.contextual.enabled || strategy == SelectionStrategy::Contextual)
            .then(|| ContextualSelector::new(store.clone(), config.contextual.exploration_alpha));

        let window = config
            .window
            .enabled
            .then(|| WindowAggregator::new(ordered, cache.clone(), &config.window));

        let delayed = config.delayed.enabled.then(|| {
            DelayedRewardTracker::new(store.clone(), cache.clone(), bandit.clone(), &config.delayed)
        });

        let objectives = if config.objectives.enabled || strategy == SelectionStrategy::MultiObjective {
            Some(MultiObjectiveScorer::new(store.clone(), &config.objectives)?)
        } else {
            None
        };

        let currency = CurrencyNormalizer::new(cache, rate_source, &config.currency);

        info!(
            strategy = ?strategy,
            contextual = contextual.is_some(),
            window = window.is_some(),
            delayed = delayed.is_some(),
            objectives = objectives.is_some(),
            "Experiment engine initialized"
        );

        Ok(Self {
            store,
            strategy,
            bandit,
            contextual,
            window,
            delayed,
            objectives,
            currency,
            expiry_batch_size: config.delayed.batch_size.max(1),
            win_simulations: config.bandit.win_probability_simulations,
        })
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    pub fn bandit(&self) -> &ThompsonBandit {
        &self.bandit
    }

    pub fn contextual(&self) -> Option<&ContextualSelector> {
        self.contextual.as_ref()
    }

    pub fn window(&self) -> Option<&WindowAggregator> {
        self.window.as_ref()
    }

    pub fn delayed(&self) -> Option<&DelayedRewardTracker> {
        self.delayed.as_ref()
    }

    pub fn objectives(&self) -> Option<&MultiObjectiveScorer> {
        self.objectives.as_ref()
    }

    pub fn currency(&self) -> &CurrencyNormalizer {
        &self.currency
    }

    pub async fn register_arm(&self, arm: Arm) -> ExperimentResult<Arm> {
        self.bandit.register_arm(arm).await
    }

    /// Choose an arm with the configured strategy, falling back to Thompson
    /// sampling when it fails, then open a pending reward if delayed
    /// feedback is enabled.
    pub async fn select_arm(
        &self,
        experiment_id: Uuid,
        user_id: &str,
        context: &UserContext,
    ) -> ExperimentResult<Uuid> {
        let preferred = match self.strategy {
            SelectionStrategy::Thompson => None,
            SelectionStrategy::Contextual => match &self.contextual {
                Some(selector) => Some(selector.select_arm(experiment_id, context).await),
                None => None,
            },
            SelectionStrategy::MultiObjective => match &self.objectives {
                Some(scorer) => Some(scorer.select_best_arm(experiment_id).await),
                None => None,
            },
        };

        let arm_id = match preferred {
            Some(Ok(arm_id)) => arm_id,
            Some(Err(e)) => {
                metrics::counter!("bandit.selection_fallbacks").increment(1);
                warn!(
                    experiment_id = %experiment_id,
                    strategy = ?self.strategy,
                    error = %e,
                    "Selection strategy failed, falling back to Thompson sampling"
                );
                self.bandit.select_arm(experiment_id, user_id).await?
            }
            None => self.bandit.select_arm(experiment_id, user_id).await?,
        };

        if let Some(tracker) = &self.delayed {
            if let Err(e) = tracker.record_pending_reward(experiment_id, arm_id, user_id).await {
                warn!(
                    experiment_id = %experiment_id,
                    arm_id = %arm_id,
                    error = %e,
                    "Pending reward not recorded"
                );
            }
        }

        debug!(experiment_id = %experiment_id, user_id = user_id, arm_id = %arm_id, "Arm selected");
        Ok(arm_id)
    }

    /// Normalize the reward to USD and feed it to every enabled component.
    /// An empty `currency` is inferred from the context.
    /// Each step runs even if an earlier one failed; only a failed Thompson
    /// update is reported to the caller.
    pub async fn record_reward(
        &self,
        experiment_id: Uuid,
        arm_id: Uuid,
        user_id: &str,
        reward: f64,
        currency: &str,
        context: Option<&UserContext>,
    ) -> ExperimentResult<RewardOutcome> {
        let currency = infer_currency(currency, context);
        let normalized_reward = match self.currency.convert_to_usd(reward, &currency).await {
            Ok(usd) => usd,
            Err(e) => {
                warn!(
                    currency = %currency,
                    reward = reward,
                    error = %e,
                    "Currency conversion failed, using raw reward"
                );
                reward
            }
        };

        let stats = self
            .bandit
            .update_reward(experiment_id, arm_id, normalized_reward)
            .await;
        if let Err(e) = &stats {
            error!(experiment_id = %experiment_id, arm_id = %arm_id, error = %e, "Bandit update failed");
        }

        let mut contextual_updated = false;
        if let (Some(selector), Some(context)) = (&self.contextual, context) {
            match selector.update(arm_id, context, normalized_reward).await {
                Ok(_) => contextual_updated = true,
                Err(e) => warn!(arm_id = %arm_id, error = %e, "Contextual model update failed"),
            }
        }

        let mut window_recorded = false;
        if let Some(window) = &self.window {
            match window
                .record_event(experiment_id, arm_id, user_id, normalized_reward)
                .await
            {
                Ok(_) => window_recorded = true,
                Err(e) => warn!(arm_id = %arm_id, error = %e, "Window append failed"),
            }
        }

        let mut objectives_updated = 0;
        if let Some(scorer) = &self.objectives {
            match scorer.record_reward(arm_id, normalized_reward).await {
                Ok(updated) => objectives_updated = updated,
                Err(e) => warn!(arm_id = %arm_id, error = %e, "Objective update failed"),
            }
        }

        Ok(RewardOutcome {
            normalized_reward,
            stats: stats?,
            contextual_updated,
            window_recorded,
            objectives_updated,
        })
    }

    /// Attribute a purchase to the user's latest open pending reward and
    /// credit its arm. `Unsupported` when delayed feedback is disabled.
    pub async fn process_conversion(
        &self,
        transaction_id: &str,
        user_id: &str,
        value: f64,
        currency: &str,
        experiment_id: Option<Uuid>,
    ) -> ExperimentResult<Option<PendingReward>> {
        let tracker = self
            .delayed
            .as_ref()
            .ok_or_else(|| ExperimentError::Unsupported("delayed rewards are disabled".into()))?;

        let Some(converted) = tracker
            .process_conversion(transaction_id, user_id, value, currency, experiment_id)
            .await?
        else {
            return Ok(None);
        };

        if let Err(e) = self
            .record_reward(
                converted.experiment_id,
                converted.arm_id,
                &converted.user_id,
                value,
                currency,
                None,
            )
            .await
        {
            metrics::counter!("delayed.credit_errors").increment(1);
            error!(
                pending_id = %converted.id,
                arm_id = %converted.arm_id,
                error = %e,
                "Converted reward could not be credited"
            );
        }
        Ok(Some(converted))
    }

    pub async fn get_arm_statistics(&self, experiment_id: Uuid) -> ExperimentResult<ExperimentStatistics> {
        let arms = self.bandit.get_experiment_stats(experiment_id).await?;
        let win_probabilities = self
            .bandit
            .calculate_win_probability(experiment_id, self.win_simulations)
            .await?;

        let window = match &self.window {
            Some(window) => {
                let arm_ids: Vec<Uuid> = arms.iter().map(|a| a.arm.id).collect();
                match window.get_experiment_window_stats(experiment_id, &arm_ids).await {
                    Ok(stats) => Some(stats),
                    Err(e) => {
                        warn!(experiment_id = %experiment_id, error = %e, "Window stats unavailable");
                        None
                    }
                }
            }
            None => None,
        };

        Ok(ExperimentStatistics {
            experiment_id,
            arms,
            win_probabilities,
            window,
        })
    }

    pub async fn get_objective_scores(&self, experiment_id: Uuid) -> ExperimentResult<Vec<ArmScore>> {
        let scorer = self
            .objectives
            .as_ref()
            .ok_or_else(|| ExperimentError::Unsupported("objective scoring is disabled".into()))?;
        scorer.get_objective_scores(experiment_id).await
    }

    pub async fn get_metrics(&self, experiment_id: Uuid) -> ExperimentResult<ExperimentMetrics> {
        let arms = self.bandit.arms(experiment_id).await?;
        let mut samples_per_arm = Vec::with_capacity(arms.len());
        let mut total_conversions = 0;
        let mut total_revenue = 0.0;
        for arm in &arms {
            let stats = self.bandit.get_arm_stats(arm.id).await?;
            samples_per_arm.push((arm.id, stats.samples));
            total_conversions += stats.conversions;
            total_revenue += stats.revenue;
        }

        let samples: Vec<u64> = samples_per_arm.iter().map(|(_, s)| *s).collect();
        let total_samples: u64 = samples.iter().sum();
        Ok(ExperimentMetrics {
            experiment_id,
            arm_count: arms.len(),
            total_samples,
            total_conversions,
            total_revenue,
            conversion_rate: if total_samples > 0 {
                total_conversions as f64 / total_samples as f64
            } else {
                0.0
            },
            balance_index: balance_index(&samples),
            samples_per_arm,
        })
    }

    /// Expire overdue pending rewards and refresh exchange rates. Failures
    /// are collected in the report rather than returned.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        if let Some(tracker) = &self.delayed {
            match tracker.process_expired_rewards(self.expiry_batch_size).await {
                Ok(processed) => report.expired_processed = processed,
                Err(e) => {
                    warn!(error = %e, "Expired reward sweep failed");
                    report.errors.push(format!("expired rewards: {e}"));
                }
            }
        }

        match self.currency.update_rates().await {
            Ok(refreshed) => report.rates_refreshed = refreshed,
            Err(e) => {
                warn!(error = %e, "Exchange rate refresh failed");
                report.errors.push(format!("exchange rates: {e}"));
            }
        }

        info!(
            expired_processed = report.expired_processed,
            rates_refreshed = report.rates_refreshed,
            errors = report.errors.len(),
            "Maintenance complete"
        );
        report
    }

    /// Statistics straight from the store, bypassing caches.
    pub async fn stored_arm_stats(&self, arm_id: Uuid) -> ExperimentResult<Option<ArmStats>> {
        self.store.get_arm_stats(arm_id).await
    }
}
