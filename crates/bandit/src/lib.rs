#![warn(clippy::unwrap_used)]

mod best_effort;
pub mod currency;
pub mod delayed;
pub mod engine;
pub mod linucb;
pub mod objectives;
pub mod sampler;
pub mod thompson;
pub mod window;

#[cfg(test)]
mod test_support;

pub use currency::{
    currency_for_country, infer_currency, CurrencyNormalizer, HttpRateSource, RateSource,
};
pub use delayed::DelayedRewardTracker;
pub use engine::{
    balance_index, ExperimentEngine, ExperimentMetrics, ExperimentStatistics, MaintenanceReport,
    RewardOutcome,
};
pub use linucb::{extract_features, ContextualSelector, FEATURE_DIM};
pub use objectives::{ArmScore, MultiObjectiveScorer};
pub use sampler::{beta_sample, sample_beta};
pub use thompson::{ArmSummary, ThompsonBandit};
pub use window::WindowAggregator;
