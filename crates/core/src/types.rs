use chrono::{DateTime, Duration, Utc};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// One variant within an experiment. Only `weight` changes after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Arm {
    pub id: Uuid,
    pub experiment_id: Uuid,
    pub name: String,
    pub is_control: bool,
    pub weight: f64,
    pub created_at: DateTime<Utc>,
}

impl Arm {
    pub fn new(experiment_id: Uuid, name: impl Into<String>, is_control: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            experiment_id,
            name: name.into(),
            is_control,
            weight: 1.0,
            created_at: Utc::now(),
        }
    }
}

/// Beta-Bernoulli posterior for an arm, plus reward accounting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArmStats {
    pub arm_id: Uuid,
    pub alpha: f64,
    pub beta: f64,
    pub samples: u64,
    pub conversions: u64,
    pub revenue: f64,
    pub avg_reward: f64,
    pub updated_at: DateTime<Utc>,
}

impl ArmStats {
    /// Uniform Beta(1, 1) prior.
    pub fn new(arm_id: Uuid) -> Self {
        Self {
            arm_id,
            alpha: 1.0,
            beta: 1.0,
            samples: 0,
            conversions: 0,
            revenue: 0.0,
            avg_reward: 0.0,
            updated_at: Utc::now(),
        }
    }

    /// Canonical update: a positive reward is a conversion, anything else a miss.
    pub fn apply_reward(&mut self, reward: f64) {
        if reward > 0.0 {
            self.alpha += 1.0;
            self.conversions += 1;
            self.revenue += reward;
        } else {
            self.beta += 1.0;
        }
        self.samples += 1;
        self.avg_reward = self.revenue / self.samples as f64;
        self.updated_at = Utc::now();
    }

    pub fn mean(&self) -> f64 {
        beta_mean(self.alpha, self.beta)
    }

    /// Normal approximation of the 95% credible interval, clamped to [0, 1].
    pub fn credible_interval(&self) -> (f64, f64) {
        let total = self.alpha + self.beta;
        if total <= 0.0 {
            return (0.0, 1.0);
        }
        let mean = self.mean();
        let variance = (self.alpha * self.beta) / (total.powi(2) * (total + 1.0));
        let width = 1.96 * variance.sqrt();
        ((mean - width).max(0.0), (mean + width).min(1.0))
    }

    pub fn conversion_rate(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.conversions as f64 / self.samples as f64
        }
    }
}

fn beta_mean(alpha: f64, beta: f64) -> f64 {
    let total = alpha + beta;
    if total <= 0.0 {
        0.5
    } else {
        alpha / total
    }
}

/// Sticky (experiment, user) -> arm mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assignment {
    pub experiment_id: Uuid,
    pub user_id: String,
    pub arm_id: Uuid,
    pub assigned_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Assignment {
    pub fn new(experiment_id: Uuid, user_id: impl Into<String>, arm_id: Uuid, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            experiment_id,
            user_id: user_id.into(),
            arm_id,
            assigned_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// User attributes available at selection time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserContext {
    /// ISO-3166 alpha-2 country code.
    pub country: Option<String>,
    /// `ios`, `android`, `web`, `tablet` or anything else.
    pub device: Option<String>,
    pub days_since_install: Option<u32>,
    /// Lifetime spend in the common currency unit.
    pub total_spend: f64,
    pub has_purchased: bool,
    pub last_purchase_at: Option<DateTime<Utc>>,
    pub currency: Option<String>,
}

/// Disjoint LinUCB state for one arm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinUcbModel {
    pub arm_id: Uuid,
    pub a: Array2<f64>,
    pub b: Array1<f64>,
    pub theta: Array1<f64>,
    pub samples: u64,
    pub updated_at: DateTime<Utc>,
}

impl LinUcbModel {
    /// A = I, b = 0, theta = 0.
    pub fn new(arm_id: Uuid, dim: usize) -> Self {
        Self {
            arm_id,
            a: Array2::eye(dim),
            b: Array1::zeros(dim),
            theta: Array1::zeros(dim),
            samples: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn dim(&self) -> usize {
        self.b.len()
    }
}

/// Reward whose outcome is resolved after selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingReward {
    pub id: Uuid,
    pub experiment_id: Uuid,
    pub arm_id: Uuid,
    pub user_id: String,
    pub assigned_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub converted: bool,
    pub conversion_value: Option<f64>,
    pub conversion_currency: Option<String>,
    pub converted_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl PendingReward {
    pub fn new(experiment_id: Uuid, arm_id: Uuid, user_id: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            experiment_id,
            arm_id,
            user_id: user_id.into(),
            assigned_at: now,
            expires_at: now + ttl,
            converted: false,
            conversion_value: None,
            conversion_currency: None,
            converted_at: None,
            processed_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Unconverted, unprocessed and not yet expired.
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        !self.converted && self.processed_at.is_none() && !self.is_expired(now)
    }
}

/// Conversion data applied to a pending reward.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversionDetails {
    pub value: f64,
    pub currency: String,
    pub converted_at: DateTime<Utc>,
}

/// Append-only join between an external transaction and the reward it resolved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversionLink {
    pub pending_reward_id: Uuid,
    pub transaction_id: String,
    pub linked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveType {
    Conversion,
    Ltv,
    Revenue,
}

impl ObjectiveType {
    pub const ALL: [ObjectiveType; 3] = [
        ObjectiveType::Conversion,
        ObjectiveType::Ltv,
        ObjectiveType::Revenue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectiveType::Conversion => "conversion",
            ObjectiveType::Ltv => "ltv",
            ObjectiveType::Revenue => "revenue",
        }
    }
}

impl fmt::Display for ObjectiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectiveType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "conversion" => Ok(ObjectiveType::Conversion),
            "ltv" => Ok(ObjectiveType::Ltv),
            "revenue" => Ok(ObjectiveType::Revenue),
            other => Err(format!("unknown objective: {other}")),
        }
    }
}

/// Smoothing weight kept from the previous LTV average.
pub const LTV_SMOOTHING: f64 = 0.9;

/// Per (arm, objective) statistics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArmObjectiveStats {
    pub arm_id: Uuid,
    pub objective: ObjectiveType,
    pub alpha: f64,
    pub beta: f64,
    pub samples: u64,
    pub conversions: u64,
    pub total_revenue: f64,
    pub avg_ltv: f64,
    pub updated_at: DateTime<Utc>,
}

impl ArmObjectiveStats {
    pub fn new(arm_id: Uuid, objective: ObjectiveType) -> Self {
        Self {
            arm_id,
            objective,
            alpha: 1.0,
            beta: 1.0,
            samples: 0,
            conversions: 0,
            total_revenue: 0.0,
            avg_ltv: 0.0,
            updated_at: Utc::now(),
        }
    }

    /// Same rule as [`ArmStats::apply_reward`], plus an exponential moving
    /// average of the value of converting rewards.
    pub fn apply_reward(&mut self, reward: f64) {
        if reward > 0.0 {
            self.avg_ltv = if self.conversions == 0 {
                reward
            } else {
                LTV_SMOOTHING * self.avg_ltv + (1.0 - LTV_SMOOTHING) * reward
            };
            self.alpha += 1.0;
            self.conversions += 1;
            self.total_revenue += reward;
        } else {
            self.beta += 1.0;
        }
        self.samples += 1;
        self.updated_at = Utc::now();
    }

    pub fn mean(&self) -> f64 {
        beta_mean(self.alpha, self.beta)
    }

    pub fn revenue_per_sample(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.total_revenue / self.samples as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
    /// Keep the most recent `size` events.
    #[default]
    Events,
    /// Keep events younger than `duration_secs`.
    Time,
}

/// Window discipline shared by every arm of an experiment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowConfig {
    pub mode: WindowMode,
    pub size: u64,
    pub duration_secs: u64,
    pub min_samples: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            mode: WindowMode::Events,
            size: 1000,
            duration_secs: 86_400,
            min_samples: 100,
        }
    }
}

/// One reward observation held in a window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowEvent {
    pub id: Uuid,
    pub user_id: String,
    pub reward: f64,
    pub converted: bool,
    pub timestamp_ms: i64,
}

/// Statistics recomputed from the live window of one arm.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowStats {
    pub arm_id: Uuid,
    pub mode: WindowMode,
    pub alpha: f64,
    pub beta: f64,
    pub samples: u64,
    pub conversions: u64,
    pub revenue: f64,
    pub avg_reward: f64,
    pub computed_at: DateTime<Utc>,
}

impl WindowStats {
    pub fn from_events(arm_id: Uuid, mode: WindowMode, events: &[WindowEvent]) -> Self {
        let samples = events.len() as u64;
        let conversions = events.iter().filter(|e| e.converted).count() as u64;
        let revenue: f64 = events.iter().filter(|e| e.converted).map(|e| e.reward).sum();
        Self {
            arm_id,
            mode,
            alpha: 1.0 + conversions as f64,
            beta: 1.0 + (samples - conversions) as f64,
            samples,
            conversions,
            revenue,
            avg_reward: if samples > 0 { revenue / samples as f64 } else { 0.0 },
            computed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RateOrigin {
    Live,
    Fallback,
}

/// Conversion factor from one currency unit into USD.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CurrencyRate {
    pub currency: String,
    pub rate_to_usd: f64,
    pub source: RateOrigin,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arm_stats_update_rule() {
        let mut stats = ArmStats::new(Uuid::new_v4());
        stats.apply_reward(9.99);
        stats.apply_reward(0.0);
        stats.apply_reward(-1.0);

        assert_eq!(stats.samples, 3);
        assert_eq!(stats.conversions, 1);
        assert_eq!(stats.alpha, 2.0);
        assert_eq!(stats.beta, 3.0);
        assert!((stats.revenue - 9.99).abs() < 1e-9);
        assert!((stats.avg_reward - 3.33).abs() < 1e-9);
        assert_eq!(stats.alpha, 1.0 + stats.conversions as f64);
        assert_eq!(stats.beta, 1.0 + (stats.samples - stats.conversions) as f64);
    }

    #[test]
    fn test_credible_interval_narrows_with_data() {
        let fresh = ArmStats::new(Uuid::new_v4());
        let mut seasoned = ArmStats::new(Uuid::new_v4());
        for i in 0..500 {
            seasoned.apply_reward(if i % 5 == 0 { 1.0 } else { 0.0 });
        }
        let (lo1, hi1) = fresh.credible_interval();
        let (lo2, hi2) = seasoned.credible_interval();
        assert!(hi2 - lo2 < hi1 - lo1);
        assert!(lo2 <= seasoned.mean() && seasoned.mean() <= hi2);
    }

    #[test]
    fn test_objective_ltv_smoothing() {
        let mut stats = ArmObjectiveStats::new(Uuid::new_v4(), ObjectiveType::Ltv);
        stats.apply_reward(100.0);
        assert_eq!(stats.avg_ltv, 100.0);

        stats.apply_reward(0.0);
        assert_eq!(stats.avg_ltv, 100.0);

        stats.apply_reward(200.0);
        assert!((stats.avg_ltv - 110.0).abs() < 1e-9);
        assert_eq!(stats.samples, 3);
        assert_eq!(stats.conversions, 2);
        assert!((stats.revenue_per_sample() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_pending_reward_open_window() {
        let now = Utc::now();
        let mut pending = PendingReward::new(Uuid::new_v4(), Uuid::new_v4(), "u1", Duration::hours(1));
        assert!(pending.is_open(now));
        assert!(!pending.is_open(now + Duration::hours(2)));

        pending.converted = true;
        assert!(!pending.is_open(now));
    }

    #[test]
    fn test_window_stats_from_events() {
        let events: Vec<WindowEvent> = (0..4)
            .map(|i| WindowEvent {
                id: Uuid::new_v4(),
                user_id: format!("u{i}"),
                reward: if i < 3 { 2.0 } else { 0.0 },
                converted: i < 3,
                timestamp_ms: i,
            })
            .collect();
        let stats = WindowStats::from_events(Uuid::new_v4(), WindowMode::Events, &events);
        assert_eq!(stats.samples, 4);
        assert_eq!(stats.conversions, 3);
        assert_eq!(stats.alpha, 4.0);
        assert_eq!(stats.beta, 2.0);
        assert!((stats.avg_reward - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_objective_type_parse() {
        assert_eq!("LTV".parse::<ObjectiveType>(), Ok(ObjectiveType::Ltv));
        assert!("hybrid".parse::<ObjectiveType>().is_err());
    }

    #[test]
    fn test_linucb_model_identity_prior() {
        let model = LinUcbModel::new(Uuid::new_v4(), 4);
        assert_eq!(model.dim(), 4);
        assert_eq!(model.a[[2, 2]], 1.0);
        assert_eq!(model.a[[0, 1]], 0.0);
        assert!(model.b.iter().all(|v| *v == 0.0));
    }
}
