use crate::types::{ObjectiveType, WindowConfig, WindowMode};
use serde::Deserialize;

/// Root configuration. Loaded from environment variables with the prefix
/// `EXPERIMENT_OPTIMIZER__`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub bandit: BanditConfig,
    #[serde(default)]
    pub contextual: ContextualConfig,
    #[serde(default)]
    pub window: WindowSettings,
    #[serde(default)]
    pub delayed: DelayedRewardConfig,
    #[serde(default)]
    pub objectives: ObjectiveConfig,
    #[serde(default)]
    pub currency: CurrencyConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_urls")]
    pub urls: Vec<String>,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    #[default]
    Thompson,
    Contextual,
    MultiObjective,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BanditConfig {
    #[serde(default)]
    pub strategy: SelectionStrategy,
    #[serde(default = "default_assignment_ttl_secs")]
    pub assignment_ttl_secs: u64,
    #[serde(default = "default_stats_cache_ttl_secs")]
    pub stats_cache_ttl_secs: u64,
    #[serde(default = "default_win_probability_simulations")]
    pub win_probability_simulations: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContextualConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_exploration_alpha")]
    pub exploration_alpha: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WindowSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mode: WindowMode,
    #[serde(default = "default_window_size")]
    pub size: u64,
    #[serde(default = "default_window_duration_secs")]
    pub duration_secs: u64,
    #[serde(default = "default_window_min_samples")]
    pub min_samples: u64,
    #[serde(default = "default_stats_cache_ttl_secs")]
    pub stats_cache_ttl_secs: u64,
}

impl WindowSettings {
    /// Window discipline applied to experiments without an explicit one.
    pub fn default_window(&self) -> WindowConfig {
        WindowConfig {
            mode: self.mode,
            size: self.size,
            duration_secs: self.duration_secs,
            min_samples: self.min_samples,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DelayedRewardConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_pending_ttl_hours")]
    pub default_ttl_hours: u64,
    #[serde(default = "default_pending_max_ttl_hours")]
    pub max_ttl_hours: u64,
    #[serde(default = "default_expiry_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveMode {
    #[default]
    Conversion,
    Ltv,
    Revenue,
    Hybrid,
}

impl ObjectiveMode {
    /// The single objective tracked by a non-hybrid mode.
    pub fn single(&self) -> Option<ObjectiveType> {
        match self {
            ObjectiveMode::Conversion => Some(ObjectiveType::Conversion),
            ObjectiveMode::Ltv => Some(ObjectiveType::Ltv),
            ObjectiveMode::Revenue => Some(ObjectiveType::Revenue),
            ObjectiveMode::Hybrid => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ObjectiveWeights {
    #[serde(default = "default_conversion_weight")]
    pub conversion: f64,
    #[serde(default)]
    pub ltv: f64,
    #[serde(default)]
    pub revenue: f64,
}

impl ObjectiveWeights {
    pub fn get(&self, objective: ObjectiveType) -> f64 {
        match objective {
            ObjectiveType::Conversion => self.conversion,
            ObjectiveType::Ltv => self.ltv,
            ObjectiveType::Revenue => self.revenue,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectiveConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mode: ObjectiveMode,
    #[serde(default)]
    pub weights: ObjectiveWeights,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CurrencyConfig {
    #[serde(default = "default_live_rates")]
    pub live_rates: bool,
    #[serde(default = "default_rates_url")]
    pub rates_url: String,
    #[serde(default = "default_rate_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_rate_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_maintenance_interval_secs")]
    pub interval_secs: u64,
}

// Default functions
fn default_redis_urls() -> Vec<String> {
    vec!["redis://localhost:6379".to_string()]
}
fn default_ttl_secs() -> u64 {
    3600
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_io_timeout_ms() -> u64 {
    250
}
fn default_assignment_ttl_secs() -> u64 {
    86_400
}
fn default_stats_cache_ttl_secs() -> u64 {
    300
}
fn default_win_probability_simulations() -> usize {
    10_000
}
fn default_exploration_alpha() -> f64 {
    0.3
}
fn default_window_size() -> u64 {
    1000
}
fn default_window_duration_secs() -> u64 {
    86_400
}
fn default_window_min_samples() -> u64 {
    100
}
fn default_pending_ttl_hours() -> u64 {
    168
}
fn default_pending_max_ttl_hours() -> u64 {
    720
}
fn default_expiry_batch_size() -> usize {
    100
}
fn default_conversion_weight() -> f64 {
    1.0
}
fn default_live_rates() -> bool {
    true
}
fn default_rates_url() -> String {
    "https://open.er-api.com/v6/latest/USD".to_string()
}
fn default_rate_cache_ttl_secs() -> u64 {
    3600
}
fn default_rate_request_timeout_ms() -> u64 {
    5000
}
fn default_maintenance_interval_secs() -> u64 {
    300
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            urls: default_redis_urls(),
            ttl_secs: default_ttl_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
        }
    }
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::default(),
            assignment_ttl_secs: default_assignment_ttl_secs(),
            stats_cache_ttl_secs: default_stats_cache_ttl_secs(),
            win_probability_simulations: default_win_probability_simulations(),
        }
    }
}

impl Default for ContextualConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            exploration_alpha: default_exploration_alpha(),
        }
    }
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: WindowMode::default(),
            size: default_window_size(),
            duration_secs: default_window_duration_secs(),
            min_samples: default_window_min_samples(),
            stats_cache_ttl_secs: default_stats_cache_ttl_secs(),
        }
    }
}

impl Default for DelayedRewardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_ttl_hours: default_pending_ttl_hours(),
            max_ttl_hours: default_pending_max_ttl_hours(),
            batch_size: default_expiry_batch_size(),
        }
    }
}

impl Default for ObjectiveWeights {
    fn default() -> Self {
        Self {
            conversion: default_conversion_weight(),
            ltv: 0.0,
            revenue: 0.0,
        }
    }
}

impl Default for ObjectiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: ObjectiveMode::default(),
            weights: ObjectiveWeights::default(),
        }
    }
}

impl Default for CurrencyConfig {
    fn default() -> Self {
        Self {
            live_rates: default_live_rates(),
            rates_url: default_rates_url(),
            cache_ttl_secs: default_rate_cache_ttl_secs(),
            request_timeout_ms: default_rate_request_timeout_ms(),
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_maintenance_interval_secs(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("EXPERIMENT_OPTIMIZER")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("redis.urls"),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
