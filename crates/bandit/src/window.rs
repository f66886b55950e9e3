//! Sliding-window statistics: recent reward events per (experiment, arm) in a
//! score-ordered collection, with Beta statistics recomputed from the window.
//!
//! Members are JSON-encoded [`WindowEvent`]s scored by their timestamp in
//! milliseconds. Count windows keep the newest `size` members; time windows
//! drop members older than `duration_secs`.

use crate::best_effort::{cache_evict, cache_put, cached};
use chrono::Utc;
use dashmap::DashMap;
use experiment_cache::{Cache, OrderedStore};
use experiment_core::config::WindowSettings;
use experiment_core::types::{WindowConfig, WindowEvent, WindowMode, WindowStats};
use experiment_core::{ExperimentError, ExperimentResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

fn window_key(experiment_id: Uuid, arm_id: Uuid) -> String {
    format!("window:{experiment_id}:{arm_id}")
}

fn stats_key(experiment_id: Uuid, arm_id: Uuid) -> String {
    format!("window_stats:{experiment_id}:{arm_id}")
}

pub fn validate_window(config: &WindowConfig) -> ExperimentResult<()> {
    match config.mode {
        WindowMode::Events if config.size == 0 => Err(ExperimentError::Validation(
            "event window size must be positive".into(),
        )),
        WindowMode::Time if config.duration_secs == 0 => Err(ExperimentError::Validation(
            "time window duration must be positive".into(),
        )),
        _ => Ok(()),
    }
}

pub struct WindowAggregator {
    ordered: Arc<dyn OrderedStore>,
    cache: Arc<dyn Cache>,
    configs: DashMap<Uuid, WindowConfig>,
    default_config: WindowConfig,
    stats_cache_ttl: Duration,
}

impl WindowAggregator {
    pub fn new(ordered: Arc<dyn OrderedStore>, cache: Arc<dyn Cache>, settings: &WindowSettings) -> Self {
        let default_config = settings.default_window();
        let default_config = match validate_window(&default_config) {
            Ok(()) => default_config,
            Err(e) => {
                warn!(error = %e, "Invalid default window, using built-in defaults");
                WindowConfig::default()
            }
        };
        Self {
            ordered,
            cache,
            configs: DashMap::new(),
            default_config,
            stats_cache_ttl: Duration::from_secs(settings.stats_cache_ttl_secs),
        }
    }

    /// Set the window discipline shared by every arm of an experiment.
    pub fn configure(&self, experiment_id: Uuid, config: WindowConfig) -> ExperimentResult<()> {
        validate_window(&config)?;
        info!(
            experiment_id = %experiment_id,
            mode = ?config.mode,
            size = config.size,
            duration_secs = config.duration_secs,
            "Window configured"
        );
        self.configs.insert(experiment_id, config);
        Ok(())
    }

    pub fn config_for(&self, experiment_id: Uuid) -> WindowConfig {
        self.configs
            .get(&experiment_id)
            .map(|c| c.clone())
            .unwrap_or_else(|| self.default_config.clone())
    }

    /// Append one reward observation, trim the window and drop cached stats.
    pub async fn record_event(
        &self,
        experiment_id: Uuid,
        arm_id: Uuid,
        user_id: &str,
        reward: f64,
    ) -> ExperimentResult<WindowEvent> {
        let event = WindowEvent {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            reward,
            converted: reward > 0.0,
            timestamp_ms: Utc::now().timestamp_millis(),
        };
        let key = window_key(experiment_id, arm_id);
        let member = serde_json::to_string(&event)?;
        self.ordered.add(&key, &member, event.timestamp_ms as f64).await?;

        let config = self.config_for(experiment_id);
        self.trim(&key, &config).await?;
        if config.mode == WindowMode::Time {
            self.ordered
                .expire(&key, Duration::from_secs(config.duration_secs))
                .await?;
        }
        cache_evict(self.cache.as_ref(), &stats_key(experiment_id, arm_id)).await;

        debug!(
            experiment_id = %experiment_id,
            arm_id = %arm_id,
            reward = reward,
            "Window event recorded"
        );
        Ok(event)
    }

    async fn trim(&self, key: &str, config: &WindowConfig) -> ExperimentResult<u64> {
        let removed = match config.mode {
            // ZREMRANGEBYRANK 0 -(size+1) keeps the newest `size` members
            WindowMode::Events => {
                let keep = config.size.min(isize::MAX as u64) as isize;
                self.ordered.remove_range_by_rank(key, 0, -keep - 1).await?
            }
            WindowMode::Time => {
                let cutoff = window_start_ms(config);
                self.ordered
                    .remove_range_by_score(key, 0.0, (cutoff - 1) as f64)
                    .await?
            }
        };
        Ok(removed)
    }

    /// Enforce the window discipline now; returns the number of evicted events.
    pub async fn trim_window(&self, experiment_id: Uuid, arm_id: Uuid) -> ExperimentResult<u64> {
        let config = self.config_for(experiment_id);
        let removed = self.trim(&window_key(experiment_id, arm_id), &config).await?;
        if removed > 0 {
            cache_evict(self.cache.as_ref(), &stats_key(experiment_id, arm_id)).await;
            debug!(experiment_id = %experiment_id, arm_id = %arm_id, removed = removed, "Window trimmed");
        }
        Ok(removed)
    }

    async fn live_events(
        &self,
        experiment_id: Uuid,
        arm_id: Uuid,
        config: &WindowConfig,
    ) -> ExperimentResult<Vec<WindowEvent>> {
        let key = window_key(experiment_id, arm_id);
        let members = match config.mode {
            WindowMode::Events => {
                let keep = config.size.min(isize::MAX as u64) as isize;
                self.ordered.range_by_rank(&key, -keep, -1).await?
            }
            WindowMode::Time => {
                let start = window_start_ms(config);
                self.ordered
                    .range_by_score(&key, start as f64, i64::MAX as f64)
                    .await?
            }
        };
        Ok(decode_events(&key, members))
    }

    /// Beta statistics over the live window, cached briefly.
    pub async fn get_window_stats(&self, experiment_id: Uuid, arm_id: Uuid) -> ExperimentResult<WindowStats> {
        let key = stats_key(experiment_id, arm_id);
        if let Some(stats) = cached::<WindowStats>(self.cache.as_ref(), &key).await {
            return Ok(stats);
        }
        let config = self.config_for(experiment_id);
        let events = self.live_events(experiment_id, arm_id, &config).await?;
        let stats = WindowStats::from_events(arm_id, config.mode, &events);
        cache_put(self.cache.as_ref(), &key, &stats, self.stats_cache_ttl).await;
        Ok(stats)
    }

    pub async fn get_experiment_window_stats(
        &self,
        experiment_id: Uuid,
        arm_ids: &[Uuid],
    ) -> ExperimentResult<Vec<WindowStats>> {
        let mut all = Vec::with_capacity(arm_ids.len());
        for &arm_id in arm_ids {
            all.push(self.get_window_stats(experiment_id, arm_id).await?);
        }
        Ok(all)
    }

    pub async fn has_enough_samples(&self, experiment_id: Uuid, arm_id: Uuid) -> ExperimentResult<bool> {
        let min_samples = self.config_for(experiment_id).min_samples;
        let stats = self.get_window_stats(experiment_id, arm_id).await?;
        Ok(stats.samples >= min_samples)
    }

    /// Fill ratio of a count window; time windows have no capacity and report 1.0.
    pub async fn get_utilization(&self, experiment_id: Uuid, arm_id: Uuid) -> ExperimentResult<f64> {
        let config = self.config_for(experiment_id);
        match config.mode {
            WindowMode::Time => Ok(1.0),
            WindowMode::Events => {
                let count = self.ordered.count(&window_key(experiment_id, arm_id)).await?;
                Ok((count as f64 / config.size as f64).min(1.0))
            }
        }
    }

    pub async fn clear_window(&self, experiment_id: Uuid, arm_id: Uuid) -> ExperimentResult<()> {
        self.ordered.delete(&window_key(experiment_id, arm_id)).await?;
        cache_evict(self.cache.as_ref(), &stats_key(experiment_id, arm_id)).await;
        info!(experiment_id = %experiment_id, arm_id = %arm_id, "Window cleared");
        Ok(())
    }

    /// Every stored event, oldest first, including any not yet trimmed.
    pub async fn export_events(&self, experiment_id: Uuid, arm_id: Uuid) -> ExperimentResult<Vec<WindowEvent>> {
        let key = window_key(experiment_id, arm_id);
        let members = self.ordered.range_by_rank(&key, 0, -1).await?;
        Ok(decode_events(&key, members))
    }
}

fn window_start_ms(config: &WindowConfig) -> i64 {
    let width_ms = config.duration_secs.saturating_mul(1000).min(i64::MAX as u64) as i64;
    Utc::now().timestamp_millis().saturating_sub(width_ms)
}

fn decode_events(key: &str, members: Vec<(String, f64)>) -> Vec<WindowEvent> {
    members
        .into_iter()
        .filter_map(|(member, _)| match serde_json::from_str(&member) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(key = key, error = %e, "Skipping undecodable window member");
                None
            }
        })
        .collect()
}
