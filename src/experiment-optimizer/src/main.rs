//! Experiment Optimizer: arm selection and reward learning worker.
//!
//! Wires the experiment engine to Redis (falling back to in-process tiers)
//! and runs the maintenance sweep on an interval until shutdown.
//!
//! Standalone, the worker owns a fresh in-memory store that nothing else
//! writes to, so the sweep only refreshes the shared exchange-rate cache.
//! Expiring pending rewards needs the engine to be built over the store the
//! serving layer writes to; embed `ExperimentEngine` there instead.

use clap::Parser;
use experiment_bandit::{ExperimentEngine, HttpRateSource, RateSource};
use experiment_cache::{connect, Cache, LocalCache, LocalOrderedStore, OrderedStore, RedisCache, RedisOrderedStore};
use experiment_core::{AppConfig, ExperimentStore, MemoryStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "experiment-optimizer")]
#[command(about = "Bandit-driven experiment arm selection and reward learning")]
#[command(version)]
struct Cli {
    /// Redis URL (overrides config)
    #[arg(long, env = "EXPERIMENT_OPTIMIZER__REDIS__URL")]
    redis_url: Option<String>,

    /// Seconds between maintenance sweeps (overrides config)
    #[arg(long, env = "EXPERIMENT_OPTIMIZER__MAINTENANCE__INTERVAL_SECS")]
    maintenance_interval_secs: Option<u64>,

    /// Use in-process cache tiers only
    #[arg(long, default_value_t = false)]
    local: bool,

    /// Run one maintenance sweep and exit
    #[arg(long, default_value_t = false)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "experiment_optimizer=info,experiment_bandit=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Experiment Optimizer starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(url) = cli.redis_url {
        config.redis.urls = vec![url];
    }
    if let Some(secs) = cli.maintenance_interval_secs {
        config.maintenance.interval_secs = secs;
    }

    info!(
        strategy = ?config.bandit.strategy,
        contextual = config.contextual.enabled,
        window = config.window.enabled,
        delayed = config.delayed.enabled,
        objectives = config.objectives.enabled,
        maintenance_interval_secs = config.maintenance.interval_secs,
        "Configuration loaded"
    );

    let redis = if cli.local {
        None
    } else {
        match connect(&config.redis).await {
            Ok(conn) => Some(conn),
            Err(e) => {
                warn!(error = %e, "Redis unavailable, using in-process cache tiers");
                None
            }
        }
    };

    let (cache, ordered): (Arc<dyn Cache>, Arc<dyn OrderedStore>) = match redis {
        Some(conn) => {
            let cache = Arc::new(RedisCache::from_connection(conn.clone(), &config.redis));
            let l1 = cache.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(60));
                loop {
                    interval.tick().await;
                    l1.maintenance().await;
                }
            });
            (
                cache as Arc<dyn Cache>,
                Arc::new(RedisOrderedStore::new(conn, &config.redis)) as Arc<dyn OrderedStore>,
            )
        }
        None => {
            let cache = Arc::new(LocalCache::default());
            let local = cache.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(60));
                loop {
                    interval.tick().await;
                    local.evict_expired();
                }
            });
            (
                cache as Arc<dyn Cache>,
                Arc::new(LocalOrderedStore::new()) as Arc<dyn OrderedStore>,
            )
        }
    };

    let rate_source: Option<Arc<dyn RateSource>> = if config.currency.live_rates {
        match HttpRateSource::new(&config.currency) {
            Ok(source) => Some(Arc::new(source) as Arc<dyn RateSource>),
            Err(e) => {
                warn!(error = %e, "Live exchange rates disabled");
                None
            }
        }
    } else {
        None
    };

    // Private to this process; see the module docs
    let store: Arc<dyn ExperimentStore> = Arc::new(MemoryStore::new());
    let engine = ExperimentEngine::new(&config, store, cache, ordered, rate_source)?;

    if cli.once {
        let report = engine.run_maintenance().await;
        info!(
            expired_processed = report.expired_processed,
            rates_refreshed = report.rates_refreshed,
            errors = ?report.errors,
            "Maintenance sweep finished"
        );
        return Ok(());
    }

    info!("Experiment Optimizer is running");

    let mut interval = tokio::time::interval(Duration::from_secs(config.maintenance.interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                engine.run_maintenance().await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Experiment Optimizer stopped");
    Ok(())
}
