//! Currency normalization of reward values into USD.
//!
//! Lookup order: cached rate, live rate source, static fallback table.
//! Rates from the live source are cached for the configured TTL. Fallback
//! rates are cached for at most [`FALLBACK_RATE_TTL`], so an outage costs one
//! live fetch per currency per interval and the source takes over again once
//! it answers or the maintenance refresh succeeds.

use crate::best_effort::{cache_put, cached};
use async_trait::async_trait;
use chrono::Utc;
use experiment_cache::Cache;
use experiment_core::config::CurrencyConfig;
use experiment_core::types::{CurrencyRate, RateOrigin, UserContext};
use experiment_core::{ExperimentError, ExperimentResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const BASE_CURRENCY: &str = "USD";

/// Upper bound on how long a fallback-table rate is served from cache.
pub const FALLBACK_RATE_TTL: Duration = Duration::from_secs(300);

/// A table of exchange rates keyed by ISO-4217 code, in units per USD.
#[async_trait]
pub trait RateSource: Send + Sync {
    async fn fetch_rates(&self) -> ExperimentResult<HashMap<String, f64>>;
}

#[derive(Debug, Deserialize)]
struct RatesResponse {
    rates: HashMap<String, f64>,
}

/// JSON feed shaped as `{"rates": {"EUR": 0.92, ...}}` with USD as the base.
pub struct HttpRateSource {
    client: reqwest::Client,
    url: String,
}

impl HttpRateSource {
    pub fn new(config: &CurrencyConfig) -> ExperimentResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| ExperimentError::RateSource(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: config.rates_url.clone(),
        })
    }
}

#[async_trait]
impl RateSource for HttpRateSource {
    async fn fetch_rates(&self) -> ExperimentResult<HashMap<String, f64>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| ExperimentError::RateSource(format!("Request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ExperimentError::RateSource(format!(
                "Rate feed returned {}",
                response.status()
            )));
        }

        let body: RatesResponse = response
            .json()
            .await
            .map_err(|e| ExperimentError::RateSource(format!("Parse failed: {e}")))?;
        Ok(body.rates)
    }
}

/// Three ASCII letters, upper-cased.
pub fn normalize_code(currency: &str) -> ExperimentResult<String> {
    let code = currency.trim();
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(ExperimentError::Validation(format!(
            "invalid currency code: {currency:?}"
        )));
    }
    Ok(code.to_ascii_uppercase())
}

/// Static rates in units per USD, used when no live rate is available.
pub fn fallback_units_per_usd(code: &str) -> Option<f64> {
    let rate = match code {
        "USD" => 1.0,
        "EUR" => 0.92,
        "GBP" => 0.79,
        "JPY" => 150.0,
        "CAD" => 1.36,
        "AUD" => 1.52,
        "NZD" => 1.64,
        "CHF" => 0.88,
        "SEK" => 10.5,
        "NOK" => 10.6,
        "DKK" => 6.9,
        "PLN" => 4.0,
        "BRL" => 5.0,
        "MXN" => 17.0,
        "INR" => 83.0,
        "CNY" => 7.2,
        "KRW" => 1330.0,
        "SGD" => 1.34,
        "HKD" => 7.8,
        "TRY" => 32.0,
        "ZAR" => 18.5,
        "RUB" => 92.0,
        _ => return None,
    };
    Some(rate)
}

/// Likely billing currency for an ISO-3166 alpha-2 country code.
pub fn currency_for_country(country: &str) -> Option<&'static str> {
    let currency = match country.trim().to_ascii_uppercase().as_str() {
        "US" => "USD",
        "GB" => "GBP",
        "DE" | "FR" | "IT" | "ES" | "NL" | "BE" | "AT" | "IE" | "FI" | "PT" | "GR" => "EUR",
        "JP" => "JPY",
        "CA" => "CAD",
        "AU" => "AUD",
        "NZ" => "NZD",
        "CH" => "CHF",
        "SE" => "SEK",
        "NO" => "NOK",
        "DK" => "DKK",
        "PL" => "PLN",
        "BR" => "BRL",
        "MX" => "MXN",
        "IN" => "INR",
        "CN" => "CNY",
        "KR" => "KRW",
        "SG" => "SGD",
        "HK" => "HKD",
        "TR" => "TRY",
        "ZA" => "ZAR",
        "RU" => "RUB",
        _ => return None,
    };
    Some(currency)
}

/// Currency a reward is denominated in: the explicit code if given, else the
/// user's currency, else the currency of the user's country, else USD.
pub fn infer_currency(explicit: &str, context: Option<&UserContext>) -> String {
    let explicit = explicit.trim();
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    let Some(context) = context else {
        return BASE_CURRENCY.to_string();
    };
    if let Some(currency) = context.currency.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        return currency.to_string();
    }
    context
        .country
        .as_deref()
        .and_then(currency_for_country)
        .unwrap_or(BASE_CURRENCY)
        .to_string()
}

fn rate_key(code: &str) -> String {
    format!("fx_rate:{code}")
}

fn usable(units_per_usd: f64) -> bool {
    units_per_usd.is_finite() && units_per_usd > 0.0
}

pub struct CurrencyNormalizer {
    cache: Arc<dyn Cache>,
    source: Option<Arc<dyn RateSource>>,
    rate_ttl: Duration,
}

impl CurrencyNormalizer {
    pub fn new(cache: Arc<dyn Cache>, source: Option<Arc<dyn RateSource>>, config: &CurrencyConfig) -> Self {
        Self {
            cache,
            source,
            rate_ttl: Duration::from_secs(config.cache_ttl_secs),
        }
    }

    /// Convert `amount` into USD. USD and an empty currency are the identity
    /// and zero stays zero; anything else needs a resolvable rate.
    pub async fn convert_to_usd(&self, amount: f64, currency: &str) -> ExperimentResult<f64> {
        if amount == 0.0 {
            return Ok(0.0);
        }
        let trimmed = currency.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(BASE_CURRENCY) {
            return Ok(amount);
        }
        let rate = self.get_rate(trimmed).await?;
        Ok(amount * rate.rate_to_usd)
    }

    pub async fn get_rate(&self, currency: &str) -> ExperimentResult<CurrencyRate> {
        let code = normalize_code(currency)?;
        if code == BASE_CURRENCY {
            return Ok(CurrencyRate {
                currency: code,
                rate_to_usd: 1.0,
                source: RateOrigin::Live,
                updated_at: Utc::now(),
            });
        }

        if let Some(rate) = cached::<CurrencyRate>(self.cache.as_ref(), &rate_key(&code)).await {
            return Ok(rate);
        }

        if self.source.is_some() {
            match self.refresh().await {
                Ok(table) => {
                    if let Some(rate) = table.into_iter().find(|r| r.currency == code) {
                        return Ok(rate);
                    }
                }
                Err(e) => warn!(currency = %code, error = %e, "Live rate lookup failed, using fallback"),
            }
        }

        match fallback_units_per_usd(&code) {
            Some(units) => {
                metrics::counter!("currency.fallback_used").increment(1);
                debug!(currency = %code, units_per_usd = units, "Using fallback rate");
                let rate = CurrencyRate {
                    currency: code,
                    rate_to_usd: 1.0 / units,
                    source: RateOrigin::Fallback,
                    updated_at: Utc::now(),
                };
                let ttl = self.rate_ttl.min(FALLBACK_RATE_TTL);
                cache_put(self.cache.as_ref(), &rate_key(&rate.currency), &rate, ttl).await;
                Ok(rate)
            }
            None => Err(ExperimentError::Validation(format!("unsupported currency: {code}"))),
        }
    }

    /// Pull the full table from the live source and cache every usable rate.
    async fn refresh(&self) -> ExperimentResult<Vec<CurrencyRate>> {
        let Some(source) = &self.source else {
            return Ok(Vec::new());
        };
        let raw = source.fetch_rates().await?;
        let now = Utc::now();

        let mut rates = Vec::with_capacity(raw.len());
        for (currency, units) in raw {
            let Ok(code) = normalize_code(&currency) else {
                continue;
            };
            if !usable(units) {
                warn!(currency = %code, units_per_usd = units, "Ignoring unusable rate");
                continue;
            }
            let rate = CurrencyRate {
                currency: code,
                rate_to_usd: 1.0 / units,
                source: RateOrigin::Live,
                updated_at: now,
            };
            cache_put(self.cache.as_ref(), &rate_key(&rate.currency), &rate, self.rate_ttl).await;
            rates.push(rate);
        }
        Ok(rates)
    }

    /// Refresh the cached table. Returns the number of rates cached, zero
    /// when no live source is configured.
    pub async fn update_rates(&self) -> ExperimentResult<usize> {
        if self.source.is_none() {
            return Ok(0);
        }
        let rates = self.refresh().await?;
        info!(rates = rates.len(), "Exchange rates refreshed");
        Ok(rates.len())
    }
}
