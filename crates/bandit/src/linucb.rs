//! Contextual bandits: disjoint LinUCB over a fixed 20-slot user feature vector.
//!
//! Scoring uses only the diagonal of `A` for the exploration bonus:
//! `UCB = θᵀx + α·sqrt(Σ xᵢ² / Aᵢᵢ)`. θ itself is the exact solution of
//! `Aθ = b`, recomputed on every update.

use crate::thompson::pick_best;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use experiment_core::types::{LinUcbModel, UserContext};
use experiment_core::{ExperimentError, ExperimentResult, ExperimentStore};
use ndarray::{Array1, Array2};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub const FEATURE_DIM: usize = 20;
pub const DEFAULT_EXPLORATION: f64 = 0.3;

const TOP_COUNTRIES: [&str; 9] = ["US", "GB", "DE", "FR", "JP", "CA", "AU", "BR", "IN"];
const DEVICES: [&str; 4] = ["ios", "android", "web", "tablet"];

const COUNTRY_OFFSET: usize = 0;
const DEVICE_OFFSET: usize = 10;
const INSTALL_AGE: usize = 15;
const SPEND: usize = 16;
const HAS_PURCHASED: usize = 17;
const RECENT_PURCHASE: usize = 18;
const BIAS: usize = 19;

const MAX_INSTALL_DAYS: f64 = 30.0;
const RECENT_PURCHASE_DAYS: i64 = 7;
const SINGULAR_EPS: f64 = 1e-12;

/// Map user attributes onto the fixed feature layout:
/// countries (9 + other), devices (4 + other), install age, log spend,
/// purchase flags and a bias term.
pub fn extract_features(context: &UserContext, now: DateTime<Utc>) -> Array1<f64> {
    let mut x = Array1::zeros(FEATURE_DIM);

    let country = context
        .country
        .as_deref()
        .and_then(|c| TOP_COUNTRIES.iter().position(|top| top.eq_ignore_ascii_case(c)))
        .unwrap_or(TOP_COUNTRIES.len());
    x[COUNTRY_OFFSET + country] = 1.0;

    let device = context
        .device
        .as_deref()
        .and_then(|d| DEVICES.iter().position(|known| known.eq_ignore_ascii_case(d)))
        .unwrap_or(DEVICES.len());
    x[DEVICE_OFFSET + device] = 1.0;

    if let Some(days) = context.days_since_install {
        x[INSTALL_AGE] = (days as f64).min(MAX_INSTALL_DAYS) / MAX_INSTALL_DAYS;
    }
    x[SPEND] = context.total_spend.max(0.0).ln_1p() / 10.0;
    if context.has_purchased {
        x[HAS_PURCHASED] = 1.0;
    }
    if let Some(last) = context.last_purchase_at {
        if now - last <= chrono::Duration::days(RECENT_PURCHASE_DAYS) {
            x[RECENT_PURCHASE] = 1.0;
        }
    }
    x[BIAS] = 1.0;
    x
}

/// Solve `a·x = b` by Gaussian elimination with partial pivoting.
/// Works on copies; returns `None` for a singular or mis-shaped system.
pub fn solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = b.len();
    if a.nrows() != n || a.ncols() != n {
        return None;
    }
    let mut m = a.to_owned();
    let mut rhs = b.to_owned();

    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| m[[i, col]].abs().total_cmp(&m[[j, col]].abs()))?;
        if !(m[[pivot, col]].abs() >= SINGULAR_EPS) {
            return None;
        }
        if pivot != col {
            for k in 0..n {
                m.swap([col, k], [pivot, k]);
            }
            rhs.swap(col, pivot);
        }
        for row in col + 1..n {
            let factor = m[[row, col]] / m[[col, col]];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                let delta = factor * m[[col, k]];
                m[[row, k]] -= delta;
            }
            let delta = factor * rhs[col];
            rhs[row] -= delta;
        }
    }

    let mut x = Array1::zeros(n);
    for row in (0..n).rev() {
        let mut acc = rhs[row];
        for k in row + 1..n {
            acc -= m[[row, k]] * x[k];
        }
        x[row] = acc / m[[row, row]];
    }
    Some(x)
}

/// Upper confidence bound with the diagonal stand-in for `A⁻¹`.
pub fn ucb_score(model: &LinUcbModel, x: &Array1<f64>, exploration: f64) -> f64 {
    let estimate = model.theta.dot(x);
    let variance: f64 = x
        .iter()
        .zip(model.a.diag().iter())
        .map(|(xi, aii)| xi * xi / aii.max(SINGULAR_EPS))
        .sum();
    estimate + exploration * variance.sqrt()
}

/// `A` is square and `b`, `θ` match the feature layout.
fn has_feature_shape(model: &LinUcbModel) -> bool {
    model.a.dim() == (FEATURE_DIM, FEATURE_DIM)
        && model.b.len() == FEATURE_DIM
        && model.theta.len() == FEATURE_DIM
}

fn outer(x: &Array1<f64>) -> Array2<f64> {
    let d = x.len();
    Array2::from_shape_fn((d, d), |(i, j)| x[i] * x[j])
}

pub struct ContextualSelector {
    store: Arc<dyn ExperimentStore>,
    exploration: DashMap<Uuid, f64>,
    default_exploration: f64,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl ContextualSelector {
    pub fn new(store: Arc<dyn ExperimentStore>, default_exploration: f64) -> Self {
        let default_exploration = if default_exploration > 0.0 && default_exploration.is_finite() {
            default_exploration
        } else {
            DEFAULT_EXPLORATION
        };
        Self {
            store,
            exploration: DashMap::new(),
            default_exploration,
            locks: DashMap::new(),
        }
    }

    /// Override the exploration constant for one experiment. Non-positive
    /// values are ignored; returns whether the override was applied.
    pub fn set_exploration(&self, experiment_id: Uuid, alpha: f64) -> bool {
        if !(alpha > 0.0 && alpha.is_finite()) {
            warn!(experiment_id = %experiment_id, alpha = alpha, "Ignoring invalid exploration constant");
            return false;
        }
        self.exploration.insert(experiment_id, alpha);
        true
    }

    pub fn exploration(&self, experiment_id: Uuid) -> f64 {
        self.exploration
            .get(&experiment_id)
            .map(|a| *a)
            .unwrap_or(self.default_exploration)
    }

    /// Persisted model for an arm, or a fresh one.
    pub async fn get_model(&self, arm_id: Uuid) -> ExperimentResult<LinUcbModel> {
        Ok(self
            .store
            .get_linucb_model(arm_id)
            .await?
            .unwrap_or_else(|| LinUcbModel::new(arm_id, FEATURE_DIM)))
    }

    /// Pick the arm with the highest UCB. Arms whose model cannot be loaded
    /// are skipped; if none can be scored the first arm is returned.
    pub async fn select_arm(&self, experiment_id: Uuid, context: &UserContext) -> ExperimentResult<Uuid> {
        let arms = self.store.get_arms(experiment_id).await?;
        let Some(first) = arms.first() else {
            return Err(ExperimentError::NotFound(format!(
                "no arms for experiment {experiment_id}"
            )));
        };

        let x = extract_features(context, Utc::now());
        let alpha = self.exploration(experiment_id);
        let mut scores = Vec::with_capacity(arms.len());
        for arm in &arms {
            match self.get_model(arm.id).await {
                Ok(model) if has_feature_shape(&model) => {
                    scores.push((arm.id, ucb_score(&model, &x, alpha)));
                }
                Ok(model) => {
                    warn!(
                        arm_id = %arm.id,
                        a = ?model.a.dim(),
                        b = model.b.len(),
                        theta = model.theta.len(),
                        "Skipping model with wrong shape"
                    );
                }
                Err(e) => {
                    warn!(arm_id = %arm.id, error = %e, "Skipping arm without a usable model");
                }
            }
        }

        let arm_id = pick_best(&scores).unwrap_or(first.id);
        debug!(
            experiment_id = %experiment_id,
            arm_id = %arm_id,
            scored = scores.len(),
            alpha = alpha,
            "Arm selected by LinUCB"
        );
        Ok(arm_id)
    }

    /// `A += xxᵀ`, `b += r·x`, `θ = A⁻¹b`. Updates to one arm are serialized.
    pub async fn update(
        &self,
        arm_id: Uuid,
        context: &UserContext,
        reward: f64,
    ) -> ExperimentResult<LinUcbModel> {
        let lock = self
            .locks
            .entry(arm_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let mut model = self.get_model(arm_id).await?;
        if !has_feature_shape(&model) {
            return Err(ExperimentError::Validation(format!(
                "model for arm {arm_id} has shape A={:?} b={} theta={}, expected {FEATURE_DIM}",
                model.a.dim(),
                model.b.len(),
                model.theta.len()
            )));
        }

        let x = extract_features(context, Utc::now());
        model.a += &outer(&x);
        model.b.scaled_add(reward, &x);
        match solve(&model.a, &model.b) {
            Some(theta) => model.theta = theta,
            None => warn!(arm_id = %arm_id, "Design matrix is singular, keeping previous theta"),
        }
        model.samples += 1;
        model.updated_at = Utc::now();

        self.store.save_linucb_model(&model).await?;
        debug!(arm_id = %arm_id, reward = reward, samples = model.samples, "LinUCB model updated");
        Ok(model)
    }
}
