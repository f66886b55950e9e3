//! Beta(α, β) deviates for Thompson sampling.
//!
//! Regimes:
//! - both shapes below one: Johnk's method;
//! - otherwise: ratio of two Marsaglia–Tsang gamma deviates, three attempts,
//!   then Cheng's rejection algorithm. A shape below one is drawn with the
//!   shape raised by one and rescaled by `U^(1/shape)`.
//!
//! Non-positive or non-finite shapes yield a uniform deviate. Every path
//! terminates; pathological inputs fall back to the posterior mean.

use rand::Rng;
use rand_distr::StandardNormal;

const GAMMA_ATTEMPTS: usize = 3;
const MAX_GAMMA_ITERATIONS: usize = 256;
const MAX_REJECTION_ITERATIONS: usize = 10_000;

/// Draw one Beta(α, β) deviate using the thread-local generator.
pub fn beta_sample(alpha: f64, beta: f64) -> f64 {
    sample_beta(&mut rand::thread_rng(), alpha, beta)
}

/// Draw one Beta(α, β) deviate in `[0, 1]`.
pub fn sample_beta<R: Rng + ?Sized>(rng: &mut R, alpha: f64, beta: f64) -> f64 {
    if !(alpha > 0.0 && beta > 0.0 && alpha.is_finite() && beta.is_finite()) {
        return rng.gen::<f64>();
    }

    let value = if alpha < 1.0 && beta < 1.0 {
        johnk(rng, alpha, beta)
    } else {
        gamma_ratio(rng, alpha, beta).unwrap_or_else(|| cheng(rng, alpha, beta))
    };

    value.clamp(0.0, 1.0)
}

/// Uniform on (0, 1).
fn open_uniform<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    loop {
        let u: f64 = rng.gen();
        if u > 0.0 {
            return u;
        }
    }
}

fn mean(alpha: f64, beta: f64) -> f64 {
    alpha / (alpha + beta)
}

fn johnk<R: Rng + ?Sized>(rng: &mut R, alpha: f64, beta: f64) -> f64 {
    for _ in 0..MAX_REJECTION_ITERATIONS {
        let x = open_uniform(rng).powf(1.0 / alpha);
        let y = open_uniform(rng).powf(1.0 / beta);
        let sum = x + y;
        if sum <= 1.0 && sum > 0.0 {
            return x / sum;
        }
    }
    mean(alpha, beta)
}

fn gamma_ratio<R: Rng + ?Sized>(rng: &mut R, alpha: f64, beta: f64) -> Option<f64> {
    for _ in 0..GAMMA_ATTEMPTS {
        let (Some(ga), Some(gb)) = (gamma(rng, alpha), gamma(rng, beta)) else {
            continue;
        };
        let sum = ga + gb;
        if sum > 0.0 && sum.is_finite() {
            return Some(ga / sum);
        }
    }
    None
}

/// Gamma(shape, 1) for any positive shape.
fn gamma<R: Rng + ?Sized>(rng: &mut R, shape: f64) -> Option<f64> {
    if shape < 1.0 {
        let boosted = marsaglia_tsang(rng, shape + 1.0)?;
        return Some(boosted * open_uniform(rng).powf(1.0 / shape));
    }
    marsaglia_tsang(rng, shape)
}

/// Marsaglia–Tsang Gamma(shape, 1) for shape >= 1.
fn marsaglia_tsang<R: Rng + ?Sized>(rng: &mut R, shape: f64) -> Option<f64> {
    let d = shape - 1.0 / 3.0;
    let c = 1.0 / (9.0 * d).sqrt();
    for _ in 0..MAX_GAMMA_ITERATIONS {
        let x: f64 = rng.sample(StandardNormal);
        let v = 1.0 + c * x;
        if v <= 0.0 {
            continue;
        }
        let v = v * v * v;
        let u = open_uniform(rng);
        let x2 = x * x;
        if u < 1.0 - 0.0331 * x2 * x2 || u.ln() < 0.5 * x2 + d * (1.0 - v + v.ln()) {
            return Some(d * v);
        }
    }
    None
}

/// Cheng's algorithm BA, valid for any positive shapes.
fn cheng<R: Rng + ?Sized>(rng: &mut R, alpha: f64, beta: f64) -> f64 {
    let sum = alpha + beta;
    let min = alpha.min(beta);
    let scale = if min <= 1.0 {
        1.0 / min
    } else {
        ((sum - 2.0) / (2.0 * alpha * beta - sum)).sqrt()
    };
    let shift = alpha + 1.0 / scale;
    let ln4 = 4f64.ln();

    for _ in 0..MAX_REJECTION_ITERATIONS {
        let u1 = open_uniform(rng);
        let u2 = open_uniform(rng);
        if u1 >= 1.0 {
            continue;
        }
        let v = scale * (u1 / (1.0 - u1)).ln();
        let w = alpha * v.exp();
        if !w.is_finite() {
            continue;
        }
        let lhs = sum * (sum / (beta + w)).ln() + shift * v - ln4;
        if lhs >= (u1 * u1 * u2).ln() {
            return w / (beta + w);
        }
    }
    mean(alpha, beta)
}
