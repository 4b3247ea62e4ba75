//! Random-walk synthesis of storage usage values.

mod profile;

pub use profile::{ProfileError, ProfileTable, SeriesProfile};

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

const SPIKE_RANGE: std::ops::Range<f64> = 10.0..60.0;
const DROP_RANGE: std::ops::Range<f64> = 5.0..80.0;
const FALLBACK_STEP: f64 = 0.01;

/// One generated step: the new level plus the deltas derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub value: f64,
    pub added: f64,
    pub deleted: f64,
    pub updated: f64,
}

impl Reading {
    /// Minimal positive increment used whenever a step cannot be computed.
    pub fn fallback(prev: f64) -> Self {
        let prev = if prev.is_finite() { prev.max(0.0) } else { 0.0 };
        Self {
            value: round2(prev + FALLBACK_STEP),
            added: FALLBACK_STEP,
            deleted: 0.0,
            updated: FALLBACK_STEP,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum GenerateError {
    #[error("previous value {0} is not finite")]
    NonFinitePrevious(f64),
    #[error("invalid normal distribution (mean {mean}, std dev {std_dev})")]
    Distribution { mean: f64, std_dev: f64 },
    #[error("probability {0} outside [0, 1]")]
    Probability(f64),
    #[error("generated value is not finite")]
    NonFiniteResult,
}

/// Produces the next reading. Never fails: any undefined step resolves to
/// [`Reading::fallback`].
pub fn next_value<R: Rng + ?Sized>(rng: &mut R, prev: f64, profile: &SeriesProfile) -> Reading {
    match try_next_value(rng, prev, profile) {
        Ok(reading) => reading,
        Err(err) => {
            warn!(error = %err, prev, "generator fell back to minimal increment");
            Reading::fallback(prev)
        }
    }
}

pub fn try_next_value<R: Rng + ?Sized>(
    rng: &mut R,
    prev: f64,
    profile: &SeriesProfile,
) -> Result<Reading, GenerateError> {
    if !prev.is_finite() {
        return Err(GenerateError::NonFinitePrevious(prev));
    }

    let drift = sample_normal(rng, profile.drift, (profile.drift * 0.25).abs())?;
    let mut change = sample_normal(rng, 0.0, profile.volatility)?;
    if chance(rng, profile.spike_probability)? {
        change += rng.gen_range(SPIKE_RANGE);
    }
    if chance(rng, profile.drop_probability)? {
        change -= rng.gen_range(DROP_RANGE);
    }

    let raw = prev + drift + change;
    if !raw.is_finite() {
        return Err(GenerateError::NonFiniteResult);
    }
    let value = round2(raw.max(0.0));
    let delta = value - prev;

    Ok(Reading {
        value,
        added: round2(delta.max(0.0)),
        deleted: round2((-delta).max(0.0)),
        updated: round2(delta.abs()),
    })
}

fn sample_normal<R: Rng + ?Sized>(
    rng: &mut R,
    mean: f64,
    std_dev: f64,
) -> Result<f64, GenerateError> {
    let dist =
        Normal::new(mean, std_dev).map_err(|_| GenerateError::Distribution { mean, std_dev })?;
    let draw = dist.sample(rng);
    if draw.is_finite() {
        Ok(draw)
    } else {
        Err(GenerateError::Distribution { mean, std_dev })
    }
}

fn chance<R: Rng + ?Sized>(rng: &mut R, p: f64) -> Result<bool, GenerateError> {
    if !(0.0..=1.0).contains(&p) {
        return Err(GenerateError::Probability(p));
    }
    Ok(rng.gen_bool(p))
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
