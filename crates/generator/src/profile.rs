use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Random-walk parameters for one monitored directory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesProfile {
    pub base: f64,
    pub volatility: f64,
    pub drift: f64,
    pub spike_probability: f64,
    pub drop_probability: f64,
}

impl SeriesProfile {
    pub const fn new(
        base: f64,
        volatility: f64,
        drift: f64,
        spike_probability: f64,
        drop_probability: f64,
    ) -> Self {
        Self {
            base,
            volatility,
            drift,
            spike_probability,
            drop_probability,
        }
    }

    pub fn validate(&self, series: &str) -> Result<(), ProfileError> {
        let fields = [
            ("base", self.base),
            ("volatility", self.volatility),
            ("drift", self.drift),
            ("spike_probability", self.spike_probability),
            ("drop_probability", self.drop_probability),
        ];
        for (field, value) in fields {
            if !value.is_finite() {
                return Err(ProfileError::Invalid {
                    series: series.to_string(),
                    reason: format!("{field} must be finite"),
                });
            }
        }
        if self.base < 0.0 || self.volatility < 0.0 {
            return Err(ProfileError::Invalid {
                series: series.to_string(),
                reason: "base and volatility must be non-negative".into(),
            });
        }
        for (field, p) in [
            ("spike_probability", self.spike_probability),
            ("drop_probability", self.drop_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(ProfileError::Invalid {
                    series: series.to_string(),
                    reason: format!("{field} must lie in [0, 1], got {p}"),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("failed to read profile file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse profile file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("profile table is empty")]
    Empty,
    #[error("invalid profile for `{series}`: {reason}")]
    Invalid { series: String, reason: String },
}

/// Immutable series-name → profile table, iterated in name order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileTable(BTreeMap<String, SeriesProfile>);

impl ProfileTable {
    pub fn new(profiles: BTreeMap<String, SeriesProfile>) -> Result<Self, ProfileError> {
        if profiles.is_empty() {
            return Err(ProfileError::Empty);
        }
        for (series, profile) in &profiles {
            profile.validate(series)?;
        }
        Ok(Self(profiles))
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ProfileError> {
        let profiles: BTreeMap<String, SeriesProfile> = serde_json::from_str(raw)?;
        Self::new(profiles)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ProfileError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn get(&self, series: &str) -> Option<&SeriesProfile> {
        self.0.get(series)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SeriesProfile)> {
        self.0.iter().map(|(name, profile)| (name.as_str(), profile))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for ProfileTable {
    fn default() -> Self {
        let profiles = [
            ("/scratch", SeriesProfile::new(1500.0, 6.5, 0.008, 0.004, 0.003)),
            ("/projects", SeriesProfile::new(900.0, 4.0, 0.0055, 0.0025, 0.002)),
            ("/customer", SeriesProfile::new(600.0, 2.0, 0.003, 0.0015, 0.001)),
            ("/info", SeriesProfile::new(400.0, 1.2, 0.0018, 0.001, 0.0008)),
        ];
        Self(
            profiles
                .into_iter()
                .map(|(name, profile)| (name.to_string(), profile))
                .collect(),
        )
    }
}
