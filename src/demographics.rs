//! Demographic profiles: trait name → known value or probability distribution.
//!
//! A profile is either a matching *target* (a run's demographic constraints) or a
//! persona's known demographics. Absent traits mean "no information".

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Keys that carry record metadata rather than demographic traits.
pub const METADATA_KEYS: &[&str] = &["id", "custom_tags"];

/// Slack allowed on a distribution's total mass before it is rejected.
const MASS_TOLERANCE: f64 = 1e-6;

/// A deterministic trait value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl ScalarValue {
    /// Normalized form used for case-insensitive comparison.
    pub fn match_key(&self) -> String {
        self.to_string().trim().to_lowercase()
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Bool(b) => write!(f, "{b}"),
            // 30.0 renders as "30" so numeric ages compare equal to "30".
            ScalarValue::Number(n) if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 => {
                write!(f, "{}", *n as i64)
            }
            ScalarValue::Number(n) => write!(f, "{n}"),
            ScalarValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ScalarValue {
    fn from(s: &str) -> Self {
        ScalarValue::Text(s.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(s: String) -> Self {
        ScalarValue::Text(s)
    }
}

impl From<f64> for ScalarValue {
    fn from(n: f64) -> Self {
        ScalarValue::Number(n)
    }
}

impl From<bool> for ScalarValue {
    fn from(b: bool) -> Self {
        ScalarValue::Bool(b)
    }
}

/// A trait's value: known outright, or a distribution over values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TraitValue {
    Scalar(ScalarValue),
    Distribution(BTreeMap<String, f64>),
}

impl TraitValue {
    pub fn scalar(value: impl Into<ScalarValue>) -> Self {
        TraitValue::Scalar(value.into())
    }

    pub fn distribution<K: Into<String>>(masses: impl IntoIterator<Item = (K, f64)>) -> Self {
        TraitValue::Distribution(masses.into_iter().map(|(k, p)| (k.into(), p)).collect())
    }

    /// Probability this value assigns to `value`.
    ///
    /// Distributions are looked up exactly first, then case-insensitively.
    /// Scalars give 1.0 on a case-insensitive match and `mismatch` otherwise.
    pub fn probability_of(&self, value: &ScalarValue, mismatch: f64) -> f64 {
        match self {
            TraitValue::Scalar(own) => {
                if own.match_key() == value.match_key() {
                    1.0
                } else {
                    mismatch
                }
            }
            TraitValue::Distribution(masses) => {
                let rendered = value.to_string();
                if let Some(p) = masses.get(&rendered) {
                    return p.max(0.0);
                }
                let key = value.match_key();
                masses
                    .iter()
                    .find(|(k, _)| k.trim().to_lowercase() == key)
                    .map(|(_, p)| p.max(0.0))
                    .unwrap_or(0.0)
            }
        }
    }

    /// Most likely value, for rendering a distribution into a prompt.
    pub fn modal_value(&self) -> Option<String> {
        match self {
            TraitValue::Scalar(v) => Some(v.to_string()),
            TraitValue::Distribution(masses) => masses
                .iter()
                .filter(|(_, p)| p.is_finite())
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(k, _)| k.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DemographicError {
    #[error("trait '{trait_name}' has invalid probability {value} for '{key}'")]
    InvalidProbability {
        trait_name: String,
        key: String,
        value: f64,
    },
    #[error("trait '{trait_name}' distribution sums to {total} (> 1)")]
    MassExceeded { trait_name: String, total: f64 },
}

/// Mapping from trait name to value. Null entries in stored JSON are dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, Option<TraitValue>>",
    into = "BTreeMap<String, TraitValue>"
)]
pub struct DemographicProfile {
    traits: BTreeMap<String, TraitValue>,
}

impl From<BTreeMap<String, Option<TraitValue>>> for DemographicProfile {
    fn from(raw: BTreeMap<String, Option<TraitValue>>) -> Self {
        Self {
            traits: raw
                .into_iter()
                .filter_map(|(k, v)| v.map(|v| (k, v)))
                .collect(),
        }
    }
}

impl From<DemographicProfile> for BTreeMap<String, TraitValue> {
    fn from(profile: DemographicProfile) -> Self {
        profile.traits
    }
}

impl DemographicProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: TraitValue) -> Self {
        self.traits.insert(name.into(), value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: TraitValue) {
        self.traits.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&TraitValue> {
        self.traits.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.traits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.traits.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TraitValue)> {
        self.traits.iter()
    }

    /// Demographic traits, skipping metadata keys.
    pub fn demographic_traits(&self) -> impl Iterator<Item = (&String, &TraitValue)> {
        self.traits
            .iter()
            .filter(|(k, _)| !METADATA_KEYS.contains(&k.as_str()))
    }

    /// Check every distribution has finite, non-negative masses summing to at most 1.
    pub fn validate(&self) -> Result<(), DemographicError> {
        for (name, value) in &self.traits {
            let TraitValue::Distribution(masses) = value else {
                continue;
            };
            let mut total = 0.0;
            for (key, p) in masses {
                if !p.is_finite() || *p < 0.0 {
                    return Err(DemographicError::InvalidProbability {
                        trait_name: name.clone(),
                        key: key.clone(),
                        value: *p,
                    });
                }
                total += p;
            }
            if total > 1.0 + MASS_TOLERANCE {
                return Err(DemographicError::MassExceeded {
                    trait_name: name.clone(),
                    total,
                });
            }
        }
        Ok(())
    }
}
