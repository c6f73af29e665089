//! Weighted persona matching.
//!
//! The weight of a (target, candidate) pair is the product, over the target's
//! demographic traits, of the probability that the candidate has the target's
//! value. Targets are then assigned to personas by maximum-weight bipartite
//! matching, so the total weight is globally optimal rather than greedy.
//!
//! Two floors keep every pairing feasible:
//! - a scalar mismatch (or a trait the candidate does not state) contributes
//!   `mismatch_epsilon` instead of zero;
//! - a candidate with no demographic information at all weighs `uninformative_floor`
//!   against any target.
//!
//! An empty target weighs 1.0 against every informative candidate (empty product).
//! That is a policy point: untargeted runs still produce a usable match, but every
//! informative persona ties.

use nalgebra::DMatrix;
use tracing::debug;

use crate::assignment::{max_weight_assignment, AssignmentError};
use crate::demographics::{DemographicProfile, TraitValue};
use crate::model::Persona;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchParams {
    /// Probability credited to a scalar trait that does not match.
    pub mismatch_epsilon: f64,
    /// Weight of a candidate with no demographics against any target.
    pub uninformative_floor: f64,
}

impl Default for MatchParams {
    fn default() -> Self {
        Self {
            mismatch_epsilon: 0.01,
            uninformative_floor: 0.001,
        }
    }
}

/// A target paired with the persona assigned to it.
#[derive(Debug, Clone)]
pub struct PersonaMatch<'a> {
    pub target_index: usize,
    pub persona: &'a Persona,
    pub weight: f64,
}

#[derive(Debug, Clone, Default)]
pub struct WeightedMatcher {
    params: MatchParams,
}

impl WeightedMatcher {
    pub fn new(params: MatchParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> MatchParams {
        self.params
    }

    /// Likelihood that `candidate` matches `target`.
    pub fn weight(&self, target: &DemographicProfile, candidate: &DemographicProfile) -> f64 {
        if candidate.demographic_traits().next().is_none() {
            return self.params.uninformative_floor;
        }

        let eps = self.params.mismatch_epsilon;
        let weight: f64 = target
            .demographic_traits()
            .map(|(name, wanted)| {
                let Some(known) = candidate.get(name) else {
                    return eps;
                };
                match wanted {
                    TraitValue::Scalar(value) => known.probability_of(value, eps),
                    // Expected agreement when the target itself is uncertain.
                    TraitValue::Distribution(masses) => masses
                        .iter()
                        .map(|(value, p)| {
                            p.max(0.0) * known.probability_of(&value.as_str().into(), eps)
                        })
                        .sum(),
                }
            })
            .product();

        if weight.is_finite() {
            weight
        } else {
            0.0
        }
    }

    /// `|targets| × |candidates|` weight matrix.
    pub fn weight_matrix(
        &self,
        targets: &[DemographicProfile],
        candidates: &[Persona],
    ) -> DMatrix<f64> {
        DMatrix::from_fn(targets.len(), candidates.len(), |i, j| {
            self.weight(&targets[i], &candidates[j].demographics)
        })
    }

    /// Optimal one-to-one assignment of targets to personas.
    ///
    /// Returns `min(|targets|, |candidates|)` matches ordered by target index; no
    /// target or persona appears twice. Empty if either side is empty.
    pub fn match_personas<'a>(
        &self,
        targets: &[DemographicProfile],
        candidates: &'a [Persona],
    ) -> Result<Vec<PersonaMatch<'a>>, AssignmentError> {
        if targets.is_empty() || candidates.is_empty() {
            return Ok(Vec::new());
        }

        let weights = self.weight_matrix(targets, candidates);
        let pairs = max_weight_assignment(&weights)?;
        debug!(
            targets = targets.len(),
            candidates = candidates.len(),
            matched = pairs.len(),
            "solved persona assignment"
        );

        Ok(pairs
            .into_iter()
            .map(|(i, j)| PersonaMatch {
                target_index: i,
                persona: &candidates[j],
                weight: weights[(i, j)],
            })
            .collect())
    }
}
