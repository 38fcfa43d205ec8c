//! Admission scoring.
//!
//! The engine composes criterion scores that collaborators already normalized
//! to [0, 1]; it does no domain scoring of its own. Hard filters are evaluated
//! first and force `reject` when any fires. The composite is always computed
//! so rejected items still report it. Output depends only on the inputs and
//! the configuration.

use std::collections::BTreeMap;

use chrono::Utc;
use thiserror::Error;

use super::config::{DecisionConfig, WEIGHT_EPSILON};
use super::item::{DecisionRecord, Tier};

/// Slack allowed when a composite sits on a threshold.
const THRESHOLD_EPSILON: f64 = 1e-9;

#[derive(Debug, Error, PartialEq)]
pub enum DecisionError {
    #[error("Decision weights must sum to 1.0, got {0:.6}")]
    InvalidWeights(f64),

    #[error("Missing score for criterion '{0}'")]
    MissingCriterion(String),

    #[error("Score for criterion '{criterion}' out of range: {value}")]
    OutOfRange { criterion: String, value: f64 },
}

#[derive(Debug, Clone)]
pub struct DecisionEngine {
    weights: BTreeMap<String, f64>,
    hard_filters: BTreeMap<String, f64>,
    submission_threshold: f64,
    priority_threshold: f64,
    review_floor: f64,
}

impl DecisionEngine {
    pub fn new(config: &DecisionConfig) -> Result<Self, DecisionError> {
        let sum: f64 = config.weights.values().sum();
        if config.weights.is_empty() || (sum - 1.0).abs() > WEIGHT_EPSILON {
            return Err(DecisionError::InvalidWeights(sum));
        }

        Ok(Self {
            weights: config.weights.clone(),
            hard_filters: config.hard_filters.clone(),
            submission_threshold: config.submission_threshold,
            priority_threshold: config.priority_threshold,
            review_floor: config.review_floor,
        })
    }

    /// Criteria that must be present before an item can be decided.
    pub fn required_criteria(&self) -> impl Iterator<Item = &str> {
        self.weights
            .keys()
            .chain(self.hard_filters.keys())
            .map(String::as_str)
    }

    /// Produces the decision record for a complete set of criterion scores.
    pub fn decide(&self, scores: &BTreeMap<String, f64>) -> Result<DecisionRecord, DecisionError> {
        for criterion in self.required_criteria() {
            let value = *scores
                .get(criterion)
                .ok_or_else(|| DecisionError::MissingCriterion(criterion.to_string()))?;
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(DecisionError::OutOfRange {
                    criterion: criterion.to_string(),
                    value,
                });
            }
        }

        let filters_fired: Vec<String> = self
            .hard_filters
            .iter()
            .filter(|(criterion, floor)| scores.get(*criterion).is_some_and(|s| s < *floor))
            .map(|(criterion, _)| criterion.clone())
            .collect();

        let composite: f64 = self
            .weights
            .iter()
            .map(|(criterion, weight)| weight * scores.get(criterion).copied().unwrap_or(0.0))
            .sum();

        let tier = if !filters_fired.is_empty() {
            Tier::Reject
        } else if reaches(composite, self.submission_threshold) {
            Tier::Submit
        } else if reaches(composite, self.review_floor) {
            Tier::Review
        } else {
            Tier::Reject
        };

        let high_priority = tier == Tier::Review && reaches(composite, self.priority_threshold);

        Ok(DecisionRecord {
            scores: scores.clone(),
            weights: self.weights.clone(),
            composite,
            tier,
            filters_fired,
            high_priority,
            decided_at: Utc::now(),
        })
    }
}

/// Threshold comparison that ignores summation-order rounding.
fn reaches(composite: f64, threshold: f64) -> bool {
    composite + THRESHOLD_EPSILON >= threshold
}
