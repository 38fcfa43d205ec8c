//! Failure classification and recovery decisions.
//!
//! Every stage failure passes through [`RecoveryManager::handle`], which
//! classifies it into an [`ErrorCategory`], looks up the retry policy bound to
//! that category and the item's failure count at the stage, and returns the
//! [`RecoveryAction`] the scheduler must apply. Each decision is appended to
//! the audit log as an [`ErrorRecord`].

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::config::{bounded_delay, ClassificationRule, ConfigError, RunConfig, MAX_DELAY_SECS};
use super::item::{ErrorRecord, WorkItem};
use crate::error::{ErrorCategory, StageFailure};

/// Backoff or escalation strategy bound to one error category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPolicy {
    ExponentialBackoff {
        base_secs: f64,
        max_delay_secs: f64,
        max_attempts: u32,
    },
    LinearBackoff {
        step_secs: f64,
        max_attempts: u32,
    },
    /// Abort the whole run.
    ImmediateStop,
    /// Surface the item for a human; never retried.
    ManualIntervention,
}

impl RetryPolicy {
    /// Policy bound to `category` when the configuration names none.
    pub fn default_for(category: ErrorCategory) -> Self {
        match category {
            ErrorCategory::System | ErrorCategory::ExternalService => {
                RetryPolicy::ExponentialBackoff {
                    base_secs: 1.0,
                    max_delay_secs: 30.0,
                    max_attempts: 5,
                }
            }
            ErrorCategory::Resource => RetryPolicy::ImmediateStop,
            ErrorCategory::Business => RetryPolicy::ManualIntervention,
        }
    }

    /// Delay before retrying after the `attempt`-th failure (1-based), or
    /// `None` once the policy's attempts are exhausted or it never retries.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match self {
            RetryPolicy::ExponentialBackoff {
                base_secs,
                max_delay_secs,
                max_attempts,
            } => {
                if attempt == 0 || attempt > *max_attempts {
                    return None;
                }
                let exponent = (attempt - 1).min(63) as i32;
                let secs = (base_secs * 2f64.powi(exponent)).min(*max_delay_secs);
                Some(bounded_delay(secs))
            }
            RetryPolicy::LinearBackoff {
                step_secs,
                max_attempts,
            } => {
                if attempt == 0 || attempt > *max_attempts {
                    return None;
                }
                Some(bounded_delay(step_secs * attempt as f64))
            }
            RetryPolicy::ImmediateStop | RetryPolicy::ManualIntervention => None,
        }
    }

    pub fn validate(&self, category: ErrorCategory) -> Result<(), ConfigError> {
        let invalid = |message: &str| {
            Err(ConfigError::ValidationFailed(format!(
                "retry_policies.{}: {}",
                category, message
            )))
        };
        match self {
            RetryPolicy::ExponentialBackoff {
                base_secs,
                max_delay_secs,
                max_attempts,
            } => {
                if !(*base_secs > 0.0 && *base_secs <= MAX_DELAY_SECS) {
                    return invalid("base_secs must be in (0, 86400]");
                }
                if !(*base_secs..=MAX_DELAY_SECS).contains(max_delay_secs) {
                    return invalid("max_delay_secs must be between base_secs and 86400");
                }
                if *max_attempts == 0 {
                    return invalid("max_attempts must be greater than 0");
                }
            }
            RetryPolicy::LinearBackoff {
                step_secs,
                max_attempts,
            } => {
                if !(*step_secs > 0.0 && *step_secs <= MAX_DELAY_SECS) {
                    return invalid("step_secs must be in (0, 86400]");
                }
                if *max_attempts == 0 {
                    return invalid("max_attempts must be greater than 0");
                }
            }
            RetryPolicy::ImmediateStop | RetryPolicy::ManualIntervention => {}
        }
        Ok(())
    }
}

/// What the scheduler does with a failed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Requeue as a deferred entry at the same stage.
    RetryAfter { delay_ms: u64 },
    /// Mark the item failed terminally.
    Drop,
    /// Mark the item failed and flag it for manual review.
    Escalate,
    /// Abort the run after a forced checkpoint.
    AbortRun,
}

impl RecoveryAction {
    pub fn retry_after(delay: Duration) -> Self {
        RecoveryAction::RetryAfter {
            delay_ms: delay.as_millis().min(u64::MAX as u128) as u64,
        }
    }

    pub fn delay(&self) -> Option<Duration> {
        match self {
            RecoveryAction::RetryAfter { delay_ms } => Some(Duration::from_millis(*delay_ms)),
            _ => None,
        }
    }
}

/// Maps failure messages to categories using configured patterns.
#[derive(Debug)]
pub struct ErrorClassifier {
    rules: Vec<(Regex, ErrorCategory)>,
    default_category: ErrorCategory,
}

impl ErrorClassifier {
    /// Compiles the rule set once. Patterns match case-insensitively, first
    /// match wins.
    pub fn new(
        rules: &[ClassificationRule],
        default_category: ErrorCategory,
    ) -> Result<Self, ConfigError> {
        let rules = rules
            .iter()
            .enumerate()
            .map(|(index, rule)| {
                Regex::new(&format!("(?i){}", rule.pattern))
                    .map(|regex| (regex, rule.category))
                    .map_err(|e| ConfigError::InvalidValue {
                        key: format!("classification_rules[{}].pattern", index),
                        message: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            rules,
            default_category,
        })
    }

    /// The failing layer's hint wins; then the first matching rule; then the
    /// configured default.
    pub fn classify(&self, failure: &StageFailure) -> ErrorCategory {
        if let Some(hint) = failure.hint {
            return hint;
        }
        self.rules
            .iter()
            .find(|(regex, _)| regex.is_match(&failure.message))
            .map(|(_, category)| *category)
            .unwrap_or(self.default_category)
    }
}

/// Applies retry policies and keeps the audit log of every failure.
#[derive(Debug)]
pub struct RecoveryManager {
    classifier: ErrorClassifier,
    policies: BTreeMap<ErrorCategory, RetryPolicy>,
    escalate_on_exhaustion: bool,
    records: Mutex<Vec<ErrorRecord>>,
}

impl RecoveryManager {
    pub fn new(
        classifier: ErrorClassifier,
        policies: BTreeMap<ErrorCategory, RetryPolicy>,
        escalate_on_exhaustion: bool,
    ) -> Self {
        Self {
            classifier,
            policies,
            escalate_on_exhaustion,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(config: &RunConfig) -> Result<Self, ConfigError> {
        let classifier =
            ErrorClassifier::new(&config.classification_rules, config.default_error_category)?;
        Ok(Self::new(
            classifier,
            config.retry_policies.clone(),
            config.escalate_on_exhaustion,
        ))
    }

    /// Seeds the audit log with records carried over from a checkpoint.
    pub fn with_records(self, records: Vec<ErrorRecord>) -> Self {
        *self.records.lock().unwrap_or_else(|e| e.into_inner()) = records;
        self
    }

    pub fn classify(&self, failure: &StageFailure) -> ErrorCategory {
        self.classifier.classify(failure)
    }

    /// Action for the `attempt`-th failure (1-based) in `category`.
    pub fn decide(&self, category: ErrorCategory, attempt: u32) -> RecoveryAction {
        let policy = match self.policies.get(&category) {
            Some(policy) => policy,
            None => return RecoveryAction::Escalate,
        };
        match policy {
            RetryPolicy::ImmediateStop => RecoveryAction::AbortRun,
            RetryPolicy::ManualIntervention => RecoveryAction::Escalate,
            backoff => match backoff.delay_for(attempt) {
                Some(delay) => RecoveryAction::retry_after(delay),
                None if self.escalate_on_exhaustion => RecoveryAction::Escalate,
                None => RecoveryAction::Drop,
            },
        }
    }

    /// Classifies a failure of `item` at its current stage, counts it, and
    /// records the resulting decision. The caller applies the action.
    pub fn handle(&self, item: &mut WorkItem, failure: &StageFailure) -> ErrorRecord {
        let category = self.classify(failure);
        let attempt = item.record_failure();
        let action = self.decide(category, attempt);

        warn!(
            item_id = %item.id,
            stage = %failure.stage,
            category = %category,
            attempt,
            action = ?action,
            "Stage failed: {}",
            failure.message
        );

        let record = ErrorRecord {
            item_id: item.id,
            stage: failure.stage,
            category,
            message: failure.message.clone(),
            attempt,
            action,
            timestamp: Utc::now(),
        };
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        record
    }

    /// Every failure recorded so far, oldest first.
    pub fn records(&self) -> Vec<ErrorRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
