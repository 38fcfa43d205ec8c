//! Run configuration for the orchestrator.
//!
//! This module provides the options for one pipeline run: stage order,
//! decision weights and thresholds, retry policy bindings, concurrency and
//! submission throttling, checkpoint cadence and retention, and collaborator
//! endpoints. A configuration is validated once, wrapped in `Arc`, and handed
//! to every component at construction.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::item::Stage;
use super::recovery::{ErrorClassifier, RetryPolicy};
use crate::error::ErrorCategory;

/// Tolerance for the decision weight sum.
pub const WEIGHT_EPSILON: f64 = 1e-6;

/// Upper bound for any configured delay: submission spacing and retry waits.
pub const MAX_DELAY_SECS: f64 = 86_400.0;

/// Upper bound for the smart-delay spacing multiplier.
pub const MAX_SMART_MULTIPLIER: f64 = 100.0;

/// Seconds to a `Duration`, clamped to `[0, MAX_DELAY_SECS]`.
pub(crate) fn bounded_delay(secs: f64) -> Duration {
    if secs.is_nan() {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(secs.clamp(0.0, MAX_DELAY_SECS))
}

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// The resumed checkpoint was written under a different configuration.
    #[error("Configuration drift: checkpoint hash {stored} does not match current {current}")]
    Drift { stored: String, current: String },

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Upstream search parameters used at ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub query: String,
    pub limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            query: "software engineer".to_string(),
            limit: 50,
        }
    }
}

/// Decision weights, hard filters and tier thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// Criterion name to weight; weights sum to 1.0.
    pub weights: BTreeMap<String, f64>,
    /// Criterion name to floor; a score below its floor forces `reject`.
    pub hard_filters: BTreeMap<String, f64>,
    pub submission_threshold: f64,
    pub priority_threshold: f64,
    pub review_floor: f64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        let weights = [
            ("semantic_match", 0.3),
            ("salary", 0.2),
            ("experience", 0.2),
            ("location", 0.1),
            ("company", 0.1),
            ("skills", 0.1),
        ]
        .into_iter()
        .map(|(name, weight)| (name.to_string(), weight))
        .collect();

        Self {
            weights,
            hard_filters: BTreeMap::new(),
            submission_threshold: 0.7,
            priority_threshold: 0.6,
            review_floor: 0.4,
        }
    }
}

/// Pattern to category mapping used by the error classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRule {
    pub pattern: String,
    pub category: ErrorCategory,
}

impl ClassificationRule {
    pub fn new(pattern: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            pattern: pattern.into(),
            category,
        }
    }
}

/// Adaptive spacing of submissions after recent failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartDelayConfig {
    pub enabled: bool,
    /// Number of recent submissions considered.
    pub window: usize,
    /// Failure ratio above which spacing is multiplied.
    pub failure_ratio: f64,
    pub multiplier: f64,
}

impl Default for SmartDelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window: 10,
            failure_ratio: 0.3,
            multiplier: 2.0,
        }
    }
}

/// Checkpoint retention. The newest checkpoint is always kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub max_count: Option<usize>,
    pub max_age_secs: Option<u64>,
}

/// Where the HTTP collaborators live and where offline inputs come from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaboratorConfig {
    /// Base URL of the collaborator service.
    pub base_url: Option<String>,
    /// JSON array of candidate payloads used instead of remote search.
    pub candidates_file: Option<PathBuf>,
    /// Resume document (JSON) passed to matching and submission.
    pub resume_file: Option<PathBuf>,
}

/// Configuration for one orchestrator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    // Identity
    /// Key under which checkpoints are stored.
    pub run_id: String,
    /// Ordered pipeline stages.
    pub stages: Vec<Stage>,
    pub search: SearchConfig,

    // Decision
    pub decision: DecisionConfig,

    // Recovery
    /// Exactly one policy per error category.
    pub retry_policies: BTreeMap<ErrorCategory, RetryPolicy>,
    pub classification_rules: Vec<ClassificationRule>,
    pub default_error_category: ErrorCategory,
    /// Escalate exhausted backoff policies; drop the item otherwise.
    pub escalate_on_exhaustion: bool,

    // Scheduling
    pub max_concurrency: usize,
    /// Per collaborator call timeout.
    pub stage_timeout_secs: u64,
    /// Minimum spacing between dispatched submissions.
    pub submission_delay_secs: f64,
    pub smart_delay: SmartDelayConfig,

    // Checkpointing
    /// Checkpoint every N stage steps.
    pub checkpoint_interval: u64,
    /// Optional time-based cadence in addition to the step count.
    pub checkpoint_every_secs: Option<u64>,
    pub checkpoint_dir: PathBuf,
    pub retention: RetentionPolicy,

    // Run mode
    pub dry_run: bool,
    pub resume: bool,
    pub allow_config_drift: bool,

    // Normalization
    /// Currency code to value of one unit in `base_currency`.
    pub currency_rates: BTreeMap<String, f64>,
    pub base_currency: String,
    /// Maximum cached bridge transforms; 0 disables the cache.
    pub bridge_cache_size: usize,

    pub collaborators: CollaboratorConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        let retry_policies = ErrorCategory::ALL
            .into_iter()
            .map(|category| (category, RetryPolicy::default_for(category)))
            .collect();

        let currency_rates = [("USD", 1.0), ("EUR", 1.08), ("GBP", 1.27), ("CAD", 0.73)]
            .into_iter()
            .map(|(code, rate)| (code.to_string(), rate))
            .collect();

        Self {
            run_id: "default".to_string(),
            stages: Stage::ALL.to_vec(),
            search: SearchConfig::default(),

            decision: DecisionConfig::default(),

            retry_policies,
            classification_rules: default_classification_rules(),
            default_error_category: ErrorCategory::ExternalService,
            escalate_on_exhaustion: true,

            max_concurrency: 4,
            stage_timeout_secs: 30,
            submission_delay_secs: 5.0,
            smart_delay: SmartDelayConfig::default(),

            checkpoint_interval: 25,
            checkpoint_every_secs: None,
            checkpoint_dir: PathBuf::from("./checkpoints"),
            retention: RetentionPolicy {
                max_count: Some(10),
                max_age_secs: None,
            },

            dry_run: false,
            resume: false,
            allow_config_drift: false,

            currency_rates,
            base_currency: "USD".to_string(),
            bridge_cache_size: 1024,

            collaborators: CollaboratorConfig::default(),
        }
    }
}

/// Rules shipped with the default configuration.
pub fn default_classification_rules() -> Vec<ClassificationRule> {
    vec![
        ClassificationRule::new(
            r"out of memory|\boom\b|no space left|disk full|quota",
            ErrorCategory::Resource,
        ),
        ClassificationRule::new(
            r"timed? ?out|connection (reset|refused)|dns|broken pipe",
            ErrorCategory::System,
        ),
        ClassificationRule::new(
            r"invalid|missing field|malformed|contract",
            ErrorCategory::Business,
        ),
        ClassificationRule::new(
            r"\b5\d\d\b|unavailable|rate limit|\b429\b",
            ErrorCategory::ExternalService,
        ),
    ]
}

impl RunConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a YAML document. Missing fields take their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Loads a YAML file and applies `APPLY_FORGE_*` environment overrides.
    ///
    /// The result is not validated; [`RunConfig::validate`] runs when a run
    /// starts.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml_str(&yaml)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Applies environment overrides on top of the current values.
    ///
    /// # Environment Variables
    ///
    /// - `APPLY_FORGE_RUN_ID`: Run identifier
    /// - `APPLY_FORGE_SEARCH_QUERY`: Search query
    /// - `APPLY_FORGE_SEARCH_LIMIT`: Search result limit
    /// - `APPLY_FORGE_MAX_CONCURRENCY`: Worker count
    /// - `APPLY_FORGE_STAGE_TIMEOUT_SECS`: Per-call timeout
    /// - `APPLY_FORGE_SUBMISSION_DELAY_SECS`: Spacing between submissions
    /// - `APPLY_FORGE_CHECKPOINT_INTERVAL`: Stage steps between checkpoints
    /// - `APPLY_FORGE_CHECKPOINT_DIR`: Checkpoint directory
    /// - `APPLY_FORGE_DRY_RUN`: Simulate submissions
    /// - `APPLY_FORGE_BASE_URL`: Collaborator service URL
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("APPLY_FORGE_RUN_ID") {
            self.run_id = val;
        }

        if let Ok(val) = std::env::var("APPLY_FORGE_SEARCH_QUERY") {
            self.search.query = val;
        }

        if let Ok(val) = std::env::var("APPLY_FORGE_SEARCH_LIMIT") {
            self.search.limit = parse_env_value(&val, "APPLY_FORGE_SEARCH_LIMIT")?;
        }

        if let Ok(val) = std::env::var("APPLY_FORGE_MAX_CONCURRENCY") {
            self.max_concurrency = parse_env_value(&val, "APPLY_FORGE_MAX_CONCURRENCY")?;
        }

        if let Ok(val) = std::env::var("APPLY_FORGE_STAGE_TIMEOUT_SECS") {
            self.stage_timeout_secs = parse_env_value(&val, "APPLY_FORGE_STAGE_TIMEOUT_SECS")?;
        }

        if let Ok(val) = std::env::var("APPLY_FORGE_SUBMISSION_DELAY_SECS") {
            self.submission_delay_secs =
                parse_env_value(&val, "APPLY_FORGE_SUBMISSION_DELAY_SECS")?;
        }

        if let Ok(val) = std::env::var("APPLY_FORGE_CHECKPOINT_INTERVAL") {
            self.checkpoint_interval = parse_env_value(&val, "APPLY_FORGE_CHECKPOINT_INTERVAL")?;
        }

        if let Ok(val) = std::env::var("APPLY_FORGE_CHECKPOINT_DIR") {
            self.checkpoint_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("APPLY_FORGE_DRY_RUN") {
            self.dry_run = parse_env_bool(&val, "APPLY_FORGE_DRY_RUN")?;
        }

        if let Ok(val) = std::env::var("APPLY_FORGE_BASE_URL") {
            self.collaborators.base_url = Some(val);
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` naming the offending field, or
    /// `ConfigError::InvalidValue` for a classification pattern that does not
    /// compile.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Identity
        if self.run_id.is_empty()
            || !self
                .run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(ConfigError::ValidationFailed(
                "run_id must be non-empty and contain only [A-Za-z0-9._-]".to_string(),
            ));
        }

        if self.search.limit == 0 {
            return Err(ConfigError::ValidationFailed(
                "search.limit must be greater than 0".to_string(),
            ));
        }

        self.validate_stages()?;
        self.validate_decision()?;

        // Recovery
        for category in ErrorCategory::ALL {
            match self.retry_policies.get(&category) {
                Some(policy) => policy.validate(category)?,
                None => {
                    return Err(ConfigError::ValidationFailed(format!(
                        "retry_policies has no binding for category '{}'",
                        category
                    )))
                }
            }
        }
        ErrorClassifier::new(&self.classification_rules, self.default_error_category)?;

        // Scheduling
        if self.max_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.stage_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "stage_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=MAX_DELAY_SECS).contains(&self.submission_delay_secs) {
            return Err(ConfigError::ValidationFailed(format!(
                "submission_delay_secs must be between 0 and {}",
                MAX_DELAY_SECS
            )));
        }

        if self.smart_delay.enabled {
            if self.smart_delay.window == 0 {
                return Err(ConfigError::ValidationFailed(
                    "smart_delay.window must be greater than 0".to_string(),
                ));
            }
            if !(self.smart_delay.failure_ratio > 0.0 && self.smart_delay.failure_ratio <= 1.0) {
                return Err(ConfigError::ValidationFailed(
                    "smart_delay.failure_ratio must be in (0.0, 1.0]".to_string(),
                ));
            }
            if !(1.0..=MAX_SMART_MULTIPLIER).contains(&self.smart_delay.multiplier) {
                return Err(ConfigError::ValidationFailed(format!(
                    "smart_delay.multiplier must be between 1.0 and {}",
                    MAX_SMART_MULTIPLIER
                )));
            }
        }

        // Checkpointing
        if self.checkpoint_interval == 0 {
            return Err(ConfigError::ValidationFailed(
                "checkpoint_interval must be greater than 0".to_string(),
            ));
        }

        if self.checkpoint_every_secs == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "checkpoint_every_secs must be greater than 0 when set".to_string(),
            ));
        }

        if self.retention.max_count == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "retention.max_count must be greater than 0 when set".to_string(),
            ));
        }

        // Normalization
        if let Some((code, _)) = self
            .currency_rates
            .iter()
            .find(|(_, rate)| !rate.is_finite() || **rate <= 0.0)
        {
            return Err(ConfigError::ValidationFailed(format!(
                "currency_rates.{} must be greater than 0",
                code
            )));
        }

        if !self.currency_rates.contains_key(&self.base_currency) {
            return Err(ConfigError::ValidationFailed(format!(
                "base_currency '{}' has no entry in currency_rates",
                self.base_currency
            )));
        }

        Ok(())
    }

    fn validate_stages(&self) -> Result<(), ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "stages cannot be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        if let Some(dup) = self.stages.iter().find(|stage| !seen.insert(**stage)) {
            return Err(ConfigError::ValidationFailed(format!(
                "stages lists '{}' more than once",
                dup
            )));
        }

        let position = |stage: Stage| self.stages.iter().position(|s| *s == stage);

        if let Some(index) = position(Stage::Extract) {
            if index != 0 {
                return Err(ConfigError::ValidationFailed(
                    "stages: 'extract' must be the first stage".to_string(),
                ));
            }
        }

        if let Some(decide) = position(Stage::Decide) {
            for scoring in [Stage::Enrich, Stage::Match] {
                if matches!(position(scoring), Some(index) if index > decide) {
                    return Err(ConfigError::ValidationFailed(format!(
                        "stages: 'decide' must come after '{}'",
                        scoring
                    )));
                }
            }
        }

        if let Some(submit) = position(Stage::Submit) {
            if !matches!(position(Stage::Decide), Some(decide) if decide < submit) {
                return Err(ConfigError::ValidationFailed(
                    "stages: 'submit' requires an earlier 'decide' stage".to_string(),
                ));
            }
        }

        Ok(())
    }

    fn validate_decision(&self) -> Result<(), ConfigError> {
        let decision = &self.decision;

        if decision.weights.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "decision.weights cannot be empty".to_string(),
            ));
        }

        if let Some((name, _)) = decision
            .weights
            .iter()
            .find(|(_, w)| !(0.0..=1.0).contains(*w))
        {
            return Err(ConfigError::ValidationFailed(format!(
                "decision.weights.{} must be between 0.0 and 1.0",
                name
            )));
        }

        let sum: f64 = decision.weights.values().sum();
        if (sum - 1.0).abs() > WEIGHT_EPSILON {
            return Err(ConfigError::ValidationFailed(format!(
                "decision.weights must sum to 1.0 (got {:.6})",
                sum
            )));
        }

        if let Some((name, _)) = decision
            .hard_filters
            .iter()
            .find(|(_, floor)| !(0.0..=1.0).contains(*floor))
        {
            return Err(ConfigError::ValidationFailed(format!(
                "decision.hard_filters.{} must be between 0.0 and 1.0",
                name
            )));
        }

        for (field, value) in [
            ("submission_threshold", decision.submission_threshold),
            ("priority_threshold", decision.priority_threshold),
            ("review_floor", decision.review_floor),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ValidationFailed(format!(
                    "decision.{} must be between 0.0 and 1.0",
                    field
                )));
            }
        }

        if decision.review_floor > decision.submission_threshold {
            return Err(ConfigError::ValidationFailed(
                "decision.review_floor cannot exceed decision.submission_threshold".to_string(),
            ));
        }

        if decision.priority_threshold > decision.submission_threshold {
            return Err(ConfigError::ValidationFailed(
                "decision.priority_threshold cannot exceed decision.submission_threshold"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Hex SHA-256 of the configuration with run-local fields cleared.
    ///
    /// `run_id`, `resume`, `dry_run` and `allow_config_drift` do not change
    /// what a run computes, so a dry-run resume of a live checkpoint matches.
    pub fn config_hash(&self) -> String {
        let mut canonical = self.clone();
        canonical.run_id = String::new();
        canonical.resume = false;
        canonical.dry_run = false;
        canonical.allow_config_drift = false;

        let json = serde_json::to_vec(&canonical).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&json);
        hex::encode(hasher.finalize())
    }

    pub fn first_stage(&self) -> Stage {
        self.stages.first().copied().unwrap_or(Stage::Extract)
    }

    /// Stage following `stage` in the configured order.
    pub fn next_stage(&self, stage: Stage) -> Option<Stage> {
        let index = self.stages.iter().position(|s| *s == stage)?;
        self.stages.get(index + 1).copied()
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn submission_delay(&self) -> Duration {
        bounded_delay(self.submission_delay_secs)
    }

    /// Builder method to set the run identifier.
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// Builder method to set the stage order.
    pub fn with_stages(mut self, stages: Vec<Stage>) -> Self {
        self.stages = stages;
        self
    }

    /// Builder method to set the search query and limit.
    pub fn with_search(mut self, query: impl Into<String>, limit: usize) -> Self {
        self.search = SearchConfig {
            query: query.into(),
            limit,
        };
        self
    }

    /// Builder method to replace the decision weights.
    pub fn with_weights<I, S>(mut self, weights: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        self.decision.weights = weights.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self
    }

    /// Builder method to add a hard-filter floor.
    pub fn with_hard_filter(mut self, criterion: impl Into<String>, floor: f64) -> Self {
        self.decision.hard_filters.insert(criterion.into(), floor);
        self
    }

    /// Builder method to set the submission threshold.
    pub fn with_submission_threshold(mut self, threshold: f64) -> Self {
        self.decision.submission_threshold = threshold;
        self
    }

    /// Builder method to set the high-priority threshold.
    pub fn with_priority_threshold(mut self, threshold: f64) -> Self {
        self.decision.priority_threshold = threshold;
        self
    }

    /// Builder method to set the review floor.
    pub fn with_review_floor(mut self, floor: f64) -> Self {
        self.decision.review_floor = floor;
        self
    }

    /// Builder method to bind a retry policy to a category.
    pub fn with_retry_policy(mut self, category: ErrorCategory, policy: RetryPolicy) -> Self {
        self.retry_policies.insert(category, policy);
        self
    }

    /// Builder method to prepend a classification rule.
    pub fn with_classification_rule(mut self, rule: ClassificationRule) -> Self {
        self.classification_rules.insert(0, rule);
        self
    }

    /// Builder method to choose escalate or drop on exhausted retries.
    pub fn with_escalate_on_exhaustion(mut self, escalate: bool) -> Self {
        self.escalate_on_exhaustion = escalate;
        self
    }

    /// Builder method to set worker count.
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Builder method to set the per-call timeout.
    pub fn with_stage_timeout_secs(mut self, secs: u64) -> Self {
        self.stage_timeout_secs = secs;
        self
    }

    /// Builder method to set submission spacing.
    pub fn with_submission_delay_secs(mut self, secs: f64) -> Self {
        self.submission_delay_secs = secs;
        self
    }

    /// Builder method to configure adaptive submission spacing.
    pub fn with_smart_delay(mut self, smart_delay: SmartDelayConfig) -> Self {
        self.smart_delay = smart_delay;
        self
    }

    /// Builder method to set the checkpoint step interval.
    pub fn with_checkpoint_interval(mut self, interval: u64) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Builder method to set the checkpoint directory.
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = dir.into();
        self
    }

    /// Builder method to set checkpoint retention.
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Builder method to enable or disable dry-run.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Builder method to resume from the latest checkpoint.
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Builder method to accept a checkpoint written under another configuration.
    pub fn with_allow_config_drift(mut self, allow: bool) -> Self {
        self.allow_config_drift = allow;
        self
    }

    /// Builder method to set the collaborator service URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.collaborators.base_url = Some(url.into());
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_invalid(config: RunConfig, needle: &str) {
        let err = config.validate().unwrap_err();
        assert!(
            err.to_string().contains(needle),
            "expected '{}' in '{}'",
            needle,
            err
        );
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stages, Stage::ALL.to_vec());
        assert_eq!(config.retry_policies.len(), 4);
        assert!((config.decision.weights.values().sum::<f64>() - 1.0).abs() < WEIGHT_EPSILON);
    }

    #[test]
    fn test_config_builder() {
        let config = RunConfig::new()
            .with_run_id("nightly")
            .with_max_concurrency(8)
            .with_stage_timeout_secs(10)
            .with_submission_delay_secs(0.5)
            .with_checkpoint_interval(3)
            .with_dry_run(true)
            .with_hard_filter("salary", 0.3);

        assert_eq!(config.run_id, "nightly");
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.stage_timeout(), Duration::from_secs(10));
        assert_eq!(config.submission_delay(), Duration::from_millis(500));
        assert_eq!(config.checkpoint_interval, 3);
        assert!(config.dry_run);
        assert_eq!(config.decision.hard_filters.get("salary"), Some(&0.3));
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let config = RunConfig::default().with_weights([("semantic_match", 0.5), ("salary", 0.4)]);
        assert_invalid(config, "sum to 1.0");

        let close = RunConfig::default()
            .with_weights([("semantic_match", 0.7), ("salary", 0.3 + 1e-9)]);
        assert!(close.validate().is_ok());
    }

    #[test]
    fn test_stage_order_rules() {
        assert_invalid(RunConfig::default().with_stages(vec![]), "stages cannot be empty");
        assert_invalid(
            RunConfig::default().with_stages(vec![Stage::Extract, Stage::Match, Stage::Match]),
            "more than once",
        );
        assert_invalid(
            RunConfig::default().with_stages(vec![Stage::Extract, Stage::Decide, Stage::Match]),
            "after 'match'",
        );
        assert_invalid(
            RunConfig::default().with_stages(vec![Stage::Extract, Stage::Submit]),
            "requires an earlier 'decide'",
        );
        assert_invalid(
            RunConfig::default().with_stages(vec![Stage::Match, Stage::Extract, Stage::Decide]),
            "first stage",
        );
        assert!(RunConfig::default()
            .with_stages(vec![Stage::Extract, Stage::Match, Stage::Decide])
            .validate()
            .is_ok());
    }

    #[test]
    fn test_retry_bindings_cover_all_categories() {
        let mut config = RunConfig::default();
        config.retry_policies.remove(&ErrorCategory::Resource);
        assert_invalid(config, "resource");
    }

    #[test]
    fn test_invalid_thresholds() {
        assert_invalid(
            RunConfig::default().with_submission_threshold(1.5),
            "submission_threshold",
        );
        assert_invalid(
            RunConfig::default()
                .with_submission_threshold(0.5)
                .with_review_floor(0.6),
            "review_floor",
        );
        assert_invalid(RunConfig::default().with_hard_filter("salary", -0.1), "salary");
    }

    #[test]
    fn test_invalid_scheduling_values() {
        assert_invalid(RunConfig::default().with_max_concurrency(0), "max_concurrency");
        assert_invalid(RunConfig::default().with_stage_timeout_secs(0), "stage_timeout_secs");
        assert_invalid(
            RunConfig::default().with_checkpoint_interval(0),
            "checkpoint_interval",
        );
        assert_invalid(RunConfig::default().with_run_id("../escape"), "run_id");
    }

    #[test]
    fn test_delays_are_bounded() {
        assert_invalid(
            RunConfig::default().with_submission_delay_secs(1e20),
            "submission_delay_secs",
        );
        assert_invalid(
            RunConfig::default().with_submission_delay_secs(f64::NAN),
            "submission_delay_secs",
        );
        assert!(RunConfig::default()
            .with_submission_delay_secs(MAX_DELAY_SECS)
            .validate()
            .is_ok());

        let mut config = RunConfig::default();
        config.smart_delay.enabled = true;
        config.smart_delay.multiplier = 1e12;
        assert_invalid(config, "smart_delay.multiplier");

        assert_invalid(
            RunConfig::default().with_retry_policy(
                ErrorCategory::System,
                RetryPolicy::LinearBackoff {
                    step_secs: 1e20,
                    max_attempts: 3,
                },
            ),
            "step_secs",
        );
        assert_invalid(
            RunConfig::default().with_retry_policy(
                ErrorCategory::ExternalService,
                RetryPolicy::ExponentialBackoff {
                    base_secs: 1.0,
                    max_delay_secs: 1e20,
                    max_attempts: 3,
                },
            ),
            "max_delay_secs",
        );

        // Unvalidated values still convert without panicking.
        let mut config = RunConfig::default();
        config.submission_delay_secs = 1e20;
        assert_eq!(
            config.submission_delay(),
            Duration::from_secs_f64(MAX_DELAY_SECS)
        );
    }

    #[test]
    fn test_next_stage() {
        let config = RunConfig::default().with_stages(vec![
            Stage::Extract,
            Stage::Match,
            Stage::Decide,
        ]);
        assert_eq!(config.first_stage(), Stage::Extract);
        assert_eq!(config.next_stage(Stage::Extract), Some(Stage::Match));
        assert_eq!(config.next_stage(Stage::Decide), None);
        assert_eq!(config.next_stage(Stage::Submit), None);
    }

    #[test]
    fn test_config_hash_ignores_run_local_fields() {
        let base = RunConfig::default();
        let resumed = base
            .clone()
            .with_run_id("other")
            .with_resume(true)
            .with_dry_run(true);
        assert_eq!(base.config_hash(), resumed.config_hash());
        assert_eq!(base.config_hash().len(), 64);

        let changed = base.clone().with_max_concurrency(9);
        assert_ne!(base.config_hash(), changed.config_hash());
    }

    #[test]
    fn test_yaml_defaults_and_policies() {
        let yaml = r#"
run_id: weekly
stages: [extract, match, decide, submit]
decision:
  weights:
    semantic_match: 0.6
    salary: 0.4
  hard_filters:
    salary: 0.3
retry_policies:
  system:
    kind: linear_backoff
    step_secs: 2.0
    max_attempts: 3
  business:
    kind: manual_intervention
  external_service:
    kind: exponential_backoff
    base_secs: 1.0
    max_delay_secs: 30.0
    max_attempts: 5
  resource:
    kind: immediate_stop
"#;
        let config = RunConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.run_id, "weekly");
        assert_eq!(config.stages.len(), 4);
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(
            config.retry_policies.get(&ErrorCategory::System),
            Some(&RetryPolicy::LinearBackoff {
                step_secs: 2.0,
                max_attempts: 3
            })
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_parse_error() {
        let err = RunConfig::from_yaml_str("stages: [extract, teleport]").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("YES", "K").unwrap());
        assert!(!parse_env_bool("off", "K").unwrap());
        assert!(parse_env_bool("maybe", "K").is_err());
    }
}
