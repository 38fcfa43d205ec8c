//! Contract checks and normalization at stage boundaries.
//!
//! The bridge validates that a payload entering a stage carries what the stage
//! needs, converts salaries to annual figures in the base currency, and maps
//! raw collaborator signals onto [0, 1]. Extracted postings are cached by the
//! content fingerprint of the raw payload so a retried extract does not redo
//! the work.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::collaborators::{Signal, SignalScale};
use super::config::RunConfig;
use super::item::{Stage, WorkItem};
use crate::error::BridgeError;

/// Fields every raw payload must carry to enter `extract`.
pub const REQUIRED_FIELDS: [&str; 3] = ["title", "company", "url"];

/// Annual salary band in the base currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalaryRange {
    pub min: f64,
    pub max: f64,
    pub currency: String,
}

/// Normalized job posting produced by the extract stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPosting {
    pub title: String,
    pub company: String,
    pub url: String,
    pub location: Option<String>,
    pub remote: bool,
    pub description: Option<String>,
    pub salary: Option<SalaryRange>,
}

/// Hex SHA-256 of the payload's canonical JSON form.
pub fn fingerprint(payload: &Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

/// Posting URL used as a secondary de-duplication key.
pub fn dedup_url(payload: &Value) -> Option<String> {
    payload
        .get("url")
        .and_then(Value::as_str)
        .map(|url| url.trim().trim_end_matches('/').to_lowercase())
        .filter(|url| !url.is_empty())
}

/// Validates that a criterion score is a finite value in [0, 1].
pub fn check_score(criterion: &str, value: f64) -> Result<f64, BridgeError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(BridgeError::OutOfRange {
            criterion: criterion.to_string(),
            value,
        })
    }
}

/// Returns the item's normalized posting, or a contract violation for `stage`.
pub fn require_posting(stage: Stage, item: &WorkItem) -> Result<&JobPosting, BridgeError> {
    item.posting
        .as_ref()
        .ok_or_else(|| BridgeError::ContractViolation {
            stage,
            field: "posting".to_string(),
        })
}

#[derive(Debug, Clone)]
struct CacheEntry {
    posting: JobPosting,
    last_accessed: Instant,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct DataBridge {
    rates: BTreeMap<String, f64>,
    base_currency: String,
    max_entries: usize,
    cache: RwLock<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl DataBridge {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            rates: config.currency_rates.clone(),
            base_currency: config.base_currency.clone(),
            max_entries: config.bridge_cache_size,
            cache: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Validates and normalizes a raw payload into a posting.
    pub fn extract(&self, fingerprint: &str, payload: &Value) -> Result<JobPosting, BridgeError> {
        if let Some(posting) = self.cached(fingerprint) {
            return Ok(posting);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let [title, company, url] = REQUIRED_FIELDS;
        let posting = JobPosting {
            title: required_str(payload, title)?,
            company: required_str(payload, company)?,
            url: required_str(payload, url)?,
            location: optional_str(payload, "location"),
            remote: payload
                .get("remote")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            description: optional_str(payload, "description"),
            salary: match payload.get("salary") {
                None | Some(Value::Null) => None,
                Some(raw) => Some(self.normalize_salary(raw)?),
            },
        };

        self.insert(fingerprint, &posting);
        Ok(posting)
    }

    /// Converts a raw salary (a bare annual number in the base currency, or an
    /// object with `min`, `max`, `currency`, `period`) to an annual band in
    /// the base currency.
    pub fn normalize_salary(&self, raw: &Value) -> Result<SalaryRange, BridgeError> {
        let (min, max, currency, period) = match raw {
            Value::Number(n) => {
                let amount = n.as_f64().unwrap_or(f64::NAN);
                (amount, amount, self.base_currency.clone(), "year".to_string())
            }
            Value::Object(map) => {
                let min = map.get("min").and_then(Value::as_f64);
                let max = map.get("max").and_then(Value::as_f64);
                let (min, max) = match (min, max) {
                    (Some(min), Some(max)) => (min, max),
                    (Some(v), None) | (None, Some(v)) => (v, v),
                    (None, None) => {
                        return Err(BridgeError::Normalization(
                            "salary needs at least one of 'min' or 'max'".to_string(),
                        ))
                    }
                };
                let currency = map
                    .get("currency")
                    .and_then(Value::as_str)
                    .map(|c| c.trim().to_uppercase())
                    .unwrap_or_else(|| self.base_currency.clone());
                let period = map
                    .get("period")
                    .and_then(Value::as_str)
                    .unwrap_or("year")
                    .to_lowercase();
                (min, max, currency, period)
            }
            other => {
                return Err(BridgeError::Normalization(format!(
                    "unsupported salary format: {}",
                    other
                )))
            }
        };

        if !min.is_finite() || !max.is_finite() || min < 0.0 || max < min {
            return Err(BridgeError::Normalization(format!(
                "invalid salary band {}..{}",
                min, max
            )));
        }

        let multiplier = period_multiplier(&period).ok_or_else(|| {
            BridgeError::Normalization(format!("unknown salary period '{}'", period))
        })?;
        let rate = self.rate_to_base(&currency)?;

        Ok(SalaryRange {
            min: min * multiplier * rate,
            max: max * multiplier * rate,
            currency: self.base_currency.clone(),
        })
    }

    /// Maps a raw signal onto [0, 1].
    ///
    /// Unit and percent signals outside their scale are rejected; range
    /// signals are clamped to the declared bounds.
    pub fn normalize_signal(&self, signal: &Signal) -> Result<f64, BridgeError> {
        let out_of_range = || BridgeError::OutOfRange {
            criterion: signal.criterion.clone(),
            value: signal.value,
        };
        if !signal.value.is_finite() {
            return Err(out_of_range());
        }

        match &signal.scale {
            SignalScale::Unit => check_score(&signal.criterion, signal.value),
            SignalScale::Percent => {
                check_score(&signal.criterion, signal.value / 100.0).map_err(|_| out_of_range())
            }
            SignalScale::Range { min, max } => {
                if !min.is_finite() || !max.is_finite() || max <= min {
                    return Err(BridgeError::Normalization(format!(
                        "signal '{}' has an empty range {}..{}",
                        signal.criterion, min, max
                    )));
                }
                Ok(((signal.value - min) / (max - min)).clamp(0.0, 1.0))
            }
        }
    }

    pub fn cache_stats(&self) -> BridgeCacheStats {
        BridgeCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn rate_to_base(&self, currency: &str) -> Result<f64, BridgeError> {
        let rate = self
            .rates
            .get(currency)
            .ok_or_else(|| BridgeError::UnknownCurrency(currency.to_string()))?;
        let base = self
            .rates
            .get(&self.base_currency)
            .ok_or_else(|| BridgeError::UnknownCurrency(self.base_currency.clone()))?;
        Ok(rate / base)
    }

    fn cached(&self, fingerprint: &str) -> Option<JobPosting> {
        if self.max_entries == 0 {
            return None;
        }
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        let entry = cache.get_mut(fingerprint)?;
        entry.last_accessed = Instant::now();
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.posting.clone())
    }

    fn insert(&self, fingerprint: &str, posting: &JobPosting) {
        if self.max_entries == 0 {
            return;
        }
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        if cache.len() >= self.max_entries && !cache.contains_key(fingerprint) {
            let oldest = cache
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(key, _)| key.clone());
            if let Some(key) = oldest {
                cache.remove(&key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        cache.insert(
            fingerprint.to_string(),
            CacheEntry {
                posting: posting.clone(),
                last_accessed: Instant::now(),
            },
        );
    }
}

impl std::fmt::Debug for DataBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBridge")
            .field("base_currency", &self.base_currency)
            .field("max_entries", &self.max_entries)
            .field("stats", &self.cache_stats())
            .finish()
    }
}

fn required_str(payload: &Value, field: &str) -> Result<String, BridgeError> {
    optional_str(payload, field).ok_or_else(|| BridgeError::ContractViolation {
        stage: Stage::Extract,
        field: field.to_string(),
    })
}

fn optional_str(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Multiplier converting a salary period to a year.
fn period_multiplier(period: &str) -> Option<f64> {
    match period.trim() {
        "hour" | "hourly" => Some(2080.0),
        "day" | "daily" => Some(260.0),
        "week" | "weekly" => Some(52.0),
        "month" | "monthly" => Some(12.0),
        "year" | "yearly" | "annual" | "annually" => Some(1.0),
        _ => None,
    }
}
