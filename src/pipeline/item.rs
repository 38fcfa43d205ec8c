//! Work items and the records attached to them.
//!
//! A [`WorkItem`] is one job-application candidate traversing the configured
//! stages. Its status only moves forward along
//! `pending -> in_progress -> {succeeded, failed, rejected}`; a failed item
//! re-enters `pending` only through [`WorkItem::retry`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::bridge::JobPosting;
use super::recovery::RecoveryAction;
use crate::error::ErrorCategory;

/// One ordered step of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Validate and normalize the raw search payload.
    Extract,
    /// Gather company, salary and location signals.
    Enrich,
    /// Score the resume against the posting.
    Match,
    /// Compute the admission decision.
    Decide,
    /// Submit the application.
    Submit,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Extract,
        Stage::Enrich,
        Stage::Match,
        Stage::Decide,
        Stage::Submit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Enrich => "enrich",
            Stage::Match => "match",
            Stage::Decide => "decide",
            Stage::Submit => "submit",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Rejected,
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 5] = [
        ItemStatus::Pending,
        ItemStatus::InProgress,
        ItemStatus::Succeeded,
        ItemStatus::Failed,
        ItemStatus::Rejected,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Succeeded | ItemStatus::Failed | ItemStatus::Rejected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::InProgress => "in_progress",
            ItemStatus::Succeeded => "succeeded",
            ItemStatus::Failed => "failed",
            ItemStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision outcome class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Reject,
    Review,
    Submit,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Reject, Tier::Review, Tier::Submit];

    /// Queue rank: higher is dispatched first.
    pub fn rank(&self) -> u8 {
        match self {
            Tier::Submit => 3,
            Tier::Review => 2,
            Tier::Reject => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Reject => "reject",
            Tier::Review => "review",
            Tier::Submit => "submit",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The scored, tiered outcome attached to an item at the decide stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Normalized per-criterion scores, each in [0, 1].
    pub scores: BTreeMap<String, f64>,
    /// Weights in force when the record was computed.
    pub weights: BTreeMap<String, f64>,
    pub composite: f64,
    pub tier: Tier,
    /// Names of hard filters that fired.
    pub filters_fired: Vec<String>,
    /// Ordering flag within `review`; never a tier of its own.
    pub high_priority: bool,
    pub decided_at: DateTime<Utc>,
}

/// One observed stage failure and the recovery action taken for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub item_id: Uuid,
    pub stage: Stage,
    pub category: ErrorCategory,
    pub message: String,
    /// 1-based failure count for this item at this stage.
    pub attempt: u32,
    pub action: RecoveryAction,
    pub timestamp: DateTime<Utc>,
}

/// Result of the submit stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub simulated: bool,
    pub message: String,
    pub external_reference: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

/// Rejected status change.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid status transition for item {id}: {from} -> {to}")]
pub struct TransitionError {
    pub id: Uuid,
    pub from: ItemStatus,
    pub to: ItemStatus,
}

/// One candidate moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    /// Raw search payload, opaque to the orchestrator.
    pub payload: Value,
    /// Content fingerprint of the raw payload.
    pub fingerprint: String,
    /// Stage the item will run next (or last ran, once terminal).
    pub stage: Stage,
    pub status: ItemStatus,
    /// Failures observed per stage.
    pub retries: BTreeMap<Stage, u32>,
    /// Normalized posting, set by the extract stage.
    pub posting: Option<JobPosting>,
    /// Normalized criterion scores gathered before the decide stage.
    pub criteria: BTreeMap<String, f64>,
    pub decision: Option<DecisionRecord>,
    pub submission: Option<SubmissionRecord>,
    /// Set when recovery surfaced the item for manual intervention.
    pub escalated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    /// Creates a pending item at the given first stage.
    pub fn new(payload: Value, fingerprint: impl Into<String>, first_stage: Stage) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            payload,
            fingerprint: fingerprint.into(),
            stage: first_stage,
            status: ItemStatus::Pending,
            retries: BTreeMap::new(),
            posting: None,
            criteria: BTreeMap::new(),
            decision: None,
            submission: None,
            escalated: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Failures recorded so far at `stage`.
    pub fn retries_at(&self, stage: Stage) -> u32 {
        self.retries.get(&stage).copied().unwrap_or(0)
    }

    /// Counts a failure at the current stage and returns the new attempt number.
    pub fn record_failure(&mut self) -> u32 {
        let count = {
            let count = self.retries.entry(self.stage).or_insert(0);
            *count += 1;
            *count
        };
        self.touch();
        count
    }

    /// Claims a pending item for processing at its current stage.
    pub fn begin(&mut self) -> Result<(), TransitionError> {
        if self.status != ItemStatus::Pending {
            return Err(self.transition_error(self.status, ItemStatus::InProgress));
        }
        self.status = ItemStatus::InProgress;
        self.touch();
        Ok(())
    }

    /// Parks an in-progress item as `pending` at the next stage.
    ///
    /// An item is `in_progress` only while a worker holds it; between stages
    /// it waits in the queue like any other pending item.
    pub fn advance(&mut self, next: Stage) -> Result<(), TransitionError> {
        self.require_in_progress(ItemStatus::Pending)?;
        self.stage = next;
        self.status = ItemStatus::Pending;
        self.touch();
        Ok(())
    }

    pub fn succeed(&mut self) -> Result<(), TransitionError> {
        self.finish(ItemStatus::Succeeded)
    }

    pub fn fail(&mut self) -> Result<(), TransitionError> {
        self.finish(ItemStatus::Failed)
    }

    pub fn reject(&mut self) -> Result<(), TransitionError> {
        self.finish(ItemStatus::Rejected)
    }

    /// Marks the item failed and surfaced for manual intervention.
    pub fn escalate(&mut self) -> Result<(), TransitionError> {
        self.finish(ItemStatus::Failed)?;
        self.escalated = true;
        Ok(())
    }

    /// Re-enters a failed item into `pending` at its current stage.
    pub fn retry(&mut self) -> Result<(), TransitionError> {
        if self.status != ItemStatus::Failed || self.escalated {
            return Err(self.transition_error(self.status, ItemStatus::Pending));
        }
        self.status = ItemStatus::Pending;
        self.touch();
        Ok(())
    }

    /// Normalizes a snapshotted `in_progress` item to `pending` so the current
    /// stage restarts from scratch.
    pub fn rehydrate(&mut self) {
        if self.status == ItemStatus::InProgress {
            self.status = ItemStatus::Pending;
        }
    }

    /// Clears the decision so the decide stage recomputes it.
    pub fn request_rescore(&mut self) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(self.transition_error(self.status, ItemStatus::Pending));
        }
        self.decision = None;
        self.stage = Stage::Decide;
        self.touch();
        Ok(())
    }

    pub fn tier(&self) -> Option<Tier> {
        self.decision.as_ref().map(|d| d.tier)
    }

    fn finish(&mut self, to: ItemStatus) -> Result<(), TransitionError> {
        self.require_in_progress(to)?;
        self.status = to;
        self.touch();
        Ok(())
    }

    fn require_in_progress(&self, to: ItemStatus) -> Result<(), TransitionError> {
        if self.status != ItemStatus::InProgress {
            return Err(self.transition_error(self.status, to));
        }
        Ok(())
    }

    fn transition_error(&self, from: ItemStatus, to: ItemStatus) -> TransitionError {
        TransitionError {
            id: self.id,
            from,
            to,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
