//! Execution of a single stage for a single item.
//!
//! Every collaborator call is bounded by the stage timeout; a call that runs
//! past it becomes a `system` failure. Contract and decision errors become
//! `business` failures.
//!
//! A submission first secures the session, then reserves a slot from the
//! shared limiter. The slot wait counts against the same stage timeout.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::debug;

use super::bridge::{self, DataBridge};
use super::collaborators::{Collaborators, SessionHandle};
use super::config::RunConfig;
use super::decision::DecisionEngine;
use super::item::{Stage, SubmissionRecord, Tier, WorkItem};
use crate::error::{BridgeError, CollaboratorError, ErrorCategory, StageFailure};
use crate::scheduler::{LimiterError, SubmissionLimiter};

/// Criterion name under which the match score is stored.
pub const SEMANTIC_MATCH: &str = "semantic_match";

/// Result of a successful stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Stage finished; the item moves on.
    Completed,
    /// Submission dispatched (or simulated under dry-run).
    Submitted { simulated: bool },
    /// Decision tier was `reject`; the item is terminal.
    Rejected,
}

pub struct StageRunner {
    config: Arc<RunConfig>,
    bridge: Arc<DataBridge>,
    engine: DecisionEngine,
    collaborators: Collaborators,
    resume: Arc<Value>,
    limiter: Arc<SubmissionLimiter>,
    session: OnceCell<SessionHandle>,
}

impl StageRunner {
    pub fn new(
        config: Arc<RunConfig>,
        bridge: Arc<DataBridge>,
        engine: DecisionEngine,
        collaborators: Collaborators,
        resume: Arc<Value>,
        limiter: Arc<SubmissionLimiter>,
    ) -> Self {
        Self {
            config,
            bridge,
            engine,
            collaborators,
            resume,
            limiter,
            session: OnceCell::new(),
        }
    }

    /// Releases any worker waiting for a submission slot and refuses new
    /// submissions for the rest of the run.
    pub fn interrupt(&self) {
        self.limiter.close();
    }

    /// Runs `item`'s current stage.
    pub async fn run(&self, item: &mut WorkItem) -> Result<StageOutcome, StageFailure> {
        let stage = item.stage;
        debug!(item_id = %item.id, stage = %stage, "Running stage");
        match stage {
            Stage::Extract => self.extract(item),
            Stage::Enrich => self.enrich(item).await,
            Stage::Match => self.match_resume(item).await,
            Stage::Decide => self.decide(item),
            Stage::Submit => self.submit(item).await,
        }
    }

    fn extract(&self, item: &mut WorkItem) -> Result<StageOutcome, StageFailure> {
        let posting = self
            .bridge
            .extract(&item.fingerprint, &item.payload)
            .map_err(|e| StageFailure::from_bridge(Stage::Extract, &e))?;
        item.posting = Some(posting);
        Ok(StageOutcome::Completed)
    }

    async fn enrich(&self, item: &mut WorkItem) -> Result<StageOutcome, StageFailure> {
        let posting = posting_for(Stage::Enrich, item)?;
        let signals = self
            .call(
                Stage::Enrich,
                "signals",
                self.collaborators.signals.signals(posting),
            )
            .await?;

        let normalized = signals
            .iter()
            .map(|signal| {
                self.bridge
                    .normalize_signal(signal)
                    .map(|score| (signal.criterion.clone(), score))
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StageFailure::from_bridge(Stage::Enrich, &e))?;
        item.criteria.extend(normalized);
        Ok(StageOutcome::Completed)
    }

    async fn match_resume(&self, item: &mut WorkItem) -> Result<StageOutcome, StageFailure> {
        let posting = posting_for(Stage::Match, item)?;
        let matched = self
            .call(
                Stage::Match,
                "score",
                self.collaborators.matcher.score(&self.resume, posting),
            )
            .await?;

        let score = bridge::check_score(SEMANTIC_MATCH, matched.score)
            .map_err(|e| StageFailure::from_bridge(Stage::Match, &e))?;
        debug!(item_id = %item.id, score, explanation = %matched.explanation, "Match scored");
        item.criteria.insert(SEMANTIC_MATCH.to_string(), score);
        Ok(StageOutcome::Completed)
    }

    fn decide(&self, item: &mut WorkItem) -> Result<StageOutcome, StageFailure> {
        // Decisions are immutable once recorded; only request_rescore clears them.
        if item.decision.is_none() {
            let record = self.engine.decide(&item.criteria).map_err(|e| {
                StageFailure::new(Stage::Decide, e.to_string()).with_hint(ErrorCategory::Business)
            })?;
            item.decision = Some(record);
        }

        match item.tier() {
            Some(Tier::Reject) => Ok(StageOutcome::Rejected),
            _ => Ok(StageOutcome::Completed),
        }
    }

    async fn submit(&self, item: &mut WorkItem) -> Result<StageOutcome, StageFailure> {
        let tier = item.tier().ok_or_else(|| {
            StageFailure::from_bridge(
                Stage::Submit,
                &BridgeError::ContractViolation {
                    stage: Stage::Submit,
                    field: "decision".to_string(),
                },
            )
        })?;

        match tier {
            Tier::Reject => return Ok(StageOutcome::Rejected),
            // Review items wait for a human; nothing is sent.
            Tier::Review => return Ok(StageOutcome::Completed),
            Tier::Submit => {}
        }

        if item.submission.is_some() {
            return Ok(StageOutcome::Completed);
        }

        let record = if self.config.dry_run {
            SubmissionRecord {
                simulated: true,
                message: "dry run: submission simulated".to_string(),
                external_reference: None,
                submitted_at: Utc::now(),
            }
        } else {
            let posting = posting_for(Stage::Submit, item)?;
            let session = self.session().await?;
            self.reserve_slot().await?;
            let result = self
                .call(
                    Stage::Submit,
                    "submit",
                    self.collaborators
                        .submitter
                        .submit(posting, &self.resume, &session),
                )
                .await;
            self.limiter
                .record(matches!(&result, Ok(outcome) if outcome.success));

            let outcome = result?;
            if !outcome.success {
                return Err(StageFailure::new(
                    Stage::Submit,
                    format!("submission rejected: {}", outcome.message),
                )
                .with_hint(ErrorCategory::ExternalService));
            }
            SubmissionRecord {
                simulated: false,
                message: outcome.message,
                external_reference: outcome.external_reference,
                submitted_at: Utc::now(),
            }
        };

        let simulated = record.simulated;
        item.submission = Some(record);
        Ok(StageOutcome::Submitted { simulated })
    }

    /// Session for the submission target, acquired on first use.
    async fn session(&self) -> Result<SessionHandle, StageFailure> {
        self.session
            .get_or_try_init(|| {
                self.call(
                    Stage::Submit,
                    "acquire_session",
                    self.collaborators.auth.acquire_session(),
                )
            })
            .await
            .cloned()
    }

    async fn reserve_slot(&self) -> Result<(), StageFailure> {
        let timeout = self.config.stage_timeout();
        match self.limiter.acquire(timeout).await {
            Ok(_) => Ok(()),
            Err(LimiterError::Saturated(wait)) => {
                debug!(wait_ms = wait.as_millis() as u64, "Submission slot out of reach");
                Err(StageFailure::from_collaborator(
                    Stage::Submit,
                    &CollaboratorError::Timeout {
                        operation: "submission slot".to_string(),
                        seconds: timeout.as_secs(),
                    },
                ))
            }
            Err(e @ LimiterError::Closed) => Err(StageFailure::new(Stage::Submit, e.to_string())
                .with_hint(ErrorCategory::System)),
        }
    }

    async fn call<T, F>(&self, stage: Stage, operation: &str, fut: F) -> Result<T, StageFailure>
    where
        F: Future<Output = Result<T, CollaboratorError>>,
    {
        let timeout = self.config.stage_timeout();
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(StageFailure::from_collaborator(stage, &e)),
            Err(_) => Err(StageFailure::from_collaborator(
                stage,
                &CollaboratorError::Timeout {
                    operation: operation.to_string(),
                    seconds: timeout.as_secs(),
                },
            )),
        }
    }
}

fn posting_for(stage: Stage, item: &WorkItem) -> Result<&bridge::JobPosting, StageFailure> {
    bridge::require_posting(stage, item).map_err(|e| StageFailure::from_bridge(stage, &e))
}
