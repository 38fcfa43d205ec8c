//! Interfaces to the external collaborators a run depends on.
//!
//! The orchestrator never performs search, matching or submission itself; it
//! calls these traits. Each call is bounded by the per-stage timeout at the
//! call site. `probe` is a side-effect-free reachability check used by
//! health reports.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::bridge::JobPosting;
use crate::error::CollaboratorError;

/// Match score in [0, 1] plus the scorer's explanation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchScore {
    pub score: f64,
    #[serde(default)]
    pub explanation: String,
}

/// How a raw signal value is expressed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalScale {
    /// Already in [0, 1].
    #[default]
    Unit,
    /// In [0, 100].
    Percent,
    /// Linear in [min, max].
    Range { min: f64, max: f64 },
}

/// One raw criterion signal from the enrichment collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub criterion: String,
    pub value: f64,
    #[serde(default)]
    pub scale: SignalScale,
}

impl Signal {
    pub fn unit(criterion: impl Into<String>, value: f64) -> Self {
        Self {
            criterion: criterion.into(),
            value,
            scale: SignalScale::Unit,
        }
    }
}

/// Opaque authenticated session used by the submission stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Result of one submission call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionOutcome {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub external_reference: Option<String>,
}

/// Upstream search and retrieval.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Value>, CollaboratorError>;

    async fn probe(&self) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// Resume-to-posting matching.
#[async_trait]
pub trait MatchScorer: Send + Sync {
    async fn score(
        &self,
        resume: &Value,
        posting: &JobPosting,
    ) -> Result<MatchScore, CollaboratorError>;

    async fn probe(&self) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// Company, salary, location and similar criterion signals.
#[async_trait]
pub trait SignalProvider: Send + Sync {
    async fn signals(&self, posting: &JobPosting) -> Result<Vec<Signal>, CollaboratorError>;

    async fn probe(&self) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// Application submission. Idempotency is the implementor's concern; each
/// call is made at most once per attempt.
#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(
        &self,
        posting: &JobPosting,
        resume: &Value,
        session: &SessionHandle,
    ) -> Result<SubmissionOutcome, CollaboratorError>;

    async fn probe(&self) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// Session acquisition for the submission target.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn acquire_session(&self) -> Result<SessionHandle, CollaboratorError>;

    async fn probe(&self) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// Every collaborator a run is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub search: Arc<dyn SearchProvider>,
    pub matcher: Arc<dyn MatchScorer>,
    pub signals: Arc<dyn SignalProvider>,
    pub submitter: Arc<dyn Submitter>,
    pub auth: Arc<dyn AuthProvider>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Reachability of one collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaboratorHealth {
    pub name: String,
    pub reachable: bool,
    pub error: Option<String>,
}

impl CollaboratorHealth {
    fn from_probe(name: &str, result: Result<(), CollaboratorError>) -> Self {
        Self {
            name: name.to_string(),
            reachable: result.is_ok(),
            error: result.err().map(|e| e.to_string()),
        }
    }
}

impl Collaborators {
    /// Probes every collaborator concurrently.
    pub async fn probe_all(&self) -> Vec<CollaboratorHealth> {
        let (search, matcher, signals, submitter, auth) = futures::join!(
            self.search.probe(),
            self.matcher.probe(),
            self.signals.probe(),
            self.submitter.probe(),
            self.auth.probe(),
        );

        vec![
            CollaboratorHealth::from_probe("search", search),
            CollaboratorHealth::from_probe("matcher", matcher),
            CollaboratorHealth::from_probe("signals", signals),
            CollaboratorHealth::from_probe("submitter", submitter),
            CollaboratorHealth::from_probe("auth", auth),
        ]
    }
}
