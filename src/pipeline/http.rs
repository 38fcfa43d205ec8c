//! Collaborator transports.
//!
//! [`HttpCollaborator`] talks JSON to a collaborator service exposing
//! `POST /search`, `/score`, `/signals`, `/submit`, `/session` and
//! `GET /health`. [`StaticCandidates`] serves candidates from a local JSON file
//! for offline and dry runs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::bridge::{self, JobPosting};
use super::collaborators::{
    AuthProvider, Collaborators, MatchScore, MatchScorer, SearchProvider, SessionHandle, Signal,
    SignalProvider, SubmissionOutcome, Submitter,
};
use super::config::RunConfig;
use crate::error::CollaboratorError;

/// Upper bound for a single HTTP request; stage timeouts usually fire first.
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

/// Environment variable holding the collaborator API key.
pub const API_KEY_ENV: &str = "APPLY_FORGE_API_KEY";

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    results: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct SignalsResponse {
    signals: Vec<Signal>,
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    posting: &'a JobPosting,
    resume: &'a Value,
    session: &'a str,
}

/// JSON-over-HTTP client implementing every collaborator trait.
#[derive(Debug, Clone)]
pub struct HttpCollaborator {
    base_url: String,
    api_key: Option<String>,
    http_client: Client,
}

impl HttpCollaborator {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, CollaboratorError> {
        let http_client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| CollaboratorError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            http_client,
        })
    }

    /// Builds a client from `APPLY_FORGE_API_KEY` and the given base URL.
    pub fn from_env(base_url: impl Into<String>) -> Result<Self, CollaboratorError> {
        Self::new(base_url, std::env::var(API_KEY_ENV).ok())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Wires this client into every collaborator slot.
    pub fn into_collaborators(self) -> Collaborators {
        let client = Arc::new(self);
        Collaborators {
            search: client.clone(),
            matcher: client.clone(),
            signals: client.clone(),
            submitter: client.clone(),
            auth: client,
        }
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, CollaboratorError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(ref api_key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = request.json(body).send().await?;
        let status = response.status();
        debug!(url = %url, status = status.as_u16(), "Collaborator call");

        if !status.is_success() {
            let status_code = status.as_u16();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            let message = serde_json::from_str::<ApiErrorResponse>(&error_text)
                .map(|e| e.error)
                .unwrap_or(error_text);

            // 507 Insufficient Storage means the collaborator host is out of
            // resources, not that this request was bad.
            if status_code == 507 {
                return Err(CollaboratorError::ResourceExhausted(message));
            }
            return Err(CollaboratorError::Rejected {
                status: status_code,
                message,
            });
        }

        response
            .json()
            .await
            .map_err(|e| CollaboratorError::InvalidResponse(e.to_string()))
    }

    async fn health(&self) -> Result<(), CollaboratorError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http_client.get(&url).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(CollaboratorError::Unavailable(format!(
                "{} returned {}",
                url,
                response.status()
            )))
        }
    }
}

#[async_trait]
impl SearchProvider for HttpCollaborator {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Value>, CollaboratorError> {
        let response: SearchResponse = self
            .post("/search", &json!({ "query": query, "limit": limit }))
            .await?;
        Ok(response.results)
    }

    async fn probe(&self) -> Result<(), CollaboratorError> {
        self.health().await
    }
}

#[async_trait]
impl MatchScorer for HttpCollaborator {
    async fn score(
        &self,
        resume: &Value,
        posting: &JobPosting,
    ) -> Result<MatchScore, CollaboratorError> {
        self.post("/score", &json!({ "resume": resume, "posting": posting }))
            .await
    }

    async fn probe(&self) -> Result<(), CollaboratorError> {
        self.health().await
    }
}

#[async_trait]
impl SignalProvider for HttpCollaborator {
    async fn signals(&self, posting: &JobPosting) -> Result<Vec<Signal>, CollaboratorError> {
        let response: SignalsResponse = self
            .post("/signals", &json!({ "posting": posting }))
            .await?;
        Ok(response.signals)
    }

    async fn probe(&self) -> Result<(), CollaboratorError> {
        self.health().await
    }
}

#[async_trait]
impl Submitter for HttpCollaborator {
    async fn submit(
        &self,
        posting: &JobPosting,
        resume: &Value,
        session: &SessionHandle,
    ) -> Result<SubmissionOutcome, CollaboratorError> {
        self.post(
            "/submit",
            &SubmitRequest {
                posting,
                resume,
                session: &session.token,
            },
        )
        .await
    }

    async fn probe(&self) -> Result<(), CollaboratorError> {
        self.health().await
    }
}

#[async_trait]
impl AuthProvider for HttpCollaborator {
    async fn acquire_session(&self) -> Result<SessionHandle, CollaboratorError> {
        self.post("/session", &json!({})).await
    }

    async fn probe(&self) -> Result<(), CollaboratorError> {
        self.health().await
    }
}

/// Candidates loaded from a JSON array on disk.
///
/// Each candidate may carry precomputed `match_score` (number) and `signals`
/// (object of criterion to unit-scale value) fields, which back the matching
/// and enrichment collaborators. Submission is refused; use it with dry runs.
#[derive(Debug, Clone, Default)]
pub struct StaticCandidates {
    candidates: Vec<Value>,
    by_url: HashMap<String, Value>,
}

impl StaticCandidates {
    pub fn new(candidates: Vec<Value>) -> Self {
        let by_url = candidates
            .iter()
            .filter_map(|c| bridge::dedup_url(c).map(|url| (url, c.clone())))
            .collect();
        Self { candidates, by_url }
    }

    pub fn from_file(path: &Path) -> Result<Self, CollaboratorError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CollaboratorError::Unavailable(format!("{}: {}", path.display(), e))
        })?;
        let candidates: Vec<Value> = serde_json::from_str(&content)
            .map_err(|e| CollaboratorError::InvalidResponse(format!("{}: {}", path.display(), e)))?;
        Ok(Self::new(candidates))
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn into_collaborators(self) -> Collaborators {
        let source = Arc::new(self);
        Collaborators {
            search: source.clone(),
            matcher: source.clone(),
            signals: source.clone(),
            submitter: source.clone(),
            auth: source,
        }
    }

    fn candidate_for(&self, posting: &JobPosting) -> Result<&Value, CollaboratorError> {
        let key = posting.url.trim().trim_end_matches('/').to_lowercase();
        self.by_url.get(&key).ok_or_else(|| {
            CollaboratorError::InvalidResponse(format!("no candidate for {}", posting.url))
        })
    }
}

#[async_trait]
impl SearchProvider for StaticCandidates {
    async fn search(&self, _query: &str, limit: usize) -> Result<Vec<Value>, CollaboratorError> {
        Ok(self.candidates.iter().take(limit).cloned().collect())
    }
}

#[async_trait]
impl MatchScorer for StaticCandidates {
    async fn score(
        &self,
        _resume: &Value,
        posting: &JobPosting,
    ) -> Result<MatchScore, CollaboratorError> {
        let candidate = self.candidate_for(posting)?;
        let score = candidate
            .get("match_score")
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                CollaboratorError::InvalidResponse(format!(
                    "candidate {} has no match_score",
                    posting.url
                ))
            })?;
        Ok(MatchScore {
            score,
            explanation: "precomputed".to_string(),
        })
    }
}

#[async_trait]
impl SignalProvider for StaticCandidates {
    async fn signals(&self, posting: &JobPosting) -> Result<Vec<Signal>, CollaboratorError> {
        let candidate = self.candidate_for(posting)?;
        let Some(signals) = candidate.get("signals").and_then(Value::as_object) else {
            return Ok(Vec::new());
        };
        signals
            .iter()
            .map(|(criterion, value)| {
                value
                    .as_f64()
                    .map(|v| Signal::unit(criterion.clone(), v))
                    .ok_or_else(|| {
                        CollaboratorError::InvalidResponse(format!(
                            "signal '{}' is not a number",
                            criterion
                        ))
                    })
            })
            .collect()
    }
}

#[async_trait]
impl Submitter for StaticCandidates {
    async fn submit(
        &self,
        _posting: &JobPosting,
        _resume: &Value,
        _session: &SessionHandle,
    ) -> Result<SubmissionOutcome, CollaboratorError> {
        Err(CollaboratorError::Unavailable(
            "static candidates cannot submit; run with dry_run".to_string(),
        ))
    }
}

#[async_trait]
impl AuthProvider for StaticCandidates {
    async fn acquire_session(&self) -> Result<SessionHandle, CollaboratorError> {
        Ok(SessionHandle {
            token: "offline".to_string(),
            expires_at: None,
        })
    }
}

/// Picks collaborators for `config`: a local candidates file wins over the
/// HTTP service.
pub fn collaborators_for(config: &RunConfig) -> Result<Collaborators, CollaboratorError> {
    if let Some(path) = &config.collaborators.candidates_file {
        return Ok(StaticCandidates::from_file(path)?.into_collaborators());
    }
    match &config.collaborators.base_url {
        Some(base_url) => Ok(HttpCollaborator::from_env(base_url.clone())?.into_collaborators()),
        None => Err(CollaboratorError::Unavailable(
            "no collaborator configured: set collaborators.base_url or collaborators.candidates_file"
                .to_string(),
        )),
    }
}
