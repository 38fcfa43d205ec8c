//! Run lifecycle.
//!
//! [`MasterController`] validates a configuration, builds the run's
//! components, ingests candidates (or restores the latest checkpoint) and
//! hands the work to a [`JobScheduler`]. Status queries read the last
//! published [`RunStatus`] snapshot and never touch scheduler internals.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::bridge::{self, DataBridge};
use super::collaborators::{CollaboratorHealth, Collaborators};
use super::config::{ConfigError, RunConfig};
use super::decision::{DecisionEngine, DecisionError};
use super::item::{ErrorRecord, ItemStatus, Stage, Tier, WorkItem};
use super::observer::RunObserver;
use super::recovery::RecoveryManager;
use super::stages::StageRunner;
use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointRef, CheckpointStore, RunCounters};
use crate::error::{CollaboratorError, ErrorCategory};
use crate::scheduler::{
    InitialState, JobScheduler, SchedulerControl, SchedulerError, SubmissionLimiter,
};

/// Errors that can occur while starting or supervising a run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Invalid configuration, including checkpoint drift.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Decision configuration error: {0}")]
    Decision(#[from] DecisionError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Candidate ingestion failed.
    #[error("Search failed: {0}")]
    Search(#[from] CollaboratorError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Run '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Run task failed: {0}")]
    TaskFailed(String),
}

impl OrchestratorError {
    /// Process exit code for a run that could not start or finish.
    ///
    /// `2` for invalid configuration and for a search that hit resource
    /// exhaustion, the same code an aborted run reports. `1` for everything
    /// else.
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::Config(_) | OrchestratorError::Decision(_) => 2,
            OrchestratorError::Search(e) if e.category_hint() == Some(ErrorCategory::Resource) => {
                2
            }
            OrchestratorError::Search(_)
            | OrchestratorError::Checkpoint(_)
            | OrchestratorError::Scheduler(_)
            | OrchestratorError::AlreadyRunning(_)
            | OrchestratorError::TaskFailed(_) => 1,
        }
    }
}

/// Overall state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Completed,
    Cancelled,
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Running => write!(f, "running"),
            RunState::Completed => write!(f, "completed"),
            RunState::Cancelled => write!(f, "cancelled"),
            RunState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: String,
    pub state: RunState,
    pub counts_by_status: BTreeMap<ItemStatus, usize>,
    /// Keyed by tier name, plus `undecided`.
    pub counts_by_tier: BTreeMap<String, usize>,
    pub escalated: usize,
    /// Queued items, ready and deferred.
    pub backlog: usize,
    pub deferred: usize,
    pub in_flight: usize,
    pub stage_steps: u64,
    /// Stage steps per second since the run started.
    pub throughput_per_sec: f64,
    pub started_at: DateTime<Utc>,
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    pub last_checkpoint_sequence: Option<u64>,
}

const UNDECIDED: &str = "undecided";

impl RunStatus {
    pub fn new(run_id: &str, started_at: DateTime<Utc>) -> Self {
        let mut counts_by_tier: BTreeMap<String, usize> = Tier::ALL
            .iter()
            .map(|tier| (tier.as_str().to_string(), 0))
            .collect();
        counts_by_tier.insert(UNDECIDED.to_string(), 0);

        Self {
            run_id: run_id.to_string(),
            state: RunState::Running,
            counts_by_status: ItemStatus::ALL.iter().map(|s| (*s, 0)).collect(),
            counts_by_tier,
            escalated: 0,
            backlog: 0,
            deferred: 0,
            in_flight: 0,
            stage_steps: 0,
            throughput_per_sec: 0.0,
            started_at,
            last_checkpoint_at: None,
            last_checkpoint_sequence: None,
        }
    }

    /// Adds one item to the status and tier counts.
    pub fn record_item(&mut self, item: &WorkItem) {
        *self.counts_by_status.entry(item.status).or_insert(0) += 1;
        let tier = item.tier().map(|t| t.as_str()).unwrap_or(UNDECIDED);
        *self.counts_by_tier.entry(tier.to_string()).or_insert(0) += 1;
        if item.escalated {
            self.escalated += 1;
        }
    }

    pub fn count(&self, status: ItemStatus) -> usize {
        self.counts_by_status.get(&status).copied().unwrap_or(0)
    }

    /// Status as recorded by a stored checkpoint.
    pub fn from_checkpoint(checkpoint: &Checkpoint, state: RunState) -> Self {
        let run = &checkpoint.state;
        let mut status = Self::new(&run.run_id, checkpoint.created_at);
        status.state = state;
        for item in &run.items {
            status.record_item(item);
        }
        status.backlog = run.queue.ready.len() + run.queue.deferred.len();
        status.deferred = run.queue.deferred.len();
        status.stage_steps = run.counters.stage_steps;
        status.last_checkpoint_at = Some(checkpoint.created_at);
        status.last_checkpoint_sequence = Some(checkpoint.sequence);
        status
    }
}

/// Terminal counts of a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    /// Failed by error, escalated items included.
    pub failed: usize,
    /// Rejected by decision.
    pub rejected: usize,
    pub escalated: usize,
    /// Not yet terminal (cancelled or aborted runs).
    pub unfinished: usize,
}

/// Outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub state: RunState,
    pub abort_reason: Option<String>,
    pub status: RunStatus,
    pub counters: RunCounters,
    pub items: Vec<WorkItem>,
    /// Every recorded failure, oldest first.
    pub errors: Vec<ErrorRecord>,
    pub peak_concurrency: usize,
}

impl RunReport {
    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary {
            total: self.items.len(),
            ..RunSummary::default()
        };
        for item in &self.items {
            match item.status {
                ItemStatus::Succeeded => summary.succeeded += 1,
                ItemStatus::Failed => summary.failed += 1,
                ItemStatus::Rejected => summary.rejected += 1,
                ItemStatus::Pending | ItemStatus::InProgress => summary.unfinished += 1,
            }
            if item.escalated {
                summary.escalated += 1;
            }
        }
        summary
    }

    /// `0` when every item succeeded, `2` when the run aborted, `1` otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.state == RunState::Aborted {
            return 2;
        }
        let summary = self.summary();
        if self.state == RunState::Completed && summary.succeeded == summary.total {
            0
        } else {
            1
        }
    }
}

/// Collaborator reachability and scheduler backlog.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub collaborators: Vec<CollaboratorHealth>,
    pub backlog: usize,
    pub healthy: bool,
}

/// Handle to a started run.
pub struct RunHandle {
    run_id: String,
    control: SchedulerControl,
    task: JoinHandle<Result<RunReport, SchedulerError>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Requests cooperative shutdown.
    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// Cloneable control for cancelling from another task.
    pub fn control(&self) -> SchedulerControl {
        self.control.clone()
    }

    /// Waits for the run to finish.
    pub async fn wait(self) -> Result<RunReport, OrchestratorError> {
        self.task
            .await
            .map_err(|e| OrchestratorError::TaskFailed(e.to_string()))?
            .map_err(OrchestratorError::from)
    }
}

/// Current run, if any.
struct ActiveRun {
    run_id: String,
    status: watch::Receiver<RunStatus>,
}

/// Top-level entry point for runs.
pub struct MasterController {
    collaborators: Collaborators,
    checkpoints: Arc<CheckpointStore>,
    resume: Arc<Value>,
    observers: Vec<Arc<dyn RunObserver>>,
    active: Mutex<Option<ActiveRun>>,
}

impl MasterController {
    pub fn new(collaborators: Collaborators, checkpoints: Arc<CheckpointStore>) -> Self {
        Self {
            collaborators,
            checkpoints,
            resume: Arc::new(Value::Null),
            observers: Vec::new(),
            active: Mutex::new(None),
        }
    }

    /// Sets the resume document passed to the matching and submission
    /// collaborators.
    pub fn with_resume(mut self, resume: Value) -> Self {
        self.resume = Arc::new(resume);
        self
    }

    /// Registers an observer for every subsequent run.
    pub fn register_observer(&mut self, observer: Arc<dyn RunObserver>) {
        self.observers.push(observer);
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    /// Validates `config`, prepares the run and starts the scheduler.
    ///
    /// Nothing is scheduled unless every check passes.
    pub async fn start_run(&self, config: RunConfig) -> Result<RunHandle, OrchestratorError> {
        if let Some(status) = self.status() {
            if status.state == RunState::Running {
                return Err(OrchestratorError::AlreadyRunning(status.run_id));
            }
        }

        config.validate()?;
        let engine = DecisionEngine::new(&config.decision)?;
        let recovery = RecoveryManager::from_config(&config)?;
        let config = Arc::new(config);

        let (initial, recovery) = match self.restore(&config).await? {
            Some(checkpoint) => {
                let records = checkpoint.state.errors.clone();
                (
                    Self::resume_from(checkpoint, &config),
                    recovery.with_records(records),
                )
            }
            None => (self.ingest(&config).await?, recovery),
        };

        info!(
            run_id = %config.run_id,
            items = initial.items.len(),
            dry_run = config.dry_run,
            resumed = initial.last_checkpoint.is_some(),
            "Starting run"
        );

        let bridge = Arc::new(DataBridge::new(&config));
        let limiter = Arc::new(SubmissionLimiter::from_config(&config));
        let runner = Arc::new(StageRunner::new(
            Arc::clone(&config),
            bridge,
            engine,
            self.collaborators.clone(),
            Arc::clone(&self.resume),
            limiter,
        ));

        let (status_tx, status_rx) = watch::channel(RunStatus::new(&config.run_id, Utc::now()));
        let scheduler = JobScheduler::new(
            Arc::clone(&config),
            runner,
            Arc::new(recovery),
            Arc::clone(&self.checkpoints),
            self.observers.clone(),
            initial,
            status_tx,
        );
        let control = scheduler.control();

        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = Some(ActiveRun {
            run_id: config.run_id.clone(),
            status: status_rx,
        });

        let checkpoints = Arc::clone(&self.checkpoints);
        let run_config = Arc::clone(&config);
        let task = tokio::spawn(async move {
            let report = scheduler.run().await?;
            if let Err(e) = checkpoints
                .prune(&run_config.run_id, &run_config.retention)
                .await
            {
                error!(run_id = %run_config.run_id, error = %e, "Checkpoint pruning failed");
            }
            Ok(report)
        });

        Ok(RunHandle {
            run_id: config.run_id.clone(),
            control,
            task,
        })
    }

    /// Latest published status of the current or last run.
    pub fn status(&self) -> Option<RunStatus> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|run| run.status.borrow().clone())
    }

    /// Probes every collaborator without side effects.
    pub async fn health_check(&self) -> HealthReport {
        let collaborators = self.collaborators.probe_all().await;
        let backlog = self.status().map(|s| s.backlog).unwrap_or(0);
        let healthy = collaborators.iter().all(|c| c.reachable);
        HealthReport {
            collaborators,
            backlog,
            healthy,
        }
    }

    /// Requests cooperative shutdown of `handle`'s run.
    pub fn cancel(&self, handle: &RunHandle) {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(run) = active.as_ref() {
            if run.run_id != handle.run_id {
                warn!(
                    run_id = %handle.run_id,
                    active = %run.run_id,
                    "Cancelling a run that is not the active one"
                );
            }
        }
        handle.cancel();
    }

    /// Loads the latest checkpoint when resuming, enforcing drift rules.
    async fn restore(&self, config: &RunConfig) -> Result<Option<Checkpoint>, OrchestratorError> {
        if !config.resume {
            return Ok(None);
        }

        let checkpoint = match self
            .checkpoints
            .restore(&config.run_id, CheckpointRef::Latest)
            .await
        {
            Ok(checkpoint) => checkpoint,
            Err(CheckpointError::NoCheckpoints(_)) => {
                info!(run_id = %config.run_id, "No checkpoint to resume from; starting fresh");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let current = config.config_hash();
        if checkpoint.state.config_hash != current {
            let stored = checkpoint.state.config_hash.clone();
            if !config.allow_config_drift {
                return Err(ConfigError::Drift { stored, current }.into());
            }
            warn!(
                run_id = %config.run_id,
                stored = %stored,
                current = %current,
                "Configuration changed since the checkpoint; resuming anyway"
            );
        }

        info!(
            run_id = %config.run_id,
            sequence = checkpoint.sequence,
            items = checkpoint.state.items.len(),
            "Resuming from checkpoint"
        );
        Ok(Some(checkpoint))
    }

    fn resume_from(checkpoint: Checkpoint, config: &RunConfig) -> InitialState {
        let mut state = checkpoint.state;
        let drifted = state.config_hash != config.config_hash();

        if drifted && config.stages.contains(&Stage::Decide) {
            // Decisions taken under the old configuration are recomputed.
            let mut rescored = 0;
            for item in state.items.iter_mut().filter(|i| i.decision.is_some()) {
                if item.request_rescore().is_ok() {
                    rescored += 1;
                }
            }
            if rescored > 0 {
                info!(run_id = %config.run_id, rescored, "Cleared decisions for rescoring");
            }
        }

        InitialState {
            items: state.items,
            queue: state.queue,
            counters: state.counters,
            last_checkpoint: Some(checkpoint.sequence),
        }
    }

    /// Runs the search collaborator and de-duplicates its results.
    async fn ingest(&self, config: &RunConfig) -> Result<InitialState, OrchestratorError> {
        let timeout = config.stage_timeout();
        let payloads = tokio::time::timeout(
            timeout,
            self.collaborators
                .search
                .search(&config.search.query, config.search.limit),
        )
        .await
        .map_err(|_| CollaboratorError::Timeout {
            operation: "search".to_string(),
            seconds: timeout.as_secs(),
        })??;

        let first_stage = config.first_stage();
        let mut fingerprints: HashSet<String> = HashSet::new();
        let mut urls: HashSet<String> = HashSet::new();
        let mut counters = RunCounters::default();
        let mut items = Vec::new();

        for payload in payloads {
            let fingerprint = bridge::fingerprint(&payload);
            let url = bridge::dedup_url(&payload);
            let seen_url = url.as_ref().is_some_and(|u| urls.contains(u));
            if fingerprints.contains(&fingerprint) || seen_url {
                counters.duplicates_skipped += 1;
                continue;
            }
            fingerprints.insert(fingerprint.clone());
            if let Some(url) = url {
                urls.insert(url);
            }
            items.push(WorkItem::new(payload, fingerprint, first_stage));
        }
        counters.ingested = items.len() as u64;

        info!(
            run_id = %config.run_id,
            ingested = counters.ingested,
            duplicates = counters.duplicates_skipped,
            "Candidates ingested"
        );

        Ok(InitialState {
            items,
            counters,
            ..InitialState::default()
        })
    }
}
