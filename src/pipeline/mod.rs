//! The application pipeline.
//!
//! Candidates returned by the search collaborator become [`WorkItem`]s that
//! move through an ordered list of stages:
//!
//! 1. **extract**: validate the raw payload and normalize it into a [`JobPosting`]
//! 2. **enrich**: gather company, salary and location signals
//! 3. **match**: score the resume against the posting
//! 4. **decide**: compose the criteria into a tiered [`DecisionRecord`]
//! 5. **submit**: submit `submit`-tier items (simulated under dry-run)
//!
//! Stage failures are classified by the [`RecoveryManager`], which decides
//! whether the item is retried after a delay, dropped, escalated for manual
//! intervention or whether the whole run aborts.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use apply_forge::checkpoint::{CheckpointStore, FsKvStore};
//! use apply_forge::pipeline::{HttpCollaborator, MasterController, RunConfig};
//!
//! let config = RunConfig::load(Path::new("run.yaml"))?;
//! let collaborators = HttpCollaborator::from_env("http://localhost:8080")?.into_collaborators();
//! let store = Arc::new(CheckpointStore::new(Arc::new(FsKvStore::new(&config.checkpoint_dir))));
//!
//! let controller = MasterController::new(collaborators, store);
//! let handle = controller.start_run(config).await?;
//! let report = handle.wait().await?;
//! println!("{} items, exit code {}", report.items.len(), report.exit_code());
//! ```

pub mod bridge;
pub mod collaborators;
pub mod config;
pub mod decision;
pub mod http;
pub mod item;
pub mod observer;
pub mod orchestrator;
pub mod recovery;
pub mod stages;

// Re-export main types for convenience
pub use bridge::{BridgeCacheStats, DataBridge, JobPosting, SalaryRange};
pub use collaborators::{
    AuthProvider, CollaboratorHealth, Collaborators, MatchScore, MatchScorer, SearchProvider,
    SessionHandle, Signal, SignalProvider, SignalScale, SubmissionOutcome, Submitter,
};
pub use config::{
    ClassificationRule, CollaboratorConfig, ConfigError, DecisionConfig, RetentionPolicy,
    RunConfig, SearchConfig, SmartDelayConfig,
};
pub use decision::{DecisionEngine, DecisionError};
pub use http::{collaborators_for, HttpCollaborator, StaticCandidates};
pub use item::{
    DecisionRecord, ErrorRecord, ItemStatus, Stage, SubmissionRecord, Tier, TransitionError,
    WorkItem,
};
pub use observer::{LoggingObserver, RunObserver};
pub use orchestrator::{
    HealthReport, MasterController, OrchestratorError, RunHandle, RunReport, RunState, RunStatus,
    RunSummary,
};
pub use recovery::{ErrorClassifier, RecoveryAction, RecoveryManager, RetryPolicy};
pub use stages::{StageOutcome, StageRunner, SEMANTIC_MATCH};
