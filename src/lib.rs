//! apply_forge: job application pipeline orchestrator.
//!
//! Candidates from a search collaborator are pushed through ordered stages
//! (extract, enrich, match, decide, submit) by a bounded worker pool, scored
//! into tiers, and submitted under a rate limit. Failures are classified and
//! retried, dropped, escalated or abort the run; state is checkpointed so a
//! run can resume where it stopped.

pub mod checkpoint;
pub mod cli;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;

// Re-export commonly used error types
pub use error::{BridgeError, CollaboratorError, ErrorCategory, StageFailure};
