//! Run observers.
//!
//! Monitoring depends on the controller, never the reverse: anything that
//! wants to watch a run implements [`RunObserver`] and is registered with the
//! `MasterController`, which hands the list to the scheduler.

use std::time::Duration;

use tracing::{info, warn};

use super::item::{ErrorRecord, Stage, WorkItem};
use super::orchestrator::{RunReport, RunStatus};

/// Callbacks invoked by the scheduler. Implementations must be cheap; they run
/// on worker tasks.
pub trait RunObserver: Send + Sync {
    /// A stage attempt finished successfully.
    fn on_stage_completed(&self, _item: &WorkItem, _stage: Stage, _elapsed: Duration) {}

    /// A stage attempt failed and recovery decided what to do.
    fn on_stage_failure(&self, _item: &WorkItem, _record: &ErrorRecord) {}

    /// The item reached a terminal status.
    fn on_item_finished(&self, _item: &WorkItem) {}

    /// A checkpoint was written.
    fn on_checkpoint(&self, _sequence: u64, _status: &RunStatus) {}

    /// Published after every scheduler step.
    fn on_status(&self, _status: &RunStatus) {}

    fn on_run_finished(&self, _report: &RunReport) {}
}

/// Logs progress at checkpoints and a summary at the end of the run.
#[derive(Debug, Default, Clone)]
pub struct LoggingObserver;

impl LoggingObserver {
    pub fn new() -> Self {
        Self
    }
}

impl RunObserver for LoggingObserver {
    fn on_item_finished(&self, item: &WorkItem) {
        info!(
            item_id = %item.id,
            status = %item.status,
            stage = %item.stage,
            tier = item.tier().map(|t| t.as_str()).unwrap_or("undecided"),
            escalated = item.escalated,
            "Item finished"
        );
    }

    fn on_checkpoint(&self, sequence: u64, status: &RunStatus) {
        info!(
            run_id = %status.run_id,
            sequence,
            backlog = status.backlog,
            in_flight = status.in_flight,
            steps = status.stage_steps,
            "Progress checkpoint"
        );
    }

    fn on_run_finished(&self, report: &RunReport) {
        let summary = report.summary();
        if report.abort_reason.is_some() {
            warn!(
                run_id = %report.run_id,
                state = %report.state,
                reason = report.abort_reason.as_deref().unwrap_or_default(),
                "Run aborted"
            );
        }
        info!(
            run_id = %report.run_id,
            state = %report.state,
            succeeded = summary.succeeded,
            failed = summary.failed,
            rejected = summary.rejected,
            escalated = summary.escalated,
            errors = report.errors.len(),
            "Run finished"
        );
    }
}
