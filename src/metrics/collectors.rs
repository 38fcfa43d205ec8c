//! Run observer that feeds the Prometheus metrics.
//!
//! `MetricsObserver` wraps the raw statics; every method is a no-op until
//! `init_metrics()` has run.

use std::time::Duration;

use super::prometheus::{
    CHECKPOINTS_TOTAL, ITEMS_IN_PROGRESS, ITEMS_TOTAL, QUEUE_DEPTH, STAGE_DURATION,
    STAGE_FAILURES_TOTAL, SUBMISSIONS_TOTAL,
};
use crate::pipeline::{ErrorRecord, RunObserver, RunStatus, Stage, Tier, WorkItem};

/// Records run events as Prometheus metrics.
///
/// ```ignore
/// use apply_forge::metrics::{init_metrics, MetricsObserver};
///
/// init_metrics()?;
/// controller.register_observer(Arc::new(MetricsObserver::new()));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsObserver;

impl MetricsObserver {
    pub fn new() -> Self {
        Self
    }

    /// Record a successful stage attempt.
    pub fn record_stage(&self, stage: Stage, duration_secs: f64) {
        if let Some(durations) = STAGE_DURATION.get() {
            durations
                .with_label_values(&[stage.as_str()])
                .observe(duration_secs);
        }
    }

    pub fn record_failure(&self, stage: Stage, category: &str) {
        if let Some(failures) = STAGE_FAILURES_TOTAL.get() {
            failures.with_label_values(&[stage.as_str(), category]).inc();
        }
    }

    /// Record a submission stage outcome (`submitted`, `simulated` or `review`).
    pub fn record_submission(&self, outcome: &str) {
        if let Some(submissions) = SUBMISSIONS_TOTAL.get() {
            submissions.with_label_values(&[outcome]).inc();
        }
    }

    pub fn record_item(&self, status: &str) {
        if let Some(items) = ITEMS_TOTAL.get() {
            items.with_label_values(&[status]).inc();
        }
    }

    pub fn set_queue_depth(&self, depth: usize) {
        if let Some(gauge) = QUEUE_DEPTH.get() {
            gauge.set(depth as f64);
        }
    }

    pub fn set_in_progress(&self, count: usize) {
        if let Some(gauge) = ITEMS_IN_PROGRESS.get() {
            gauge.set(count as f64);
        }
    }

    pub fn record_checkpoint(&self) {
        if let Some(counter) = CHECKPOINTS_TOTAL.get() {
            counter.inc();
        }
    }
}

impl RunObserver for MetricsObserver {
    fn on_stage_completed(&self, item: &WorkItem, stage: Stage, elapsed: Duration) {
        self.record_stage(stage, elapsed.as_secs_f64());

        if stage == Stage::Submit {
            let outcome = match (&item.submission, item.tier()) {
                (Some(record), _) if record.simulated => Some("simulated"),
                (Some(_), _) => Some("submitted"),
                (None, Some(Tier::Review)) => Some("review"),
                _ => None,
            };
            if let Some(outcome) = outcome {
                self.record_submission(outcome);
            }
        }
    }

    fn on_stage_failure(&self, _item: &WorkItem, record: &ErrorRecord) {
        self.record_failure(record.stage, record.category.as_str());
    }

    fn on_item_finished(&self, item: &WorkItem) {
        self.record_item(item.status.as_str());
    }

    fn on_checkpoint(&self, _sequence: u64, _status: &RunStatus) {
        self.record_checkpoint();
    }

    fn on_status(&self, status: &RunStatus) {
        self.set_queue_depth(status.backlog);
        self.set_in_progress(status.in_flight);
    }
}
