//! Metrics module for Prometheus-based monitoring.
//!
//! Stage timings, failures by category, queue depth and submission outcomes
//! are exposed through a global registry. [`MetricsObserver`] plugs into a run
//! as a [`crate::pipeline::RunObserver`].
//!
//! # Example
//!
//! ```ignore
//! use apply_forge::metrics::{export_metrics, init_metrics, MetricsObserver};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! controller.register_observer(Arc::new(MetricsObserver::new()));
//!
//! // After the run
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsObserver;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    CHECKPOINTS_TOTAL, ITEMS_IN_PROGRESS, ITEMS_TOTAL, QUEUE_DEPTH, REGISTRY, STAGE_DURATION,
    STAGE_FAILURES_TOTAL, SUBMISSIONS_TOTAL,
};
