//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by apply_forge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{Counter, CounterVec, Encoder, Gauge, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::{Mutex, OnceLock};

/// Global Prometheus registry for all apply_forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Serializes initialization so every static comes from the same registry.
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Items that reached a terminal status, labeled by status.
pub static ITEMS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Duration of successful stage attempts in seconds, labeled by stage.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Stage failures, labeled by stage and error category.
pub static STAGE_FAILURES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Items waiting in the scheduler queue, ready or deferred.
pub static QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Items currently leased by a worker.
pub static ITEMS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Checkpoints written.
pub static CHECKPOINTS_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Submission stage outcomes, labeled by outcome (submitted, simulated, review).
pub static SUBMISSIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup; later calls leave the first registration in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }
    let registry = Registry::new();

    // Item metrics
    let items_total = CounterVec::new(
        Opts::new(
            "apply_forge_items_total",
            "Items that reached a terminal status",
        ),
        &["status"],
    )?;

    // Stage metrics
    let stage_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "apply_forge_stage_duration_seconds",
            "Duration of successful stage attempts in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0]),
        &["stage"],
    )?;

    let stage_failures_total = CounterVec::new(
        Opts::new(
            "apply_forge_stage_failures_total",
            "Stage failures by stage and error category",
        ),
        &["stage", "category"],
    )?;

    // Scheduler metrics
    let queue_depth = Gauge::new(
        "apply_forge_queue_depth",
        "Items waiting in the scheduler queue",
    )?;

    let items_in_progress = Gauge::new(
        "apply_forge_items_in_progress",
        "Items currently leased by a worker",
    )?;

    let checkpoints_total = Counter::new("apply_forge_checkpoints_total", "Checkpoints written")?;

    let submissions_total = CounterVec::new(
        Opts::new(
            "apply_forge_submissions_total",
            "Submission stage outcomes",
        ),
        &["outcome"],
    )?;

    registry.register(Box::new(items_total.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(stage_failures_total.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(items_in_progress.clone()))?;
    registry.register(Box::new(checkpoints_total.clone()))?;
    registry.register(Box::new(submissions_total.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = ITEMS_TOTAL.set(items_total);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = STAGE_FAILURES_TOTAL.set(stage_failures_total);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ITEMS_IN_PROGRESS.set(items_in_progress);
    let _ = CHECKPOINTS_TOTAL.set(checkpoints_total);
    let _ = SUBMISSIONS_TOTAL.set(submissions_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line instead when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
