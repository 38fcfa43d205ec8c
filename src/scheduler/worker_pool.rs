//! Bounded worker pool that advances work items through stages.
//!
//! `max_concurrency` workers run as independent tokio tasks. Each worker
//! claims the highest-priority ready item under a short critical section,
//! marks it in progress and takes a lease on it, runs exactly one stage, then requeues or archives the
//! item and releases the lease under a second short critical section. The
//! dispatch lock is never held across an await.
//!
//! # Cancellation
//!
//! Cancel and abort are flags checked between stage calls. A worker inside a
//! collaborator call finishes it (bounded by the stage timeout) before it
//! notices. A final checkpoint is always written before the run reports its
//! outcome.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::lease::{LeaseId, LeaseTable};
use super::queue::{QueueState, WorkQueue};
use crate::checkpoint::{CheckpointStore, ExecutionState, RunCounters};
use crate::pipeline::{
    RecoveryAction, RecoveryManager, RunConfig, RunObserver, RunReport, RunState, RunStatus,
    StageOutcome, StageRunner, TransitionError, WorkItem,
};

/// How long an idle worker sleeps before re-checking the queue when nothing
/// wakes it.
const IDLE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Scheduler already started")]
    AlreadyStarted,
}

/// Items and queue contents a run starts from.
#[derive(Debug, Default)]
pub struct InitialState {
    pub items: Vec<WorkItem>,
    pub queue: QueueState,
    pub counters: RunCounters,
    pub last_checkpoint: Option<u64>,
}

/// State mutated by every worker; guarded by one mutex.
#[derive(Debug, Default)]
struct Dispatch {
    queue: WorkQueue,
    leases: LeaseTable,
    /// Terminal items.
    archive: Vec<WorkItem>,
    counters: RunCounters,
}

enum Claim {
    Item(WorkItem, LeaseId),
    /// Nothing ready; wait until the deadline or a wake-up.
    Wait(Option<Instant>),
    /// Queue empty and no item in flight.
    Drained,
}

/// Shared state between the scheduler, its workers and the controller.
struct Shared {
    dispatch: Mutex<Dispatch>,
    wake: Notify,
    cancel: AtomicBool,
    abort: AtomicBool,
    abort_reason: Mutex<Option<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    steps_since_checkpoint: AtomicU64,
    checkpoint_gate: tokio::sync::Mutex<()>,
    last_checkpoint: Mutex<Option<(u64, chrono::DateTime<Utc>)>>,
    status_tx: watch::Sender<RunStatus>,
    started_at: chrono::DateTime<Utc>,
}

impl Shared {
    fn dispatch(&self) -> MutexGuard<'_, Dispatch> {
        self.dispatch.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stopping(&self) -> bool {
        self.cancel.load(Ordering::SeqCst) || self.abort.load(Ordering::SeqCst)
    }
}

/// Cheap handle for cancelling a running scheduler and reading its gauges.
#[derive(Clone)]
pub struct SchedulerControl {
    shared: Arc<Shared>,
    runner: Arc<StageRunner>,
}

impl SchedulerControl {
    /// Requests cooperative shutdown. Workers parked on a submission slot
    /// are released at once.
    pub fn cancel(&self) {
        if !self.shared.cancel.swap(true, Ordering::SeqCst) {
            info!("Cancellation requested");
        }
        self.runner.interrupt();
        self.shared.wake.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.load(Ordering::SeqCst)
    }

    /// Items currently being processed.
    pub fn active(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Highest number of items processed at once so far.
    pub fn peak_concurrency(&self) -> usize {
        self.shared.peak.load(Ordering::SeqCst)
    }
}

/// Everything a worker needs, shared by reference count.
struct Context {
    config: Arc<RunConfig>,
    runner: Arc<StageRunner>,
    recovery: Arc<RecoveryManager>,
    checkpoints: Arc<CheckpointStore>,
    observers: Arc<Vec<Arc<dyn RunObserver>>>,
    config_hash: String,
    shared: Arc<Shared>,
}

pub struct JobScheduler {
    context: Arc<Context>,
    started: AtomicBool,
}

impl JobScheduler {
    pub fn new(
        config: Arc<RunConfig>,
        runner: Arc<StageRunner>,
        recovery: Arc<RecoveryManager>,
        checkpoints: Arc<CheckpointStore>,
        observers: Vec<Arc<dyn RunObserver>>,
        initial: InitialState,
        status_tx: watch::Sender<RunStatus>,
    ) -> Self {
        let mut dispatch = Dispatch {
            counters: initial.counters,
            ..Dispatch::default()
        };
        seed(&mut dispatch, initial.items, &initial.queue);

        let started_at = Utc::now();
        let last_checkpoint = initial.last_checkpoint.map(|seq| (seq, started_at));
        let shared = Arc::new(Shared {
            dispatch: Mutex::new(dispatch),
            wake: Notify::new(),
            cancel: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            abort_reason: Mutex::new(None),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            steps_since_checkpoint: AtomicU64::new(0),
            checkpoint_gate: tokio::sync::Mutex::new(()),
            last_checkpoint: Mutex::new(last_checkpoint),
            status_tx,
            started_at,
        });

        let context = Arc::new(Context {
            config_hash: config.config_hash(),
            config,
            runner,
            recovery,
            checkpoints,
            observers: Arc::new(observers),
            shared,
        });
        context.publish(RunState::Running);

        Self {
            context,
            started: AtomicBool::new(false),
        }
    }

    pub fn control(&self) -> SchedulerControl {
        SchedulerControl {
            shared: Arc::clone(&self.context.shared),
            runner: Arc::clone(&self.context.runner),
        }
    }

    /// Runs every worker to completion and writes the final checkpoint.
    pub async fn run(&self) -> Result<RunReport, SchedulerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyStarted);
        }
        let context = &self.context;
        let workers = context.config.max_concurrency;
        info!(
            run_id = %context.config.run_id,
            workers,
            queued = context.shared.dispatch().queue.len(),
            "Scheduler started"
        );

        let ticker = context.config.checkpoint_every_secs.map(|secs| {
            let context = Arc::clone(context);
            tokio::spawn(async move {
                let period = Duration::from_secs(secs);
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                loop {
                    interval.tick().await;
                    context.checkpoint("timer", RunState::Running).await;
                }
            })
        });

        let handles: Vec<JoinHandle<()>> = (0..workers)
            .map(|i| {
                let worker = Worker {
                    id: format!("worker-{}", i),
                    context: Arc::clone(context),
                };
                tokio::spawn(async move { worker.run().await })
            })
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
        if let Some(ticker) = ticker {
            ticker.abort();
        }

        let state = if context.shared.abort.load(Ordering::SeqCst) {
            RunState::Aborted
        } else if context.shared.cancel.load(Ordering::SeqCst) {
            RunState::Cancelled
        } else {
            RunState::Completed
        };

        context.checkpoint("final", state).await;
        let status = context.publish(state);
        let report = context.report(status);

        for observer in context.observers.iter() {
            observer.on_run_finished(&report);
        }
        info!(run_id = %report.run_id, state = %report.state, "Scheduler stopped");
        Ok(report)
    }
}

/// Places restored items back into the queue or the archive.
fn seed(dispatch: &mut Dispatch, items: Vec<WorkItem>, queue: &QueueState) {
    let now = Instant::now();
    let mut pending: Vec<WorkItem> = Vec::new();
    let deferred: HashMap<_, _> = queue
        .deferred
        .iter()
        .map(|d| (d.item_id, d.remaining_ms))
        .collect();

    for item in items {
        if item.status.is_terminal() {
            dispatch.archive.push(item);
        } else if let Some(remaining_ms) = deferred.get(&item.id) {
            let delay = Duration::from_millis(*remaining_ms);
            dispatch.queue.push_deferred(item, delay, now);
        } else {
            pending.push(item);
        }
    }

    // Ready items keep their recorded order; anything else follows.
    let order: HashMap<_, _> = queue
        .ready
        .iter()
        .enumerate()
        .map(|(position, id)| (*id, position))
        .collect();
    pending.sort_by_key(|item| order.get(&item.id).copied().unwrap_or(usize::MAX));
    for item in pending {
        dispatch.queue.push(item);
    }
}

impl Context {
    fn claim(&self, worker_id: &str) -> Claim {
        let mut dispatch = self.shared.dispatch();
        dispatch.queue.promote_due(Instant::now());

        if let Some(mut item) = dispatch.queue.pop() {
            // Queued items are pending; only a leased item is in progress.
            if let Err(e) = item.begin() {
                error!(worker_id, item_id = %item.id, error = %e, "Cannot start item");
                dispatch.archive.push(item);
                return Claim::Wait(None);
            }
            match dispatch.leases.acquire(&item, worker_id) {
                Ok(lease_id) => return Claim::Item(item, lease_id),
                Err(e) => {
                    // An item queued while leased means it was requeued twice.
                    error!(worker_id, error = %e, "Dropping duplicate queue entry");
                    return Claim::Wait(None);
                }
            }
        }

        if let Some(at) = dispatch.queue.next_ready_at() {
            Claim::Wait(Some(at))
        } else if !dispatch.leases.is_empty() {
            Claim::Wait(None)
        } else {
            Claim::Drained
        }
    }

    /// Releases the lease and either requeues or archives the item.
    fn settle(&self, lease_id: LeaseId, item: WorkItem, requeue: Requeue, outcome: &StepOutcome) {
        {
            let mut dispatch = self.shared.dispatch();
            if let Err(e) = dispatch.leases.release(lease_id) {
                error!(item_id = %item.id, error = %e, "Lease missing on release");
            }
            dispatch.counters.stage_steps += 1;
            match outcome {
                StepOutcome::Submitted { simulated: true } => {
                    dispatch.counters.simulated_submissions += 1
                }
                StepOutcome::Submitted { simulated: false } => dispatch.counters.submissions += 1,
                StepOutcome::Retried => dispatch.counters.retries += 1,
                StepOutcome::Other => {}
            }
            match requeue {
                Requeue::Now => dispatch.queue.push(item),
                Requeue::After(delay) => dispatch.queue.push_deferred(item, delay, Instant::now()),
                Requeue::Archive => dispatch.archive.push(item),
            }
        }
        self.shared.wake.notify_waiters();
    }

    fn status(&self, state: RunState) -> RunStatus {
        let dispatch = self.shared.dispatch();
        let mut status = RunStatus::new(&self.config.run_id, self.shared.started_at);
        status.state = state;
        for item in dispatch
            .archive
            .iter()
            .chain(dispatch.queue.items())
            .chain(dispatch.leases.leases().map(|lease| &lease.item))
        {
            status.record_item(item);
        }
        status.in_flight = dispatch.leases.len();
        status.backlog = dispatch.queue.len();
        status.deferred = dispatch.queue.deferred_len();
        status.stage_steps = dispatch.counters.stage_steps;
        drop(dispatch);

        let elapsed = (Utc::now() - self.shared.started_at).num_milliseconds().max(1) as f64;
        status.throughput_per_sec = status.stage_steps as f64 / (elapsed / 1000.0);
        if let Some((sequence, at)) = *self
            .shared
            .last_checkpoint
            .lock()
            .unwrap_or_else(|e| e.into_inner())
        {
            status.last_checkpoint_sequence = Some(sequence);
            status.last_checkpoint_at = Some(at);
        }
        status
    }

    fn publish(&self, state: RunState) -> RunStatus {
        let status = self.status(state);
        for observer in self.observers.iter() {
            observer.on_status(&status);
        }
        self.shared.status_tx.send_replace(status.clone());
        status
    }

    fn snapshot(&self) -> ExecutionState {
        let dispatch = self.shared.dispatch();
        let items = dispatch
            .archive
            .iter()
            .chain(dispatch.queue.items())
            .chain(dispatch.leases.leases().map(|lease| &lease.item))
            .cloned()
            .collect();
        ExecutionState {
            run_id: self.config.run_id.clone(),
            config_hash: self.config_hash.clone(),
            items,
            queue: dispatch.queue.state(Instant::now()),
            counters: dispatch.counters.clone(),
            errors: self.recovery.records(),
        }
    }

    /// Writes a checkpoint. Failures are logged; the run continues.
    /// `state` is the run state observers see alongside the checkpoint.
    async fn checkpoint(&self, reason: &str, state: RunState) {
        let _gate = self.shared.checkpoint_gate.lock().await;
        let snapshot = self.snapshot();
        match self.checkpoints.save(&snapshot).await {
            Ok(sequence) => {
                self.shared.steps_since_checkpoint.store(0, Ordering::SeqCst);
                *self
                    .shared
                    .last_checkpoint
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = Some((sequence, Utc::now()));
                debug!(sequence, reason, "Checkpoint written");
                let status = self.status(state);
                for observer in self.observers.iter() {
                    observer.on_checkpoint(sequence, &status);
                }
            }
            Err(e) => error!(reason, error = %e, "Checkpoint failed"),
        }
    }

    fn abort(&self, reason: String) {
        warn!(reason = %reason, "Aborting run");
        *self
            .shared
            .abort_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(reason);
        self.shared.abort.store(true, Ordering::SeqCst);
        self.runner.interrupt();
        self.shared.wake.notify_waiters();
    }

    fn report(&self, status: RunStatus) -> RunReport {
        let state = self.snapshot();
        RunReport {
            run_id: state.run_id,
            state: status.state,
            abort_reason: self
                .shared
                .abort_reason
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            status,
            counters: state.counters,
            items: state.items,
            errors: state.errors,
            peak_concurrency: self.shared.peak.load(Ordering::SeqCst),
        }
    }
}

enum Requeue {
    Now,
    After(Duration),
    Archive,
}

enum StepOutcome {
    Submitted { simulated: bool },
    Retried,
    Other,
}

/// A single worker pulling items from the shared queue.
struct Worker {
    id: String,
    context: Arc<Context>,
}

impl Worker {
    async fn run(self) {
        debug!(worker_id = %self.id, "Worker started");
        let shared = Arc::clone(&self.context.shared);

        loop {
            if shared.stopping() {
                debug!(worker_id = %self.id, "Worker received shutdown signal");
                break;
            }

            // Registered before claiming so a wake-up between the claim and the
            // wait is not lost.
            let notified = shared.wake.notified();

            match self.context.claim(&self.id) {
                Claim::Item(item, lease_id) => self.process(item, lease_id).await,
                Claim::Wait(deadline) => {
                    let deadline = deadline
                        .map(|at| at.min(Instant::now() + IDLE_POLL))
                        .unwrap_or_else(|| Instant::now() + IDLE_POLL);
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                Claim::Drained => break,
            }
        }

        debug!(worker_id = %self.id, "Worker stopped");
    }

    async fn process(&self, mut item: WorkItem, lease_id: LeaseId) {
        let context = &self.context;
        let shared = &context.shared;
        let active = shared.active.fetch_add(1, Ordering::SeqCst) + 1;
        shared.peak.fetch_max(active, Ordering::SeqCst);

        let stage = item.stage;
        let item_id = item.id;
        let started = std::time::Instant::now();

        let result = context.runner.run(&mut item).await;
        let elapsed = started.elapsed();
        shared.active.fetch_sub(1, Ordering::SeqCst);

        let (requeue, outcome) = match result {
            Ok(stage_outcome) => {
                for observer in context.observers.iter() {
                    observer.on_stage_completed(&item, stage, elapsed);
                }
                let outcome = match stage_outcome {
                    StageOutcome::Submitted { simulated } => StepOutcome::Submitted { simulated },
                    _ => StepOutcome::Other,
                };
                let requeue = if stage_outcome == StageOutcome::Rejected {
                    log_transition(item.reject(), &self.id);
                    Requeue::Archive
                } else if let Some(next) = context.config.next_stage(stage) {
                    log_transition(item.advance(next), &self.id);
                    Requeue::Now
                } else {
                    log_transition(item.succeed(), &self.id);
                    Requeue::Archive
                };
                (requeue, outcome)
            }
            Err(failure) => {
                let record = context.recovery.handle(&mut item, &failure);
                let requeue = match record.action {
                    RecoveryAction::RetryAfter { .. } => {
                        log_transition(item.fail(), &self.id);
                        log_transition(item.retry(), &self.id);
                        Requeue::After(record.action.delay().unwrap_or_default())
                    }
                    RecoveryAction::Drop => {
                        log_transition(item.fail(), &self.id);
                        Requeue::Archive
                    }
                    RecoveryAction::Escalate => {
                        log_transition(item.escalate(), &self.id);
                        Requeue::Archive
                    }
                    RecoveryAction::AbortRun => {
                        // Left pending at its stage so a resume retries it.
                        log_transition(item.fail(), &self.id);
                        log_transition(item.retry(), &self.id);
                        context.abort(format!(
                            "{} error at stage '{}': {}",
                            record.category, record.stage, record.message
                        ));
                        Requeue::Now
                    }
                };
                for observer in context.observers.iter() {
                    observer.on_stage_failure(&item, &record);
                }
                let outcome = if matches!(record.action, RecoveryAction::RetryAfter { .. }) {
                    StepOutcome::Retried
                } else {
                    StepOutcome::Other
                };
                (requeue, outcome)
            }
        };

        debug!(
            worker_id = %self.id,
            item_id = %item_id,
            stage = %stage,
            status = %item.status,
            duration_ms = elapsed.as_millis() as u64,
            "Stage step finished"
        );

        if item.status.is_terminal() {
            for observer in context.observers.iter() {
                observer.on_item_finished(&item);
            }
        }
        context.settle(lease_id, item, requeue, &outcome);

        let steps = shared.steps_since_checkpoint.fetch_add(1, Ordering::SeqCst) + 1;
        if steps >= context.config.checkpoint_interval {
            context.checkpoint("interval", RunState::Running).await;
        }
        context.publish(RunState::Running);
    }
}

fn log_transition(result: Result<(), TransitionError>, worker_id: &str) {
    if let Err(e) = result {
        error!(worker_id, error = %e, "Rejected status transition");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ItemStatus, Stage, WorkItem};
    use crate::scheduler::DeferredState;
    use serde_json::json;

    #[test]
    fn test_seed_splits_terminal_ready_and_deferred() {
        let ready_a = WorkItem::new(json!({"n": 1}), "a", Stage::Extract);
        let ready_b = WorkItem::new(json!({"n": 2}), "b", Stage::Extract);
        let waiting = WorkItem::new(json!({"n": 3}), "c", Stage::Match);
        let mut done = WorkItem::new(json!({"n": 4}), "d", Stage::Extract);
        done.begin().unwrap();
        done.succeed().unwrap();

        let queue = QueueState {
            ready: vec![ready_b.id, ready_a.id],
            deferred: vec![DeferredState {
                item_id: waiting.id,
                remaining_ms: 10_000,
            }],
        };

        let mut dispatch = Dispatch::default();
        seed(&mut dispatch, vec![ready_a, ready_b, waiting, done], &queue);

        assert_eq!(dispatch.archive.len(), 1);
        assert_eq!(dispatch.queue.ready_len(), 2);
        assert_eq!(dispatch.queue.deferred_len(), 1);
        assert_eq!(dispatch.archive[0].status, ItemStatus::Succeeded);
    }

    #[test]
    fn test_seed_restores_recorded_ready_order() {
        let items: Vec<WorkItem> = (0..50)
            .map(|n| WorkItem::new(json!({ "n": n }), &format!("fp-{}", n), Stage::Extract))
            .collect();
        let stray = WorkItem::new(json!({"n": "stray"}), "stray", Stage::Extract);

        // Recorded order is the reverse of the order items are handed over.
        let queue = QueueState {
            ready: items.iter().rev().map(|item| item.id).collect(),
            deferred: Vec::new(),
        };
        let expected: Vec<_> = queue.ready.iter().copied().chain([stray.id]).collect();

        let mut dispatch = Dispatch::default();
        let mut handed = vec![stray];
        handed.extend(items);
        seed(&mut dispatch, handed, &queue);

        let mut popped = Vec::new();
        while let Some(item) = dispatch.queue.pop() {
            assert_eq!(item.status, ItemStatus::Pending);
            popped.push(item.id);
        }
        assert_eq!(popped, expected);
    }
}
