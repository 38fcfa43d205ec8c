//! End-to-end runs of the orchestrator against in-process collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::{RngExt, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::{json, Value};

use apply_forge::checkpoint::{CheckpointRef, CheckpointStore, MemoryKvStore};
use apply_forge::error::{CollaboratorError, ErrorCategory};
use apply_forge::pipeline::{
    AuthProvider, Collaborators, ConfigError, ItemStatus, JobPosting, MasterController,
    MatchScore, MatchScorer, OrchestratorError, RecoveryAction, RetentionPolicy, RetryPolicy,
    RunConfig, RunObserver, RunReport, RunState, RunStatus, SearchProvider, SessionHandle, Signal,
    SignalProvider, Stage, SubmissionOutcome, Submitter, Tier, WorkItem,
};

// ============================================================================
// Collaborators
// ============================================================================

/// Search results plus the match and salary scores for every posting url.
struct Catalog {
    payloads: Vec<Value>,
    scores: HashMap<String, (f64, f64)>,
}

fn posting_url(i: usize) -> String {
    format!("https://jobs.example.com/postings/{}", i)
}

/// `n` postings cycling through submit, review and reject profiles.
fn catalog(n: usize) -> Arc<Catalog> {
    let mut payloads = Vec::with_capacity(n);
    let mut scores = HashMap::new();
    for i in 0..n {
        let url = posting_url(i);
        payloads.push(json!({
            "title": format!("Rust Engineer {}", i),
            "company": format!("Company {}", i % 4),
            "url": url,
            "remote": i % 2 == 0,
        }));
        let profile = match i % 3 {
            0 => (0.9, 0.8),
            1 => (0.6, 0.5),
            _ => (0.2, 0.1),
        };
        scores.insert(url, profile);
    }
    Arc::new(Catalog { payloads, scores })
}

fn expected_tier(i: usize) -> Tier {
    match i % 3 {
        0 => Tier::Submit,
        1 => Tier::Review,
        _ => Tier::Reject,
    }
}

#[async_trait]
impl SearchProvider for Catalog {
    async fn search(&self, _query: &str, limit: usize) -> Result<Vec<Value>, CollaboratorError> {
        Ok(self.payloads.iter().take(limit).cloned().collect())
    }
}

#[async_trait]
impl MatchScorer for Catalog {
    async fn score(
        &self,
        _resume: &Value,
        posting: &JobPosting,
    ) -> Result<MatchScore, CollaboratorError> {
        let (score, _) = self.lookup(posting)?;
        Ok(MatchScore {
            score,
            explanation: "keyword overlap".to_string(),
        })
    }
}

impl Catalog {
    fn lookup(&self, posting: &JobPosting) -> Result<(f64, f64), CollaboratorError> {
        self.scores
            .get(&posting.url)
            .copied()
            .ok_or_else(|| CollaboratorError::InvalidResponse(format!("unknown {}", posting.url)))
    }
}

/// Salary signals with injectable latency and failures.
struct Signals {
    catalog: Arc<Catalog>,
    delay: Duration,
    failure_rate: f64,
    rng: Mutex<ChaCha8Rng>,
    exhausted_url: Option<String>,
    flaky_url: Option<String>,
    flaked: AtomicBool,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl Signals {
    fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            delay: Duration::ZERO,
            failure_rate: 0.0,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(42)),
            exhausted_url: None,
            flaky_url: None,
            flaked: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn with_failure_rate(mut self, rate: f64, seed: u64) -> Self {
        self.failure_rate = rate;
        self.rng = Mutex::new(ChaCha8Rng::seed_from_u64(seed));
        self
    }

    fn exhausted_for(mut self, url: String) -> Self {
        self.exhausted_url = Some(url);
        self
    }

    /// Fails the first call for `url` only.
    fn flaky_once_for(mut self, url: String) -> Self {
        self.flaky_url = Some(url);
        self
    }

    fn roll_failure(&self) -> bool {
        if self.failure_rate <= 0.0 {
            return false;
        }
        let mut rng = self.rng.lock().unwrap();
        rng.random_range(0.0..1.0) < self.failure_rate
    }

    async fn respond(&self, posting: &JobPosting) -> Result<Vec<Signal>, CollaboratorError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.exhausted_url.as_deref() == Some(posting.url.as_str()) {
            return Err(CollaboratorError::ResourceExhausted(
                "signal quota used up".to_string(),
            ));
        }
        let flaky = self.flaky_url.as_deref() == Some(posting.url.as_str())
            && !self.flaked.swap(true, Ordering::SeqCst);
        if flaky || self.roll_failure() {
            return Err(CollaboratorError::Rejected {
                status: 503,
                message: "upstream busy".to_string(),
            });
        }
        let (_, salary) = self.catalog.lookup(posting)?;
        Ok(vec![Signal::unit("salary", salary)])
    }
}

#[async_trait]
impl SignalProvider for Signals {
    async fn signals(&self, posting: &JobPosting) -> Result<Vec<Signal>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let result = self.respond(posting).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[derive(Default)]
struct CountingSubmitter {
    calls: AtomicUsize,
    exhausted_url: Option<String>,
}

impl CountingSubmitter {
    fn exhausted_for(url: String) -> Self {
        Self {
            exhausted_url: Some(url),
            ..Self::default()
        }
    }
}

#[async_trait]
impl Submitter for CountingSubmitter {
    async fn submit(
        &self,
        posting: &JobPosting,
        _resume: &Value,
        session: &SessionHandle,
    ) -> Result<SubmissionOutcome, CollaboratorError> {
        assert_eq!(session.token, "test-session");
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.exhausted_url.as_deref() == Some(posting.url.as_str()) {
            return Err(CollaboratorError::ResourceExhausted(
                "daily application limit".to_string(),
            ));
        }
        Ok(SubmissionOutcome {
            success: true,
            message: format!("applied to {}", posting.company),
            external_reference: Some(format!("app-{}", n)),
        })
    }
}

struct StaticAuth;

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn acquire_session(&self) -> Result<SessionHandle, CollaboratorError> {
        Ok(SessionHandle {
            token: "test-session".to_string(),
            expires_at: None,
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn collaborators(
    search: Arc<dyn SearchProvider>,
    catalog: Arc<Catalog>,
    signals: Arc<Signals>,
    submitter: Arc<CountingSubmitter>,
) -> Collaborators {
    Collaborators {
        search,
        matcher: catalog,
        signals,
        submitter,
        auth: Arc::new(StaticAuth),
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::ExponentialBackoff {
        base_secs: 0.005,
        max_delay_secs: 0.02,
        max_attempts: 10,
    }
}

fn config(run_id: &str) -> RunConfig {
    RunConfig::new()
        .with_run_id(run_id)
        .with_search("rust engineer", 100)
        .with_weights([("semantic_match", 0.6), ("salary", 0.4)])
        .with_submission_threshold(0.7)
        .with_review_floor(0.4)
        .with_submission_delay_secs(0.0)
        .with_stage_timeout_secs(5)
        .with_checkpoint_interval(5)
        .with_retry_policy(ErrorCategory::ExternalService, fast_retry())
        .with_retry_policy(ErrorCategory::System, fast_retry())
}

fn memory_store() -> Arc<CheckpointStore> {
    Arc::new(CheckpointStore::new(Arc::new(MemoryKvStore::new())))
}

fn item_for(report: &RunReport, i: usize) -> &WorkItem {
    let url = posting_url(i);
    report
        .items
        .iter()
        .find(|item| item.posting.as_ref().map(|p| p.url.as_str()) == Some(url.as_str()))
        .expect("posting was ingested")
}

/// Records every checkpoint and checks each published status.
#[derive(Default)]
struct Recorder {
    checkpoints: Mutex<Vec<(u64, RunState)>>,
    /// `(in_progress items, in_flight leases)` per published status.
    statuses: Mutex<Vec<(usize, usize)>>,
}

impl RunObserver for Recorder {
    fn on_checkpoint(&self, sequence: u64, status: &RunStatus) {
        self.checkpoints
            .lock()
            .unwrap()
            .push((sequence, status.state));
    }

    fn on_status(&self, status: &RunStatus) {
        self.statuses
            .lock()
            .unwrap()
            .push((status.count(ItemStatus::InProgress), status.in_flight));
    }
}

fn index_of(url: &str) -> usize {
    url.rsplit('/')
        .next()
        .and_then(|s| s.parse().ok())
        .expect("posting url ends in an index")
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_run_tiers_and_submits_once() {
    let catalog = catalog(9);
    let signals = Arc::new(Signals::new(catalog.clone()));
    let submitter = Arc::new(CountingSubmitter::default());
    let controller = MasterController::new(
        collaborators(catalog.clone(), catalog.clone(), signals, submitter.clone()),
        memory_store(),
    );

    let handle = controller
        .start_run(config("tiers").with_max_concurrency(2))
        .await
        .unwrap();
    let report = handle.wait().await.unwrap();

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.items.len(), 9);
    assert_eq!(submitter.calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.counters.submissions, 3);
    assert_eq!(report.counters.simulated_submissions, 0);

    for item in &report.items {
        let posting = item.posting.as_ref().unwrap();
        let tier = expected_tier(index_of(&posting.url));
        assert_eq!(item.tier(), Some(tier));
        match tier {
            Tier::Submit => {
                assert_eq!(item.status, ItemStatus::Succeeded);
                let submission = item.submission.as_ref().unwrap();
                assert!(!submission.simulated);
                assert!(submission.external_reference.is_some());
            }
            Tier::Review => {
                assert_eq!(item.status, ItemStatus::Succeeded);
                assert!(item.submission.is_none());
            }
            Tier::Reject => {
                assert_eq!(item.status, ItemStatus::Rejected);
                assert!(item.submission.is_none());
            }
        }
    }

    let summary = report.summary();
    assert_eq!(summary.succeeded, 6);
    assert_eq!(summary.rejected, 3);
    // Rejected items keep the exit code off zero.
    assert_eq!(report.exit_code(), 1);

    let status = controller.status().unwrap();
    assert_eq!(status.state, RunState::Completed);
    assert_eq!(status.counts_by_tier.get("submit"), Some(&3));
    assert_eq!(status.in_flight, 0);
}

#[tokio::test]
async fn test_concurrency_stays_bounded_under_random_failures() {
    let catalog = catalog(30);
    let signals = Arc::new(
        Signals::new(catalog.clone())
            .with_delay(Duration::from_millis(3))
            .with_failure_rate(0.25, 7),
    );
    let submitter = Arc::new(CountingSubmitter::default());
    let controller = MasterController::new(
        collaborators(catalog.clone(), catalog.clone(), signals.clone(), submitter.clone()),
        memory_store(),
    );

    let handle = controller
        .start_run(config("bounded").with_max_concurrency(3))
        .await
        .unwrap();
    let report = handle.wait().await.unwrap();

    assert_eq!(report.state, RunState::Completed);
    assert!(report.peak_concurrency <= 3);
    assert!(signals.peak.load(Ordering::SeqCst) <= 3);
    assert!(report.items.iter().all(|i| i.status.is_terminal()));

    let summary = report.summary();
    assert_eq!(summary.unfinished, 0);
    assert_eq!(summary.succeeded + summary.failed + summary.rejected, 30);

    // Every failure came from the flaky signal provider.
    for record in &report.errors {
        assert_eq!(record.stage, Stage::Enrich);
        assert_eq!(record.category, ErrorCategory::ExternalService);
        assert!(matches!(
            record.action,
            RecoveryAction::RetryAfter { .. } | RecoveryAction::Escalate
        ));
    }
    let retried = report
        .errors
        .iter()
        .filter(|r| matches!(r.action, RecoveryAction::RetryAfter { .. }))
        .count() as u64;
    assert_eq!(report.counters.retries, retried);
    let escalated = report.items.iter().filter(|i| i.escalated).count();
    assert_eq!(
        signals.calls.load(Ordering::SeqCst),
        30 - escalated + report.errors.len()
    );

    // No posting is ever submitted twice.
    let submitted = report.items.iter().filter(|i| i.submission.is_some()).count();
    assert_eq!(submitter.calls.load(Ordering::SeqCst), submitted);
}

#[tokio::test]
async fn test_resource_exhaustion_aborts_and_checkpoints() {
    let catalog = catalog(4);
    let signals = Arc::new(Signals::new(catalog.clone()).exhausted_for(posting_url(0)));
    let submitter = Arc::new(CountingSubmitter::default());
    let store = memory_store();
    let controller = MasterController::new(
        collaborators(catalog.clone(), catalog.clone(), signals, submitter.clone()),
        store.clone(),
    );

    let handle = controller
        .start_run(config("abort").with_max_concurrency(1))
        .await
        .unwrap();
    let report = handle.wait().await.unwrap();

    assert_eq!(report.state, RunState::Aborted);
    assert_eq!(report.exit_code(), 2);
    assert!(report.abort_reason.is_some());
    assert_eq!(submitter.calls.load(Ordering::SeqCst), 0);
    assert_eq!(report.summary().unfinished, 4);

    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].category, ErrorCategory::Resource);
    assert_eq!(report.errors[0].action, RecoveryAction::AbortRun);

    let checkpoint = store.restore("abort", CheckpointRef::Latest).await.unwrap();
    let stuck = checkpoint
        .state
        .items
        .iter()
        .find(|i| i.posting.as_ref().map(|p| p.url.as_str()) == Some(posting_url(0).as_str()))
        .unwrap();
    assert_eq!(stuck.status, ItemStatus::Pending);
    assert_eq!(stuck.stage, Stage::Enrich);
}

#[tokio::test]
async fn test_dry_run_resume_never_submits() {
    let catalog = catalog(9);
    let store = memory_store();
    let submitter = Arc::new(CountingSubmitter::default());
    let run_config = config("dry-resume").with_dry_run(true).with_max_concurrency(1);

    // First attempt stops on a resource error.
    let failing = Arc::new(Signals::new(catalog.clone()).exhausted_for(posting_url(0)));
    let controller = MasterController::new(
        collaborators(catalog.clone(), catalog.clone(), failing, submitter.clone()),
        store.clone(),
    );
    let first = controller
        .start_run(run_config.clone())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(first.state, RunState::Aborted);

    // Resume with a healthy provider.
    let healthy = Arc::new(Signals::new(catalog.clone()));
    let controller = MasterController::new(
        collaborators(catalog.clone(), catalog.clone(), healthy.clone(), submitter.clone()),
        store.clone(),
    );
    let second = controller
        .start_run(run_config.clone().with_resume(true))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(second.state, RunState::Completed);
    assert_eq!(second.items.len(), 9);
    assert_eq!(second.counters.ingested, 9);
    assert_eq!(second.counters.simulated_submissions, 3);
    assert!(!second.errors.is_empty());
    assert!(second.items.iter().all(|i| i.status.is_terminal()));
    for item in second.items.iter().filter(|i| i.tier() == Some(Tier::Submit)) {
        assert!(item.submission.as_ref().unwrap().simulated);
    }

    // Resuming a finished run does no further work.
    let calls_before = healthy.calls.load(Ordering::SeqCst);
    let third = controller
        .start_run(run_config.with_resume(true))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(third.state, RunState::Completed);
    assert_eq!(third.counters.simulated_submissions, 3);
    assert_eq!(healthy.calls.load(Ordering::SeqCst), calls_before);

    let mut before: Vec<_> = second.items.iter().map(|i| (i.id, i.status)).collect();
    let mut after: Vec<_> = third.items.iter().map(|i| (i.id, i.status)).collect();
    before.sort();
    after.sort();
    assert_eq!(before, after);

    assert_eq!(submitter.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_resume_with_changed_config_requires_opt_in() {
    let catalog = catalog(3);
    let store = memory_store();
    let submitter = Arc::new(CountingSubmitter::default());
    let controller = MasterController::new(
        collaborators(
            catalog.clone(),
            catalog.clone(),
            Arc::new(Signals::new(catalog.clone())),
            submitter,
        ),
        store,
    );

    let original = config("drift").with_dry_run(true);
    controller
        .start_run(original.clone())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let changed = original
        .with_weights([("semantic_match", 0.5), ("salary", 0.5)])
        .with_resume(true);
    let err = controller.start_run(changed.clone()).await.err().unwrap();
    assert!(matches!(
        err,
        OrchestratorError::Config(ConfigError::Drift { .. })
    ));
    assert_eq!(err.exit_code(), 2);

    let report = controller
        .start_run(changed.with_allow_config_drift(true))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.items.len(), 3);
}

#[tokio::test]
async fn test_duplicate_candidates_are_skipped() {
    let catalog = catalog(2);
    let first = catalog.payloads[0].clone();
    let mut same_url = first.clone();
    same_url["title"] = json!("Senior Rust Engineer");
    same_url["url"] = json!(format!("{}/", posting_url(0).to_uppercase()));

    let search = Arc::new(Catalog {
        payloads: vec![
            first.clone(),
            first,
            same_url,
            catalog.payloads[1].clone(),
        ],
        scores: catalog.scores.clone(),
    });
    let submitter = Arc::new(CountingSubmitter::default());
    let controller = MasterController::new(
        collaborators(
            search,
            catalog.clone(),
            Arc::new(Signals::new(catalog.clone())),
            submitter,
        ),
        memory_store(),
    );

    let report = controller
        .start_run(config("dedup").with_dry_run(true))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(report.items.len(), 2);
    assert_eq!(report.counters.ingested, 2);
    assert_eq!(report.counters.duplicates_skipped, 2);
}

#[tokio::test]
async fn test_cancel_leaves_resumable_items() {
    let catalog = catalog(20);
    let signals = Arc::new(Signals::new(catalog.clone()).with_delay(Duration::from_millis(50)));
    let submitter = Arc::new(CountingSubmitter::default());
    let store = memory_store();
    let controller = MasterController::new(
        collaborators(catalog.clone(), catalog.clone(), signals, submitter),
        store.clone(),
    );

    let handle = controller
        .start_run(config("cancel").with_dry_run(true).with_max_concurrency(2))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    controller.cancel(&handle);
    let report = handle.wait().await.unwrap();

    assert_eq!(report.state, RunState::Cancelled);
    assert_eq!(report.exit_code(), 1);
    assert!(report.summary().unfinished > 0);
    assert!(report
        .items
        .iter()
        .all(|i| i.status != ItemStatus::InProgress));

    let checkpoint = store.restore("cancel", CheckpointRef::Latest).await.unwrap();
    assert_eq!(checkpoint.state.items.len(), 20);
}

#[tokio::test]
async fn test_health_check_reports_collaborators() {
    let catalog = catalog(1);
    let controller = MasterController::new(
        collaborators(
            catalog.clone(),
            catalog.clone(),
            Arc::new(Signals::new(catalog.clone())),
            Arc::new(CountingSubmitter::default()),
        ),
        memory_store(),
    );

    let health = controller.health_check().await;
    assert!(health.healthy);
    assert_eq!(health.backlog, 0);
    assert_eq!(health.collaborators.len(), 5);
    assert!(health.collaborators.iter().all(|c| c.reachable));
}

#[tokio::test]
async fn test_checkpoint_cadence_follows_step_interval() {
    let catalog = catalog(9);
    let store = memory_store();
    let recorder = Arc::new(Recorder::default());
    let mut controller = MasterController::new(
        collaborators(
            catalog.clone(),
            catalog.clone(),
            Arc::new(Signals::new(catalog.clone())),
            Arc::new(CountingSubmitter::default()),
        ),
        store.clone(),
    );
    controller.register_observer(recorder.clone());

    let report = controller
        .start_run(
            config("cadence")
                .with_max_concurrency(1)
                .with_retention(RetentionPolicy {
                    max_count: None,
                    max_age_secs: None,
                }),
        )
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(report.state, RunState::Completed);

    // Submit and review items take five steps, rejected items stop after decide.
    assert_eq!(report.counters.stage_steps, 3 * 5 + 3 * 5 + 3 * 4);

    // One checkpoint per five steps plus the final one.
    let expected = (report.counters.stage_steps / 5 + 1) as usize;
    let stored = store.list("cadence").await.unwrap();
    assert_eq!(stored.len(), expected);

    let checkpoints = recorder.checkpoints.lock().unwrap().clone();
    assert_eq!(checkpoints.len(), expected);
    let (last_sequence, last_state) = *checkpoints.last().unwrap();
    assert_eq!(last_state, RunState::Completed);
    assert!(checkpoints[..expected - 1]
        .iter()
        .all(|(_, state)| *state == RunState::Running));
    assert_eq!(stored.last().unwrap().sequence, last_sequence);
    assert_eq!(report.status.last_checkpoint_sequence, Some(last_sequence));

    // Only leased items are ever reported in progress.
    let statuses = recorder.statuses.lock().unwrap();
    assert!(!statuses.is_empty());
    for (in_progress, in_flight) in statuses.iter() {
        assert_eq!(in_progress, in_flight);
    }
}

#[tokio::test]
async fn test_allowed_drift_redecides_only_unfinished_items() {
    let catalog = catalog(9);
    let store = memory_store();
    let original = config("redecide").with_max_concurrency(1);

    // Posting 3 is a submit-tier item; its submission exhausts the quota.
    let first_submitter = Arc::new(CountingSubmitter::exhausted_for(posting_url(3)));
    let controller = MasterController::new(
        collaborators(
            catalog.clone(),
            catalog.clone(),
            Arc::new(Signals::new(catalog.clone())),
            first_submitter.clone(),
        ),
        store.clone(),
    );
    let first = controller
        .start_run(original.clone())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(first.state, RunState::Aborted);
    assert_eq!(first.errors.len(), 1);
    assert_eq!(first.errors[0].stage, Stage::Submit);

    let blocked = item_for(&first, 3);
    assert_eq!(blocked.status, ItemStatus::Pending);
    assert_eq!(blocked.stage, Stage::Submit);
    let old_composite = blocked.decision.as_ref().unwrap().composite;
    assert!((old_composite - 0.86).abs() < 1e-9);
    for i in 0..3 {
        assert!(item_for(&first, i).status.is_terminal());
    }

    let second_submitter = Arc::new(CountingSubmitter::default());
    let controller = MasterController::new(
        collaborators(
            catalog.clone(),
            catalog.clone(),
            Arc::new(Signals::new(catalog.clone())),
            second_submitter.clone(),
        ),
        store.clone(),
    );
    let second = controller
        .start_run(
            original
                .with_weights([("semantic_match", 0.5), ("salary", 0.5)])
                .with_resume(true)
                .with_allow_config_drift(true),
        )
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(second.state, RunState::Completed);
    assert_eq!(second.items.len(), 9);

    // Finished items keep the decision and submission they already had.
    for i in 0..3 {
        let before = item_for(&first, i);
        let after = item_for(&second, i);
        assert_eq!(after.status, before.status);
        assert_eq!(after.decision, before.decision);
        assert_eq!(after.submission, before.submission);
    }

    // The blocked item was decided again under the new weights.
    let redecided = item_for(&second, 3);
    let decision = redecided.decision.as_ref().unwrap();
    assert!((decision.composite - 0.85).abs() < 1e-9);
    assert_eq!(decision.tier, Tier::Submit);
    assert_eq!(redecided.status, ItemStatus::Succeeded);
    assert!(redecided.submission.is_some());

    // Posting 0 went out in the first run; postings 3 and 6 in the second.
    assert_eq!(first_submitter.calls.load(Ordering::SeqCst), 2);
    assert_eq!(second_submitter.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_transient_failure_retries_once_then_succeeds() {
    let catalog = catalog(3);
    let signals = Arc::new(Signals::new(catalog.clone()).flaky_once_for(posting_url(0)));
    let controller = MasterController::new(
        collaborators(
            catalog.clone(),
            catalog.clone(),
            signals.clone(),
            Arc::new(CountingSubmitter::default()),
        ),
        memory_store(),
    );

    let report = controller
        .start_run(config("flaky").with_dry_run(true))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(report.state, RunState::Completed);

    let item = item_for(&report, 0);
    assert_eq!(item.status, ItemStatus::Succeeded);
    assert_eq!(item.retries_at(Stage::Enrich), 1);
    assert_eq!(item.retries_at(Stage::Match), 0);
    assert!(!item.escalated);

    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].stage, Stage::Enrich);
    assert_eq!(report.errors[0].category, ErrorCategory::ExternalService);
    assert!(matches!(
        report.errors[0].action,
        RecoveryAction::RetryAfter { .. }
    ));
    assert_eq!(report.counters.retries, 1);
    assert_eq!(signals.calls.load(Ordering::SeqCst), 4);
}

