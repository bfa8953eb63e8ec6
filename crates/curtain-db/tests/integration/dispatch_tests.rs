use chrono::TimeDelta;
use chrono_tz::America::New_York;
use curtain_core::orchestrator::worker::JobReport;
use curtain_core::traits::{
    AttemptLedger, ChangeCheck, ClaimStore, DispatchLock, JobQueue, PageContent, ScheduleStore,
};
use curtain_core::{
    AppError, AttemptOutcome, ChangeStatus, Dispatcher, DispatcherConfig, Extractor,
    IntervalSpec, MonitoredSource, NewSchedule, NullAssets, Orchestrator, OrchestratorConfig,
    PageSource, ScheduleSpec, SubmitOutcome, SubmitRequest, TracingWorkerReporter, WorkerPool,
};
use curtain_db::{Database, PgDispatchLock};

use crate::integration::common::{seeded_store, setup_test_db, utc};

#[derive(Clone)]
struct StaticPages;

impl PageSource for StaticPages {
    async fn check(&self, _source: &MonitoredSource) -> Result<ChangeCheck, AppError> {
        Ok(ChangeCheck {
            status: Some(ChangeStatus::Changed),
            fingerprint: Some("fp-1".into()),
            ..ChangeCheck::default()
        })
    }

    async fn fetch(&self, source: &MonitoredSource) -> Result<PageContent, AppError> {
        Ok(PageContent {
            markdown: format!("# {}\n\nHamlet, nightly at 8", source.label),
            pages_requested: 1,
            pages_succeeded: 1,
            errors: Vec::new(),
        })
    }
}

#[derive(Clone)]
struct OneShow;

impl Extractor for OneShow {
    async fn extract(
        &self,
        _source: &MonitoredSource,
        _content: &str,
    ) -> Result<Vec<serde_json::Value>, AppError> {
        Ok(vec![serde_json::json!({"title": "Hamlet"})])
    }
}

#[tokio::test]
async fn advisory_lock_is_exclusive_across_sessions() {
    let (pool, _container) = setup_test_db().await;
    let first = PgDispatchLock::new(pool.clone());
    let second = Database::from_pool(pool).dispatch_lock();

    assert!(first.try_lock().await.unwrap());
    assert!(!second.try_lock().await.unwrap());
    // Re-entry from the same holder is refused too.
    assert!(!first.try_lock().await.unwrap());

    first.unlock().await.unwrap();
    assert!(second.try_lock().await.unwrap());
    second.unlock().await.unwrap();
    // Unlocking without holding is a no-op.
    second.unlock().await.unwrap();
}

#[tokio::test]
async fn tick_enqueues_once_and_mirrors_claim() {
    let (pool, _container) = setup_test_db().await;
    let store = seeded_store(pool.clone(), &["palace-theatre"]).await;
    let schedule = store
        .create_schedule(
            NewSchedule::new(
                "palace-theatre",
                ScheduleSpec::new(IntervalSpec::Daily { hour: 2, minute: 0 }, New_York),
            ),
            utc("2024-03-09T07:00:00Z"),
        )
        .await
        .unwrap();

    let dispatcher = Dispatcher::new(
        Orchestrator::new(store.clone(), OrchestratorConfig::default()),
        PgDispatchLock::new(pool),
        DispatcherConfig::default(),
    );
    let now = utc("2024-03-09T07:05:00Z");

    let report = dispatcher.tick(now).await.unwrap();
    assert_eq!(report.enqueued, 1);
    assert_eq!(dispatcher.tick(now).await.unwrap().enqueued, 0);
    assert_eq!(store.count_pending().await.unwrap(), 1);

    let stored = store.get_schedule(schedule.id).await.unwrap().unwrap();
    assert_eq!(stored.next_due_at, utc("2024-03-10T07:00:00Z"));
    assert_eq!(stored.last_claimed_at, Some(now));
    let claim = store.current_claim("palace-theatre").await.unwrap().unwrap();
    assert_eq!(stored.claim_token, Some(claim.token));
}

#[tokio::test]
async fn worker_runs_manual_job_end_to_end() {
    let (pool, _container) = setup_test_db().await;
    let store = seeded_store(pool, &["palace-theatre"]).await;
    let orchestrator = Orchestrator::new(store.clone(), OrchestratorConfig::default());
    let now = utc("2024-06-01T06:00:00Z");

    let accepted = orchestrator
        .submit(SubmitRequest::manual("palace-theatre"), now)
        .await
        .unwrap();
    assert!(accepted.is_accepted());
    assert_eq!(
        orchestrator
            .submit(SubmitRequest::manual("palace-theatre"), now)
            .await
            .unwrap(),
        SubmitOutcome::Rejected(curtain_core::RejectReason::AlreadyClaimed)
    );

    let pool = WorkerPool::new(orchestrator, StaticPages, OneShow, NullAssets);
    let report = pool
        .run_once("worker-1", now, &TracingWorkerReporter)
        .await
        .unwrap()
        .unwrap();

    let JobReport::Finished {
        attempt_id,
        outcome,
        retry_job,
    } = report
    else {
        panic!("expected a finished job, got {report:?}");
    };
    assert_eq!(outcome, AttemptOutcome::Succeeded);
    assert!(retry_job.is_none());

    let attempt = store.get_attempt(attempt_id).await.unwrap().unwrap();
    assert_eq!(attempt.records_count, Some(1));
    assert!(attempt.gate_bypass.is_some());
    assert!(store.current_claim("palace-theatre").await.unwrap().is_none());
}

#[tokio::test]
async fn reaper_closes_attempt_of_expired_claim() {
    let (pool, _container) = setup_test_db().await;
    let store = seeded_store(pool, &["palace-theatre"]).await;
    let orchestrator = Orchestrator::new(store.clone(), OrchestratorConfig::default());
    let now = utc("2024-06-01T06:00:00Z");

    let SubmitOutcome::Accepted { claim_token, .. } = orchestrator
        .submit(SubmitRequest::manual("palace-theatre"), now)
        .await
        .unwrap()
    else {
        panic!("submission should be accepted");
    };
    store.claim_next_job("worker-1", now).await.unwrap().unwrap();
    let attempt_id = store
        .begin_attempt(&curtain_core::models::NewAttempt {
            source_id: "palace-theatre".into(),
            schedule_id: None,
            trigger: curtain_core::TriggerKind::Manual,
            attempt_number: 1,
            claim_token,
            started_at: now,
        })
        .await
        .unwrap();

    let later = now + orchestrator.stale_after() + TimeDelta::seconds(1);
    let reaped = orchestrator.reap_stale(later).await.unwrap();
    assert_eq!(reaped.claims_released, 1);
    assert_eq!(reaped.attempts_abandoned, 1);
    assert_eq!(reaped.jobs_abandoned, 1);

    let attempt = store.get_attempt(attempt_id).await.unwrap().unwrap();
    assert_eq!(attempt.outcome, Some(AttemptOutcome::FailedRetryable));
    assert!(store.current_claim("palace-theatre").await.unwrap().is_none());
}
