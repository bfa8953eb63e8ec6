use std::collections::HashSet;

use chrono::TimeDelta;
use curtain_core::traits::JobQueue;
use curtain_core::{AppError, JobStatus, Lane, NewJob, TriggerKind};
use uuid::Uuid;

use crate::integration::common::{seeded_store, setup_test_db, utc};

#[tokio::test]
async fn enqueue_and_verify_fields() {
    let (pool, _container) = setup_test_db().await;
    let store = seeded_store(pool, &["palace-theatre"]).await;
    let token = Uuid::new_v4();
    let run_after = utc("2024-06-01T06:00:00Z");

    let job = store
        .enqueue(
            NewJob::new("palace-theatre", TriggerKind::Manual, run_after)
                .with_claim(token)
                .with_lane(Lane::Priority),
        )
        .await
        .unwrap();

    assert_eq!(job.source_id, "palace-theatre");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.lane, Lane::Priority);
    assert_eq!(job.claim_token, Some(token));
    assert_eq!(job.attempt_number, 1);
    assert!(job.worker_id.is_none());
    assert!(!job.gate_passed);
    assert_eq!(store.count_pending().await.unwrap(), 1);
}

#[tokio::test]
async fn retry_carries_passed_gate() {
    let (pool, _container) = setup_test_db().await;
    let store = seeded_store(pool, &["palace-theatre"]).await;
    let now = utc("2024-06-01T06:00:00Z");

    store
        .enqueue(
            NewJob::new("palace-theatre", TriggerKind::Scheduled, now)
                .with_attempt_number(2)
                .with_gate_passed(true),
        )
        .await
        .unwrap();

    let picked = store.claim_next_job("worker-1", now).await.unwrap().unwrap();
    assert!(picked.gate_passed);
    assert_eq!(picked.attempt_number, 2);
}

#[tokio::test]
async fn priority_lane_then_due_order() {
    let (pool, _container) = setup_test_db().await;
    let store = seeded_store(pool, &["palace-theatre", "orpheum", "lyric"]).await;
    let now = utc("2024-06-01T06:00:00Z");

    let scheduled = store
        .enqueue(NewJob::new("palace-theatre", TriggerKind::Scheduled, now - TimeDelta::minutes(5)))
        .await
        .unwrap();
    let delayed = store
        .enqueue(NewJob::new("lyric", TriggerKind::Scheduled, now + TimeDelta::minutes(5)))
        .await
        .unwrap();
    let manual = store
        .enqueue(NewJob::new("orpheum", TriggerKind::Manual, now).with_lane(Lane::Priority))
        .await
        .unwrap();

    let first = store.claim_next_job("worker-1", now).await.unwrap().unwrap();
    assert_eq!(first.id, manual.id);
    assert_eq!(first.status, JobStatus::Running);
    assert_eq!(first.worker_id.as_deref(), Some("worker-1"));
    assert_eq!(first.started_at, Some(now));

    let second = store.claim_next_job("worker-1", now).await.unwrap().unwrap();
    assert_eq!(second.id, scheduled.id);

    // Not runnable until its run_after.
    assert!(store.claim_next_job("worker-1", now).await.unwrap().is_none());
    let later = store
        .claim_next_job("worker-1", now + TimeDelta::minutes(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(later.id, delayed.id);
}

#[tokio::test]
async fn concurrent_workers_never_share_a_job() {
    let (pool, _container) = setup_test_db().await;
    let ids: Vec<String> = (0..8).map(|i| format!("venue-{i}")).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let store = seeded_store(pool, &id_refs).await;
    let now = utc("2024-06-01T06:00:00Z");

    for id in &ids {
        store
            .enqueue(NewJob::new(id.as_str(), TriggerKind::Scheduled, now))
            .await
            .unwrap();
    }

    let handles: Vec<_> = (0..4)
        .map(|w| {
            let store = store.clone();
            tokio::spawn(async move {
                let worker = format!("worker-{w}");
                let mut taken = Vec::new();
                while let Some(job) = store.claim_next_job(&worker, now).await.unwrap() {
                    taken.push(job.id);
                }
                taken
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "job {id} was claimed twice");
        }
    }
    assert_eq!(seen.len(), 8);
    assert_eq!(store.count_pending().await.unwrap(), 0);
}

#[tokio::test]
async fn attached_claim_lets_reaper_abandon_running_job() {
    let (pool, _container) = setup_test_db().await;
    let store = seeded_store(pool, &["palace-theatre"]).await;
    let now = utc("2024-06-01T06:00:00Z");

    let retry = store
        .enqueue(
            NewJob::new("palace-theatre", TriggerKind::Scheduled, now).with_attempt_number(2),
        )
        .await
        .unwrap();
    assert!(retry.claim_token.is_none());

    store.claim_next_job("worker-1", now).await.unwrap().unwrap();
    let token = Uuid::new_v4();
    store.attach_claim(retry.id, token).await.unwrap();

    assert_eq!(store.abandon_jobs(Uuid::new_v4()).await.unwrap(), 0);
    assert_eq!(store.abandon_jobs(token).await.unwrap(), 1);
    // Already abandoned; nothing left running under this token.
    assert_eq!(store.abandon_jobs(token).await.unwrap(), 0);

    assert!(matches!(
        store.attach_claim(Uuid::new_v4(), token).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn release_worker_jobs_returns_them_to_pending() {
    let (pool, _container) = setup_test_db().await;
    let store = seeded_store(pool, &["palace-theatre", "orpheum"]).await;
    let now = utc("2024-06-01T06:00:00Z");

    store
        .enqueue(NewJob::new("palace-theatre", TriggerKind::Scheduled, now))
        .await
        .unwrap();
    store
        .enqueue(NewJob::new("orpheum", TriggerKind::Scheduled, now))
        .await
        .unwrap();

    let mine = store.claim_next_job("worker-1", now).await.unwrap().unwrap();
    let theirs = store.claim_next_job("worker-2", now).await.unwrap().unwrap();
    store.finish_job(theirs.id, JobStatus::Completed).await.unwrap();

    assert_eq!(store.release_worker_jobs("worker-1").await.unwrap(), 1);
    assert_eq!(store.release_worker_jobs("worker-2").await.unwrap(), 0);
    assert_eq!(store.count_pending().await.unwrap(), 1);

    let again = store.claim_next_job("worker-3", now).await.unwrap().unwrap();
    assert_eq!(again.id, mine.id);
}
