use chrono::{DateTime, TimeDelta, Utc};
use curtain_core::models::{AttemptResult, NewAttempt};
use curtain_core::traits::AttemptLedger;
use curtain_core::{AppError, AttemptFilter, AttemptOutcome, ChangeStatus, TriggerKind};
use curtain_db::PgStore;
use uuid::Uuid;

use crate::integration::common::{seeded_store, setup_test_db, utc};

fn new_attempt(source_id: &str, started_at: DateTime<Utc>, token: Uuid) -> NewAttempt {
    NewAttempt {
        source_id: source_id.into(),
        schedule_id: None,
        trigger: TriggerKind::Scheduled,
        attempt_number: 1,
        claim_token: token,
        started_at,
    }
}

fn finished(
    outcome: AttemptOutcome,
    status: Option<ChangeStatus>,
    fingerprint: Option<&str>,
    at: DateTime<Utc>,
) -> AttemptResult {
    AttemptResult {
        finished_at: at,
        change_status: status,
        fingerprint: fingerprint.map(str::to_string),
        outcome: Some(outcome),
        ..AttemptResult::default()
    }
}

async fn record(
    store: &PgStore,
    source_id: &str,
    started_at: DateTime<Utc>,
    result: AttemptResult,
) -> Uuid {
    let id = store
        .begin_attempt(&new_attempt(source_id, started_at, Uuid::new_v4()))
        .await
        .unwrap();
    assert!(store.finish_attempt(id, &result).await.unwrap());
    id
}

#[tokio::test]
async fn finish_is_write_once() {
    let (pool, _container) = setup_test_db().await;
    let store = seeded_store(pool, &["palace-theatre"]).await;
    let start = utc("2024-06-01T06:00:00Z");

    let id = store
        .begin_attempt(&new_attempt("palace-theatre", start, Uuid::new_v4()))
        .await
        .unwrap();
    let open = store.get_attempt(id).await.unwrap().unwrap();
    assert!(open.outcome.is_none());

    let mut success = finished(
        AttemptOutcome::Succeeded,
        Some(ChangeStatus::Changed),
        Some("fp-1"),
        start + TimeDelta::seconds(40),
    );
    success.records = Some(serde_json::json!([{"title": "Hamlet"}]));
    success.records_count = Some(1);
    assert!(store.finish_attempt(id, &success).await.unwrap());

    let late = finished(
        AttemptOutcome::FailedRetryable,
        None,
        None,
        start + TimeDelta::minutes(30),
    );
    assert!(!store.finish_attempt(id, &late).await.unwrap());

    let stored = store.get_attempt(id).await.unwrap().unwrap();
    assert_eq!(stored.outcome, Some(AttemptOutcome::Succeeded));
    assert_eq!(stored.records_count, Some(1));
    assert_eq!(stored.duration(), Some(TimeDelta::seconds(40)));

    assert!(matches!(
        store.finish_attempt(Uuid::new_v4(), &late).await,
        Err(AppError::NotFound(_))
    ));
    assert!(
        store
            .finish_attempt(id, &AttemptResult::default())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn baseline_skips_failures_and_missing_fingerprints() {
    let (pool, _container) = setup_test_db().await;
    let store = seeded_store(pool, &["palace-theatre"]).await;
    let t0 = utc("2024-06-01T06:00:00Z");

    let good = record(
        &store,
        "palace-theatre",
        t0,
        finished(AttemptOutcome::Succeeded, Some(ChangeStatus::New), Some("fp-a"), t0),
    )
    .await;
    record(
        &store,
        "palace-theatre",
        t0 + TimeDelta::days(1),
        finished(AttemptOutcome::FailedFatal, Some(ChangeStatus::Changed), Some("fp-b"), t0),
    )
    .await;
    record(
        &store,
        "palace-theatre",
        t0 + TimeDelta::days(2),
        finished(AttemptOutcome::Succeeded, Some(ChangeStatus::Changed), None, t0),
    )
    .await;

    let baseline = store.baseline_for("palace-theatre").await.unwrap().unwrap();
    assert_eq!(baseline.id, good);
    assert_eq!(baseline.fingerprint.as_deref(), Some("fp-a"));
}

#[tokio::test]
async fn recent_is_terminal_only_and_newest_first() {
    let (pool, _container) = setup_test_db().await;
    let store = seeded_store(pool, &["palace-theatre"]).await;
    let t0 = utc("2024-06-01T06:00:00Z");

    let first = record(
        &store,
        "palace-theatre",
        t0,
        finished(AttemptOutcome::Skipped, Some(ChangeStatus::Same), Some("fp"), t0),
    )
    .await;
    // Same start time: insertion order breaks the tie.
    let second = record(
        &store,
        "palace-theatre",
        t0,
        finished(AttemptOutcome::FailedFatal, Some(ChangeStatus::Removed), None, t0),
    )
    .await;
    let open = store
        .begin_attempt(&new_attempt("palace-theatre", t0 + TimeDelta::hours(1), Uuid::new_v4()))
        .await
        .unwrap();

    let recent = store.recent_for("palace-theatre", 10).await.unwrap();
    let ids: Vec<_> = recent.iter().map(|a| a.id).collect();
    assert_eq!(ids, vec![second, first]);

    let latest = store.latest_for("palace-theatre").await.unwrap().unwrap();
    assert_eq!(latest.id, open);
}

#[tokio::test]
async fn list_filters_combine() {
    let (pool, _container) = setup_test_db().await;
    let store = seeded_store(pool, &["palace-theatre", "orpheum"]).await;
    let t0 = utc("2024-06-01T06:00:00Z");

    for day in 0..3 {
        let at = t0 + TimeDelta::days(day);
        record(
            &store,
            "palace-theatre",
            at,
            finished(AttemptOutcome::Skipped, Some(ChangeStatus::Same), Some("fp"), at),
        )
        .await;
    }
    record(
        &store,
        "orpheum",
        t0,
        finished(AttemptOutcome::Succeeded, Some(ChangeStatus::Changed), Some("fp"), t0),
    )
    .await;

    let skipped = store
        .list_attempts(&AttemptFilter {
            source_id: Some("palace-theatre".into()),
            outcome: Some(AttemptOutcome::Skipped),
            since: Some(t0 + TimeDelta::days(1)),
            ..AttemptFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(skipped.len(), 2);
    assert!(skipped[0].started_at > skipped[1].started_at);

    let changed = store
        .list_attempts(&AttemptFilter {
            change_status: Some(ChangeStatus::Changed),
            ..AttemptFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].source_id, "orpheum");

    let limited = store
        .list_attempts(&AttemptFilter {
            trigger: Some(TriggerKind::Scheduled),
            until: Some(t0 + TimeDelta::days(2)),
            limit: 1,
            ..AttemptFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);
}

#[tokio::test]
async fn abandon_closes_only_open_attempts_of_token() {
    let (pool, _container) = setup_test_db().await;
    let store = seeded_store(pool, &["palace-theatre"]).await;
    let t0 = utc("2024-06-01T06:00:00Z");
    let token = Uuid::new_v4();

    let open = store
        .begin_attempt(&new_attempt("palace-theatre", t0, token))
        .await
        .unwrap();
    let closed = store
        .begin_attempt(&new_attempt("palace-theatre", t0, token))
        .await
        .unwrap();
    store
        .finish_attempt(
            closed,
            &finished(AttemptOutcome::Skipped, Some(ChangeStatus::Same), Some("fp"), t0),
        )
        .await
        .unwrap();
    let other = store
        .begin_attempt(&new_attempt("palace-theatre", t0, Uuid::new_v4()))
        .await
        .unwrap();

    let reaped_at = t0 + TimeDelta::minutes(25);
    assert_eq!(
        store
            .abandon_attempts(token, "claim expired", reaped_at)
            .await
            .unwrap(),
        1
    );

    let abandoned = store.get_attempt(open).await.unwrap().unwrap();
    assert_eq!(abandoned.outcome, Some(AttemptOutcome::FailedRetryable));
    assert_eq!(abandoned.error.as_deref(), Some("claim expired"));
    assert_eq!(abandoned.finished_at, Some(reaped_at));
    assert_eq!(
        store.get_attempt(closed).await.unwrap().unwrap().outcome,
        Some(AttemptOutcome::Skipped)
    );
    assert!(store.get_attempt(other).await.unwrap().unwrap().outcome.is_none());
}
