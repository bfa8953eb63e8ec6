use chrono::{TimeDelta, Weekday};
use chrono_tz::America::New_York;
use chrono_tz::Europe::London;
use curtain_core::traits::{ClaimStore, ScheduleStore, SourceStore};
use curtain_core::{AppError, IntervalSpec, NewSchedule, ScheduleSpec, SourceStatus};

use crate::integration::common::{sample_source, seeded_store, setup_test_db, utc};

fn stale() -> TimeDelta {
    TimeDelta::minutes(20)
}

fn daily(source: &str) -> NewSchedule {
    NewSchedule::new(
        source,
        ScheduleSpec::new(IntervalSpec::Daily { hour: 2, minute: 0 }, New_York),
    )
}

#[tokio::test]
async fn upsert_keeps_lifecycle_status() {
    let (pool, _container) = setup_test_db().await;
    let store = seeded_store(pool, &["palace-theatre"]).await;
    store
        .set_source_status("palace-theatre", SourceStatus::Degraded)
        .await
        .unwrap();

    let mut renamed = sample_source("palace-theatre");
    renamed.label = "The Palace".into();
    let stored = store.upsert_source(&renamed).await.unwrap();

    assert_eq!(stored.label, "The Palace");
    assert_eq!(stored.status, SourceStatus::Degraded);
    assert_eq!(stored.fetch, renamed.fetch);
    assert!(matches!(
        store.set_source_enabled("nowhere", false).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn spec_round_trips_with_time_zone() {
    let (pool, _container) = setup_test_db().await;
    let store = seeded_store(pool, &["palace-theatre"]).await;
    let spec = ScheduleSpec::new(
        IntervalSpec::Weekly {
            weekday: Weekday::Sat,
            hour: 9,
            minute: 30,
        },
        London,
    );

    let created = store
        .create_schedule(
            NewSchedule::new("palace-theatre", spec.clone()),
            utc("2024-06-01T08:30:00Z"),
        )
        .await
        .unwrap();
    let fetched = store.get_schedule(created.id).await.unwrap().unwrap();

    assert_eq!(fetched.spec, spec);
    assert_eq!(fetched.next_due_at, utc("2024-06-01T08:30:00Z"));
    assert!(fetched.enabled);
}

#[tokio::test]
async fn create_for_unknown_source_is_not_found() {
    let (pool, _container) = setup_test_db().await;
    let store = seeded_store(pool, &[]).await;

    let result = store
        .create_schedule(daily("ghost-light"), utc("2024-06-01T06:00:00Z"))
        .await;
    assert!(matches!(result, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn due_schedules_filters_disabled_claimed_and_future() {
    let (pool, _container) = setup_test_db().await;
    let store = seeded_store(pool, &["palace-theatre", "orpheum", "lyric", "apollo"]).await;
    let now = utc("2024-06-01T06:10:00Z");

    let palace = store
        .create_schedule(daily("palace-theatre"), utc("2024-06-01T06:00:00Z"))
        .await
        .unwrap();
    let orpheum = store
        .create_schedule(daily("orpheum"), utc("2024-06-01T05:00:00Z"))
        .await
        .unwrap();
    // Not yet due.
    store
        .create_schedule(daily("lyric"), utc("2024-06-02T06:00:00Z"))
        .await
        .unwrap();
    // Disabled schedule.
    store
        .create_schedule(daily("apollo").disabled(), utc("2024-06-01T06:00:00Z"))
        .await
        .unwrap();

    let due = store.due_schedules(now, stale()).await.unwrap();
    let ids: Vec<_> = due.iter().map(|d| d.schedule.id).collect();
    assert_eq!(ids, vec![orpheum.id, palace.id]);
    assert_eq!(due[1].source.id, "palace-theatre");

    // A live claim hides the schedule; a soft-disabled source too.
    store
        .try_claim("palace-theatre", Some(palace.id), now, stale())
        .await
        .unwrap()
        .unwrap();
    store
        .set_source_status("orpheum", SourceStatus::Disabled)
        .await
        .unwrap();
    assert!(store.due_schedules(now, stale()).await.unwrap().is_empty());

    // Once the claim goes stale the schedule is due again.
    let later = now + stale();
    let due = store.due_schedules(later, stale()).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].schedule.id, palace.id);
}

#[tokio::test]
async fn advance_is_compare_and_set() {
    let (pool, _container) = setup_test_db().await;
    let store = seeded_store(pool, &["palace-theatre"]).await;
    let due = utc("2024-06-01T06:00:00Z");
    let schedule = store.create_schedule(daily("palace-theatre"), due).await.unwrap();

    let ran = utc("2024-06-01T06:05:00Z");
    let next = utc("2024-06-02T06:00:00Z");
    assert!(store.advance_schedule(schedule.id, due, next, ran).await.unwrap());
    // A second dispatcher still holding the old due time loses.
    assert!(
        !store
            .advance_schedule(schedule.id, due, utc("2024-06-03T06:00:00Z"), ran)
            .await
            .unwrap()
    );

    let stored = store.get_schedule(schedule.id).await.unwrap().unwrap();
    assert_eq!(stored.next_due_at, next);
    assert_eq!(stored.last_run_at, Some(ran));
}

#[tokio::test]
async fn delete_and_toggle_schedules() {
    let (pool, _container) = setup_test_db().await;
    let store = seeded_store(pool, &["palace-theatre", "orpheum"]).await;
    let due = utc("2024-06-01T06:00:00Z");
    let palace = store.create_schedule(daily("palace-theatre"), due).await.unwrap();
    store.create_schedule(daily("orpheum"), due).await.unwrap();

    assert_eq!(
        store
            .list_schedules(Some("palace-theatre"))
            .await
            .unwrap()
            .len(),
        1
    );
    assert_eq!(store.list_schedules(None).await.unwrap().len(), 2);

    store.set_schedule_enabled(palace.id, false).await.unwrap();
    assert!(!store.get_schedule(palace.id).await.unwrap().unwrap().enabled);

    assert!(store.delete_schedule(palace.id).await.unwrap());
    assert!(!store.delete_schedule(palace.id).await.unwrap());
    assert!(store.get_schedule(palace.id).await.unwrap().is_none());
}
