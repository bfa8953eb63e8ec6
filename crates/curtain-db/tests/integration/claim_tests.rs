use chrono::TimeDelta;
use chrono_tz::America::New_York;
use curtain_core::traits::{ClaimStore, JobQueue, ScheduleStore};
use curtain_core::{IntervalSpec, NewJob, NewSchedule, ScheduleSpec, TriggerKind};
use uuid::Uuid;

use crate::integration::common::{seeded_store, setup_test_db, utc};

fn stale() -> TimeDelta {
    TimeDelta::minutes(20)
}

#[tokio::test]
async fn concurrent_claims_have_one_winner() {
    let (pool, _container) = setup_test_db().await;
    let store = seeded_store(pool, &["palace-theatre"]).await;
    let now = utc("2024-06-01T06:00:00Z");

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .try_claim("palace-theatre", None, now, stale())
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn live_claim_blocks_and_stale_claim_is_taken_over() {
    let (pool, _container) = setup_test_db().await;
    let store = seeded_store(pool, &["palace-theatre"]).await;
    let schedule = store
        .create_schedule(
            NewSchedule::new(
                "palace-theatre",
                ScheduleSpec::new(IntervalSpec::Daily { hour: 2, minute: 0 }, New_York),
            ),
            utc("2024-06-01T06:00:00Z"),
        )
        .await
        .unwrap();

    let start = utc("2024-06-01T06:00:00Z");
    let first = store
        .try_claim("palace-theatre", Some(schedule.id), start, stale())
        .await
        .unwrap()
        .expect("unclaimed source should be claimable");

    let mirrored = store.get_schedule(schedule.id).await.unwrap().unwrap();
    assert_eq!(mirrored.claim_token, Some(first.token));
    assert_eq!(mirrored.last_claimed_at, Some(start));

    // One second short of stale: still held.
    let almost = start + stale() - TimeDelta::seconds(1);
    assert!(
        store
            .try_claim("palace-theatre", None, almost, stale())
            .await
            .unwrap()
            .is_none()
    );

    // Exactly at the threshold the claim is stale.
    let takeover = store
        .try_claim("palace-theatre", None, start + stale(), stale())
        .await
        .unwrap()
        .expect("stale claim should be taken over");
    assert_ne!(takeover.token, first.token);

    let cleared = store.get_schedule(schedule.id).await.unwrap().unwrap();
    assert!(cleared.claim_token.is_none());
    assert!(cleared.last_claimed_at.is_none());

    // The old holder can no longer refresh or release.
    assert!(
        !store
            .refresh_claim("palace-theatre", first.token, start + stale())
            .await
            .unwrap()
    );
    assert!(
        !store
            .release_claim("palace-theatre", first.token)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn release_requires_matching_token() {
    let (pool, _container) = setup_test_db().await;
    let store = seeded_store(pool, &["palace-theatre"]).await;
    let now = utc("2024-06-01T06:00:00Z");

    let claim = store
        .try_claim("palace-theatre", None, now, stale())
        .await
        .unwrap()
        .unwrap();

    assert!(
        !store
            .release_claim("palace-theatre", Uuid::new_v4())
            .await
            .unwrap()
    );
    assert!(store.current_claim("palace-theatre").await.unwrap().is_some());

    assert!(store.release_claim("palace-theatre", claim.token).await.unwrap());
    assert!(store.current_claim("palace-theatre").await.unwrap().is_none());
    assert!(
        store
            .try_claim("palace-theatre", None, now, stale())
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn refresh_extends_claim_and_stale_listing() {
    let (pool, _container) = setup_test_db().await;
    let store = seeded_store(pool, &["palace-theatre", "orpheum"]).await;
    let start = utc("2024-06-01T06:00:00Z");

    let palace = store
        .try_claim("palace-theatre", None, start, stale())
        .await
        .unwrap()
        .unwrap();
    store
        .try_claim("orpheum", None, start, stale())
        .await
        .unwrap()
        .unwrap();

    let later = start + TimeDelta::minutes(15);
    assert!(
        store
            .refresh_claim("palace-theatre", palace.token, later)
            .await
            .unwrap()
    );

    let check_at = start + TimeDelta::minutes(25);
    let stale = store.stale_claims(check_at, stale()).await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].source_id, "orpheum");
}

#[tokio::test]
async fn claim_of_queued_job_does_not_go_stale() {
    let (pool, _container) = setup_test_db().await;
    let store = seeded_store(pool, &["palace-theatre"]).await;
    let start = utc("2024-06-01T06:00:00Z");

    let claim = store
        .try_claim("palace-theatre", None, start, stale())
        .await
        .unwrap()
        .unwrap();
    let job = NewJob::new("palace-theatre", TriggerKind::Manual, start).with_claim(claim.token);
    store.enqueue(job).await.unwrap();

    // Still queued well past the threshold: neither listed nor taken over.
    let later = start + stale() * 3;
    assert!(store.stale_claims(later, stale()).await.unwrap().is_empty());
    assert!(
        store
            .try_claim("palace-theatre", None, later, stale())
            .await
            .unwrap()
            .is_none()
    );

    // Once picked up the clock runs from the last refresh.
    store.claim_next_job("worker-1", later).await.unwrap().unwrap();
    assert!(
        store
            .refresh_claim("palace-theatre", claim.token, later)
            .await
            .unwrap()
    );
    let almost = later + stale() - TimeDelta::seconds(1);
    assert!(store.stale_claims(almost, stale()).await.unwrap().is_empty());

    let listed = store.stale_claims(later + stale(), stale()).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].token, claim.token);
}
