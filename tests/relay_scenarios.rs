//! End-to-end scenarios against the in-memory backends and the scripted upstream.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use score_relay::{
    config::{AppConfig, RetentionSettings},
    coordination::LockKey,
    dao::models::{CredentialUpsert, IntentStatus, TargetKey},
    services::{
        relay_service::{self, IntentDraft},
        retention,
        scheduler::Scheduler,
        sync_service::SyncOutcome,
    },
    state::{AppState, SharedState, Stores},
    upstream::{FakeUpstream, UpstreamError},
};

const ACTOR: i64 = 11;
const GROUP: i64 = 3;

struct Harness {
    state: SharedState,
    stores: Stores,
    upstream: FakeUpstream,
    scheduler: Scheduler,
}

async fn harness() -> Harness {
    let config = AppConfig::default();
    let upstream = FakeUpstream::new();
    let state = AppState::new(
        config.clone(),
        Arc::new(upstream.clone()),
        Arc::new(upstream.clone()),
    );
    let stores = Stores::in_memory();
    state.install_stores(stores.clone()).await;
    login(&state, "access-1").await;

    let scheduler = Scheduler::new(state.clone(), config.scheduler);
    Harness {
        state,
        stores,
        upstream,
        scheduler,
    }
}

async fn login(state: &SharedState, access_token: &str) {
    relay_service::upsert_credential(
        state,
        CredentialUpsert {
            actor_id: ACTOR,
            access_token: access_token.into(),
            refresh_token: "refresh".into(),
            token_expiry: SystemTime::now() + Duration::from_secs(3_600),
        },
    )
    .await
    .unwrap();
}

fn draft(target_id: &str, delta: i64) -> Vec<IntentDraft> {
    vec![IntentDraft {
        group_id: GROUP,
        target_id: target_id.into(),
        target_label: format!("Team {target_id}"),
        delta,
    }]
}

fn key(target_id: &str) -> TargetKey {
    TargetKey::new(ACTOR, GROUP, target_id)
}

#[tokio::test]
async fn resubmitting_a_request_creates_nothing_new() {
    let h = harness().await;

    let first = relay_service::submit_intents(&h.state, "req-1", ACTOR, draft("p1", 4), false)
        .await
        .unwrap();
    let again = relay_service::submit_intents(&h.state, "req-1", ACTOR, draft("p1", 4), false)
        .await
        .unwrap();

    assert!(again.replayed);
    assert_eq!(again.intents[0].id, first.intents[0].id);
    assert_eq!(
        relay_service::count_pending_for_actor(&h.state, ACTOR)
            .await
            .unwrap(),
        1
    );

    h.scheduler.tick().await.unwrap();
    assert_eq!(h.upstream.value(GROUP, "p1"), 4);
}

#[tokio::test]
async fn queued_changes_coalesce_into_one_write() {
    let h = harness().await;
    h.upstream.set_value(GROUP, "p1", 10);

    relay_service::submit_intents(&h.state, "req-a", ACTOR, draft("p1", 5), false)
        .await
        .unwrap();
    relay_service::submit_intents(&h.state, "req-b", ACTOR, draft("p1", 3), false)
        .await
        .unwrap();
    assert_eq!(
        relay_service::pending_deltas_for_group(&h.state, GROUP)
            .await
            .unwrap()
            .get("p1"),
        Some(&8)
    );

    let report = h.scheduler.tick().await.unwrap();
    assert_eq!(report.targets, 1);
    assert_eq!(report.synchronized, 2);

    let writes = h.upstream.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].value, 18);
    assert_eq!(writes[0].access_token, "access-1");

    let audit = relay_service::audit_for_target(&h.state, GROUP, "p1".into())
        .await
        .unwrap();
    assert_eq!(audit.len(), 2);
    assert!(audit
        .iter()
        .all(|record| record.previous_value == 10 && record.new_value == 18));
    assert_eq!(audit.iter().map(|record| record.delta).sum::<i64>(), 8);
}

#[tokio::test]
async fn locked_target_is_deferred_then_drained_by_the_scheduler() {
    let h = harness().await;
    relay_service::submit_intents(&h.state, "req-1", ACTOR, draft("p1", 2), false)
        .await
        .unwrap();

    let lock_key = LockKey::new(GROUP, "p1");
    assert!(h
        .stores
        .lock
        .try_acquire(lock_key.clone(), Duration::from_secs(60))
        .await
        .unwrap());

    let outcome = relay_service::synchronize_target(&h.state, key("p1"))
        .await
        .unwrap();
    assert_eq!(outcome, SyncOutcome::Deferred);
    assert!(h.upstream.writes().is_empty());

    let token = relay_service::derive_token("req-1", "p1", 0);
    let intent = relay_service::find_intent(&h.state, token.clone())
        .await
        .unwrap();
    assert_eq!(intent.status, IntentStatus::Pending);
    assert_eq!(intent.attempt_count, 0);

    h.stores.lock.release(lock_key).await.unwrap();
    let report = h.scheduler.tick().await.unwrap();
    assert_eq!(report.synchronized, 1);
    assert_eq!(
        relay_service::find_intent(&h.state, token)
            .await
            .unwrap()
            .status,
        IntentStatus::Completed
    );
}

#[tokio::test]
async fn revoked_authorization_quarantines_until_next_login() {
    let h = harness().await;
    relay_service::submit_intents(&h.state, "req-1", ACTOR, draft("p1", 6), false)
        .await
        .unwrap();
    relay_service::submit_intents(&h.state, "req-2", ACTOR, draft("p2", 1), false)
        .await
        .unwrap();
    h.upstream.fail_next_read(UpstreamError::Unauthorized {
        message: "token revoked".into(),
    });

    let outcome = relay_service::synchronize_target(&h.state, key("p1"))
        .await
        .unwrap();
    assert!(matches!(outcome, SyncOutcome::Quarantined { count: 1 }));
    assert_eq!(
        relay_service::count_pending_for_actor(&h.state, ACTOR)
            .await
            .unwrap(),
        0
    );
    assert!(h.scheduler.tick().await.unwrap().is_empty());
    assert!(h.upstream.writes().is_empty());

    login(&h.state, "access-2").await;
    assert_eq!(
        relay_service::recover_quarantined(&h.state, ACTOR)
            .await
            .unwrap(),
        2
    );

    let report = h.scheduler.tick().await.unwrap();
    assert_eq!(report.synchronized, 2);
    assert_eq!(h.upstream.value(GROUP, "p1"), 6);
    assert_eq!(h.upstream.value(GROUP, "p2"), 1);
    assert!(h
        .upstream
        .writes()
        .iter()
        .all(|write| write.access_token == "access-2"));
}

#[tokio::test]
async fn transient_failure_is_retried_later() {
    let h = harness().await;
    relay_service::submit_intents(&h.state, "req-1", ACTOR, draft("p1", 2), false)
        .await
        .unwrap();
    h.upstream.fail_next_write(UpstreamError::Transient {
        message: "connection reset".into(),
    });

    let submission_outcome = relay_service::synchronize_target(&h.state, key("p1"))
        .await
        .unwrap();
    let SyncOutcome::Failed {
        retry_at: Some(retry_at),
        ..
    } = submission_outcome
    else {
        panic!("expected a scheduled retry, got {submission_outcome:?}");
    };
    assert!(retry_at > SystemTime::now());

    let intent = relay_service::find_intent(&h.state, relay_service::derive_token("req-1", "p1", 0))
        .await
        .unwrap();
    assert_eq!(intent.status, IntentStatus::Failed);
    assert_eq!(intent.attempt_count, 1);
    assert_eq!(intent.next_retry_at, Some(retry_at));

    // Not yet due: nothing to claim.
    assert_eq!(
        relay_service::synchronize_target(&h.state, key("p1"))
            .await
            .unwrap(),
        SyncOutcome::NothingToDo
    );
}

#[tokio::test]
async fn retention_keeps_outstanding_work() {
    let h = harness().await;
    for (request, target) in [("req-a", "done"), ("req-b", "busy"), ("req-c", "queued")] {
        relay_service::submit_intents(&h.state, request, ACTOR, draft(target, 1), false)
            .await
            .unwrap();
    }
    relay_service::synchronize_target(&h.state, key("done"))
        .await
        .unwrap();
    let claimed = h
        .stores
        .intents
        .claim_pending_for_target(key("busy"))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let immediate = RetentionSettings {
        completed_hours: 0,
        failed_days: 0,
        audit_days: 0,
    };
    let report = retention::sweep(&h.stores, &immediate).await.unwrap();
    assert_eq!(report.intents_deleted, 1);
    assert_eq!(report.audit_deleted, 1);

    let busy = relay_service::find_intent(&h.state, relay_service::derive_token("req-b", "busy", 0))
        .await
        .unwrap();
    assert_eq!(busy.status, IntentStatus::Processing);
    let queued =
        relay_service::find_intent(&h.state, relay_service::derive_token("req-c", "queued", 0))
            .await
            .unwrap();
    assert_eq!(queued.status, IntentStatus::Pending);
    assert!(relay_service::find_intent(&h.state, relay_service::derive_token("req-a", "done", 0))
        .await
        .is_err());
}

#[tokio::test]
async fn two_replicas_racing_on_one_target_write_once() {
    let h = harness().await;
    h.upstream.set_latency(Duration::from_millis(50));
    relay_service::submit_intents(&h.state, "req-1", ACTOR, draft("p1", 7), false)
        .await
        .unwrap();

    let replica_a = h.state.sync_service().await.unwrap();
    let replica_b = h.state.sync_service().await.unwrap();
    let (a, b) = tokio::join!(
        replica_a.synchronize_target(key("p1")),
        replica_b.synchronize_target(key("p1")),
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    assert_eq!(
        outcomes
            .iter()
            .filter(|outcome| matches!(outcome, SyncOutcome::Synchronized { count: 1, .. }))
            .count(),
        1
    );
    assert!(outcomes.contains(&SyncOutcome::Deferred));
    assert_eq!(h.upstream.writes().len(), 1);
    assert_eq!(h.upstream.value(GROUP, "p1"), 7);
}

#[tokio::test]
async fn missing_target_fails_terminally() {
    let h = harness().await;
    relay_service::submit_intents(&h.state, "req-1", ACTOR, draft("gone", 1), false)
        .await
        .unwrap();
    h.upstream.fail_next_read(UpstreamError::NotFound {
        message: "no such target".into(),
    });

    let report = h.scheduler.tick().await.unwrap();
    assert_eq!(report.failed, 1);

    let intent = relay_service::find_intent(&h.state, relay_service::derive_token("req-1", "gone", 0))
        .await
        .unwrap();
    assert_eq!(intent.status, IntentStatus::Failed);
    assert_eq!(intent.next_retry_at, None);
    assert!(intent.last_error.is_some());
    assert!(h.scheduler.tick().await.unwrap().is_empty());
}
