//! Background drain loop.
//!
//! One loop per process, one target at a time. Running it on every replica is safe: the
//! coordination lock decides who writes, the loop only guarantees somebody eventually tries.

use std::time::SystemTime;

use tokio::{
    sync::watch,
    time::{MissedTickBehavior, interval, timeout},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::SchedulerSettings,
    error::ServiceError,
    services::sync_service::SyncOutcome,
    state::SharedState,
};

/// Counters for one scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Abandoned `processing` rows returned to `pending`.
    pub requeued: u64,
    /// Targets discovered with work.
    pub targets: usize,
    /// Intents applied upstream.
    pub synchronized: usize,
    /// Targets skipped because another run held them.
    pub deferred: usize,
    /// Intents quarantined.
    pub quarantined: usize,
    /// Intents left in `failed`.
    pub failed: usize,
    /// Targets whose run errored or timed out.
    pub errors: usize,
}

impl TickReport {
    fn record(&mut self, outcome: &SyncOutcome) {
        match outcome {
            SyncOutcome::Synchronized { count, .. } => self.synchronized += count,
            SyncOutcome::NothingToDo => {}
            SyncOutcome::Deferred => self.deferred += 1,
            SyncOutcome::Quarantined { count } => self.quarantined += count,
            SyncOutcome::Failed { count, .. } => self.failed += count,
        }
    }

    /// Whether the tick did anything worth reporting.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Periodic driver of the synchronization service.
pub struct Scheduler {
    state: SharedState,
    settings: SchedulerSettings,
}

impl Scheduler {
    pub fn new(state: SharedState, settings: SchedulerSettings) -> Self {
        Self { state, settings }
    }

    /// Tick every poll interval until `stop` turns `true` or its sender is dropped.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut ticker = interval(self.settings.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            poll_secs = self.settings.poll_interval_secs,
            "background scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(report) if report.is_empty() => debug!("scheduler tick found no work"),
                        Ok(report) => info!(
                            requeued = report.requeued,
                            targets = report.targets,
                            synchronized = report.synchronized,
                            deferred = report.deferred,
                            quarantined = report.quarantined,
                            failed = report.failed,
                            errors = report.errors,
                            "scheduler tick complete"
                        ),
                        Err(ServiceError::Degraded) => debug!("storage unavailable; skipping tick"),
                        Err(err) => warn!(error = %err, "scheduler tick aborted"),
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        info!("background scheduler stopped");
    }

    /// Requeue stale claims, then synchronize every target with work, one after another.
    ///
    /// Individual target failures are counted and logged; only failing to list work aborts.
    /// A run that outlives the target timeout keeps going in its own task so it still resolves
    /// its claim and releases its lock; the tick just stops waiting for it.
    pub async fn tick(&self) -> Result<TickReport, ServiceError> {
        let service = self.state.sync_service().await?;
        let mut report = TickReport::default();

        let stale_before = SystemTime::now()
            .checked_sub(self.settings.stale_claim_after())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        report.requeued = service.intents().requeue_stale_claims(stale_before).await?;
        if report.requeued > 0 {
            warn!(count = report.requeued, "requeued abandoned claims");
        }

        let targets = service.intents().find_targets_with_work().await?;
        report.targets = targets.len();

        for key in targets {
            let run = {
                let service = service.clone();
                let key = key.clone();
                tokio::spawn(async move { service.synchronize_target(key).await })
            };
            match timeout(self.settings.target_timeout(), run).await {
                Ok(Ok(Ok(outcome))) => report.record(&outcome),
                Ok(Ok(Err(err))) => {
                    report.errors += 1;
                    error!(%key, error = %err, "target synchronization errored");
                }
                Ok(Err(err)) => {
                    report.errors += 1;
                    error!(%key, error = %err, "target synchronization task failed");
                }
                Err(_) => {
                    report.errors += 1;
                    warn!(
                        %key,
                        timeout_secs = self.settings.target_timeout_secs,
                        "target synchronization still running; not waiting for it"
                    );
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use uuid::Uuid;

    use super::*;
    use crate::{
        config::AppConfig,
        coordination::LockKey,
        dao::models::{CredentialUpsert, IntentStatus, NewIntent},
        state::{AppState, Stores},
        upstream::{FakeUpstream, UpstreamError},
    };

    async fn setup(settings: SchedulerSettings) -> (Scheduler, Stores, FakeUpstream) {
        setup_with(AppConfig::default(), settings).await
    }

    async fn setup_with(
        config: AppConfig,
        settings: SchedulerSettings,
    ) -> (Scheduler, Stores, FakeUpstream) {
        let upstream = FakeUpstream::new();
        let state = AppState::new(
            config,
            Arc::new(upstream.clone()),
            Arc::new(upstream.clone()),
        );
        let stores = Stores::in_memory();
        state.install_stores(stores.clone()).await;
        for actor_id in [1, 2] {
            stores
                .credentials
                .upsert(CredentialUpsert {
                    actor_id,
                    access_token: format!("access-{actor_id}"),
                    refresh_token: format!("refresh-{actor_id}"),
                    token_expiry: SystemTime::now() + Duration::from_secs(3_600),
                })
                .await
                .unwrap();
        }
        (Scheduler::new(state, settings), stores, upstream)
    }

    fn intent(token: &str, actor_id: i64, target_id: &str, delta: i64) -> NewIntent {
        NewIntent {
            idempotency_token: token.into(),
            actor_id,
            group_id: 9,
            target_id: target_id.into(),
            target_label: target_id.to_uppercase(),
            delta,
            batch_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn tick_continues_past_failing_targets() {
        let (scheduler, stores, upstream) = setup(SchedulerSettings::default()).await;
        stores.intents.create(intent("a", 1, "t1", 2)).await.unwrap();
        stores.intents.create(intent("b", 2, "t2", 4)).await.unwrap();
        upstream.fail_next_read(UpstreamError::Transient {
            message: "reset".into(),
        });

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.targets, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.synchronized, 1);
        assert_eq!(report.errors, 0);
        assert_eq!(upstream.writes().len(), 1);
    }

    #[tokio::test]
    async fn second_tick_has_nothing_left() {
        let (scheduler, stores, _upstream) = setup(SchedulerSettings::default()).await;
        stores.intents.create(intent("a", 1, "t1", 2)).await.unwrap();

        assert_eq!(scheduler.tick().await.unwrap().synchronized, 1);
        assert!(scheduler.tick().await.unwrap().is_empty());
    }

    async fn lock_is_free(stores: &Stores, target_id: &str) -> bool {
        let key = LockKey::new(9, target_id);
        let acquired = stores
            .lock
            .try_acquire(key.clone(), Duration::from_secs(60))
            .await
            .unwrap();
        if acquired {
            stores.lock.release(key).await.unwrap();
        }
        acquired
    }

    #[tokio::test]
    async fn slow_upstream_call_leaves_retryable_failure_and_free_lock() {
        let mut config = AppConfig::default();
        config.sync.upstream_call_timeout_secs = 1;
        let (scheduler, stores, upstream) =
            setup_with(config, SchedulerSettings::default()).await;
        upstream.set_latency(Duration::from_secs(3));
        stores.intents.create(intent("a", 1, "t1", 2)).await.unwrap();

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.errors, 0);

        let row = stores
            .intents
            .find_by_token("a".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, IntentStatus::Failed);
        assert!(row.next_retry_at.is_some());
        assert!(row.last_error.unwrap().contains("timed out"));
        assert!(lock_is_free(&stores, "t1").await);
        assert!(upstream.writes().is_empty());
    }

    #[tokio::test]
    async fn run_outliving_target_timeout_still_finishes_and_releases_lock() {
        let settings = SchedulerSettings {
            target_timeout_secs: 1,
            ..SchedulerSettings::default()
        };
        let (scheduler, stores, upstream) = setup(settings).await;
        upstream.set_latency(Duration::from_millis(1_500));
        stores.intents.create(intent("a", 1, "t1", 2)).await.unwrap();
        stores.intents.create(intent("b", 2, "t2", 3)).await.unwrap();

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.targets, 2);
        assert_eq!(report.errors, 2);

        tokio::time::sleep(Duration::from_secs(4)).await;
        for (token, target_id) in [("a", "t1"), ("b", "t2")] {
            let row = stores
                .intents
                .find_by_token(token.into())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(row.status, IntentStatus::Completed);
            assert!(lock_is_free(&stores, target_id).await);
        }
        assert_eq!(upstream.value(9, "t1"), 2);
        assert_eq!(upstream.value(9, "t2"), 3);
    }

    #[tokio::test]
    async fn degraded_state_skips_tick() {
        let upstream = FakeUpstream::new();
        let state = AppState::new(
            AppConfig::default(),
            Arc::new(upstream.clone()),
            Arc::new(upstream),
        );
        let scheduler = Scheduler::new(state, SchedulerSettings::default());
        assert!(matches!(scheduler.tick().await, Err(ServiceError::Degraded)));
    }

    #[tokio::test]
    async fn run_stops_on_signal() {
        let (scheduler, _stores, _upstream) = setup(SchedulerSettings::default()).await;
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(stop_rx));

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler stops")
            .unwrap();
    }
}
