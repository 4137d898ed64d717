use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, SystemTime},
};

use futures::future::BoxFuture;
use indexmap::{IndexMap, IndexSet};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::cutoff;
use crate::dao::{
    intent_store::IntentStore,
    models::{FailureRecord, IntentEntity, IntentStatus, NewIntent, TargetKey},
    storage::{StorageError, StorageResult},
};

/// Process-local intent log. Every operation runs under one mutex, so a claim observes and
/// transitions its rows in a single critical section.
#[derive(Clone, Default)]
pub struct MemoryIntentStore {
    inner: Arc<Mutex<IntentTable>>,
}

#[derive(Default)]
struct IntentTable {
    rows: IndexMap<Uuid, IntentEntity>,
    tokens: HashMap<String, Uuid>,
}

impl IntentTable {
    fn insert_all(&mut self, intents: Vec<NewIntent>) -> StorageResult<Vec<IntentEntity>> {
        let mut seen = HashSet::new();
        for intent in &intents {
            let token = &intent.idempotency_token;
            if self.tokens.contains_key(token) || !seen.insert(token.as_str()) {
                return Err(StorageError::DuplicateIdempotencyToken {
                    token: token.clone(),
                });
            }
        }

        let now = SystemTime::now();
        let created = intents
            .into_iter()
            .map(|intent| intent.into_entity(now))
            .collect::<Vec<_>>();
        for entity in &created {
            self.tokens
                .insert(entity.idempotency_token.clone(), entity.id);
            self.rows.insert(entity.id, entity.clone());
        }
        Ok(created)
    }

    fn update_ids(&mut self, ids: &[Uuid], mut apply: impl FnMut(&mut IntentEntity)) {
        for id in ids {
            if let Some(row) = self.rows.get_mut(id) {
                apply(row);
            }
        }
    }

    fn retain(&mut self, mut keep: impl FnMut(&IntentEntity) -> bool) -> u64 {
        let before = self.rows.len();
        let tokens = &mut self.tokens;
        self.rows.retain(|_, row| {
            let kept = keep(row);
            if !kept {
                tokens.remove(&row.idempotency_token);
            }
            kept
        });
        (before - self.rows.len()) as u64
    }
}

impl MemoryIntentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a row in place. Lets tests stage states the public operations only reach over time.
    pub async fn replace(&self, entity: IntentEntity) {
        let mut table = self.inner.lock().await;
        table
            .tokens
            .insert(entity.idempotency_token.clone(), entity.id);
        table.rows.insert(entity.id, entity);
    }

    /// Snapshot of every row, in creation order.
    pub async fn all(&self) -> Vec<IntentEntity> {
        self.inner.lock().await.rows.values().cloned().collect()
    }
}

impl IntentStore for MemoryIntentStore {
    fn create(&self, intent: NewIntent) -> BoxFuture<'static, StorageResult<IntentEntity>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut created = inner.lock().await.insert_all(vec![intent])?;
            Ok(created.remove(0))
        })
    }

    fn create_batch(
        &self,
        intents: Vec<NewIntent>,
    ) -> BoxFuture<'static, StorageResult<Vec<IntentEntity>>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.lock().await.insert_all(intents) })
    }

    fn find_by_token(
        &self,
        token: String,
    ) -> BoxFuture<'static, StorageResult<Option<IntentEntity>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let table = inner.lock().await;
            Ok(table
                .tokens
                .get(&token)
                .and_then(|id| table.rows.get(id))
                .cloned())
        })
    }

    fn find_batch(&self, batch_id: Uuid) -> BoxFuture<'static, StorageResult<Vec<IntentEntity>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let table = inner.lock().await;
            Ok(table
                .rows
                .values()
                .filter(|row| row.batch_id == batch_id)
                .cloned()
                .collect())
        })
    }

    fn claim_pending_for_target(
        &self,
        key: TargetKey,
    ) -> BoxFuture<'static, StorageResult<Vec<IntentEntity>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut table = inner.lock().await;
            let now = SystemTime::now();
            let claimed = table
                .rows
                .values_mut()
                .filter(|row| row.target_key() == key && row.is_claimable(now))
                .map(|row| {
                    row.status = IntentStatus::Processing;
                    row.attempt_count += 1;
                    row.claimed_at = Some(now);
                    row.clone()
                })
                .collect();
            Ok(claimed)
        })
    }

    fn mark_completed(
        &self,
        ids: Vec<Uuid>,
        processed_at: SystemTime,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.lock().await.update_ids(&ids, |row| {
                row.status = IntentStatus::Completed;
                row.processed_at = Some(processed_at);
            });
            Ok(())
        })
    }

    fn mark_failed(
        &self,
        ids: Vec<Uuid>,
        failure: FailureRecord,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.lock().await.update_ids(&ids, |row| {
                row.status = IntentStatus::Failed;
                row.last_error = Some(failure.last_error.clone());
                row.next_retry_at = failure.next_retry_at;
                if failure.transient {
                    row.transient_failures = row.transient_failures.saturating_add(1);
                }
            });
            Ok(())
        })
    }

    fn mark_quarantined(&self, actor_id: i64) -> BoxFuture<'static, StorageResult<u64>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut table = inner.lock().await;
            let mut moved = 0;
            for row in table.rows.values_mut() {
                if row.actor_id == actor_id && row.status.is_outstanding() {
                    row.status = IntentStatus::Quarantined;
                    moved += 1;
                }
            }
            Ok(moved)
        })
    }

    fn recover_quarantined(&self, actor_id: i64) -> BoxFuture<'static, StorageResult<u64>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut table = inner.lock().await;
            let mut moved = 0;
            for row in table.rows.values_mut() {
                if row.actor_id == actor_id && row.status == IntentStatus::Quarantined {
                    row.status = IntentStatus::Pending;
                    moved += 1;
                }
            }
            Ok(moved)
        })
    }

    fn find_targets_with_work(&self) -> BoxFuture<'static, StorageResult<Vec<TargetKey>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let table = inner.lock().await;
            let now = SystemTime::now();
            let keys = table
                .rows
                .values()
                .filter(|row| row.is_claimable(now))
                .map(IntentEntity::target_key)
                .collect::<IndexSet<_>>();
            Ok(keys.into_iter().collect())
        })
    }

    fn requeue_stale_claims(
        &self,
        claimed_before: SystemTime,
    ) -> BoxFuture<'static, StorageResult<u64>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut table = inner.lock().await;
            let mut moved = 0;
            for row in table.rows.values_mut() {
                let stale = row.claimed_at.is_none_or(|at| at < claimed_before);
                if row.status == IntentStatus::Processing && stale {
                    row.status = IntentStatus::Pending;
                    moved += 1;
                }
            }
            Ok(moved)
        })
    }

    fn count_pending_for_actor(&self, actor_id: i64) -> BoxFuture<'static, StorageResult<u64>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let table = inner.lock().await;
            Ok(table
                .rows
                .values()
                .filter(|row| row.actor_id == actor_id && row.status.is_outstanding())
                .count() as u64)
        })
    }

    fn pending_deltas_for_group(
        &self,
        group_id: i64,
    ) -> BoxFuture<'static, StorageResult<IndexMap<String, i64>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let table = inner.lock().await;
            let mut deltas = IndexMap::new();
            for row in table.rows.values() {
                if row.group_id == group_id && row.status.is_outstanding() {
                    *deltas.entry(row.target_id.clone()).or_insert(0) += row.delta;
                }
            }
            Ok(deltas)
        })
    }

    fn delete_expired(
        &self,
        completed_retention_hours: u32,
        failed_retention_days: u32,
    ) -> BoxFuture<'static, StorageResult<u64>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let now = SystemTime::now();
            let completed_cutoff = cutoff(
                now,
                Duration::from_secs(u64::from(completed_retention_hours) * 3_600),
            );
            let failed_cutoff = cutoff(
                now,
                Duration::from_secs(u64::from(failed_retention_days) * 86_400),
            );

            Ok(inner.lock().await.retain(|row| match row.status {
                IntentStatus::Completed => row
                    .processed_at
                    .is_none_or(|processed| processed >= completed_cutoff),
                IntentStatus::Failed | IntentStatus::Quarantined => {
                    row.created_at >= failed_cutoff
                }
                IntentStatus::Pending | IntentStatus::Processing => true,
            }))
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(token: &str, target: &str, delta: i64) -> NewIntent {
        NewIntent {
            idempotency_token: token.into(),
            actor_id: 7,
            group_id: 42,
            target_id: target.into(),
            target_label: format!("Team {target}"),
            delta,
            batch_id: Uuid::new_v4(),
        }
    }

    fn key(target: &str) -> TargetKey {
        TargetKey::new(7, 42, target)
    }

    #[tokio::test]
    async fn duplicate_token_is_rejected_without_second_row() {
        let store = MemoryIntentStore::new();
        store.create(intent("tok-1", "a", 5)).await.unwrap();

        let err = store.create(intent("tok-1", "a", 5)).await.unwrap_err();
        assert!(err.is_duplicate());
        assert_eq!(store.all().await.len(), 1);
    }

    #[tokio::test]
    async fn batch_with_reused_token_creates_nothing() {
        let store = MemoryIntentStore::new();
        store.create(intent("tok-1", "a", 1)).await.unwrap();

        let err = store
            .create_batch(vec![intent("tok-2", "a", 1), intent("tok-1", "b", 1)])
            .await
            .unwrap_err();
        assert!(err.is_duplicate());
        assert!(store.find_by_token("tok-2".into()).await.unwrap().is_none());

        let err = store
            .create_batch(vec![intent("tok-3", "a", 1), intent("tok-3", "b", 1)])
            .await
            .unwrap_err();
        assert!(err.is_duplicate());
        assert_eq!(store.all().await.len(), 1);
    }

    #[tokio::test]
    async fn claim_takes_only_the_exact_target_and_only_once() {
        let store = MemoryIntentStore::new();
        store.create(intent("t1", "a", 5)).await.unwrap();
        store.create(intent("t2", "a", 3)).await.unwrap();
        store.create(intent("t3", "b", 9)).await.unwrap();

        let claimed = store.claim_pending_for_target(key("a")).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert!(claimed.iter().all(|row| row.status == IntentStatus::Processing));
        assert!(claimed.iter().all(|row| row.attempt_count == 1));

        let again = store.claim_pending_for_target(key("a")).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn failed_rows_wait_for_their_retry_time() {
        let store = MemoryIntentStore::new();
        let row = store.create(intent("t1", "a", 5)).await.unwrap();
        store.claim_pending_for_target(key("a")).await.unwrap();

        let later = SystemTime::now() + Duration::from_secs(600);
        store
            .mark_failed(
                vec![row.id],
                FailureRecord {
                    last_error: "boom".into(),
                    next_retry_at: Some(later),
                    transient: true,
                },
            )
            .await
            .unwrap();
        assert!(store.find_targets_with_work().await.unwrap().is_empty());
        assert!(
            store
                .claim_pending_for_target(key("a"))
                .await
                .unwrap()
                .is_empty()
        );

        let mut due = store.find_by_token("t1".into()).await.unwrap().unwrap();
        due.next_retry_at = Some(SystemTime::now() - Duration::from_secs(1));
        store.replace(due).await;
        assert_eq!(store.find_targets_with_work().await.unwrap(), vec![key("a")]);

        let claimed = store.claim_pending_for_target(key("a")).await.unwrap();
        assert_eq!(claimed[0].attempt_count, 2);
        assert_eq!(claimed[0].transient_failures, 1);
    }

    #[tokio::test]
    async fn terminal_failure_is_never_claimed() {
        let store = MemoryIntentStore::new();
        let row = store.create(intent("t1", "a", 5)).await.unwrap();
        store
            .mark_failed(
                vec![row.id],
                FailureRecord {
                    last_error: "gone".into(),
                    next_retry_at: None,
                    transient: false,
                },
            )
            .await
            .unwrap();

        assert!(store.find_targets_with_work().await.unwrap().is_empty());
        assert!(
            store
                .claim_pending_for_target(key("a"))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn quarantine_and_recovery_round_trip() {
        let store = MemoryIntentStore::new();
        store.create(intent("t1", "a", 5)).await.unwrap();
        store.create(intent("t2", "b", 1)).await.unwrap();
        store.claim_pending_for_target(key("a")).await.unwrap();

        assert_eq!(store.mark_quarantined(7).await.unwrap(), 2);
        assert_eq!(store.mark_quarantined(7).await.unwrap(), 0);
        assert_eq!(store.count_pending_for_actor(7).await.unwrap(), 0);
        assert!(store.find_targets_with_work().await.unwrap().is_empty());

        assert_eq!(store.recover_quarantined(7).await.unwrap(), 2);
        assert_eq!(store.recover_quarantined(7).await.unwrap(), 0);
        assert_eq!(store.find_targets_with_work().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn pending_deltas_sum_outstanding_rows_per_target() {
        let store = MemoryIntentStore::new();
        store.create(intent("t1", "a", 5)).await.unwrap();
        store.create(intent("t2", "a", -2)).await.unwrap();
        let done = store.create(intent("t3", "b", 4)).await.unwrap();
        store
            .mark_completed(vec![done.id], SystemTime::now())
            .await
            .unwrap();

        let deltas = store.pending_deltas_for_group(42).await.unwrap();
        assert_eq!(deltas.get("a"), Some(&3));
        assert_eq!(deltas.get("b"), None);
        assert!(store.pending_deltas_for_group(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_processing_rows_return_to_pending() {
        let store = MemoryIntentStore::new();
        store.create(intent("t1", "a", 5)).await.unwrap();
        store.claim_pending_for_target(key("a")).await.unwrap();

        let long_ago = SystemTime::now() - Duration::from_secs(3_600);
        assert_eq!(store.requeue_stale_claims(long_ago).await.unwrap(), 0);

        let future = SystemTime::now() + Duration::from_secs(1);
        assert_eq!(store.requeue_stale_claims(future).await.unwrap(), 1);
        let row = store.find_by_token("t1".into()).await.unwrap().unwrap();
        assert_eq!(row.status, IntentStatus::Pending);
    }

    #[tokio::test]
    async fn retention_sweep_keeps_live_and_recent_rows() {
        let store = MemoryIntentStore::new();
        let old = SystemTime::now() - Duration::from_secs(30 * 86_400);

        let pending = store.create(intent("pending", "a", 1)).await.unwrap();
        let mut aged_pending = pending.clone();
        aged_pending.created_at = old;
        store.replace(aged_pending).await;

        let mut processing = store.create(intent("processing", "a", 1)).await.unwrap();
        processing.status = IntentStatus::Processing;
        processing.created_at = old;
        store.replace(processing).await;

        let mut old_completed = store.create(intent("old-done", "a", 1)).await.unwrap();
        old_completed.status = IntentStatus::Completed;
        old_completed.processed_at = Some(old);
        store.replace(old_completed).await;

        let mut fresh_completed = store.create(intent("new-done", "a", 1)).await.unwrap();
        fresh_completed.status = IntentStatus::Completed;
        fresh_completed.processed_at = Some(SystemTime::now());
        store.replace(fresh_completed).await;

        let mut old_failed = store.create(intent("old-failed", "a", 1)).await.unwrap();
        old_failed.status = IntentStatus::Failed;
        old_failed.created_at = old;
        store.replace(old_failed).await;

        let mut fresh_failed = store.create(intent("new-failed", "a", 1)).await.unwrap();
        fresh_failed.status = IntentStatus::Failed;
        store.replace(fresh_failed).await;

        assert_eq!(store.delete_expired(24, 7).await.unwrap(), 2);

        let remaining = store
            .all()
            .await
            .into_iter()
            .map(|row| row.idempotency_token)
            .collect::<Vec<_>>();
        assert_eq!(
            remaining,
            vec!["pending", "processing", "new-done", "new-failed"]
        );
        assert!(store.find_by_token("old-done".into()).await.unwrap().is_none());
    }
}
