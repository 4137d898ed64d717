use std::time::SystemTime;

use futures::future::BoxFuture;
use indexmap::IndexMap;
use uuid::Uuid;

use crate::dao::{
    models::{FailureRecord, IntentEntity, NewIntent, TargetKey},
    storage::StorageResult,
};

/// Durable, idempotent intent log (the outbox).
///
/// Every mutation is a single atomic backend operation; batch updates are idempotent under
/// repetition so a retried call never changes the outcome.
pub trait IntentStore: Send + Sync {
    /// Insert one intent in `pending`. Fails with `DuplicateIdempotencyToken` when the token exists.
    fn create(&self, intent: NewIntent) -> BoxFuture<'static, StorageResult<IntentEntity>>;

    /// Insert several intents atomically: either every row is created or none is.
    fn create_batch(
        &self,
        intents: Vec<NewIntent>,
    ) -> BoxFuture<'static, StorageResult<Vec<IntentEntity>>>;

    fn find_by_token(&self, token: String)
    -> BoxFuture<'static, StorageResult<Option<IntentEntity>>>;

    /// All intents created by the same request, oldest first.
    fn find_batch(&self, batch_id: Uuid) -> BoxFuture<'static, StorageResult<Vec<IntentEntity>>>;

    /// Move every claimable row of `key` to `processing`, skipping rows a concurrent claimer
    /// already owns, and return the claimed rows. An empty vector is not an error.
    fn claim_pending_for_target(
        &self,
        key: TargetKey,
    ) -> BoxFuture<'static, StorageResult<Vec<IntentEntity>>>;

    fn mark_completed(
        &self,
        ids: Vec<Uuid>,
        processed_at: SystemTime,
    ) -> BoxFuture<'static, StorageResult<()>>;

    /// Record a failure, bumping `transient_failures` when the failure is transient.
    fn mark_failed(
        &self,
        ids: Vec<Uuid>,
        failure: FailureRecord,
    ) -> BoxFuture<'static, StorageResult<()>>;

    /// Quarantine every `pending`/`processing` row of the actor. Returns the number of rows moved.
    fn mark_quarantined(&self, actor_id: i64) -> BoxFuture<'static, StorageResult<u64>>;

    /// Move every `quarantined` row of the actor back to `pending`.
    fn recover_quarantined(&self, actor_id: i64) -> BoxFuture<'static, StorageResult<u64>>;

    /// Distinct partition keys with `pending` rows or `failed` rows whose retry time elapsed.
    fn find_targets_with_work(&self) -> BoxFuture<'static, StorageResult<Vec<TargetKey>>>;

    /// Return rows stuck in `processing` since before `claimed_before` to `pending`.
    fn requeue_stale_claims(
        &self,
        claimed_before: SystemTime,
    ) -> BoxFuture<'static, StorageResult<u64>>;

    /// Number of `pending`/`processing` rows of the actor.
    fn count_pending_for_actor(&self, actor_id: i64) -> BoxFuture<'static, StorageResult<u64>>;

    /// Sum of outstanding deltas per target of a group.
    fn pending_deltas_for_group(
        &self,
        group_id: i64,
    ) -> BoxFuture<'static, StorageResult<IndexMap<String, i64>>>;

    /// Retention sweep: completed rows processed more than `completed_retention_hours` ago and
    /// failed/quarantined rows created more than `failed_retention_days` ago.
    fn delete_expired(
        &self,
        completed_retention_hours: u32,
        failed_retention_days: u32,
    ) -> BoxFuture<'static, StorageResult<u64>>;

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
}
