use std::time::{Duration, SystemTime};

use futures::{TryStreamExt, future::BoxFuture};
use indexmap::IndexMap;
use mongodb::{
    Collection,
    bson::{DateTime, Document, doc},
    options::ReturnDocument,
};
use uuid::Uuid;

use super::{
    INTENT_COLLECTION,
    error::{MongoDaoError, MongoResult, is_duplicate_key},
    manager::MongoManager,
    models::{DeltaSumRow, MongoIntentDocument, TargetGroupRow},
};
use crate::dao::{
    intent_store::IntentStore,
    models::{FailureRecord, IntentEntity, IntentStatus, NewIntent, TargetKey},
    storage::StorageResult,
};

/// MongoDB implementation of the intent log.
///
/// Claims are issued per row with `find_one_and_update` guarded by the claimable filter, so a
/// row another replica already moved to `processing` simply fails to match and is skipped.
#[derive(Clone)]
pub struct MongoIntentStore {
    manager: MongoManager,
}

impl MongoIntentStore {
    pub fn new(manager: MongoManager) -> Self {
        Self { manager }
    }

    async fn collection(&self) -> Collection<MongoIntentDocument> {
        self.manager
            .database()
            .await
            .collection::<MongoIntentDocument>(INTENT_COLLECTION)
    }

    async fn create_one(&self, intent: NewIntent) -> MongoResult<IntentEntity> {
        let entity = intent.into_entity(SystemTime::now());
        let document = MongoIntentDocument::from(&entity);
        match self.collection().await.insert_one(&document).await {
            Ok(_) => Ok(entity),
            Err(err) if is_duplicate_key(&err) => Err(MongoDaoError::DuplicateToken {
                token: entity.idempotency_token,
            }),
            Err(source) => Err(MongoDaoError::InsertIntents { source }),
        }
    }

    async fn create_many(&self, intents: Vec<NewIntent>) -> MongoResult<Vec<IntentEntity>> {
        if intents.is_empty() {
            return Ok(Vec::new());
        }
        let now = SystemTime::now();
        let entities: Vec<IntentEntity> = intents
            .into_iter()
            .map(|intent| intent.into_entity(now))
            .collect();
        let documents: Vec<MongoIntentDocument> =
            entities.iter().map(MongoIntentDocument::from).collect();

        let collection = self.collection().await;
        let client = self.manager.client().await;
        let mut session = client
            .start_session()
            .await
            .map_err(|source| MongoDaoError::Transaction {
                step: "start session",
                source,
            })?;
        session
            .start_transaction()
            .await
            .map_err(|source| MongoDaoError::Transaction {
                step: "start transaction",
                source,
            })?;

        match collection.insert_many(&documents).session(&mut session).await {
            Ok(_) => {
                session
                    .commit_transaction()
                    .await
                    .map_err(|source| MongoDaoError::Transaction {
                        step: "commit",
                        source,
                    })?;
                Ok(entities)
            }
            Err(err) => {
                let _ = session.abort_transaction().await;
                if is_duplicate_key(&err) {
                    let tokens = entities
                        .iter()
                        .map(|entity| entity.idempotency_token.clone())
                        .collect();
                    let token = self.first_existing_token(tokens).await?;
                    return Err(MongoDaoError::DuplicateToken { token });
                }
                Err(MongoDaoError::InsertIntents { source: err })
            }
        }
    }

    /// Name the offending token after a rejected batch. Falls back to the first token when the
    /// conflict came from inside the batch itself.
    async fn first_existing_token(&self, tokens: Vec<String>) -> MongoResult<String> {
        let fallback = tokens.first().cloned().unwrap_or_default();
        let existing = self
            .collection()
            .await
            .find_one(doc! { "idempotency_token": { "$in": tokens } })
            .await
            .map_err(|source| MongoDaoError::QueryIntents {
                operation: "find duplicate token",
                source,
            })?;
        Ok(existing.map_or(fallback, |document| document.idempotency_token))
    }

    async fn find_one_by_token(&self, token: String) -> MongoResult<Option<IntentEntity>> {
        let found = self
            .collection()
            .await
            .find_one(doc! { "idempotency_token": token })
            .await
            .map_err(|source| MongoDaoError::QueryIntents {
                operation: "find by token",
                source,
            })?;
        found.map(IntentEntity::try_from).transpose()
    }

    async fn find_many(
        &self,
        filter: Document,
        operation: &'static str,
    ) -> MongoResult<Vec<IntentEntity>> {
        let documents: Vec<MongoIntentDocument> = self
            .collection()
            .await
            .find(filter)
            .sort(doc! { "created_at": 1, "_id": 1 })
            .await
            .map_err(|source| MongoDaoError::QueryIntents { operation, source })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::QueryIntents { operation, source })?;
        documents.into_iter().map(IntentEntity::try_from).collect()
    }

    async fn claim(&self, key: TargetKey) -> MongoResult<Vec<IntentEntity>> {
        let now = DateTime::now();
        let candidates = self
            .find_many(claimable_filter(&key, now), "list claim candidates")
            .await?;

        let collection = self.collection().await;
        let mut claimed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let mut guard = claimable_filter(&key, now);
            guard.insert("_id", candidate.id.to_string());
            let updated = collection
                .find_one_and_update(
                    guard,
                    doc! {
                        "$set": {
                            "status": IntentStatus::Processing.as_str(),
                            "claimed_at": now,
                        },
                        "$inc": { "attempt_count": 1_i64 },
                    },
                )
                .return_document(ReturnDocument::After)
                .await
                .map_err(|source| MongoDaoError::ClaimIntents {
                    key: key.to_string(),
                    source,
                })?;
            if let Some(document) = updated {
                claimed.push(IntentEntity::try_from(document)?);
            }
        }
        Ok(claimed)
    }

    async fn update_many(
        &self,
        filter: Document,
        update: Document,
        operation: &'static str,
    ) -> MongoResult<u64> {
        let result = self
            .collection()
            .await
            .update_many(filter, update)
            .await
            .map_err(|source| MongoDaoError::UpdateIntents { operation, source })?;
        Ok(result.modified_count)
    }

    async fn targets_with_work(&self) -> MongoResult<Vec<TargetKey>> {
        let pipeline = vec![
            doc! { "$match": work_filter(DateTime::now()) },
            doc! {
                "$group": {
                    "_id": {
                        "actor_id": "$actor_id",
                        "group_id": "$group_id",
                        "target_id": "$target_id",
                    },
                    "first_created": { "$min": "$created_at" },
                }
            },
            doc! { "$sort": { "first_created": 1 } },
        ];
        let rows: Vec<TargetGroupRow> = self
            .collection()
            .await
            .aggregate(pipeline)
            .with_type::<TargetGroupRow>()
            .await
            .map_err(|source| MongoDaoError::QueryIntents {
                operation: "list targets with work",
                source,
            })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::QueryIntents {
                operation: "list targets with work",
                source,
            })?;

        Ok(rows.into_iter().map(|row| row.key).collect())
    }

    async fn count_outstanding(&self, actor_id: i64) -> MongoResult<u64> {
        self.collection()
            .await
            .count_documents(doc! {
                "actor_id": actor_id,
                "status": { "$in": outstanding_statuses() },
            })
            .await
            .map_err(|source| MongoDaoError::QueryIntents {
                operation: "count outstanding",
                source,
            })
    }

    async fn outstanding_deltas(&self, group_id: i64) -> MongoResult<IndexMap<String, i64>> {
        let pipeline = vec![
            doc! {
                "$match": {
                    "group_id": group_id,
                    "status": { "$in": outstanding_statuses() },
                }
            },
            doc! { "$group": { "_id": "$target_id", "total": { "$sum": "$delta" } } },
            doc! { "$sort": { "_id": 1 } },
        ];
        let rows: Vec<DeltaSumRow> = self
            .collection()
            .await
            .aggregate(pipeline)
            .with_type::<DeltaSumRow>()
            .await
            .map_err(|source| MongoDaoError::QueryIntents {
                operation: "sum outstanding deltas",
                source,
            })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::QueryIntents {
                operation: "sum outstanding deltas",
                source,
            })?;

        Ok(rows
            .into_iter()
            .map(|row| (row.target_id, row.total))
            .collect())
    }

    async fn sweep(&self, completed_hours: u32, failed_days: u32) -> MongoResult<u64> {
        let now = SystemTime::now();
        let completed_cutoff = cutoff(now, Duration::from_secs(u64::from(completed_hours) * 3_600));
        let failed_cutoff = cutoff(now, Duration::from_secs(u64::from(failed_days) * 86_400));
        let collection = self.collection().await;

        let completed = collection
            .delete_many(doc! {
                "status": IntentStatus::Completed.as_str(),
                "processed_at": { "$lt": completed_cutoff },
            })
            .await
            .map_err(|source| MongoDaoError::UpdateIntents {
                operation: "delete completed",
                source,
            })?;
        let failed = collection
            .delete_many(doc! {
                "status": {
                    "$in": [IntentStatus::Failed.as_str(), IntentStatus::Quarantined.as_str()],
                },
                "created_at": { "$lt": failed_cutoff },
            })
            .await
            .map_err(|source| MongoDaoError::UpdateIntents {
                operation: "delete failed",
                source,
            })?;

        Ok(completed.deleted_count + failed.deleted_count)
    }
}

fn ids_filter(ids: &[Uuid]) -> Document {
    let ids: Vec<String> = ids.iter().map(Uuid::to_string).collect();
    doc! { "_id": { "$in": ids } }
}

fn outstanding_statuses() -> Vec<&'static str> {
    vec![
        IntentStatus::Pending.as_str(),
        IntentStatus::Processing.as_str(),
    ]
}

/// Rows a claim may pick up: `pending`, or `failed` with an elapsed retry time.
fn work_filter(now: DateTime) -> Document {
    doc! {
        "$or": [
            { "status": IntentStatus::Pending.as_str() },
            {
                "status": IntentStatus::Failed.as_str(),
                "next_retry_at": { "$lte": now },
            },
        ]
    }
}

fn claimable_filter(key: &TargetKey, now: DateTime) -> Document {
    let mut filter = work_filter(now);
    filter.insert("actor_id", key.actor_id);
    filter.insert("group_id", key.group_id);
    filter.insert("target_id", key.target_id.clone());
    filter
}

fn cutoff(now: SystemTime, age: Duration) -> DateTime {
    DateTime::from_system_time(now.checked_sub(age).unwrap_or(SystemTime::UNIX_EPOCH))
}

impl IntentStore for MongoIntentStore {
    fn create(&self, intent: NewIntent) -> BoxFuture<'static, StorageResult<IntentEntity>> {
        let store = self.clone();
        Box::pin(async move { store.create_one(intent).await.map_err(Into::into) })
    }

    fn create_batch(
        &self,
        intents: Vec<NewIntent>,
    ) -> BoxFuture<'static, StorageResult<Vec<IntentEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.create_many(intents).await.map_err(Into::into) })
    }

    fn find_by_token(
        &self,
        token: String,
    ) -> BoxFuture<'static, StorageResult<Option<IntentEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.find_one_by_token(token).await.map_err(Into::into) })
    }

    fn find_batch(&self, batch_id: Uuid) -> BoxFuture<'static, StorageResult<Vec<IntentEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .find_many(doc! { "batch_id": batch_id.to_string() }, "find batch")
                .await
                .map_err(Into::into)
        })
    }

    fn claim_pending_for_target(
        &self,
        key: TargetKey,
    ) -> BoxFuture<'static, StorageResult<Vec<IntentEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.claim(key).await.map_err(Into::into) })
    }

    fn mark_completed(
        &self,
        ids: Vec<Uuid>,
        processed_at: SystemTime,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(());
            }
            store
                .update_many(
                    ids_filter(&ids),
                    doc! {
                        "$set": {
                            "status": IntentStatus::Completed.as_str(),
                            "processed_at": DateTime::from_system_time(processed_at),
                            "next_retry_at": null,
                        }
                    },
                    "complete",
                )
                .await?;
            Ok(())
        })
    }

    fn mark_failed(
        &self,
        ids: Vec<Uuid>,
        failure: FailureRecord,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(());
            }
            let mut update = doc! {
                "$set": {
                    "status": IntentStatus::Failed.as_str(),
                    "last_error": failure.last_error,
                    "next_retry_at": failure.next_retry_at.map(DateTime::from_system_time),
                }
            };
            if failure.transient {
                update.insert("$inc", doc! { "transient_failures": 1_i64 });
            }
            store.update_many(ids_filter(&ids), update, "fail").await?;
            Ok(())
        })
    }

    fn mark_quarantined(&self, actor_id: i64) -> BoxFuture<'static, StorageResult<u64>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .update_many(
                    doc! {
                        "actor_id": actor_id,
                        "status": { "$in": outstanding_statuses() },
                    },
                    doc! { "$set": { "status": IntentStatus::Quarantined.as_str() } },
                    "quarantine",
                )
                .await
                .map_err(Into::into)
        })
    }

    fn recover_quarantined(&self, actor_id: i64) -> BoxFuture<'static, StorageResult<u64>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .update_many(
                    doc! {
                        "actor_id": actor_id,
                        "status": IntentStatus::Quarantined.as_str(),
                    },
                    doc! {
                        "$set": {
                            "status": IntentStatus::Pending.as_str(),
                            "next_retry_at": null,
                        }
                    },
                    "recover",
                )
                .await
                .map_err(Into::into)
        })
    }

    fn find_targets_with_work(&self) -> BoxFuture<'static, StorageResult<Vec<TargetKey>>> {
        let store = self.clone();
        Box::pin(async move { store.targets_with_work().await.map_err(Into::into) })
    }

    fn requeue_stale_claims(
        &self,
        claimed_before: SystemTime,
    ) -> BoxFuture<'static, StorageResult<u64>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .update_many(
                    doc! {
                        "status": IntentStatus::Processing.as_str(),
                        "claimed_at": { "$lt": DateTime::from_system_time(claimed_before) },
                    },
                    doc! { "$set": { "status": IntentStatus::Pending.as_str() } },
                    "requeue",
                )
                .await
                .map_err(Into::into)
        })
    }

    fn count_pending_for_actor(&self, actor_id: i64) -> BoxFuture<'static, StorageResult<u64>> {
        let store = self.clone();
        Box::pin(async move { store.count_outstanding(actor_id).await.map_err(Into::into) })
    }

    fn pending_deltas_for_group(
        &self,
        group_id: i64,
    ) -> BoxFuture<'static, StorageResult<IndexMap<String, i64>>> {
        let store = self.clone();
        Box::pin(async move { store.outstanding_deltas(group_id).await.map_err(Into::into) })
    }

    fn delete_expired(
        &self,
        completed_retention_hours: u32,
        failed_retention_days: u32,
    ) -> BoxFuture<'static, StorageResult<u64>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .sweep(completed_retention_hours, failed_retention_days)
                .await
                .map_err(Into::into)
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.manager.ping().await.map_err(Into::into) })
    }
}
