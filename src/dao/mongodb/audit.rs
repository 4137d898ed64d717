use std::time::{Duration, SystemTime};

use futures::{TryStreamExt, future::BoxFuture};
use mongodb::{
    Collection,
    bson::{DateTime, doc},
};

use super::{
    AUDIT_COLLECTION,
    error::{MongoDaoError, MongoResult},
    manager::MongoManager,
    models::MongoAuditDocument,
};
use crate::dao::{audit_store::AuditStore, models::AuditEntity, storage::StorageResult};

#[derive(Clone)]
pub struct MongoAuditStore {
    manager: MongoManager,
}

impl MongoAuditStore {
    pub fn new(manager: MongoManager) -> Self {
        Self { manager }
    }

    async fn collection(&self) -> Collection<MongoAuditDocument> {
        self.manager
            .database()
            .await
            .collection::<MongoAuditDocument>(AUDIT_COLLECTION)
    }

    async fn insert(&self, records: Vec<AuditEntity>) -> MongoResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let documents: Vec<MongoAuditDocument> =
            records.into_iter().map(MongoAuditDocument::from).collect();
        self.collection()
            .await
            .insert_many(&documents)
            .await
            .map_err(|source| MongoDaoError::Audit {
                operation: "insert",
                source,
            })?;
        Ok(())
    }

    async fn list(&self, group_id: i64, target_id: String) -> MongoResult<Vec<AuditEntity>> {
        let documents: Vec<MongoAuditDocument> = self
            .collection()
            .await
            .find(doc! { "group_id": group_id, "target_id": target_id })
            .sort(doc! { "created_at": -1 })
            .await
            .map_err(|source| MongoDaoError::Audit {
                operation: "list",
                source,
            })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::Audit {
                operation: "list",
                source,
            })?;
        documents.into_iter().map(AuditEntity::try_from).collect()
    }

    async fn sweep(&self, retention: Duration) -> MongoResult<u64> {
        let threshold = SystemTime::now()
            .checked_sub(retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let result = self
            .collection()
            .await
            .delete_many(doc! { "created_at": { "$lt": DateTime::from_system_time(threshold) } })
            .await
            .map_err(|source| MongoDaoError::Audit {
                operation: "delete expired",
                source,
            })?;
        Ok(result.deleted_count)
    }
}

impl AuditStore for MongoAuditStore {
    fn create_batch(&self, records: Vec<AuditEntity>) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.insert(records).await.map_err(Into::into) })
    }

    fn list_for_target(
        &self,
        group_id: i64,
        target_id: String,
    ) -> BoxFuture<'static, StorageResult<Vec<AuditEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.list(group_id, target_id).await.map_err(Into::into) })
    }

    fn delete_expired(&self, retention: Duration) -> BoxFuture<'static, StorageResult<u64>> {
        let store = self.clone();
        Box::pin(async move { store.sweep(retention).await.map_err(Into::into) })
    }
}
