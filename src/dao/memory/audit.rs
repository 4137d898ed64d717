use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use super::cutoff;
use crate::dao::{audit_store::AuditStore, models::AuditEntity, storage::StorageResult};

/// Append-only audit log kept in memory.
#[derive(Clone, Default)]
pub struct MemoryAuditStore {
    records: Arc<RwLock<Vec<AuditEntity>>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record, in insertion order.
    pub async fn all(&self) -> Vec<AuditEntity> {
        self.records.read().await.clone()
    }
}

impl AuditStore for MemoryAuditStore {
    fn create_batch(&self, records: Vec<AuditEntity>) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.records.clone();
        Box::pin(async move {
            store.write().await.extend(records);
            Ok(())
        })
    }

    fn list_for_target(
        &self,
        group_id: i64,
        target_id: String,
    ) -> BoxFuture<'static, StorageResult<Vec<AuditEntity>>> {
        let store = self.records.clone();
        Box::pin(async move {
            let guard = store.read().await;
            Ok(guard
                .iter()
                .rev()
                .filter(|record| record.group_id == group_id && record.target_id == target_id)
                .cloned()
                .collect())
        })
    }

    fn delete_expired(&self, retention: Duration) -> BoxFuture<'static, StorageResult<u64>> {
        let store = self.records.clone();
        Box::pin(async move {
            let threshold = cutoff(SystemTime::now(), retention);
            let mut guard = store.write().await;
            let before = guard.len();
            guard.retain(|record| record.created_at >= threshold);
            Ok((before - guard.len()) as u64)
        })
    }
}
