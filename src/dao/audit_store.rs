use std::time::Duration;

use futures::future::BoxFuture;

use crate::dao::{models::AuditEntity, storage::StorageResult};

/// Append-only audit trail with one record per applied intent.
pub trait AuditStore: Send + Sync {
    fn create_batch(&self, records: Vec<AuditEntity>) -> BoxFuture<'static, StorageResult<()>>;

    /// Records for one target, newest first.
    fn list_for_target(
        &self,
        group_id: i64,
        target_id: String,
    ) -> BoxFuture<'static, StorageResult<Vec<AuditEntity>>>;

    /// Drop records older than `retention`.
    fn delete_expired(&self, retention: Duration) -> BoxFuture<'static, StorageResult<u64>>;
}
