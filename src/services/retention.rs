//! Retention sweep shared by the cleanup binary.

use tracing::info;

use crate::{config::RetentionSettings, dao::storage::StorageResult, state::Stores};

/// Rows removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub intents_deleted: u64,
    pub audit_deleted: u64,
}

/// Delete expired intents, then expired audit records.
pub async fn sweep(stores: &Stores, settings: &RetentionSettings) -> StorageResult<SweepReport> {
    let intents_deleted = stores
        .intents
        .delete_expired(settings.completed_hours, settings.failed_days)
        .await?;
    let audit_deleted = stores
        .audit
        .delete_expired(settings.audit_retention())
        .await?;

    info!(intents_deleted, audit_deleted, "retention sweep complete");
    Ok(SweepReport {
        intents_deleted,
        audit_deleted,
    })
}
