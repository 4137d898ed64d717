use std::{sync::Arc, time::SystemTime};

use dashmap::DashMap;
use futures::future::BoxFuture;

use crate::dao::{
    credential_store::CredentialStore,
    models::{CredentialEntity, CredentialUpsert},
    storage::StorageResult,
};

/// Process-local credential table keyed by actor.
#[derive(Clone, Default)]
pub struct MemoryCredentialStore {
    rows: Arc<DashMap<i64, CredentialEntity>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn upsert(
        &self,
        credential: CredentialUpsert,
    ) -> BoxFuture<'static, StorageResult<CredentialEntity>> {
        let rows = self.rows.clone();
        Box::pin(async move {
            let now = SystemTime::now();
            let mut entry = rows
                .entry(credential.actor_id)
                .or_insert_with(|| CredentialEntity {
                    actor_id: credential.actor_id,
                    access_token: String::new(),
                    refresh_token: String::new(),
                    token_expiry: now,
                    last_used_at: None,
                    created_at: now,
                    updated_at: now,
                });
            entry.access_token = credential.access_token;
            entry.refresh_token = credential.refresh_token;
            entry.token_expiry = credential.token_expiry;
            entry.updated_at = now;
            Ok(entry.clone())
        })
    }

    fn get(&self, actor_id: i64) -> BoxFuture<'static, StorageResult<Option<CredentialEntity>>> {
        let rows = self.rows.clone();
        Box::pin(async move { Ok(rows.get(&actor_id).map(|row| row.clone())) })
    }

    fn update_tokens(
        &self,
        actor_id: i64,
        access_token: String,
        refresh_token: String,
        token_expiry: SystemTime,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let rows = self.rows.clone();
        Box::pin(async move {
            if let Some(mut row) = rows.get_mut(&actor_id) {
                row.access_token = access_token;
                row.refresh_token = refresh_token;
                row.token_expiry = token_expiry;
                row.updated_at = SystemTime::now();
            }
            Ok(())
        })
    }

    fn update_last_used(
        &self,
        actor_id: i64,
        when: SystemTime,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let rows = self.rows.clone();
        Box::pin(async move {
            if let Some(mut row) = rows.get_mut(&actor_id) {
                row.last_used_at = Some(when);
            }
            Ok(())
        })
    }
}
