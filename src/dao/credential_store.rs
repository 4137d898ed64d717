use std::time::SystemTime;

use futures::future::BoxFuture;

use crate::dao::{
    models::{CredentialEntity, CredentialUpsert},
    storage::StorageResult,
};

/// Durable per-actor credential storage, independent of login sessions.
pub trait CredentialStore: Send + Sync {
    /// Create or refresh the actor's single credential row, keeping `created_at` and `last_used_at`.
    fn upsert(
        &self,
        credential: CredentialUpsert,
    ) -> BoxFuture<'static, StorageResult<CredentialEntity>>;

    fn get(&self, actor_id: i64) -> BoxFuture<'static, StorageResult<Option<CredentialEntity>>>;

    /// Persist the outcome of a background token refresh.
    fn update_tokens(
        &self,
        actor_id: i64,
        access_token: String,
        refresh_token: String,
        token_expiry: SystemTime,
    ) -> BoxFuture<'static, StorageResult<()>>;

    fn update_last_used(
        &self,
        actor_id: i64,
        when: SystemTime,
    ) -> BoxFuture<'static, StorageResult<()>>;
}
