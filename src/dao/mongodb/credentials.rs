use std::time::SystemTime;

use futures::future::BoxFuture;
use mongodb::{
    Collection,
    bson::{DateTime, doc},
    options::ReturnDocument,
};

use super::{
    CREDENTIAL_COLLECTION,
    error::{MongoDaoError, MongoResult},
    manager::MongoManager,
    models::MongoCredentialDocument,
};
use crate::dao::{
    credential_store::CredentialStore,
    models::{CredentialEntity, CredentialUpsert},
    storage::StorageResult,
};

/// Credentials keyed by actor id in `user_credentials`.
#[derive(Clone)]
pub struct MongoCredentialStore {
    manager: MongoManager,
}

impl MongoCredentialStore {
    pub fn new(manager: MongoManager) -> Self {
        Self { manager }
    }

    async fn collection(&self) -> Collection<MongoCredentialDocument> {
        self.manager
            .database()
            .await
            .collection::<MongoCredentialDocument>(CREDENTIAL_COLLECTION)
    }

    async fn upsert_one(&self, credential: CredentialUpsert) -> MongoResult<CredentialEntity> {
        let actor_id = credential.actor_id;
        let now = DateTime::now();
        let saved = self
            .collection()
            .await
            .find_one_and_update(
                doc! { "_id": actor_id },
                doc! {
                    "$set": {
                        "access_token": credential.access_token,
                        "refresh_token": credential.refresh_token,
                        "token_expiry": DateTime::from_system_time(credential.token_expiry),
                        "updated_at": now,
                    },
                    "$setOnInsert": {
                        "created_at": now,
                        "last_used_at": null,
                    },
                },
            )
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await
            .map_err(|source| MongoDaoError::SaveCredential { actor_id, source })?;

        saved
            .map(CredentialEntity::from)
            .ok_or_else(|| MongoDaoError::CorruptDocument {
                id: actor_id.to_string(),
                reason: "upsert returned no document".into(),
            })
    }

    async fn load(&self, actor_id: i64) -> MongoResult<Option<CredentialEntity>> {
        let found = self
            .collection()
            .await
            .find_one(doc! { "_id": actor_id })
            .await
            .map_err(|source| MongoDaoError::LoadCredential { actor_id, source })?;
        Ok(found.map(CredentialEntity::from))
    }

    async fn set_fields(&self, actor_id: i64, fields: mongodb::bson::Document) -> MongoResult<()> {
        self.collection()
            .await
            .update_one(doc! { "_id": actor_id }, doc! { "$set": fields })
            .await
            .map_err(|source| MongoDaoError::SaveCredential { actor_id, source })?;
        Ok(())
    }
}

impl CredentialStore for MongoCredentialStore {
    fn upsert(
        &self,
        credential: CredentialUpsert,
    ) -> BoxFuture<'static, StorageResult<CredentialEntity>> {
        let store = self.clone();
        Box::pin(async move { store.upsert_one(credential).await.map_err(Into::into) })
    }

    fn get(&self, actor_id: i64) -> BoxFuture<'static, StorageResult<Option<CredentialEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.load(actor_id).await.map_err(Into::into) })
    }

    fn update_tokens(
        &self,
        actor_id: i64,
        access_token: String,
        refresh_token: String,
        token_expiry: SystemTime,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .set_fields(
                    actor_id,
                    doc! {
                        "access_token": access_token,
                        "refresh_token": refresh_token,
                        "token_expiry": DateTime::from_system_time(token_expiry),
                        "updated_at": DateTime::now(),
                    },
                )
                .await
                .map_err(Into::into)
        })
    }

    fn update_last_used(
        &self,
        actor_id: i64,
        when: SystemTime,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .set_fields(
                    actor_id,
                    doc! { "last_used_at": DateTime::from_system_time(when) },
                )
                .await
                .map_err(Into::into)
        })
    }
}
