use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;
use mongodb::{
    Collection,
    bson::{DateTime, Document, doc},
};
use uuid::Uuid;

use super::{
    LOCK_COLLECTION,
    error::{MongoDaoError, is_duplicate_key},
    manager::MongoManager,
};
use crate::coordination::{CoordinationLock, LockError, LockKey, LockResult};

/// Expiring mutual-exclusion keys stored in `sync_locks`.
///
/// Acquisition is a conditional upsert: it matches the key only once its lease has expired, so
/// while the lease is live the upsert collides with the existing `_id` and reports "held".
#[derive(Clone)]
pub struct MongoCoordinationLock {
    manager: MongoManager,
    holder: String,
}

impl MongoCoordinationLock {
    pub fn new(manager: MongoManager) -> Self {
        Self {
            manager,
            holder: Uuid::new_v4().to_string(),
        }
    }

    async fn collection(&self) -> Collection<Document> {
        self.manager
            .database()
            .await
            .collection::<Document>(LOCK_COLLECTION)
    }
}

impl From<MongoDaoError> for LockError {
    fn from(err: MongoDaoError) -> Self {
        LockError::unavailable(err.to_string(), err)
    }
}

impl CoordinationLock for MongoCoordinationLock {
    fn try_acquire(&self, key: LockKey, ttl: Duration) -> BoxFuture<'static, LockResult<bool>> {
        let lock = self.clone();
        Box::pin(async move {
            let name = key.to_string();
            let now = SystemTime::now();
            let result = lock
                .collection()
                .await
                .update_one(
                    doc! {
                        "_id": name.as_str(),
                        "expires_at": { "$lte": DateTime::from_system_time(now) },
                    },
                    doc! {
                        "$set": {
                            "holder": lock.holder.as_str(),
                            "expires_at": DateTime::from_system_time(now + ttl),
                        }
                    },
                )
                .upsert(true)
                .await;

            match result {
                Ok(_) => Ok(true),
                Err(err) if is_duplicate_key(&err) => Ok(false),
                Err(source) => Err(MongoDaoError::Lock {
                    operation: "acquire",
                    key: name,
                    source,
                }
                .into()),
            }
        })
    }

    fn release(&self, key: LockKey) -> BoxFuture<'static, LockResult<()>> {
        let lock = self.clone();
        Box::pin(async move {
            let name = key.to_string();
            lock.collection()
                .await
                .delete_one(doc! { "_id": name.as_str() })
                .await
                .map_err(|source| MongoDaoError::Lock {
                    operation: "release",
                    key: name,
                    source,
                })?;
            Ok(())
        })
    }
}
