//! MongoDB storage backend.

pub mod audit;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod intents;
pub mod lock;
pub mod manager;
pub mod models;

pub use audit::MongoAuditStore;
pub use config::MongoConfig;
pub use credentials::MongoCredentialStore;
pub use error::MongoDaoError;
pub use intents::MongoIntentStore;
pub use lock::MongoCoordinationLock;
pub use manager::{MongoManager, connect};

use crate::dao::storage::StorageError;

pub(crate) const INTENT_COLLECTION: &str = "score_intents";
pub(crate) const CREDENTIAL_COLLECTION: &str = "user_credentials";
pub(crate) const AUDIT_COLLECTION: &str = "score_audit";
pub(crate) const LOCK_COLLECTION: &str = "sync_locks";

impl From<MongoDaoError> for StorageError {
    fn from(err: MongoDaoError) -> Self {
        match err {
            MongoDaoError::DuplicateToken { token } => {
                StorageError::DuplicateIdempotencyToken { token }
            }
            other => StorageError::unavailable(other.to_string(), other),
        }
    }
}
