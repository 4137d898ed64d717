use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use thiserror::Error;

pub type MongoResult<T> = std::result::Result<T, MongoDaoError>;

/// Server error code reported when a unique index rejects a write.
const DUPLICATE_KEY_CODE: i32 = 11000;

#[derive(Debug, Error)]
pub enum MongoDaoError {
    #[error("failed to parse MongoDB connection URI `{uri}`")]
    InvalidUri {
        uri: String,
        #[source]
        source: MongoError,
    },
    #[error("failed to build MongoDB client from options")]
    ClientConstruction {
        #[source]
        source: MongoError,
    },
    #[error("MongoDB ping failed during initial connection after {attempts} attempt(s)")]
    InitialPing {
        attempts: u32,
        #[source]
        source: MongoError,
    },
    #[error("MongoDB ping health check failed")]
    HealthPing {
        #[source]
        source: MongoError,
    },
    #[error("failed to ensure index `{index}` on collection `{collection}`")]
    EnsureIndex {
        collection: &'static str,
        index: &'static str,
        #[source]
        source: MongoError,
    },
    #[error("idempotency token `{token}` already used")]
    DuplicateToken { token: String },
    #[error("failed to insert intents")]
    InsertIntents {
        #[source]
        source: MongoError,
    },
    #[error("intent transaction failed during `{step}`")]
    Transaction {
        step: &'static str,
        #[source]
        source: MongoError,
    },
    #[error("failed to claim intents for `{key}`")]
    ClaimIntents {
        key: String,
        #[source]
        source: MongoError,
    },
    #[error("failed to {operation} intents")]
    UpdateIntents {
        operation: &'static str,
        #[source]
        source: MongoError,
    },
    #[error("failed to query intents ({operation})")]
    QueryIntents {
        operation: &'static str,
        #[source]
        source: MongoError,
    },
    #[error("failed to load credential for actor `{actor_id}`")]
    LoadCredential {
        actor_id: i64,
        #[source]
        source: MongoError,
    },
    #[error("failed to save credential for actor `{actor_id}`")]
    SaveCredential {
        actor_id: i64,
        #[source]
        source: MongoError,
    },
    #[error("failed to {operation} audit records")]
    Audit {
        operation: &'static str,
        #[source]
        source: MongoError,
    },
    #[error("corrupt document `{id}`: {reason}")]
    CorruptDocument { id: String, reason: String },
    #[error("failed to {operation} coordination lock `{key}`")]
    Lock {
        operation: &'static str,
        key: String,
        #[source]
        source: MongoError,
    },
}

/// Whether the failure is a unique index violation.
pub fn is_duplicate_key(err: &MongoError) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write)) => write.code == DUPLICATE_KEY_CODE,
        ErrorKind::InsertMany(failure) => failure
            .write_errors
            .as_ref()
            .is_some_and(|errors| errors.iter().any(|e| e.code == DUPLICATE_KEY_CODE)),
        ErrorKind::Command(command) => command.code == DUPLICATE_KEY_CODE,
        _ => false,
    }
}
