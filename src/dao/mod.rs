/// Append-only audit trail of applied intents.
pub mod audit_store;
/// Per-actor upstream credentials.
pub mod credential_store;
/// Durable intent log (outbox).
pub mod intent_store;
/// In-process backend.
pub mod memory;
/// Database model definitions.
pub mod models;
/// MongoDB backend.
#[cfg(feature = "mongo-store")]
pub mod mongodb;
/// Storage abstraction layer for database operations.
pub mod storage;
