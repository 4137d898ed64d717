/// Actor credential lifecycle: refresh, revocation, usage tracking.
pub mod credentials;
/// OpenAPI documentation generation.
pub mod documentation;
/// Health check service.
pub mod health_service;
/// Request-path facade over the outbox.
pub mod relay_service;
/// Retention sweep of expired intents and audit records.
pub mod retention;
/// Failure classification and backoff.
pub mod retry;
/// Periodic drain of outstanding intents.
pub mod scheduler;
/// Storage connection supervisor toggling degraded mode.
pub mod storage_supervisor;
/// Per-target synchronization runs.
pub mod sync_service;
