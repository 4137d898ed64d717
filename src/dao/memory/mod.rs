//! In-process storage backend used by tests and single-node development.

mod audit;
mod credentials;
mod intents;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use audit::MemoryAuditStore;
pub use credentials::MemoryCredentialStore;
pub use intents::MemoryIntentStore;

/// `now - age`, clamped to the epoch.
fn cutoff(now: SystemTime, age: Duration) -> SystemTime {
    now.checked_sub(age).unwrap_or(UNIX_EPOCH)
}
