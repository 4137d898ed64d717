//! Cross-replica mutual exclusion for synchronization runs.
//!
//! A lock key names one upstream target. Only the holder may synchronize that target; the lease
//! expires on its own so a crashed holder never blocks the target for longer than the TTL.

mod memory;

use std::{error::Error, fmt, time::Duration};

use futures::future::BoxFuture;
use thiserror::Error;

pub use memory::MemoryCoordinationLock;

/// Result alias for lock operations.
pub type LockResult<T> = Result<T, LockError>;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("coordination lock unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
}

impl LockError {
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        LockError::Unavailable {
            message,
            source: Box::new(source),
        }
    }
}

/// Identifies the upstream target a lock protects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub group_id: i64,
    pub target_id: String,
}

impl LockKey {
    pub fn new(group_id: i64, target_id: impl Into<String>) -> Self {
        Self {
            group_id,
            target_id: target_id.into(),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "outbox:lock:{}:{}", self.group_id, self.target_id)
    }
}

/// Shared lock service.
pub trait CoordinationLock: Send + Sync {
    /// Take the key for `ttl` if nobody holds it. `false` means another holder owns it.
    fn try_acquire(&self, key: LockKey, ttl: Duration) -> BoxFuture<'static, LockResult<bool>>;

    /// Drop the key regardless of who holds it.
    fn release(&self, key: LockKey) -> BoxFuture<'static, LockResult<()>>;
}
