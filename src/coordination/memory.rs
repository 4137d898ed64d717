use std::{sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use futures::future::BoxFuture;
use tokio::time::Instant;

use super::{CoordinationLock, LockKey, LockResult};

/// Process-local lock table. Shares leases between every clone.
#[derive(Clone, Default)]
pub struct MemoryCoordinationLock {
    leases: Arc<DashMap<LockKey, Instant>>,
}

impl MemoryCoordinationLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a live lease exists for `key`.
    pub fn is_held(&self, key: &LockKey) -> bool {
        self.leases
            .get(key)
            .is_some_and(|expires_at| *expires_at > Instant::now())
    }
}

impl CoordinationLock for MemoryCoordinationLock {
    fn try_acquire(&self, key: LockKey, ttl: Duration) -> BoxFuture<'static, LockResult<bool>> {
        let leases = self.leases.clone();
        Box::pin(async move {
            let now = Instant::now();
            let acquired = match leases.entry(key) {
                Entry::Occupied(mut lease) if *lease.get() <= now => {
                    lease.insert(now + ttl);
                    true
                }
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(now + ttl);
                    true
                }
            };
            Ok(acquired)
        })
    }

    fn release(&self, key: LockKey) -> BoxFuture<'static, LockResult<()>> {
        let leases = self.leases.clone();
        Box::pin(async move {
            leases.remove(&key);
            Ok(())
        })
    }
}
