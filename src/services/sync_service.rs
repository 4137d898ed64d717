//! Synchronization of one target: lock, claim, coalesce, read-modify-write, resolve.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    coordination::{CoordinationLock, LockError, LockKey},
    dao::{
        audit_store::AuditStore,
        intent_store::IntentStore,
        models::{AuditEntity, FailureRecord, IntentEntity, TargetKey},
        storage::StorageError,
    },
    services::{
        credentials::{CredentialError, CredentialManager, TokenHolder},
        retry::{FailureAction, RetryPolicy},
    },
    upstream::{TargetValue, UpstreamApi, UpstreamError, UpstreamResult},
};

/// Result of one synchronization run, as seen by callers deciding their own response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Claimed intents were applied upstream as one write.
    Synchronized {
        count: usize,
        net_delta: i64,
        previous_value: i64,
        new_value: i64,
    },
    /// No claimable intent existed for the target.
    NothingToDo,
    /// Another run holds the target. Nothing was claimed or modified.
    Deferred,
    /// The actor's authorization was rejected; the claimed intents were quarantined.
    Quarantined { count: usize },
    /// The upstream call failed. `retry_at` is `None` when the intents are left terminal.
    Failed {
        count: usize,
        retry_at: Option<SystemTime>,
        error: String,
    },
}

impl SyncOutcome {
    /// Short label used in logs and API payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncOutcome::Synchronized { .. } => "synchronized",
            SyncOutcome::NothingToDo => "nothing_to_do",
            SyncOutcome::Deferred => "deferred",
            SyncOutcome::Quarantined { .. } => "quarantined",
            SyncOutcome::Failed { .. } => "failed",
        }
    }
}

/// Infrastructure failures that abort a run. Upstream failures are outcomes, not errors.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Drives [`SyncOutcome`]s for individual targets.
#[derive(Clone)]
pub struct SyncService {
    intents: Arc<dyn IntentStore>,
    audit: Arc<dyn AuditStore>,
    lock: Arc<dyn CoordinationLock>,
    upstream: Arc<dyn UpstreamApi>,
    credentials: CredentialManager,
    retry: RetryPolicy,
    lock_ttl: Duration,
    call_timeout: Duration,
}

impl SyncService {
    pub fn new(
        intents: Arc<dyn IntentStore>,
        audit: Arc<dyn AuditStore>,
        lock: Arc<dyn CoordinationLock>,
        upstream: Arc<dyn UpstreamApi>,
        credentials: CredentialManager,
        retry: RetryPolicy,
        lock_ttl: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            intents,
            audit,
            lock,
            upstream,
            credentials,
            retry,
            lock_ttl,
            call_timeout,
        }
    }

    /// Intent log the service operates on.
    pub fn intents(&self) -> &Arc<dyn IntentStore> {
        &self.intents
    }

    /// Synchronize every claimable intent of `key`.
    ///
    /// The coordination lock is released on every path once acquired; a release failure is
    /// logged and left to the lease TTL.
    pub async fn synchronize_target(&self, key: TargetKey) -> Result<SyncOutcome, SyncError> {
        let lock_key = LockKey::new(key.group_id, key.target_id.clone());
        if !self.lock.try_acquire(lock_key.clone(), self.lock_ttl).await? {
            debug!(%key, "target locked by another run; deferring");
            return Ok(SyncOutcome::Deferred);
        }

        let outcome = self.run_locked(&key).await;

        if let Err(err) = self.lock.release(lock_key).await {
            warn!(%key, error = %err, "failed to release coordination lock; lease will expire");
        }
        outcome
    }

    async fn run_locked(&self, key: &TargetKey) -> Result<SyncOutcome, SyncError> {
        let claimed = self.intents.claim_pending_for_target(key.clone()).await?;
        if claimed.is_empty() {
            debug!(%key, "no claimable intents");
            return Ok(SyncOutcome::NothingToDo);
        }
        debug!(%key, count = claimed.len(), "claimed intents");

        let credential = match self.credentials.refresh_if_needed(key.actor_id).await {
            Ok(credential) => credential,
            Err(CredentialError::Revoked { .. }) => {
                return Ok(SyncOutcome::Quarantined {
                    count: claimed.len(),
                });
            }
            Err(CredentialError::Missing { actor_id }) => {
                let moved = self.intents.mark_quarantined(actor_id).await?;
                warn!(%key, moved, "no upstream credential for actor; quarantined intents");
                return Ok(SyncOutcome::Quarantined {
                    count: claimed.len(),
                });
            }
            Err(CredentialError::RefreshFailed { source, .. }) => {
                return self.resolve_failure(key, &claimed, source).await;
            }
            Err(CredentialError::Storage(err)) => return Err(err.into()),
        };

        let Some(net_delta) = claimed
            .iter()
            .try_fold(0_i64, |sum, intent| sum.checked_add(intent.delta))
        else {
            return self
                .give_up(key, &claimed, "net delta of claimed intents overflows".into())
                .await;
        };
        let token = credential.access_token().to_owned();

        let read = self
            .upstream
            .read_value(token.clone(), key.group_id, key.target_id.clone());
        let current = match self.bounded(read).await {
            Ok(current) => current,
            Err(err) => return self.resolve_failure(key, &claimed, err).await,
        };

        let Some(new_value) = current.value.checked_add(net_delta) else {
            let message = format!(
                "applying net delta {net_delta} to upstream value {} overflows",
                current.value
            );
            return self.give_up(key, &claimed, message).await;
        };

        let write = self
            .upstream
            .write_value(token, key.group_id, key.target_id.clone(), new_value);
        if let Err(err) = self.bounded(write).await {
            return self.resolve_failure(key, &claimed, err).await;
        }

        self.resolve_success(key, &claimed, current, new_value, net_delta)
            .await
    }

    /// Run one upstream call under the per-call deadline; expiry counts as a transient failure.
    async fn bounded<T>(&self, call: BoxFuture<'static, UpstreamResult<T>>) -> UpstreamResult<T> {
        match timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Transient {
                message: format!(
                    "upstream call timed out after {}s",
                    self.call_timeout.as_secs_f64()
                ),
            }),
        }
    }

    async fn resolve_success(
        &self,
        key: &TargetKey,
        claimed: &[IntentEntity],
        current: TargetValue,
        new_value: i64,
        net_delta: i64,
    ) -> Result<SyncOutcome, SyncError> {
        let processed_at = SystemTime::now();
        let ids: Vec<Uuid> = claimed.iter().map(|intent| intent.id).collect();
        if let Err(err) = self.intents.mark_completed(ids, processed_at).await {
            error!(
                %key,
                net_delta,
                error = %err,
                "upstream write applied but completion was not recorded"
            );
            return Err(err.into());
        }

        let records = audit_records(claimed, &current, new_value, processed_at);
        self.audit.create_batch(records).await?;

        if let Err(err) = self.credentials.mark_used(key.actor_id, processed_at).await {
            warn!(actor_id = key.actor_id, error = %err, "failed to record credential use");
        }

        info!(
            %key,
            count = claimed.len(),
            net_delta,
            previous_value = current.value,
            new_value,
            "synchronized target"
        );
        Ok(SyncOutcome::Synchronized {
            count: claimed.len(),
            net_delta,
            previous_value: current.value,
            new_value,
        })
    }

    async fn resolve_failure(
        &self,
        key: &TargetKey,
        claimed: &[IntentEntity],
        err: UpstreamError,
    ) -> Result<SyncOutcome, SyncError> {
        let now = SystemTime::now();
        let transient = matches!(err, UpstreamError::Transient { .. });
        let attempt = claimed
            .iter()
            .map(|intent| intent.transient_failures)
            .max()
            .unwrap_or(0)
            .saturating_add(1);
        let ids: Vec<Uuid> = claimed.iter().map(|intent| intent.id).collect();
        let message = err.to_string();

        match self.retry.classify(&err, attempt, now) {
            FailureAction::Quarantine => {
                let moved = self.intents.mark_quarantined(key.actor_id).await?;
                warn!(%key, moved, error = %err, "upstream rejected authorization; quarantined");
                Ok(SyncOutcome::Quarantined {
                    count: claimed.len(),
                })
            }
            FailureAction::RetryAt(at) => {
                self.intents
                    .mark_failed(
                        ids,
                        FailureRecord {
                            last_error: message.clone(),
                            next_retry_at: Some(at),
                            transient,
                        },
                    )
                    .await?;
                warn!(%key, attempt, error = %err, "synchronization failed; retry scheduled");
                Ok(SyncOutcome::Failed {
                    count: claimed.len(),
                    retry_at: Some(at),
                    error: message,
                })
            }
            FailureAction::GiveUp => {
                self.intents
                    .mark_failed(
                        ids,
                        FailureRecord {
                            last_error: message.clone(),
                            next_retry_at: None,
                            transient,
                        },
                    )
                    .await?;
                error!(%key, attempt, error = %err, "synchronization failed permanently");
                Ok(SyncOutcome::Failed {
                    count: claimed.len(),
                    retry_at: None,
                    error: message,
                })
            }
        }
    }

    /// Leave the claimed rows terminal without touching upstream again.
    async fn give_up(
        &self,
        key: &TargetKey,
        claimed: &[IntentEntity],
        message: String,
    ) -> Result<SyncOutcome, SyncError> {
        let ids: Vec<Uuid> = claimed.iter().map(|intent| intent.id).collect();
        self.intents
            .mark_failed(
                ids,
                FailureRecord {
                    last_error: message.clone(),
                    next_retry_at: None,
                    transient: false,
                },
            )
            .await?;
        error!(%key, error = %message, "synchronization abandoned");
        Ok(SyncOutcome::Failed {
            count: claimed.len(),
            retry_at: None,
            error: message,
        })
    }
}

/// One record per claimed intent, all sharing the observed before/after pair.
fn audit_records(
    claimed: &[IntentEntity],
    current: &TargetValue,
    new_value: i64,
    created_at: SystemTime,
) -> Vec<AuditEntity> {
    claimed
        .iter()
        .map(|intent| AuditEntity {
            id: Uuid::new_v4(),
            intent_id: intent.id,
            actor_id: intent.actor_id,
            group_id: intent.group_id,
            target_id: intent.target_id.clone(),
            target_label: current
                .label
                .clone()
                .unwrap_or_else(|| intent.target_label.clone()),
            previous_value: current.value,
            new_value,
            delta: intent.delta,
            created_at,
        })
        .collect()
}
