//! Request-path operations: submit intents, query status, credential hand-off.

use indexmap::{IndexMap, IndexSet};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    dao::{
        models::{AuditEntity, CredentialEntity, CredentialUpsert, IntentEntity, NewIntent, TargetKey},
        storage::StorageError,
    },
    error::ServiceError,
    services::sync_service::SyncOutcome,
    state::SharedState,
};

/// One entry of a submission, before tokens are derived.
#[derive(Debug, Clone)]
pub struct IntentDraft {
    pub group_id: i64,
    pub target_id: String,
    pub target_label: String,
    pub delta: i64,
}

/// Result of [`submit_intents`].
#[derive(Debug)]
pub struct Submission {
    pub batch_id: Uuid,
    pub intents: Vec<IntentEntity>,
    /// `true` when the request key had been seen before and nothing was created.
    pub replayed: bool,
    /// Outcomes of the immediate synchronization, when requested.
    pub outcomes: Vec<(TargetKey, SyncOutcome)>,
}

/// Per-entry token of a multi-target request.
pub fn derive_token(request_key: &str, target_id: &str, index: usize) -> String {
    format!("{request_key}:{target_id}:{index}")
}

/// Store one intent per draft under a shared batch.
///
/// A request key that was already used replays the stored batch instead of creating rows. With
/// `synchronize`, each touched target is synchronized right away; failures there only affect the
/// reported outcomes since the scheduler drains whatever is left.
pub async fn submit_intents(
    state: &SharedState,
    request_key: &str,
    actor_id: i64,
    drafts: Vec<IntentDraft>,
    synchronize: bool,
) -> Result<Submission, ServiceError> {
    if drafts.is_empty() {
        return Err(ServiceError::InvalidInput("no intents submitted".into()));
    }
    let stores = state.require_stores().await?;
    let first_token = derive_token(request_key, &drafts[0].target_id, 0);

    if let Some(replay) = replay(state, &first_token).await? {
        return Ok(replay);
    }

    let batch_id = Uuid::new_v4();
    let intents: Vec<NewIntent> = drafts
        .into_iter()
        .enumerate()
        .map(|(index, draft)| NewIntent {
            idempotency_token: derive_token(request_key, &draft.target_id, index),
            actor_id,
            group_id: draft.group_id,
            target_id: draft.target_id,
            target_label: draft.target_label,
            delta: draft.delta,
            batch_id,
        })
        .collect();

    let created = match stores.intents.create_batch(intents).await {
        Ok(created) => created,
        Err(StorageError::DuplicateIdempotencyToken { token }) => {
            // Lost a race against a concurrent submission of the same request.
            return match replay(state, &first_token).await? {
                Some(replay) => Ok(replay),
                None => Err(ServiceError::InvalidInput(format!(
                    "idempotency token `{token}` already used by another request"
                ))),
            };
        }
        Err(err) => return Err(err.into()),
    };
    info!(actor_id, %batch_id, count = created.len(), "stored intents");

    let outcomes = if synchronize {
        synchronize_touched(state, &created).await
    } else {
        Vec::new()
    };

    Ok(Submission {
        batch_id,
        intents: created,
        replayed: false,
        outcomes,
    })
}

async fn replay(state: &SharedState, first_token: &str) -> Result<Option<Submission>, ServiceError> {
    let stores = state.require_stores().await?;
    let Some(existing) = stores.intents.find_by_token(first_token.to_owned()).await? else {
        return Ok(None);
    };
    let intents = stores.intents.find_batch(existing.batch_id).await?;
    info!(batch_id = %existing.batch_id, "replaying duplicate submission");
    Ok(Some(Submission {
        batch_id: existing.batch_id,
        intents,
        replayed: true,
        outcomes: Vec::new(),
    }))
}

async fn synchronize_touched(
    state: &SharedState,
    created: &[IntentEntity],
) -> Vec<(TargetKey, SyncOutcome)> {
    let service = match state.sync_service().await {
        Ok(service) => service,
        Err(err) => {
            warn!(error = %err, "immediate synchronization unavailable");
            return Vec::new();
        }
    };
    let keys: IndexSet<TargetKey> = created.iter().map(IntentEntity::target_key).collect();

    let mut outcomes = Vec::with_capacity(keys.len());
    for key in keys {
        match service.synchronize_target(key.clone()).await {
            Ok(outcome) => outcomes.push((key, outcome)),
            Err(err) => warn!(%key, error = %err, "immediate synchronization failed; left queued"),
        }
    }
    outcomes
}

pub async fn find_intent(state: &SharedState, token: String) -> Result<IntentEntity, ServiceError> {
    let stores = state.require_stores().await?;
    stores
        .intents
        .find_by_token(token.clone())
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("intent `{token}`")))
}

/// Run one synchronization on behalf of the request path.
pub async fn synchronize_target(
    state: &SharedState,
    key: TargetKey,
) -> Result<SyncOutcome, ServiceError> {
    let service = state.sync_service().await?;
    Ok(service.synchronize_target(key).await?)
}

pub async fn count_pending_for_actor(state: &SharedState, actor_id: i64) -> Result<u64, ServiceError> {
    let stores = state.require_stores().await?;
    Ok(stores.intents.count_pending_for_actor(actor_id).await?)
}

pub async fn pending_deltas_for_group(
    state: &SharedState,
    group_id: i64,
) -> Result<IndexMap<String, i64>, ServiceError> {
    let stores = state.require_stores().await?;
    Ok(stores.intents.pending_deltas_for_group(group_id).await?)
}

pub async fn audit_for_target(
    state: &SharedState,
    group_id: i64,
    target_id: String,
) -> Result<Vec<AuditEntity>, ServiceError> {
    let stores = state.require_stores().await?;
    Ok(stores.audit.list_for_target(group_id, target_id).await?)
}

/// Login hand-off: store the fresh credential.
pub async fn upsert_credential(
    state: &SharedState,
    login: CredentialUpsert,
) -> Result<CredentialEntity, ServiceError> {
    let manager = state.credential_manager().await?;
    Ok(manager.upsert_credential(login).await?)
}

/// Login hand-off: release intents quarantined by an earlier revocation.
pub async fn recover_quarantined(state: &SharedState, actor_id: i64) -> Result<u64, ServiceError> {
    let stores = state.require_stores().await?;
    let recovered = stores.intents.recover_quarantined(actor_id).await?;
    if recovered > 0 {
        info!(actor_id, recovered, "recovered quarantined intents");
    }
    Ok(recovered)
}
