//! DTO definitions for the intent, target and actor routes.

use std::time::{Duration, SystemTime};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::{Validate, ValidationErrors};

use crate::{
    dao::models::{AuditEntity, CredentialEntity, CredentialUpsert, IntentEntity, TargetKey},
    dto::{
        format_system_time,
        validation::{validate_delta, validate_target_id},
    },
    services::{
        relay_service::{IntentDraft, Submission},
        sync_service::SyncOutcome,
    },
};

/// Payload submitting one or more score changes on behalf of an actor.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct SubmitIntentsRequest {
    #[validate(range(min = 1))]
    pub actor_id: i64,
    #[validate(length(min = 1, max = 100), nested)]
    pub entries: Vec<IntentEntryInput>,
    /// Synchronize touched targets before responding.
    #[serde(default)]
    pub sync: bool,
}

/// One score change within a submission.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct IntentEntryInput {
    pub group_id: i64,
    pub target_id: String,
    pub target_label: String,
    /// Signed, non-zero change of at most one billion in magnitude.
    pub delta: i64,
}

impl Validate for IntentEntryInput {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if let Err(e) = validate_target_id(&self.target_id) {
            errors.add("target_id", e);
        }
        if self.target_label.chars().count() > 200 {
            let mut err = validator::ValidationError::new("target_label_length");
            err.message = Some("Target label must be at most 200 characters".into());
            errors.add("target_label", err);
        }
        if let Err(e) = validate_delta(self.delta) {
            errors.add("delta", e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl From<IntentEntryInput> for IntentDraft {
    fn from(entry: IntentEntryInput) -> Self {
        IntentDraft {
            group_id: entry.group_id,
            target_id: entry.target_id,
            target_label: entry.target_label,
            delta: entry.delta,
        }
    }
}

/// Stored intent as exposed to collaborators.
#[derive(Debug, Serialize, ToSchema)]
pub struct IntentResponse {
    pub id: Uuid,
    pub idempotency_token: String,
    pub actor_id: i64,
    pub group_id: i64,
    pub target_id: String,
    pub target_label: String,
    pub delta: i64,
    /// One of `pending`, `processing`, `completed`, `failed`, `quarantined`.
    pub status: String,
    pub attempt_count: u32,
    pub next_retry_at: Option<String>,
    pub last_error: Option<String>,
    pub batch_id: Uuid,
    pub created_at: String,
    pub processed_at: Option<String>,
}

impl From<IntentEntity> for IntentResponse {
    fn from(intent: IntentEntity) -> Self {
        Self {
            id: intent.id,
            idempotency_token: intent.idempotency_token,
            actor_id: intent.actor_id,
            group_id: intent.group_id,
            target_id: intent.target_id,
            target_label: intent.target_label,
            delta: intent.delta,
            status: intent.status.as_str().to_owned(),
            attempt_count: intent.attempt_count,
            next_retry_at: intent.next_retry_at.map(format_system_time),
            last_error: intent.last_error,
            batch_id: intent.batch_id,
            created_at: format_system_time(intent.created_at),
            processed_at: intent.processed_at.map(format_system_time),
        }
    }
}

/// Synchronization outcome for one target.
#[derive(Debug, Serialize, ToSchema)]
pub struct SyncOutcomeResponse {
    pub group_id: i64,
    pub target_id: String,
    /// `synchronized`, `nothing_to_do`, `deferred`, `quarantined` or `failed`.
    pub outcome: String,
    /// Intents resolved by the run.
    pub count: usize,
    pub net_delta: Option<i64>,
    pub previous_value: Option<i64>,
    pub new_value: Option<i64>,
    pub retry_at: Option<String>,
    pub error: Option<String>,
}

impl SyncOutcomeResponse {
    /// Flatten an outcome for the wire.
    pub fn new(key: &TargetKey, outcome: &SyncOutcome) -> Self {
        let mut response = Self {
            group_id: key.group_id,
            target_id: key.target_id.clone(),
            outcome: outcome.kind().to_owned(),
            count: 0,
            net_delta: None,
            previous_value: None,
            new_value: None,
            retry_at: None,
            error: None,
        };
        match outcome {
            SyncOutcome::Synchronized {
                count,
                net_delta,
                previous_value,
                new_value,
            } => {
                response.count = *count;
                response.net_delta = Some(*net_delta);
                response.previous_value = Some(*previous_value);
                response.new_value = Some(*new_value);
            }
            SyncOutcome::Quarantined { count } => response.count = *count,
            SyncOutcome::Failed {
                count,
                retry_at,
                error,
            } => {
                response.count = *count;
                response.retry_at = retry_at.map(format_system_time);
                response.error = Some(error.clone());
            }
            SyncOutcome::NothingToDo | SyncOutcome::Deferred => {}
        }
        response
    }
}

/// Response to an intent submission.
#[derive(Debug, Serialize, ToSchema)]
pub struct SubmitIntentsResponse {
    pub batch_id: Uuid,
    /// `true` when the idempotency key had been used before.
    pub replayed: bool,
    pub intents: Vec<IntentResponse>,
    /// Present only when immediate synchronization was requested.
    pub outcomes: Vec<SyncOutcomeResponse>,
}

impl From<Submission> for SubmitIntentsResponse {
    fn from(submission: Submission) -> Self {
        Self {
            batch_id: submission.batch_id,
            replayed: submission.replayed,
            outcomes: submission
                .outcomes
                .iter()
                .map(|(key, outcome)| SyncOutcomeResponse::new(key, outcome))
                .collect(),
            intents: submission
                .intents
                .into_iter()
                .map(IntentResponse::from)
                .collect(),
        }
    }
}

/// Query selecting the actor whose intents a sync targets.
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct SyncQuery {
    pub actor_id: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PendingCountResponse {
    pub actor_id: i64,
    pub pending: u64,
}

/// Sum of outstanding deltas for one target.
#[derive(Debug, Serialize, ToSchema)]
pub struct TargetDelta {
    pub target_id: String,
    pub delta: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PendingDeltasResponse {
    pub group_id: i64,
    pub deltas: Vec<TargetDelta>,
}

impl PendingDeltasResponse {
    pub fn new(group_id: i64, deltas: IndexMap<String, i64>) -> Self {
        Self {
            group_id,
            deltas: deltas
                .into_iter()
                .map(|(target_id, delta)| TargetDelta { target_id, delta })
                .collect(),
        }
    }
}

/// Token material handed over by the login flow.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct CredentialRequest {
    #[validate(length(min = 1))]
    pub access_token: String,
    #[validate(length(min = 1))]
    pub refresh_token: String,
    /// Lifetime of `access_token`, in seconds from now.
    #[validate(range(min = 1))]
    pub expires_in_secs: u64,
}

impl CredentialRequest {
    /// Bind the payload to an actor, anchoring the expiry at `now`.
    pub fn into_upsert(self, actor_id: i64, now: SystemTime) -> CredentialUpsert {
        CredentialUpsert {
            actor_id,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            token_expiry: now + Duration::from_secs(self.expires_in_secs),
        }
    }
}

/// Credential metadata. Tokens are never echoed back.
#[derive(Debug, Serialize, ToSchema)]
pub struct CredentialResponse {
    pub actor_id: i64,
    pub token_expiry: String,
    pub last_used_at: Option<String>,
    pub updated_at: String,
}

impl From<CredentialEntity> for CredentialResponse {
    fn from(credential: CredentialEntity) -> Self {
        Self {
            actor_id: credential.actor_id,
            token_expiry: format_system_time(credential.token_expiry),
            last_used_at: credential.last_used_at.map(format_system_time),
            updated_at: format_system_time(credential.updated_at),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RecoverResponse {
    pub actor_id: i64,
    /// Intents moved from `quarantined` back to `pending`.
    pub recovered: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AuditRecordResponse {
    pub id: Uuid,
    pub intent_id: Uuid,
    pub actor_id: i64,
    pub target_label: String,
    pub previous_value: i64,
    pub new_value: i64,
    pub delta: i64,
    pub created_at: String,
}

impl From<AuditEntity> for AuditRecordResponse {
    fn from(record: AuditEntity) -> Self {
        Self {
            id: record.id,
            intent_id: record.intent_id,
            actor_id: record.actor_id,
            target_label: record.target_label,
            previous_value: record.previous_value,
            new_value: record.new_value,
            delta: record.delta,
            created_at: format_system_time(record.created_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(target_id: &str, delta: i64) -> IntentEntryInput {
        IntentEntryInput {
            group_id: 1,
            target_id: target_id.into(),
            target_label: "Label".into(),
            delta,
        }
    }

    #[test]
    fn submission_requires_entries() {
        let request = SubmitIntentsRequest {
            actor_id: 3,
            entries: Vec::new(),
            sync: false,
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn nested_entries_are_validated() {
        let request = SubmitIntentsRequest {
            actor_id: 3,
            entries: vec![entry("p-1", 2), entry("", 0)],
            sync: false,
        };
        let errors = request.validate().unwrap_err();
        assert!(errors.errors().contains_key("entries"));

        let entry_errors = entry("", 0).validate().unwrap_err();
        let fields = entry_errors.field_errors();
        assert!(fields.contains_key("target_id"));
        assert!(fields.contains_key("delta"));

        let ok = SubmitIntentsRequest {
            actor_id: 3,
            entries: vec![entry("p-1", -2)],
            sync: true,
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn oversized_delta_and_dot_target_are_rejected() {
        let errors = entry("..", i64::MAX).validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("target_id"));
        assert!(fields.contains_key("delta"));

        let request = SubmitIntentsRequest {
            actor_id: 3,
            entries: vec![entry("p-1", 1), entry("p-1", i64::MAX)],
            sync: false,
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn entry_round_trips_through_json() {
        let json = serde_json::to_value(entry("p-1", 5)).unwrap();
        assert_eq!(json["target_id"], "p-1");
        let back: IntentEntryInput = serde_json::from_value(json).unwrap();
        assert_eq!(back.delta, 5);
    }

    #[test]
    fn failed_outcome_flattens_retry_time() {
        let key = TargetKey::new(1, 2, "p-9");
        let response = SyncOutcomeResponse::new(
            &key,
            &SyncOutcome::Failed {
                count: 2,
                retry_at: Some(SystemTime::UNIX_EPOCH),
                error: "timeout".into(),
            },
        );
        assert_eq!(response.outcome, "failed");
        assert_eq!(response.count, 2);
        assert_eq!(response.retry_at.as_deref(), Some("1970-01-01T00:00:00Z"));
    }

    #[test]
    fn credential_expiry_is_anchored_at_now() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let upsert = CredentialRequest {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_in_secs: 60,
        }
        .into_upsert(7, now);
        assert_eq!(upsert.actor_id, 7);
        assert_eq!(upsert.token_expiry, now + Duration::from_secs(60));
    }
}
