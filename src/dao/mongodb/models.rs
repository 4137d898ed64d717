use mongodb::bson::DateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{MongoDaoError, MongoResult};
use crate::dao::models::{AuditEntity, CredentialEntity, IntentEntity, IntentStatus, TargetKey};

/// Intent as stored in the `score_intents` collection.
///
/// Identifiers are stored in their hyphenated string form so filters built
/// with `doc!` match without depending on the UUID serializer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoIntentDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub idempotency_token: String,
    pub actor_id: i64,
    pub group_id: i64,
    pub target_id: String,
    pub target_label: String,
    pub delta: i64,
    pub status: IntentStatus,
    pub attempt_count: i64,
    #[serde(default)]
    pub transient_failures: i64,
    pub next_retry_at: Option<DateTime>,
    pub last_error: Option<String>,
    pub batch_id: String,
    pub created_at: DateTime,
    pub claimed_at: Option<DateTime>,
    pub processed_at: Option<DateTime>,
}

impl From<&IntentEntity> for MongoIntentDocument {
    fn from(value: &IntentEntity) -> Self {
        Self {
            id: value.id.to_string(),
            idempotency_token: value.idempotency_token.clone(),
            actor_id: value.actor_id,
            group_id: value.group_id,
            target_id: value.target_id.clone(),
            target_label: value.target_label.clone(),
            delta: value.delta,
            status: value.status,
            attempt_count: i64::from(value.attempt_count),
            transient_failures: i64::from(value.transient_failures),
            next_retry_at: value.next_retry_at.map(DateTime::from_system_time),
            last_error: value.last_error.clone(),
            batch_id: value.batch_id.to_string(),
            created_at: DateTime::from_system_time(value.created_at),
            claimed_at: value.claimed_at.map(DateTime::from_system_time),
            processed_at: value.processed_at.map(DateTime::from_system_time),
        }
    }
}

impl TryFrom<MongoIntentDocument> for IntentEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoIntentDocument) -> MongoResult<Self> {
        let id = parse_uuid(&value.id, &value.id)?;
        let batch_id = parse_uuid(&value.id, &value.batch_id)?;
        let attempt_count =
            u32::try_from(value.attempt_count).map_err(|_| MongoDaoError::CorruptDocument {
                id: value.id.clone(),
                reason: format!("attempt_count out of range: {}", value.attempt_count),
            })?;
        let transient_failures = u32::try_from(value.transient_failures).map_err(|_| {
            MongoDaoError::CorruptDocument {
                id: value.id.clone(),
                reason: format!(
                    "transient_failures out of range: {}",
                    value.transient_failures
                ),
            }
        })?;

        Ok(Self {
            id,
            idempotency_token: value.idempotency_token,
            actor_id: value.actor_id,
            group_id: value.group_id,
            target_id: value.target_id,
            target_label: value.target_label,
            delta: value.delta,
            status: value.status,
            attempt_count,
            transient_failures,
            next_retry_at: value.next_retry_at.map(DateTime::to_system_time),
            last_error: value.last_error,
            batch_id,
            created_at: value.created_at.to_system_time(),
            claimed_at: value.claimed_at.map(DateTime::to_system_time),
            processed_at: value.processed_at.map(DateTime::to_system_time),
        })
    }
}

/// Credential row of the `user_credentials` collection, keyed by actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoCredentialDocument {
    #[serde(rename = "_id")]
    pub actor_id: i64,
    pub access_token: String,
    pub refresh_token: String,
    pub token_expiry: DateTime,
    #[serde(default)]
    pub last_used_at: Option<DateTime>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

impl From<MongoCredentialDocument> for CredentialEntity {
    fn from(value: MongoCredentialDocument) -> Self {
        Self {
            actor_id: value.actor_id,
            access_token: value.access_token,
            refresh_token: value.refresh_token,
            token_expiry: value.token_expiry.to_system_time(),
            last_used_at: value.last_used_at.map(DateTime::to_system_time),
            created_at: value.created_at.to_system_time(),
            updated_at: value.updated_at.to_system_time(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoAuditDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub intent_id: String,
    pub actor_id: i64,
    pub group_id: i64,
    pub target_id: String,
    pub target_label: String,
    pub previous_value: i64,
    pub new_value: i64,
    pub delta: i64,
    pub created_at: DateTime,
}

impl From<AuditEntity> for MongoAuditDocument {
    fn from(value: AuditEntity) -> Self {
        Self {
            id: value.id.to_string(),
            intent_id: value.intent_id.to_string(),
            actor_id: value.actor_id,
            group_id: value.group_id,
            target_id: value.target_id,
            target_label: value.target_label,
            previous_value: value.previous_value,
            new_value: value.new_value,
            delta: value.delta,
            created_at: DateTime::from_system_time(value.created_at),
        }
    }
}

impl TryFrom<MongoAuditDocument> for AuditEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoAuditDocument) -> MongoResult<Self> {
        Ok(Self {
            id: parse_uuid(&value.id, &value.id)?,
            intent_id: parse_uuid(&value.id, &value.intent_id)?,
            actor_id: value.actor_id,
            group_id: value.group_id,
            target_id: value.target_id,
            target_label: value.target_label,
            previous_value: value.previous_value,
            new_value: value.new_value,
            delta: value.delta,
            created_at: value.created_at.to_system_time(),
        })
    }
}

/// `$group` output keyed by the target partition.
#[derive(Debug, Deserialize)]
pub struct TargetGroupRow {
    #[serde(rename = "_id")]
    pub key: TargetKey,
}

/// `$group` output summing deltas per target.
#[derive(Debug, Deserialize)]
pub struct DeltaSumRow {
    #[serde(rename = "_id")]
    pub target_id: String,
    pub total: i64,
}

fn parse_uuid(document_id: &str, raw: &str) -> MongoResult<Uuid> {
    Uuid::parse_str(raw).map_err(|err| MongoDaoError::CorruptDocument {
        id: document_id.to_owned(),
        reason: format!("invalid uuid `{raw}`: {err}"),
    })
}
