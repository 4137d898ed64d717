use serde::{Deserialize, Serialize};
use std::{fmt, time::SystemTime};
use uuid::Uuid;

/// Lifecycle state of an intent stored in the outbox.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    /// Waiting to be claimed by a synchronization run.
    Pending,
    /// Claimed by a synchronization run that has not resolved yet.
    Processing,
    /// Applied upstream. Immutable until the retention sweep removes it.
    Completed,
    /// Upstream write failed. Claimable again once `next_retry_at` elapses; terminal when it is unset.
    Failed,
    /// The actor's upstream authorization was rejected. Cleared by a fresh login.
    Quarantined,
}

impl IntentStatus {
    /// Stable string form used in storage filters and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            IntentStatus::Pending => "pending",
            IntentStatus::Processing => "processing",
            IntentStatus::Completed => "completed",
            IntentStatus::Failed => "failed",
            IntentStatus::Quarantined => "quarantined",
        }
    }

    /// Statuses counted as outstanding work in status displays.
    pub fn is_outstanding(self) -> bool {
        matches!(self, IntentStatus::Pending | IntentStatus::Processing)
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Partition key of the outbox: intents sharing it are claimed and coalesced together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetKey {
    pub actor_id: i64,
    pub group_id: i64,
    pub target_id: String,
}

impl TargetKey {
    pub fn new(actor_id: i64, group_id: i64, target_id: impl Into<String>) -> Self {
        Self {
            actor_id,
            group_id,
            target_id: target_id.into(),
        }
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.actor_id, self.group_id, self.target_id)
    }
}

/// Intent as submitted by the request path, before it is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIntent {
    pub idempotency_token: String,
    pub actor_id: i64,
    pub group_id: i64,
    pub target_id: String,
    pub target_label: String,
    pub delta: i64,
    pub batch_id: Uuid,
}

impl NewIntent {
    /// Materialize the persisted row in the `pending` state.
    pub fn into_entity(self, now: SystemTime) -> IntentEntity {
        IntentEntity {
            id: Uuid::new_v4(),
            idempotency_token: self.idempotency_token,
            actor_id: self.actor_id,
            group_id: self.group_id,
            target_id: self.target_id,
            target_label: self.target_label,
            delta: self.delta,
            status: IntentStatus::Pending,
            attempt_count: 0,
            transient_failures: 0,
            next_retry_at: None,
            last_error: None,
            batch_id: self.batch_id,
            created_at: now,
            claimed_at: None,
            processed_at: None,
        }
    }
}

/// Row of the intent log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntentEntity {
    /// Primary key.
    pub id: Uuid,
    /// Caller supplied, globally unique.
    pub idempotency_token: String,
    pub actor_id: i64,
    pub group_id: i64,
    pub target_id: String,
    /// Display name of the target at submission time.
    pub target_label: String,
    /// Signed change to apply to the target value.
    pub delta: i64,
    pub status: IntentStatus,
    /// Number of times the intent has been claimed.
    pub attempt_count: u32,
    /// Transient upstream failures so far; the only count checked against the attempt cap.
    pub transient_failures: u32,
    pub next_retry_at: Option<SystemTime>,
    pub last_error: Option<String>,
    /// Correlates intents created by the same request.
    pub batch_id: Uuid,
    pub created_at: SystemTime,
    /// Last transition into `processing`.
    pub claimed_at: Option<SystemTime>,
    pub processed_at: Option<SystemTime>,
}

impl IntentEntity {
    /// Partition key of this intent.
    pub fn target_key(&self) -> TargetKey {
        TargetKey::new(self.actor_id, self.group_id, self.target_id.clone())
    }

    /// Whether a claim issued at `now` may pick this row up.
    pub fn is_claimable(&self, now: SystemTime) -> bool {
        match self.status {
            IntentStatus::Pending => true,
            IntentStatus::Failed => self.next_retry_at.is_some_and(|at| at <= now),
            _ => false,
        }
    }
}

/// How a failed synchronization leaves its claimed rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub last_error: String,
    /// `None` leaves the rows in terminal `failed`.
    pub next_retry_at: Option<SystemTime>,
    /// Whether the failure counts toward the transient-failure cap.
    pub transient: bool,
}

/// Long-lived upstream credential shared by every session of one actor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialEntity {
    pub actor_id: i64,
    pub access_token: String,
    pub refresh_token: String,
    pub token_expiry: SystemTime,
    pub last_used_at: Option<SystemTime>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

/// Token material delivered by a successful login.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialUpsert {
    pub actor_id: i64,
    pub access_token: String,
    pub refresh_token: String,
    pub token_expiry: SystemTime,
}

/// One applied intent, recorded after a successful upstream write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEntity {
    pub id: Uuid,
    /// Intent this record attributes.
    pub intent_id: Uuid,
    pub actor_id: i64,
    pub group_id: i64,
    pub target_id: String,
    pub target_label: String,
    pub previous_value: i64,
    pub new_value: i64,
    pub delta: i64,
    pub created_at: SystemTime,
}
