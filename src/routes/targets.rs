use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};

use crate::{
    dao::models::TargetKey,
    dto::relay::{AuditRecordResponse, PendingDeltasResponse, SyncOutcomeResponse, SyncQuery},
    error::AppError,
    services::{relay_service, sync_service::SyncOutcome},
    state::SharedState,
};

/// Synchronize one actor's outstanding intents for a target right away.
#[utoipa::path(
    post,
    path = "/targets/{group_id}/{target_id}/sync",
    tag = "targets",
    params(
        ("group_id" = i64, Path, description = "Group owning the target"),
        ("target_id" = String, Path, description = "Target identifier"),
        SyncQuery
    ),
    responses(
        (status = 200, description = "Synchronized, or nothing to do", body = SyncOutcomeResponse),
        (status = 202, description = "Deferred to another run, or failed and scheduled for retry", body = SyncOutcomeResponse),
        (status = 403, description = "Authorization revoked; intents quarantined", body = SyncOutcomeResponse),
        (status = 502, description = "Upstream rejected the change permanently", body = SyncOutcomeResponse),
        (status = 503, description = "Storage or coordination unavailable")
    )
)]
pub async fn sync_target(
    State(state): State<SharedState>,
    Path((group_id, target_id)): Path<(i64, String)>,
    Query(query): Query<SyncQuery>,
) -> Result<(StatusCode, Json<SyncOutcomeResponse>), AppError> {
    let key = TargetKey::new(query.actor_id, group_id, target_id);
    let outcome = relay_service::synchronize_target(&state, key.clone()).await?;
    Ok((outcome_status(&outcome), Json(SyncOutcomeResponse::new(&key, &outcome))))
}

fn outcome_status(outcome: &SyncOutcome) -> StatusCode {
    match outcome {
        SyncOutcome::Synchronized { .. } | SyncOutcome::NothingToDo => StatusCode::OK,
        SyncOutcome::Deferred => StatusCode::ACCEPTED,
        SyncOutcome::Failed {
            retry_at: Some(_), ..
        } => StatusCode::ACCEPTED,
        SyncOutcome::Failed { retry_at: None, .. } => StatusCode::BAD_GATEWAY,
        SyncOutcome::Quarantined { .. } => StatusCode::FORBIDDEN,
    }
}

/// Outstanding deltas per target of a group, for optimistic display.
#[utoipa::path(
    get,
    path = "/groups/{group_id}/pending-deltas",
    tag = "targets",
    params(("group_id" = i64, Path, description = "Group identifier")),
    responses((status = 200, description = "Sum of unsynchronized deltas per target", body = PendingDeltasResponse))
)]
pub async fn pending_deltas(
    State(state): State<SharedState>,
    Path(group_id): Path<i64>,
) -> Result<Json<PendingDeltasResponse>, AppError> {
    let deltas = relay_service::pending_deltas_for_group(&state, group_id).await?;
    Ok(Json(PendingDeltasResponse::new(group_id, deltas)))
}

/// Applied changes for one target, newest first.
#[utoipa::path(
    get,
    path = "/groups/{group_id}/targets/{target_id}/audit",
    tag = "targets",
    params(
        ("group_id" = i64, Path, description = "Group identifier"),
        ("target_id" = String, Path, description = "Target identifier")
    ),
    responses((status = 200, description = "Audit trail", body = [AuditRecordResponse]))
)]
pub async fn target_audit(
    State(state): State<SharedState>,
    Path((group_id, target_id)): Path<(i64, String)>,
) -> Result<Json<Vec<AuditRecordResponse>>, AppError> {
    let records = relay_service::audit_for_target(&state, group_id, target_id).await?;
    Ok(Json(records.into_iter().map(Into::into).collect()))
}

/// Configure the target and group routes subtree.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new()
        .route("/targets/{group_id}/{target_id}/sync", post(sync_target))
        .route("/groups/{group_id}/pending-deltas", get(pending_deltas))
        .route("/groups/{group_id}/targets/{target_id}/audit", get(target_audit))
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;

    #[test]
    fn terminal_failures_map_to_bad_gateway() {
        let retrying = SyncOutcome::Failed {
            count: 1,
            retry_at: Some(SystemTime::now()),
            error: "timeout".into(),
        };
        let terminal = SyncOutcome::Failed {
            count: 1,
            retry_at: None,
            error: "not found".into(),
        };
        assert_eq!(outcome_status(&retrying), StatusCode::ACCEPTED);
        assert_eq!(outcome_status(&terminal), StatusCode::BAD_GATEWAY);
        assert_eq!(
            outcome_status(&SyncOutcome::Quarantined { count: 2 }),
            StatusCode::FORBIDDEN
        );
        assert_eq!(outcome_status(&SyncOutcome::Deferred), StatusCode::ACCEPTED);
    }
}
