use std::time::SystemTime;

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post, put},
};
use axum_valid::Valid;

use crate::{
    dto::relay::{CredentialRequest, CredentialResponse, PendingCountResponse, RecoverResponse},
    error::AppError,
    services::relay_service,
    state::SharedState,
};

/// Number of the actor's intents not yet applied upstream.
#[utoipa::path(
    get,
    path = "/actors/{actor_id}/pending",
    tag = "actors",
    params(("actor_id" = i64, Path, description = "Actor identifier")),
    responses((status = 200, description = "Pending and processing intents", body = PendingCountResponse))
)]
pub async fn pending_count(
    State(state): State<SharedState>,
    Path(actor_id): Path<i64>,
) -> Result<Json<PendingCountResponse>, AppError> {
    let pending = relay_service::count_pending_for_actor(&state, actor_id).await?;
    Ok(Json(PendingCountResponse { actor_id, pending }))
}

/// Store the upstream credential obtained at login.
#[utoipa::path(
    put,
    path = "/actors/{actor_id}/credential",
    tag = "actors",
    params(("actor_id" = i64, Path, description = "Actor identifier")),
    request_body = CredentialRequest,
    responses((status = 200, description = "Credential stored", body = CredentialResponse))
)]
pub async fn put_credential(
    State(state): State<SharedState>,
    Path(actor_id): Path<i64>,
    Valid(Json(payload)): Valid<Json<CredentialRequest>>,
) -> Result<Json<CredentialResponse>, AppError> {
    let login = payload.into_upsert(actor_id, SystemTime::now());
    let credential = relay_service::upsert_credential(&state, login).await?;
    Ok(Json(credential.into()))
}

/// Return quarantined intents to the queue after a fresh login.
#[utoipa::path(
    post,
    path = "/actors/{actor_id}/recover",
    tag = "actors",
    params(("actor_id" = i64, Path, description = "Actor identifier")),
    responses((status = 200, description = "Quarantined intents released", body = RecoverResponse))
)]
pub async fn recover(
    State(state): State<SharedState>,
    Path(actor_id): Path<i64>,
) -> Result<Json<RecoverResponse>, AppError> {
    let recovered = relay_service::recover_quarantined(&state, actor_id).await?;
    Ok(Json(RecoverResponse {
        actor_id,
        recovered,
    }))
}

/// Configure the actor routes subtree.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new()
        .route("/actors/{actor_id}/pending", get(pending_count))
        .route("/actors/{actor_id}/credential", put(put_credential))
        .route("/actors/{actor_id}/recover", post(recover))
}
