use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use axum_valid::Valid;

use crate::{
    dto::{
        relay::{IntentResponse, SubmitIntentsRequest, SubmitIntentsResponse},
        validation::validate_idempotency_key,
    },
    error::AppError,
    services::relay_service,
    state::SharedState,
};

/// Header carrying the caller's request key.
pub const IDEMPOTENCY_HEADER: &str = "x-idempotency-key";

/// Record score changes for later synchronization.
#[utoipa::path(
    post,
    path = "/intents",
    tag = "intents",
    params(("X-Idempotency-Key" = String, Header, description = "Caller-chosen key; reusing it replays the original batch")),
    request_body = SubmitIntentsRequest,
    responses(
        (status = 202, description = "Intents stored", body = SubmitIntentsResponse),
        (status = 200, description = "Duplicate request; original batch replayed", body = SubmitIntentsResponse),
        (status = 400, description = "Invalid payload or missing idempotency key"),
        (status = 503, description = "Storage unavailable")
    )
)]
pub async fn submit_intents(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Valid(Json(payload)): Valid<Json<SubmitIntentsRequest>>,
) -> Result<(StatusCode, Json<SubmitIntentsResponse>), AppError> {
    let key = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::BadRequest("missing X-Idempotency-Key header".into()))?;
    validate_idempotency_key(key)
        .map_err(|err| AppError::BadRequest(format!("invalid X-Idempotency-Key: {err}")))?;

    let drafts = payload.entries.into_iter().map(Into::into).collect();
    let submission =
        relay_service::submit_intents(&state, key, payload.actor_id, drafts, payload.sync).await?;

    let status = if submission.replayed {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(submission.into())))
}

/// Look up a stored intent by its derived token.
#[utoipa::path(
    get,
    path = "/intents/{token}",
    tag = "intents",
    params(("token" = String, Path, description = "Idempotency token `{key}:{target}:{index}`")),
    responses(
        (status = 200, description = "Stored intent", body = IntentResponse),
        (status = 404, description = "Unknown token")
    )
)]
pub async fn get_intent(
    State(state): State<SharedState>,
    Path(token): Path<String>,
) -> Result<Json<IntentResponse>, AppError> {
    let intent = relay_service::find_intent(&state, token).await?;
    Ok(Json(intent.into()))
}

/// Configure the intent routes subtree.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new()
        .route("/intents", post(submit_intents))
        .route("/intents/{token}", get(get_intent))
}
