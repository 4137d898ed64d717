use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for the score relay.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::intents::submit_intents,
        crate::routes::intents::get_intent,
        crate::routes::targets::sync_target,
        crate::routes::targets::pending_deltas,
        crate::routes::targets::target_audit,
        crate::routes::actors::pending_count,
        crate::routes::actors::put_credential,
        crate::routes::actors::recover,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::health::RelayHealth,
            crate::dto::relay::SubmitIntentsRequest,
            crate::dto::relay::IntentEntryInput,
            crate::dto::relay::SubmitIntentsResponse,
            crate::dto::relay::IntentResponse,
            crate::dto::relay::SyncOutcomeResponse,
            crate::dto::relay::PendingCountResponse,
            crate::dto::relay::PendingDeltasResponse,
            crate::dto::relay::TargetDelta,
            crate::dto::relay::CredentialRequest,
            crate::dto::relay::CredentialResponse,
            crate::dto::relay::RecoverResponse,
            crate::dto::relay::AuditRecordResponse,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "intents", description = "Score change submission and lookup"),
        (name = "targets", description = "Target synchronization and pending state"),
        (name = "actors", description = "Login hand-off and per-actor status"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_every_route() {
        let doc = ApiDoc::openapi();
        for path in [
            "/healthcheck",
            "/intents",
            "/intents/{token}",
            "/targets/{group_id}/{target_id}/sync",
            "/groups/{group_id}/pending-deltas",
            "/groups/{group_id}/targets/{target_id}/audit",
            "/actors/{actor_id}/pending",
            "/actors/{actor_id}/credential",
            "/actors/{actor_id}/recover",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }
}
