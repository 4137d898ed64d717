use tracing::warn;

use crate::{dto::health::HealthResponse, state::SharedState};

/// Report `ok` or `degraded`, logging connectivity issues along the way.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    match state.require_stores().await {
        Ok(stores) => {
            if let Err(err) = stores.intents.health_check().await {
                warn!(error = %err, "storage health check failed");
            }
        }
        Err(_) => warn!("storage unavailable (degraded mode)"),
    }

    HealthResponse::from_degraded(state.is_degraded())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::AppConfig,
        dto::health::RelayHealth,
        state::{AppState, Stores},
        upstream::FakeUpstream,
    };

    #[tokio::test]
    async fn reports_degraded_until_stores_are_installed() {
        let upstream = FakeUpstream::new();
        let state = AppState::new(
            AppConfig::default(),
            Arc::new(upstream.clone()),
            Arc::new(upstream),
        );
        assert_eq!(health_status(&state).await.status, RelayHealth::Degraded);

        state.install_stores(Stores::in_memory()).await;
        assert_eq!(health_status(&state).await.status, RelayHealth::Ok);
    }
}
