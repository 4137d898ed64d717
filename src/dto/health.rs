use serde::Serialize;
use utoipa::ToSchema;

/// Whether the relay can currently accept and drain intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RelayHealth {
    /// Storage is installed and answering.
    Ok,
    /// Storage is unreachable; writes are refused and the scheduler idles.
    Degraded,
}

/// Body of the relay's `/healthcheck` route.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// `ok` or `degraded`.
    pub status: RelayHealth,
}

impl HealthResponse {
    /// Map the state's degraded flag onto the reported status.
    pub fn from_degraded(degraded: bool) -> Self {
        let status = if degraded {
            RelayHealth::Degraded
        } else {
            RelayHealth::Ok
        };
        Self { status }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_value(HealthResponse::from_degraded(true)).unwrap();
        assert_eq!(json, serde_json::json!({ "status": "degraded" }));
        let json = serde_json::to_value(HealthResponse::from_degraded(false)).unwrap();
        assert_eq!(json["status"], "ok");
    }
}
