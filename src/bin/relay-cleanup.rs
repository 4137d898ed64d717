//! One-shot retention sweep: removes expired intents and audit records, then exits.

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use score_relay::{
    config::{AppConfig, StorageBackend},
    services::retention,
    state::Stores,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::load();
    let stores = open_stores(&config).await?;

    let report = retention::sweep(&stores, &config.retention)
        .await
        .context("running retention sweep")?;
    info!(
        intents_deleted = report.intents_deleted,
        audit_deleted = report.audit_deleted,
        "cleanup finished"
    );

    Ok(())
}

async fn open_stores(config: &AppConfig) -> anyhow::Result<Stores> {
    match config.storage {
        StorageBackend::Memory => {
            info!("in-memory storage selected; nothing persisted to sweep");
            Ok(Stores::in_memory())
        }
        #[cfg(feature = "mongo-store")]
        StorageBackend::Mongo => Stores::connect_mongo(&config.mongo)
            .await
            .context("connecting to MongoDB"),
        #[cfg(not(feature = "mongo-store"))]
        StorageBackend::Mongo => anyhow::bail!("built without `mongo-store`"),
    }
}
