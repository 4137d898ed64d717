//! Score relay entrypoint wiring configuration, storage, the background scheduler and the HTTP surface.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;
use tokio::{net::TcpListener, sync::watch};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use score_relay::{
    config::{AppConfig, StorageBackend},
    routes,
    services::scheduler::Scheduler,
    state::{AppState, SharedState, Stores},
    upstream::{HttpTokenExchanger, HttpUpstream},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();
    let upstream = HttpUpstream::new(&config.upstream);
    let exchanger = HttpTokenExchanger::new(&config.upstream);
    let app_state = AppState::new(config.clone(), Arc::new(upstream), Arc::new(exchanger));

    start_storage(&app_state, &config).await;

    let (stop_tx, stop_rx) = watch::channel(false);
    let scheduler = Scheduler::new(app_state.clone(), config.scheduler.clone());
    let scheduler_task = tokio::spawn(scheduler.run(stop_rx));

    let app = build_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    let _ = stop_tx.send(true);
    scheduler_task.await.context("joining scheduler")?;
    info!("shutdown complete");

    Ok(())
}

/// Install the configured backend; MongoDB is connected and supervised in the background.
async fn start_storage(state: &SharedState, config: &AppConfig) {
    match config.storage {
        StorageBackend::Memory => {
            info!("using in-memory storage; state is lost on restart");
            state.install_stores(Stores::in_memory()).await;
        }
        #[cfg(feature = "mongo-store")]
        StorageBackend::Mongo => {
            use score_relay::services::storage_supervisor;

            let settings = config.mongo.clone();
            tokio::spawn(storage_supervisor::run(state.clone(), move || {
                let settings = settings.clone();
                async move { Stores::connect_mongo(&settings).await }
            }));
        }
        #[cfg(not(feature = "mongo-store"))]
        StorageBackend::Mongo => {
            tracing::warn!("built without `mongo-store`; falling back to in-memory storage");
            state.install_stores(Stores::in_memory()).await;
        }
    }
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
