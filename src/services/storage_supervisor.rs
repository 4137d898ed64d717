use std::{future::Future, time::Duration};

use tokio::time::sleep;
use tracing::{info, warn};

use crate::{
    dao::storage::StorageError,
    state::{SharedState, Stores},
};

const INITIAL_DELAY: Duration = Duration::from_millis(1_000);
const MAX_DELAY: Duration = Duration::from_secs(10);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);
const MAX_HEALTH_FAILURES: u32 = 3;

/// Connect the storage backends and keep the shared state in degraded mode while they are unavailable.
///
/// A failing health check flips the state to degraded without dropping the stores, since the
/// driver reconnects on its own. After [`MAX_HEALTH_FAILURES`] consecutive failures the stores are
/// dropped and a fresh connection is attempted.
pub async fn run<F, Fut>(state: SharedState, mut connect: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Stores, StorageError>> + Send,
{
    let mut delay = INITIAL_DELAY;

    loop {
        match connect().await {
            Ok(stores) => {
                state.install_stores(stores.clone()).await;
                info!("storage connection established; leaving degraded mode");
                delay = INITIAL_DELAY;

                watch_health(&state, &stores).await;

                warn!("exhausted storage health checks; reconnecting");
                state.clear_stores().await;
                sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
            Err(err) => {
                warn!(error = %err, "storage connection attempt failed");
                sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
        }
    }
}

/// Poll the installed stores until they fail too many times in a row.
async fn watch_health(state: &SharedState, stores: &Stores) {
    let mut failures = 0;
    let mut retry_delay = INITIAL_DELAY;

    while failures < MAX_HEALTH_FAILURES {
        match stores.intents.health_check().await {
            Ok(()) => {
                if state.is_degraded() {
                    info!("storage healthy again; leaving degraded mode");
                    state.update_degraded(false);
                }
                failures = 0;
                retry_delay = INITIAL_DELAY;
                sleep(HEALTH_POLL_INTERVAL).await;
            }
            Err(err) => {
                if failures == 0 {
                    warn!(error = %err, "storage health check failed; entering degraded mode");
                    state.update_degraded(true);
                } else {
                    warn!(attempt = failures, error = %err, "storage health check failed again");
                }
                failures += 1;
                sleep(retry_delay).await;
                retry_delay = (retry_delay * 2).min(MAX_DELAY);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;
    use crate::{config::AppConfig, state::AppState, upstream::FakeUpstream};

    #[tokio::test]
    async fn leaves_degraded_mode_once_connected() {
        let upstream = FakeUpstream::new();
        let state = AppState::new(
            AppConfig::default(),
            Arc::new(upstream.clone()),
            Arc::new(upstream),
        );
        assert!(state.is_degraded());

        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let task = tokio::spawn(run(state.clone(), move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(StorageError::unavailable(
                        "first attempt".into(),
                        std::io::Error::other("refused"),
                    ))
                } else {
                    Ok(Stores::in_memory())
                }
            }
        }));

        let mut watcher = state.degraded_watcher();
        tokio::time::timeout(Duration::from_secs(5), watcher.wait_for(|degraded| !*degraded))
            .await
            .expect("left degraded mode in time")
            .expect("watch sender alive");

        assert!(state.stores().await.is_some());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        task.abort();
    }
}
