use std::{sync::Arc, time::Duration};

use mongodb::{
    Client, Database, IndexModel,
    bson::{Document, doc},
    options::IndexOptions,
};
use tokio::{
    sync::RwLock,
    time::{MissedTickBehavior, interval},
};
use tracing::{info, warn};

use super::{
    AUDIT_COLLECTION, INTENT_COLLECTION, LOCK_COLLECTION,
    config::MongoConfig,
    connection::establish_connection,
    error::{MongoDaoError, MongoResult},
};

const HEALTH_CHECK_INTERVAL_SECS: u64 = 30;

/// Shared handle on the current MongoDB connection.
///
/// A background task pings the server and swaps in a fresh client when the
/// ping fails, so stores always clone the handle per operation.
#[derive(Clone)]
pub struct MongoManager {
    inner: Arc<MongoManagerInner>,
}

struct MongoManagerInner {
    state: RwLock<MongoState>,
    config: MongoConfig,
}

struct MongoState {
    client: Client,
    database: Database,
}

/// Connect, ensure indexes and start the connection watcher.
pub async fn connect(config: MongoConfig) -> MongoResult<MongoManager> {
    let (client, database) = establish_connection(&config.options, &config.database_name).await?;
    ensure_indexes(&database).await?;

    let inner = Arc::new(MongoManagerInner {
        state: RwLock::new(MongoState { client, database }),
        config,
    });
    MongoManagerInner::spawn_health_task(&inner);

    Ok(MongoManager { inner })
}

struct IndexSpec {
    collection: &'static str,
    name: &'static str,
    keys: Document,
    unique: bool,
    expire_after: Option<Duration>,
}

/// Ensure the indexes required by the relay are present.
pub async fn ensure_indexes(database: &Database) -> MongoResult<()> {
    let specs = [
        IndexSpec {
            collection: INTENT_COLLECTION,
            name: "idempotency_token_unique",
            keys: doc! { "idempotency_token": 1 },
            unique: true,
            expire_after: None,
        },
        IndexSpec {
            collection: INTENT_COLLECTION,
            name: "target_status_idx",
            keys: doc! { "actor_id": 1, "group_id": 1, "target_id": 1, "status": 1 },
            unique: false,
            expire_after: None,
        },
        IndexSpec {
            collection: INTENT_COLLECTION,
            name: "status_retry_idx",
            keys: doc! { "status": 1, "next_retry_at": 1 },
            unique: false,
            expire_after: None,
        },
        IndexSpec {
            collection: INTENT_COLLECTION,
            name: "batch_idx",
            keys: doc! { "batch_id": 1 },
            unique: false,
            expire_after: None,
        },
        IndexSpec {
            collection: AUDIT_COLLECTION,
            name: "audit_target_idx",
            keys: doc! { "group_id": 1, "target_id": 1, "created_at": -1 },
            unique: false,
            expire_after: None,
        },
        IndexSpec {
            collection: LOCK_COLLECTION,
            name: "lock_expiry_ttl",
            keys: doc! { "expires_at": 1 },
            unique: false,
            expire_after: Some(Duration::ZERO),
        },
    ];

    for spec in specs {
        let options = IndexOptions::builder()
            .name(Some(spec.name.to_string()))
            .unique(spec.unique.then_some(true))
            .expire_after(spec.expire_after)
            .build();
        let model = IndexModel::builder()
            .keys(spec.keys)
            .options(options)
            .build();
        database
            .collection::<Document>(spec.collection)
            .create_index(model)
            .await
            .map_err(|source| MongoDaoError::EnsureIndex {
                collection: spec.collection,
                index: spec.name,
                source,
            })?;
    }

    Ok(())
}

impl MongoManager {
    /// Clone the current database handle.
    pub async fn database(&self) -> Database {
        let guard = self.inner.state.read().await;
        guard.database.clone()
    }

    /// Clone the current client, used to open sessions.
    pub async fn client(&self) -> Client {
        let guard = self.inner.state.read().await;
        guard.client.clone()
    }

    /// Issue a ping against the current MongoDB connection.
    pub async fn ping(&self) -> MongoResult<()> {
        self.inner.ping().await
    }
}

impl MongoManagerInner {
    fn spawn_health_task(inner: &Arc<Self>) {
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(HEALTH_CHECK_INTERVAL_SECS));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                let Some(inner) = weak.upgrade() else {
                    break;
                };

                if let Err(err) = inner.ping().await {
                    warn!(error = %err, "MongoDB health ping failed; attempting reconnect");
                    inner.reconnect().await;
                }
            }
        });
    }

    async fn ping(&self) -> MongoResult<()> {
        let database = {
            let guard = self.state.read().await;
            guard.database.clone()
        };

        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|source| MongoDaoError::HealthPing { source })?;

        Ok(())
    }

    async fn reconnect(&self) {
        match establish_connection(&self.config.options, &self.config.database_name).await {
            Ok((client, database)) => {
                let mut guard = self.state.write().await;
                guard.client = client;
                guard.database = database;
                info!("reconnected to MongoDB");
            }
            Err(err) => {
                warn!(error = %err, "MongoDB reconnect failed; will retry on next health tick");
            }
        }
    }
}
