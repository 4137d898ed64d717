//! Shared application state: installed storage backends, upstream clients and degraded mode.

use std::sync::Arc;

use tokio::sync::{RwLock, watch};

use crate::{
    config::AppConfig,
    coordination::{CoordinationLock, MemoryCoordinationLock},
    dao::{
        audit_store::AuditStore,
        credential_store::CredentialStore,
        intent_store::IntentStore,
        memory::{MemoryAuditStore, MemoryCredentialStore, MemoryIntentStore},
    },
    error::ServiceError,
    services::{credentials::CredentialManager, retry::RetryPolicy, sync_service::SyncService},
    upstream::{TokenExchanger, UpstreamApi},
};

pub type SharedState = Arc<AppState>;

/// Handles on every durable store, installed and swapped together.
#[derive(Clone)]
pub struct Stores {
    pub intents: Arc<dyn IntentStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub audit: Arc<dyn AuditStore>,
    pub lock: Arc<dyn CoordinationLock>,
}

impl Stores {
    /// Fresh process-local backends.
    pub fn in_memory() -> Self {
        Self {
            intents: Arc::new(MemoryIntentStore::new()),
            credentials: Arc::new(MemoryCredentialStore::new()),
            audit: Arc::new(MemoryAuditStore::new()),
            lock: Arc::new(MemoryCoordinationLock::new()),
        }
    }

    /// Connect to MongoDB and wrap every collection in its store.
    #[cfg(feature = "mongo-store")]
    pub async fn connect_mongo(
        settings: &crate::config::MongoSettings,
    ) -> crate::dao::storage::StorageResult<Self> {
        use crate::dao::mongodb::{
            MongoAuditStore, MongoConfig, MongoCoordinationLock, MongoCredentialStore,
            MongoIntentStore, connect,
        };

        let config = MongoConfig::from_uri(&settings.uri, settings.database.as_deref()).await?;
        let manager = connect(config).await?;
        Ok(Self {
            intents: Arc::new(MongoIntentStore::new(manager.clone())),
            credentials: Arc::new(MongoCredentialStore::new(manager.clone())),
            audit: Arc::new(MongoAuditStore::new(manager.clone())),
            lock: Arc::new(MongoCoordinationLock::new(manager)),
        })
    }
}

/// Central application state.
pub struct AppState {
    config: AppConfig,
    stores: RwLock<Option<Stores>>,
    upstream: Arc<dyn UpstreamApi>,
    exchanger: Arc<dyn TokenExchanger>,
    degraded: watch::Sender<bool>,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`].
    ///
    /// The application starts in degraded mode until storage is installed.
    pub fn new(
        config: AppConfig,
        upstream: Arc<dyn UpstreamApi>,
        exchanger: Arc<dyn TokenExchanger>,
    ) -> SharedState {
        let (degraded_tx, _rx) = watch::channel(true);
        Arc::new(Self {
            config,
            stores: RwLock::new(None),
            upstream,
            exchanger,
            degraded: degraded_tx,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Currently installed stores, if any.
    pub async fn stores(&self) -> Option<Stores> {
        self.stores.read().await.clone()
    }

    /// Installed stores, or [`ServiceError::Degraded`].
    pub async fn require_stores(&self) -> Result<Stores, ServiceError> {
        self.stores().await.ok_or(ServiceError::Degraded)
    }

    /// Install storage and leave degraded mode.
    pub async fn install_stores(&self, stores: Stores) {
        {
            let mut guard = self.stores.write().await;
            *guard = Some(stores);
        }
        self.update_degraded(false);
    }

    /// Drop the installed storage and enter degraded mode.
    pub async fn clear_stores(&self) {
        {
            let mut guard = self.stores.write().await;
            guard.take();
        }
        self.update_degraded(true);
    }

    /// Current degraded flag.
    pub fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Subscribe to degraded mode updates.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    /// Update and broadcast the degraded flag when the value changes.
    pub fn update_degraded(&self, value: bool) {
        self.degraded.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });
    }

    /// Credential manager bound to the installed stores.
    pub async fn credential_manager(&self) -> Result<CredentialManager, ServiceError> {
        let stores = self.require_stores().await?;
        Ok(self.credential_manager_for(&stores))
    }

    /// Synchronization service bound to the installed stores.
    pub async fn sync_service(&self) -> Result<SyncService, ServiceError> {
        let stores = self.require_stores().await?;
        Ok(SyncService::new(
            stores.intents.clone(),
            stores.audit.clone(),
            stores.lock.clone(),
            self.upstream.clone(),
            self.credential_manager_for(&stores),
            RetryPolicy::new(&self.config.retry),
            self.config.sync.lock_ttl(),
            self.config.sync.upstream_call_timeout(),
        ))
    }

    fn credential_manager_for(&self, stores: &Stores) -> CredentialManager {
        CredentialManager::new(
            stores.credentials.clone(),
            stores.intents.clone(),
            self.exchanger.clone(),
            self.config.sync.refresh_lookahead(),
        )
    }
}
