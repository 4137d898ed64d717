//! Credential lifecycle: refresh ahead of expiry, detect revocation, quarantine on rejection.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use thiserror::Error;
use tracing::{info, warn};

use crate::{
    dao::{
        credential_store::CredentialStore,
        intent_store::IntentStore,
        models::{CredentialEntity, CredentialUpsert},
        storage::{StorageError, StorageResult},
    },
    upstream::{TokenExchanger, UpstreamError},
};

/// Anything carrying an upstream token pair the refresh logic can operate on.
pub trait TokenHolder {
    fn access_token(&self) -> &str;
    fn refresh_token(&self) -> &str;
    fn expiry(&self) -> SystemTime;
    /// Stable identifier used in logs.
    fn identifier(&self) -> String;

    /// Whether the access token expires within `lookahead` of `now`.
    fn needs_refresh(&self, now: SystemTime, lookahead: Duration) -> bool {
        self.expiry() <= now + lookahead
    }

    /// Whether the access token is still usable at `now`.
    fn is_valid_at(&self, now: SystemTime) -> bool {
        self.expiry() > now
    }
}

impl TokenHolder for CredentialEntity {
    fn access_token(&self) -> &str {
        &self.access_token
    }

    fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    fn expiry(&self) -> SystemTime {
        self.token_expiry
    }

    fn identifier(&self) -> String {
        format!("actor:{}", self.actor_id)
    }
}

impl TokenHolder for CredentialUpsert {
    fn access_token(&self) -> &str {
        &self.access_token
    }

    fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    fn expiry(&self) -> SystemTime {
        self.token_expiry
    }

    fn identifier(&self) -> String {
        format!("login:{}", self.actor_id)
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no upstream credential stored for actor {actor_id}")]
    Missing { actor_id: i64 },
    /// The upstream rejected the refresh token. Outstanding intents were quarantined.
    #[error("upstream credential of actor {actor_id} was revoked")]
    Revoked { actor_id: i64, quarantined: u64 },
    #[error("failed to refresh upstream credential of actor {actor_id}")]
    RefreshFailed {
        actor_id: i64,
        #[source]
        source: UpstreamError,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Keeps the long-lived per-actor credential usable for background writes.
#[derive(Clone)]
pub struct CredentialManager {
    credentials: Arc<dyn CredentialStore>,
    intents: Arc<dyn IntentStore>,
    exchanger: Arc<dyn TokenExchanger>,
    lookahead: Duration,
}

impl CredentialManager {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        intents: Arc<dyn IntentStore>,
        exchanger: Arc<dyn TokenExchanger>,
        lookahead: Duration,
    ) -> Self {
        Self {
            credentials,
            intents,
            exchanger,
            lookahead,
        }
    }

    /// Store the tokens of a successful login. Other sessions of the actor keep working.
    pub async fn upsert_credential(
        &self,
        login: CredentialUpsert,
    ) -> StorageResult<CredentialEntity> {
        let actor_id = login.actor_id;
        let saved = self.credentials.upsert(login).await?;
        info!(actor_id, "stored upstream credential");
        Ok(saved)
    }

    /// Return a credential whose access token is good for at least the lookahead window,
    /// exchanging the refresh token when needed.
    pub async fn refresh_if_needed(
        &self,
        actor_id: i64,
    ) -> Result<CredentialEntity, CredentialError> {
        let mut credential = self
            .credentials
            .get(actor_id)
            .await?
            .ok_or(CredentialError::Missing { actor_id })?;

        let now = SystemTime::now();
        if !credential.needs_refresh(now, self.lookahead) {
            return Ok(credential);
        }

        match self
            .exchanger
            .refresh(credential.refresh_token().to_owned())
            .await
        {
            Ok(grant) => {
                credential.access_token = grant.access_token;
                if let Some(rotated) = grant.refresh_token {
                    credential.refresh_token = rotated;
                }
                credential.token_expiry = now + grant.expires_in;
                self.credentials
                    .update_tokens(
                        actor_id,
                        credential.access_token.clone(),
                        credential.refresh_token.clone(),
                        credential.token_expiry,
                    )
                    .await?;
                info!(holder = %credential.identifier(), "refreshed upstream credential");
                Ok(credential)
            }
            Err(err) if err.is_unauthorized() => {
                let quarantined = self.intents.mark_quarantined(actor_id).await?;
                warn!(
                    holder = %credential.identifier(),
                    quarantined,
                    "upstream revoked credential; quarantined outstanding intents"
                );
                Err(CredentialError::Revoked {
                    actor_id,
                    quarantined,
                })
            }
            Err(err) if credential.is_valid_at(now) => {
                warn!(
                    holder = %credential.identifier(),
                    error = %err,
                    "credential refresh failed; current access token still valid"
                );
                Ok(credential)
            }
            Err(source) => Err(CredentialError::RefreshFailed { actor_id, source }),
        }
    }

    /// Record that the credential was just used for an upstream write.
    pub async fn mark_used(&self, actor_id: i64, when: SystemTime) -> StorageResult<()> {
        self.credentials.update_last_used(actor_id, when).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::future::BoxFuture;

    use super::*;
    use crate::{
        dao::{
            memory::{MemoryCredentialStore, MemoryIntentStore},
            models::{IntentStatus, NewIntent},
        },
        upstream::{TokenGrant, UpstreamResult},
    };

    struct ScriptedExchanger {
        result: Mutex<Option<UpstreamResult<TokenGrant>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedExchanger {
        fn new(result: UpstreamResult<TokenGrant>) -> Arc<Self> {
            Arc::new(Self {
                result: Mutex::new(Some(result)),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    impl TokenExchanger for ScriptedExchanger {
        fn refresh(&self, refresh_token: String) -> BoxFuture<'static, UpstreamResult<TokenGrant>> {
            self.calls.lock().unwrap().push(refresh_token);
            let result = self
                .result
                .lock()
                .unwrap()
                .take()
                .expect("exchanger called more than once");
            Box::pin(async move { result })
        }
    }

    struct Fixture {
        manager: CredentialManager,
        credentials: MemoryCredentialStore,
        intents: MemoryIntentStore,
        exchanger: Arc<ScriptedExchanger>,
    }

    fn fixture(result: UpstreamResult<TokenGrant>) -> Fixture {
        let credentials = MemoryCredentialStore::new();
        let intents = MemoryIntentStore::new();
        let exchanger = ScriptedExchanger::new(result);
        let manager = CredentialManager::new(
            Arc::new(credentials.clone()),
            Arc::new(intents.clone()),
            exchanger.clone(),
            Duration::from_secs(300),
        );
        Fixture {
            manager,
            credentials,
            intents,
            exchanger,
        }
    }

    fn login(expires_in: Duration) -> CredentialUpsert {
        CredentialUpsert {
            actor_id: 1,
            access_token: "access-old".into(),
            refresh_token: "refresh-old".into(),
            token_expiry: SystemTime::now() + expires_in,
        }
    }

    fn grant() -> TokenGrant {
        TokenGrant {
            access_token: "access-new".into(),
            refresh_token: Some("refresh-new".into()),
            expires_in: Duration::from_secs(3_600),
        }
    }

    #[tokio::test]
    async fn fresh_credential_is_returned_without_exchange() {
        let fx = fixture(Ok(grant()));
        fx.manager
            .upsert_credential(login(Duration::from_secs(3_600)))
            .await
            .unwrap();

        let credential = fx.manager.refresh_if_needed(1).await.unwrap();
        assert_eq!(credential.access_token, "access-old");
        assert!(fx.exchanger.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn credential_near_expiry_is_refreshed_and_persisted() {
        let fx = fixture(Ok(grant()));
        fx.manager
            .upsert_credential(login(Duration::from_secs(60)))
            .await
            .unwrap();

        let credential = fx.manager.refresh_if_needed(1).await.unwrap();
        assert_eq!(credential.access_token, "access-new");
        assert_eq!(
            fx.exchanger.calls.lock().unwrap().as_slice(),
            ["refresh-old".to_string()]
        );

        let stored = fx.credentials.get(1).await.unwrap().unwrap();
        assert_eq!(stored.refresh_token, "refresh-new");
        assert!(!stored.needs_refresh(SystemTime::now(), Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn revocation_quarantines_outstanding_intents_and_keeps_row() {
        let fx = fixture(Err(UpstreamError::Unauthorized {
            message: "invalid_grant".into(),
        }));
        fx.manager
            .upsert_credential(login(Duration::ZERO))
            .await
            .unwrap();
        fx.intents
            .create(NewIntent {
                idempotency_token: "tok".into(),
                actor_id: 1,
                group_id: 2,
                target_id: "t".into(),
                target_label: "T".into(),
                delta: 1,
                batch_id: uuid::Uuid::new_v4(),
            })
            .await
            .unwrap();

        let err = fx.manager.refresh_if_needed(1).await.unwrap_err();
        assert!(matches!(
            err,
            CredentialError::Revoked {
                actor_id: 1,
                quarantined: 1
            }
        ));
        let row = fx.intents.find_by_token("tok".into()).await.unwrap().unwrap();
        assert_eq!(row.status, IntentStatus::Quarantined);
        let stored = fx.credentials.get(1).await.unwrap().unwrap();
        assert_eq!(stored.refresh_token, "refresh-old");
    }

    #[tokio::test]
    async fn transient_failure_falls_back_to_still_valid_token() {
        let fx = fixture(Err(UpstreamError::Transient {
            message: "timeout".into(),
        }));
        fx.manager
            .upsert_credential(login(Duration::from_secs(120)))
            .await
            .unwrap();

        let credential = fx.manager.refresh_if_needed(1).await.unwrap();
        assert_eq!(credential.access_token, "access-old");
    }

    #[tokio::test]
    async fn transient_failure_on_expired_token_is_reported() {
        let fx = fixture(Err(UpstreamError::Transient {
            message: "timeout".into(),
        }));
        fx.manager
            .upsert_credential(login(Duration::ZERO))
            .await
            .unwrap();

        let err = fx.manager.refresh_if_needed(1).await.unwrap_err();
        assert!(matches!(err, CredentialError::RefreshFailed { .. }));
    }

    #[tokio::test]
    async fn missing_credential_is_reported() {
        let fx = fixture(Ok(grant()));
        let err = fx.manager.refresh_if_needed(5).await.unwrap_err();
        assert!(matches!(err, CredentialError::Missing { actor_id: 5 }));
    }
}
