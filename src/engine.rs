//! Wiring of the medgate services around one store

use crate::audit::AuditRecorder;
use crate::auth::{
    AccessGate, AuthManager, PasswordHasher, RevocationList, TokenService, TrustedProxies,
};
use crate::config::Config;
use crate::error::Result;
use crate::permissions::PermissionResolver;
use crate::records::RecordService;
use crate::storage::{self, StorageBackend};
use axum::extract::FromRef;
use std::sync::Arc;

/// Every medgate service, sharing one store, token service and audit log.
///
/// Cheap to clone; use it directly as axum router state.
#[derive(Clone)]
pub struct Medgate {
    pub storage: Arc<dyn StorageBackend>,
    pub audit: Arc<AuditRecorder>,
    pub tokens: Arc<TokenService>,
    pub gate: Arc<AccessGate>,
    pub auth: Arc<AuthManager>,
    pub permissions: Arc<PermissionResolver>,
    pub records: Arc<RecordService>,
    pub proxies: TrustedProxies,
}

impl Medgate {
    /// Build the services over an already opened store
    pub fn new(config: &Config, storage: Arc<dyn StorageBackend>) -> Result<Self> {
        let tokens = Arc::new(TokenService::new(&config.token)?);
        let hasher = Arc::new(PasswordHasher::new(config.password.bcrypt_cost)?);
        let revocations = Arc::new(RevocationList::new());
        let audit = Arc::new(AuditRecorder::new(storage.clone(), config.audit.clone()));

        let gate = Arc::new(AccessGate::new(
            tokens.clone(),
            revocations.clone(),
            storage.clone(),
            audit.clone(),
        ));
        let auth = Arc::new(AuthManager::new(
            storage.clone(),
            hasher,
            tokens.clone(),
            revocations,
            audit.clone(),
        ));
        let permissions = Arc::new(PermissionResolver::new(storage.clone(), audit.clone()));
        let records = Arc::new(RecordService::new(storage.clone(), gate.clone(), audit.clone()));
        let proxies = TrustedProxies::new(config.network.trusted_proxies.iter().copied());

        Ok(Self {
            storage,
            audit,
            tokens,
            gate,
            auth,
            permissions,
            records,
            proxies,
        })
    }

    /// Open the configured store and build the services over it
    pub async fn open(config: &Config) -> Result<Self> {
        let storage = storage::open(&config.storage).await?;
        storage.health_check().await?;

        tracing::debug!(backend = ?config.storage.backend, "Store opened");
        Self::new(config, storage)
    }
}

impl FromRef<Medgate> for Arc<AccessGate> {
    fn from_ref(state: &Medgate) -> Self {
        state.gate.clone()
    }
}

impl FromRef<Medgate> for TrustedProxies {
    fn from_ref(state: &Medgate) -> Self {
        state.proxies.clone()
    }
}

impl FromRef<Medgate> for Arc<AuthManager> {
    fn from_ref(state: &Medgate) -> Self {
        state.auth.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CurrentUser;
    use crate::config::StorageBackendType;
    use crate::MedgateError;
    use crate::RequestContext;
    use axum::extract::FromRequestParts;
    use axum::http::Request;
    use secrecy::SecretString;

    fn config() -> Config {
        let mut config = Config::default_config();
        config.token.secret = Some(SecretString::from(
            "engine-test-secret-at-least-32-bytes-long".to_string(),
        ));
        config.password.bcrypt_cost = 4;
        config.storage.backend = StorageBackendType::Memory;
        config
    }

    #[tokio::test]
    async fn test_open_requires_secret() {
        let mut config = config();
        config.token.secret = None;
        assert!(matches!(Medgate::open(&config).await, Err(MedgateError::Config(_))));
    }

    #[tokio::test]
    async fn test_state_serves_current_user() {
        let medgate = Medgate::open(&config()).await.unwrap();
        let ctx = RequestContext::new();
        medgate.permissions.seed_defaults().await.unwrap();
        medgate
            .auth
            .create_user(&crate::Actor::system("test"), "admin", "pw", "Admin", &ctx)
            .await
            .unwrap();
        let (login, _) = medgate.auth.authenticate("admin", "pw", &ctx).await.unwrap();

        let (mut parts, _) = Request::builder()
            .header("authorization", format!("Bearer {}", login.token))
            .body(())
            .unwrap()
            .into_parts();
        let CurrentUser(claims) = CurrentUser::from_request_parts(&mut parts, &medgate)
            .await
            .unwrap();
        assert!(claims.is_admin());
    }
}
