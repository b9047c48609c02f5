//! Identity provider capability and the registry resolved at login time.
//!
//! The registry is built once at startup and shared by `Arc`. Looking up a
//! kind that was never registered is an error, never a silent fallback to
//! password authentication.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{ProviderKind, RevocationReason, Session, User};
use crate::services::error::IdentityError;
use crate::services::session::SessionManager;
use crate::services::store::IdentityStore;
use crate::services::token::{TokenPair, TokenService};
use crate::utils::{verify_password_timing_safe, Password};

/// Credentials handed to a provider. Password providers read `password`,
/// federated ones read `assertion` (an ID token, SAML response, ...).
#[derive(Clone, Default)]
pub struct ProviderCredentials {
    pub email: String,
    pub password: Option<Password>,
    pub assertion: Option<String>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Resolve credentials to a known identity.
    async fn authenticate(
        &self,
        tenant_id: Option<Uuid>,
        credentials: &ProviderCredentials,
    ) -> Result<User, IdentityError>;

    /// Confirm a session issued through this provider is still usable.
    async fn verify_session(&self, session_id: Uuid) -> Result<Session, IdentityError>;

    async fn issue_tokens(&self, user: &User, session: &Session) -> Result<TokenPair, IdentityError>;

    async fn revoke_session(
        &self,
        session_id: Uuid,
        reason: RevocationReason,
    ) -> Result<(), IdentityError>;
}

/// Provider kind to implementation.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn IdentityProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        tracing::info!(provider = %provider.kind(), "Registered identity provider");
        self.providers.insert(provider.kind(), provider);
        self
    }

    pub fn resolve(&self, kind: ProviderKind) -> Result<Arc<dyn IdentityProvider>, IdentityError> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or(IdentityError::ProviderNotConfigured(kind))
    }

    pub fn is_configured(&self, kind: ProviderKind) -> bool {
        self.providers.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<ProviderKind> = self.providers.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

/// Outcome of a local password check. Exactly one hash comparison has run
/// whichever variant comes back.
#[derive(Debug)]
pub enum PasswordCheck {
    UnknownUser,
    /// The identity exists but belongs to another provider.
    Federated(User),
    Mismatch(User),
    Verified(User),
}

/// Local password store.
#[derive(Clone)]
pub struct PasswordProvider {
    store: Arc<dyn IdentityStore>,
    sessions: SessionManager,
    tokens: TokenService,
    comparisons: Arc<AtomicU64>,
}

impl PasswordProvider {
    pub fn new(store: Arc<dyn IdentityStore>, sessions: SessionManager, tokens: TokenService) -> Self {
        Self {
            store,
            sessions,
            tokens,
            comparisons: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Hash comparisons run by this provider since startup.
    pub fn hash_comparisons(&self) -> u64 {
        self.comparisons.load(Ordering::Relaxed)
    }

    pub async fn check_password(
        &self,
        tenant_id: Option<Uuid>,
        email: &str,
        password: &Password,
    ) -> Result<PasswordCheck, IdentityError> {
        let user = self.store.find_user_by_email(tenant_id, email).await?;

        let stored = user
            .as_ref()
            .filter(|u| !u.is_federated())
            .and_then(|u| u.password_hash.clone());
        let password = password.clone();
        self.comparisons.fetch_add(1, Ordering::Relaxed);
        let matches = tokio::task::spawn_blocking(move || {
            verify_password_timing_safe(&password, stored.as_deref())
        })
        .await
        .map_err(|e| IdentityError::Internal(anyhow::anyhow!("Password check task failed: {}", e)))?;

        Ok(match user {
            None => PasswordCheck::UnknownUser,
            Some(user) if user.is_federated() => PasswordCheck::Federated(user),
            Some(user) if matches => PasswordCheck::Verified(user),
            Some(user) => PasswordCheck::Mismatch(user),
        })
    }
}

#[async_trait]
impl IdentityProvider for PasswordProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Password
    }

    async fn authenticate(
        &self,
        tenant_id: Option<Uuid>,
        credentials: &ProviderCredentials,
    ) -> Result<User, IdentityError> {
        let password = credentials
            .password
            .as_ref()
            .ok_or(IdentityError::InvalidCredentials)?;

        match self
            .check_password(tenant_id, &credentials.email, password)
            .await?
        {
            PasswordCheck::Verified(user) => Ok(user),
            PasswordCheck::Federated(user) => Err(IdentityError::SsoRequired(user.auth_provider)),
            PasswordCheck::UnknownUser | PasswordCheck::Mismatch(_) => {
                Err(IdentityError::InvalidCredentials)
            }
        }
    }

    async fn verify_session(&self, session_id: Uuid) -> Result<Session, IdentityError> {
        self.sessions.validate_session(session_id).await
    }

    async fn issue_tokens(&self, user: &User, session: &Session) -> Result<TokenPair, IdentityError> {
        let roles = self.tokens.role_slugs(user.user_id).await?;
        self.tokens.issue_token_pair(user, session, &roles).await
    }

    async fn revoke_session(
        &self,
        session_id: Uuid,
        reason: RevocationReason,
    ) -> Result<(), IdentityError> {
        self.sessions.revoke_session(session_id, reason).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unregistered_kind_is_not_configured() {
        let registry = ProviderRegistry::new();

        assert!(!registry.is_configured(ProviderKind::Google));
        assert!(matches!(
            registry.resolve(ProviderKind::Google),
            Err(IdentityError::ProviderNotConfigured(ProviderKind::Google))
        ));
    }
}
