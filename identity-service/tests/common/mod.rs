//! Shared setup for identity-service integration tests.
//!
//! Everything runs against the in-memory store, cache and audit sink, so no
//! Postgres or Redis is needed.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use identity_service::{
    config::{JwtConfig, JwtSigning, MfaConfig, RateLimitConfig},
    models::{
        AssetType, ProviderKind, RevocationReason, Role, Session, TenantScope, User, UserType,
    },
    services::{
        store::{RoleStore, UserStore},
        AuditSink, CacheStore, DeviceContext, IdentityError, IdentityProvider, IdentityStore,
        LoginOutcome, LoginRequest, LoginSuccess, MemoryAuditSink, MemoryCache, MemoryStore,
        ProviderCredentials, RegisterRequest, SessionManager, SessionPolicy, TokenPair,
        TokenService,
    },
    utils::Password,
    AppState, Backends, CoreSettings,
};
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;

pub const TEST_PASSWORD: &str = "correct-horse-battery";
pub const TEST_USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 Chrome/126.0 Safari/537.36";

pub fn test_settings() -> CoreSettings {
    CoreSettings {
        jwt: JwtConfig {
            signing: JwtSigning::Hmac {
                secret: "test-secret-key-that-is-at-least-32-bytes-long".to_string(),
            },
            issuer: "identity-service-test".to_string(),
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 7,
        },
        session: SessionPolicy::default(),
        mfa: MfaConfig {
            issuer: "Identity Test".to_string(),
            ..MfaConfig::default()
        },
        permission_cache_ttl_secs: 3600,
        rate_limit: RateLimitConfig {
            login_attempts: 1000,
            login_window_seconds: 60,
            register_attempts: 1000,
            register_window_seconds: 60,
        },
        allowed_origins: vec!["http://localhost:3000".to_string()],
    }
}

pub fn device(ip: &str) -> DeviceContext {
    DeviceContext::new(ip, TEST_USER_AGENT).with_device_id("device-laptop")
}

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub cache: Arc<MemoryCache>,
    pub audit: Arc<MemoryAuditSink>,
    pub scope: TenantScope,
}

impl TestApp {
    pub async fn spawn() -> TestApp {
        Self::spawn_with(|_| {}).await
    }

    pub async fn spawn_with(configure: impl FnOnce(&mut CoreSettings)) -> TestApp {
        let mut settings = test_settings();
        configure(&mut settings);

        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let audit = MemoryAuditSink::new();

        let backends = Backends {
            store: store.clone() as Arc<dyn IdentityStore>,
            cache: cache.clone() as Arc<dyn CacheStore>,
            audit: audit.clone() as Arc<dyn AuditSink>,
            database: None,
        };

        let stub_store = store.clone();
        let state = AppState::build(backends, &settings, move |sessions, tokens| {
            vec![Arc::new(StubSsoProvider {
                store: stub_store,
                sessions: sessions.clone(),
                tokens: tokens.clone(),
            }) as Arc<dyn IdentityProvider>]
        })
        .expect("Failed to build app state");

        // Parents get no system role so registration can hit the missing-default path
        for user_type in [UserType::Student, UserType::Teacher, UserType::Staff] {
            let role = Role::system(user_type.as_str(), user_type.as_str(), AssetType::Public, None);
            store
                .insert_role(&role, &[format!("{}:read", user_type)])
                .await
                .expect("Failed to seed role");
        }
        let admin = Role::system("admin", "Administrator", AssetType::Readonly, None).with_admin();
        store
            .insert_role(&admin, &["users:manage".to_string()])
            .await
            .expect("Failed to seed admin role");

        TestApp {
            state,
            store,
            cache,
            audit,
            scope: TenantScope::new(Uuid::new_v4(), Uuid::new_v4()),
        }
    }

    pub async fn system_role(&self, slug: &str) -> Role {
        self.store
            .find_system_role_by_slug(slug)
            .await
            .expect("Role lookup failed")
            .expect("Role not seeded")
    }

    pub async fn register(&self, email: &str, user_type: UserType) -> User {
        let response = self
            .state
            .identity
            .register(
                RegisterRequest {
                    scope: self.scope,
                    email: email.to_string(),
                    password: Password::new(TEST_PASSWORD.to_string()),
                    user_type,
                },
                &device("198.51.100.1"),
            )
            .await
            .expect("Failed to register user");

        self.store
            .find_user_by_id(response.user_id)
            .await
            .expect("User lookup failed")
            .expect("Registered user missing")
    }

    /// Federated identity holding the default role for its type.
    pub async fn register_federated(&self, email: &str, provider: ProviderKind) -> User {
        let user = User::new_federated(
            self.scope.tenant_id,
            email.to_string(),
            provider,
            UserType::Teacher,
        );
        self.store
            .insert_user(&user)
            .await
            .expect("Failed to insert federated user");
        self.state
            .roles
            .assign_default_role(&self.scope, user.user_id, user.user_type)
            .await
            .expect("Failed to assign default role");
        user
    }

    pub async fn login(
        &self,
        email: &str,
        password: &str,
        device: DeviceContext,
    ) -> Result<LoginOutcome, IdentityError> {
        self.state
            .identity
            .login(
                LoginRequest {
                    tenant_id: Some(self.scope.tenant_id),
                    email: email.to_string(),
                    password: Password::new(password.to_string()),
                },
                device,
            )
            .await
    }

    /// Password login that must succeed without an MFA step.
    pub async fn login_ok(&self, email: &str, device: DeviceContext) -> LoginSuccess {
        match self.login(email, TEST_PASSWORD, device).await {
            Ok(LoginOutcome::Authenticated(success)) => success,
            Ok(LoginOutcome::MfaPending { .. }) => panic!("Unexpected MFA challenge"),
            Err(e) => panic!("Login failed: {:?}", e),
        }
    }

    pub async fn user(&self, user_id: Uuid) -> User {
        self.store
            .find_user_by_id(user_id)
            .await
            .expect("User lookup failed")
            .expect("User missing")
    }

    /// Enrol and confirm MFA for `user_id`. Returns the backup codes.
    pub async fn enable_mfa(&self, user_id: Uuid) -> Vec<String> {
        let setup = self
            .state
            .mfa
            .generate_setup(user_id)
            .await
            .expect("Failed to generate MFA setup");
        let code = self.totp_code(user_id).await;
        self.state
            .mfa
            .confirm(user_id, &code)
            .await
            .expect("Failed to confirm MFA");
        setup.backup_codes
    }

    /// Current TOTP code for the secret stored on the user.
    pub async fn totp_code(&self, user_id: Uuid) -> String {
        let secret = self
            .user(user_id)
            .await
            .mfa_secret
            .expect("User has no MFA secret");
        let bytes = Secret::Encoded(secret)
            .to_bytes()
            .expect("Stored secret is not base32");
        TOTP::new_unchecked(Algorithm::SHA1, 6, 1, 30, bytes, None, "test".to_string())
            .generate_current()
            .expect("System clock before epoch")
    }
}

/// Accepts assertions of the form `valid:{email}` for Google identities.
pub struct StubSsoProvider {
    store: Arc<MemoryStore>,
    sessions: SessionManager,
    tokens: TokenService,
}

#[async_trait]
impl IdentityProvider for StubSsoProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    async fn authenticate(
        &self,
        tenant_id: Option<Uuid>,
        credentials: &ProviderCredentials,
    ) -> Result<User, IdentityError> {
        let expected = format!("valid:{}", credentials.email);
        if credentials.assertion.as_deref() != Some(expected.as_str()) {
            return Err(IdentityError::InvalidCredentials);
        }
        self.store
            .find_user_by_email(tenant_id, &credentials.email)
            .await?
            .ok_or(IdentityError::InvalidCredentials)
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
