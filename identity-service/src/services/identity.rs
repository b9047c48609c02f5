//! Login orchestration.
//!
//! `IdentityVerifier` ties the rate limiter, the password provider, the
//! session manager, the MFA gate and token issuance together. Every terminal
//! outcome is recorded on the audit sink.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::{
    AuditEvent, AuditEventType, ProviderKind, RevocationReason, SessionInfo, TenantScope, User,
    UserResponse, UserType,
};
use crate::services::audit::AuditSink;
use crate::services::device::DeviceContext;
use crate::services::error::IdentityError;
use crate::services::metrics;
use crate::services::mfa::MfaChallengeManager;
use crate::services::permissions::RoleAssignmentService;
use crate::services::providers::{
    PasswordCheck, PasswordProvider, ProviderCredentials, ProviderRegistry,
};
use crate::services::rate_limiter::{pre_auth_identifier, user_identifier, LoginRateLimiter};
use crate::services::session::{NewSession, SessionManager};
use crate::services::store::{IdentityStore, LoginMetadata};
use crate::services::token::TokenPair;
use crate::utils::{hash_password, Password};

#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub tenant_id: Option<Uuid>,
    pub email: String,
    pub password: Password,
}

#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub scope: TenantScope,
    pub email: String,
    pub password: Password,
    pub user_type: UserType,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LoginSuccess {
    pub user: UserResponse,
    pub session: SessionInfo,
    pub tokens: TokenPair,
    pub is_new_device: bool,
}

#[derive(Debug)]
pub enum LoginOutcome {
    Authenticated(LoginSuccess),
    /// Credentials were accepted; the MFA challenge must be completed.
    MfaPending { mfa_token: String, expires_in: i64 },
}

#[derive(Clone)]
pub struct IdentityVerifier {
    store: Arc<dyn IdentityStore>,
    limiter: LoginRateLimiter,
    passwords: Arc<PasswordProvider>,
    providers: Arc<ProviderRegistry>,
    sessions: SessionManager,
    mfa: MfaChallengeManager,
    roles: RoleAssignmentService,
    audit: Arc<dyn AuditSink>,
}

impl IdentityVerifier {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn IdentityStore>,
        limiter: LoginRateLimiter,
        passwords: Arc<PasswordProvider>,
        providers: Arc<ProviderRegistry>,
        sessions: SessionManager,
        mfa: MfaChallengeManager,
        roles: RoleAssignmentService,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            limiter,
            passwords,
            providers,
            sessions,
            mfa,
            roles,
            audit,
        }
    }

    /// Create a password identity and give it the tenant's default role.
    #[tracing::instrument(skip(self, request, device), fields(tenant_id = %request.scope.tenant_id))]
    pub async fn register(
        &self,
        request: RegisterRequest,
        device: &DeviceContext,
    ) -> Result<UserResponse, IdentityError> {
        let email = request.email.trim().to_lowercase();
        if self
            .store
            .find_user_by_email(Some(request.scope.tenant_id), &email)
            .await?
            .is_some()
        {
            return Err(IdentityError::EmailAlreadyRegistered);
        }

        // Fail before creating the identity when the tenant has no usable default
        self.roles
            .default_role_for(&request.scope, request.user_type)
            .await?;

        let password = request.password.clone();
        let hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| IdentityError::Internal(anyhow::anyhow!("Password hash task failed: {}", e)))??;

        let user = User::new(
            request.scope.tenant_id,
            email,
            hash.into_string(),
            request.user_type,
        );
        self.store.insert_user(&user).await?;
        let assignment = self
            .roles
            .assign_default_role(&request.scope, user.user_id, user.user_type)
            .await?;

        tracing::info!(user_id = %user.user_id, role_id = %assignment.role_id, "User registered");
        self.audit.record(
            AuditEvent::new(AuditEventType::UserRegistered)
                .user(user.tenant_id, user.user_id)
                .device(device)
                .data(serde_json::json!({
                    "user_type": user.user_type.as_str(),
                    "role_id": assignment.role_id,
                })),
        );

        Ok(UserResponse::from(&user))
    }

    /// Password login.
    #[tracing::instrument(skip(self, request, device), fields(ip = %device.ip_address))]
    pub async fn login(
        &self,
        request: LoginRequest,
        device: DeviceContext,
    ) -> Result<LoginOutcome, IdentityError> {
        let pre_auth = pre_auth_identifier(&request.email, &device.ip_address);

        let lock = self.limiter.check_lock(&pre_auth).await;
        if lock.locked {
            metrics::record_login("blocked");
            self.audit.record(
                AuditEvent::new(AuditEventType::LoginBlocked)
                    .device(&device)
                    .data(serde_json::json!({
                        "email": request.email.trim().to_lowercase(),
                        "retry_after": lock.retry_after_secs,
                    })),
            );
            return Err(IdentityError::AccountLocked {
                retry_after_secs: lock.retry_after_secs,
            });
        }

        let check = self
            .passwords
            .check_password(request.tenant_id, &request.email, &request.password)
            .await?;

        match check {
            PasswordCheck::UnknownUser => {
                self.limiter.record_failure(&pre_auth).await;
                metrics::record_login("invalid_credentials");
                self.audit.record(
                    AuditEvent::new(AuditEventType::LoginFailed)
                        .device(&device)
                        .data(serde_json::json!({
                            "email": request.email.trim().to_lowercase(),
                            "reason": "unknown_user",
                        })),
                );
                Err(IdentityError::InvalidCredentials)
            }
            PasswordCheck::Federated(user) => {
                let kind = user.auth_provider;
                metrics::record_login("sso_required");
                self.audit.record(
                    AuditEvent::new(AuditEventType::SsoRequired)
                        .user(user.tenant_id, user.user_id)
                        .device(&device)
                        .data(serde_json::json!({ "provider": kind.as_str() })),
                );
                self.providers.resolve(kind)?;
                Err(IdentityError::SsoRequired(kind))
            }
            PasswordCheck::Mismatch(user) => {
                let status = self.limiter.record_failure(&pre_auth).await;
                self.audit.record(
                    AuditEvent::new(AuditEventType::LoginFailed)
                        .user(user.tenant_id, user.user_id)
                        .device(&device)
                        .data(serde_json::json!({
                            "reason": "invalid_password",
                            "attempts": status.attempts,
                        })),
                );

                if status.locked {
                    metrics::record_lockout();
                    metrics::record_login("locked");
                    self.audit.record(
                        AuditEvent::new(AuditEventType::AccountLocked)
                            .user(user.tenant_id, user.user_id)
                            .device(&device)
                            .data(serde_json::json!({
                                "attempts": status.attempts,
                                "lock_seconds": status.retry_after_secs,
                            })),
                    );
                    return Err(IdentityError::AccountLocked {
                        retry_after_secs: status.retry_after_secs,
                    });
                }

                metrics::record_login("invalid_credentials");
                Err(IdentityError::InvalidCredentials)
            }
            PasswordCheck::Verified(user) => {
                if !user.is_active {
                    metrics::record_login("inactive");
                    self.audit.record(
                        AuditEvent::new(AuditEventType::LoginFailed)
                            .user(user.tenant_id, user.user_id)
                            .device(&device)
                            .data(serde_json::json!({ "reason": "inactive" })),
                    );
                    return Err(IdentityError::AccountInactive);
                }

                self.limiter.clear_failures(&pre_auth).await;

                self.establish(user, &device).await
            }
        }
    }

    /// Login through an external provider. Shares session creation, the MFA
    /// gate and token issuance with password login.
    #[tracing::instrument(skip(self, credentials, device), fields(provider = %kind))]
    pub async fn login_federated(
        &self,
        kind: ProviderKind,
        tenant_id: Option<Uuid>,
        credentials: ProviderCredentials,
        device: DeviceContext,
    ) -> Result<LoginOutcome, IdentityError> {
        if !kind.is_federated() {
            return Err(IdentityError::Validation(
                "password login must use the password endpoint".to_string(),
            ));
        }

        let provider = self.providers.resolve(kind)?;
        let user = match provider.authenticate(tenant_id, &credentials).await {
            Ok(user) => user,
            Err(e) => {
                metrics::record_login("provider_rejected");
                self.audit.record(
                    AuditEvent::new(AuditEventType::LoginFailed)
                        .device(&device)
                        .data(serde_json::json!({
                            "provider": kind.as_str(),
                            "code": e.code(),
                        })),
                );
                return Err(e);
            }
        };

        if user.auth_provider != kind {
            return Err(IdentityError::SsoRequired(user.auth_provider));
        }
        if !user.is_active {
            metrics::record_login("inactive");
            return Err(IdentityError::AccountInactive);
        }

        self.establish(user, &device).await
    }

    /// Steps shared by every login path once the identity is verified.
    async fn establish(
        &self,
        user: User,
        device: &DeviceContext,
    ) -> Result<LoginOutcome, IdentityError> {
        let profile = device.profile();
        let is_new_device = !self
            .store
            .has_session_for_device(user.user_id, &profile.device_id)
            .await?;
        let fingerprint = profile.fingerprint.clone();

        let created = self
            .sessions
            .create_session(
                NewSession {
                    user_id: user.user_id,
                    tenant_id: user.tenant_id,
                    ip_address: device.ip_address.clone(),
                    profile,
                    is_new_device,
                },
                Some(LoginMetadata {
                    ip_address: device.ip_address.clone(),
                    at: Utc::now(),
                }),
            )
            .await?;
        let session = created.session;

        if is_new_device {
            self.audit.record(
                AuditEvent::new(AuditEventType::NewDeviceDetected)
                    .user(user.tenant_id, user.user_id)
                    .session(session.session_id)
                    .device(device)
                    .data(serde_json::json!({ "device_type": session.device_type.as_str() })),
            );
        }

        let mfa_required = created.roles_require_mfa || user.mfa_enabled;
        if mfa_required && user.mfa_enabled {
            let (mfa_token, expires_in) = self
                .mfa
                .issue_challenge(
                    user.user_id,
                    session.session_id,
                    &device.ip_address,
                    &fingerprint,
                )
                .await?;

            metrics::record_login("mfa_pending");
            self.audit.record(
                AuditEvent::new(AuditEventType::MfaChallengeIssued)
                    .user(user.tenant_id, user.user_id)
                    .session(session.session_id)
                    .device(device),
            );
            return Ok(LoginOutcome::MfaPending {
                mfa_token,
                expires_in,
            });
        }

        if mfa_required {
            self.sessions
                .revoke_session(session.session_id, RevocationReason::MfaSetupRequired)
                .await?;
            metrics::record_login("mfa_setup_required");
            self.audit.record(
                AuditEvent::new(AuditEventType::MfaSetupRequired)
                    .user(user.tenant_id, user.user_id)
                    .session(session.session_id)
                    .device(device),
            );
            return Err(IdentityError::MfaSetupRequired);
        }

        let tokens = self
            .providers
            .resolve(user.auth_provider)?
            .issue_tokens(&user, &session)
            .await?;

        // MFA failures count against the identity until a login completes
        self.limiter
            .clear_failures(&user_identifier(user.user_id))
            .await;

        metrics::record_login("success");
        self.audit.record(
            AuditEvent::new(AuditEventType::LoginSucceeded)
                .user(user.tenant_id, user.user_id)
                .session(session.session_id)
                .device(device)
                .data(serde_json::json!({
                    "provider": user.auth_provider.as_str(),
                    "evicted_sessions": created.evicted.len(),
                })),
        );
        tracing::info!(user_id = %user.user_id, session_id = %session.session_id, "Login succeeded");

        let mut info = SessionInfo::from(session);
        info.is_current = true;
        Ok(LoginOutcome::Authenticated(LoginSuccess {
            user: UserResponse::from(&user),
            session: info,
            tokens,
            is_new_device,
        }))
    }

    pub async fn logout(&self, user_id: Uuid, session_id: Uuid) -> Result<(), IdentityError> {
        let session = self
            .store
            .find_session(session_id)
            .await?
            .ok_or(IdentityError::InvalidToken)?;
        if session.user_id != user_id {
            return Err(IdentityError::Forbidden(
                "session belongs to another user".to_string(),
            ));
        }

        self.sessions
            .revoke_session(session_id, RevocationReason::Logout)
            .await?;
        self.audit.record(
            AuditEvent::new(AuditEventType::UserLogout)
                .user(session.tenant_id, user_id)
                .session(session_id),
        );
        Ok(())
    }

    /// Revoke every session of the user, optionally keeping the caller's.
    pub async fn logout_all(
        &self,
        user_id: Uuid,
        except: Option<Uuid>,
    ) -> Result<Vec<Uuid>, IdentityError> {
        let revoked = self
            .sessions
            .revoke_all_user_sessions(user_id, except, RevocationReason::LogoutAll)
            .await?;

        if let Some(user) = self.store.find_user_by_id(user_id).await? {
            self.audit.record(
                AuditEvent::new(AuditEventType::UserLogout)
                    .user(user.tenant_id, user_id)
                    .data(serde_json::json!({ "all": true, "revoked": revoked.len() })),
            );
        }
        Ok(revoked)
    }

    /// Clear lockout state for an email/IP pair and, when known, the identity.
    pub async fn unlock_account(&self, email: &str, ip: &str, user_id: Option<Uuid>) {
        self.limiter
            .clear_failures(&pre_auth_identifier(email, ip))
            .await;
        if let Some(user_id) = user_id {
            self.limiter.clear_failures(&user_identifier(user_id)).await;
        }

        tracing::info!(email = %email.trim().to_lowercase(), ip = %ip, "Account unlocked");
        self.audit.record(
            AuditEvent::new(AuditEventType::AccountUnlocked).data(serde_json::json!({
                "email": email.trim().to_lowercase(),
                "ip": ip,
                "user_id": user_id,
            })),
        );
    }
}
