//! TOTP enrolment and the MFA step of login.
//!
//! A login that needs MFA leaves behind a pending session and a single-use
//! challenge bound to that session, the caller's IP and device fingerprint.
//! Completing the challenge never upgrades the pending session: it is
//! revoked and replaced by a fresh one before any token is issued.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use subtle::ConstantTimeEq;
use totp_rs::{Algorithm, Secret, TOTP};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::MfaConfig;
use crate::models::{
    AuditEvent, AuditEventType, MfaChallenge, RefreshToken, RevocationReason, SessionInfo, User,
    UserResponse,
};
use crate::services::audit::AuditSink;
use crate::services::device::DeviceContext;
use crate::services::error::IdentityError;
use crate::services::identity::LoginSuccess;
use crate::services::providers::ProviderRegistry;
use crate::services::rate_limiter::{user_identifier, LoginRateLimiter};
use crate::services::session::SessionManager;
use crate::services::store::IdentityStore;

const TOTP_DIGITS: usize = 6;
const TOTP_SKEW: u8 = 1;
const TOTP_STEP: u64 = 30;

/// Enrolment material. Backup codes appear here and nowhere else.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MfaSetup {
    pub secret: String,
    pub provisioning_uri: String,
    /// PNG QR code as a data URL
    pub qr_code: String,
    pub backup_codes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MfaConfirmation {
    pub enabled: bool,
    pub verified_at: DateTime<Utc>,
    pub backup_codes_remaining: usize,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MfaStatus {
    pub enabled: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub provider: Option<String>,
}

/// Who is asking to disable MFA.
#[derive(Debug, Clone, Copy)]
pub struct MfaActor {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
}

#[derive(Clone)]
pub struct MfaChallengeManager {
    store: Arc<dyn IdentityStore>,
    limiter: LoginRateLimiter,
    sessions: SessionManager,
    providers: Arc<ProviderRegistry>,
    audit: Arc<dyn AuditSink>,
    config: MfaConfig,
}

impl MfaChallengeManager {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        limiter: LoginRateLimiter,
        sessions: SessionManager,
        providers: Arc<ProviderRegistry>,
        audit: Arc<dyn AuditSink>,
        config: MfaConfig,
    ) -> Self {
        Self {
            store,
            limiter,
            sessions,
            providers,
            audit,
            config,
        }
    }

    fn totp(&self, secret_bytes: Vec<u8>, account: &str) -> Result<TOTP, IdentityError> {
        TOTP::new(
            Algorithm::SHA1,
            TOTP_DIGITS,
            TOTP_SKEW,
            TOTP_STEP,
            secret_bytes,
            Some(self.config.issuer.clone()),
            account.to_string(),
        )
        .map_err(|e| IdentityError::Internal(anyhow::anyhow!("Failed to build TOTP: {}", e)))
    }

    fn totp_for(&self, user: &User) -> Result<TOTP, IdentityError> {
        let secret = user
            .mfa_secret
            .as_ref()
            .ok_or(IdentityError::MfaNotConfigured)?;
        let bytes = Secret::Encoded(secret.clone())
            .to_bytes()
            .map_err(|e| IdentityError::Internal(anyhow::anyhow!("Stored TOTP secret is invalid: {:?}", e)))?;
        self.totp(bytes, &user.email)
    }

    fn check_totp(&self, user: &User, code: &str) -> Result<bool, IdentityError> {
        let totp = self.totp_for(user)?;
        totp.check_current(code.trim())
            .map_err(|e| IdentityError::Internal(anyhow::anyhow!("System clock error: {}", e)))
    }

    /// TOTP first, then a backup code (burned on use).
    async fn verify_code(&self, user: &User, code: &str) -> Result<bool, IdentityError> {
        if self.check_totp(user, code)? {
            return Ok(true);
        }
        let normalized = normalize_backup_code(code);
        if normalized.is_empty() {
            return Ok(false);
        }
        let used = self
            .store
            .consume_backup_code(user.user_id, &RefreshToken::hash_token(&normalized))
            .await?;
        if used {
            tracing::info!(user_id = %user.user_id, "Backup code used");
        }
        Ok(used)
    }

    async fn load_user(&self, user_id: Uuid) -> Result<User, IdentityError> {
        self.store
            .find_user_by_id(user_id)
            .await?
            .ok_or(IdentityError::UserNotFound)
    }

    /// Generate a TOTP secret and backup codes. Stored pending; MFA stays off
    /// until `confirm`.
    pub async fn generate_setup(&self, user_id: Uuid) -> Result<MfaSetup, IdentityError> {
        let user = self.load_user(user_id).await?;
        if user.mfa_enabled {
            return Err(IdentityError::Validation(
                "MFA is already enabled".to_string(),
            ));
        }

        let secret_bytes = Secret::generate_secret()
            .to_bytes()
            .map_err(|e| IdentityError::Internal(anyhow::anyhow!("Failed to generate secret: {:?}", e)))?;
        let totp = self.totp(secret_bytes, &user.email)?;
        let qr = totp
            .get_qr_base64()
            .map_err(|e| IdentityError::Internal(anyhow::anyhow!("Failed to render QR code: {}", e)))?;

        let backup_codes = generate_backup_codes(self.config.backup_code_count);
        let hashes: Vec<String> = backup_codes
            .iter()
            .map(|c| RefreshToken::hash_token(&normalize_backup_code(c)))
            .collect();

        let secret = totp.get_secret_base32();
        self.store
            .store_pending_mfa(user_id, &secret, &hashes)
            .await?;

        tracing::info!(user_id = %user_id, "MFA setup generated");

        Ok(MfaSetup {
            secret,
            provisioning_uri: totp.get_url(),
            qr_code: format!("data:image/png;base64,{}", qr),
            backup_codes,
        })
    }

    /// Verify the first code against the pending secret and enable MFA.
    pub async fn confirm(&self, user_id: Uuid, code: &str) -> Result<MfaConfirmation, IdentityError> {
        let user = self.load_user(user_id).await?;
        if user.mfa_enabled {
            return Err(IdentityError::Validation(
                "MFA is already enabled".to_string(),
            ));
        }
        if !self.check_totp(&user, code)? {
            return Err(IdentityError::InvalidMfaCode);
        }

        let now = Utc::now();
        self.store.enable_mfa(user_id, now).await?;
        self.audit.record(
            AuditEvent::new(AuditEventType::MfaEnabled).user(user.tenant_id, user.user_id),
        );

        Ok(MfaConfirmation {
            enabled: true,
            verified_at: now,
            backup_codes_remaining: user.backup_code_hashes.len(),
        })
    }

    /// Issue a single-use challenge bound to the pending session. Returns the
    /// raw token and its lifetime in seconds.
    pub async fn issue_challenge(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        ip_address: &str,
        device_hash: &str,
    ) -> Result<(String, i64), IdentityError> {
        let raw = RefreshToken::generate_raw();
        let challenge = MfaChallenge::new(
            &raw,
            user_id,
            session_id,
            ip_address,
            device_hash,
            self.config.challenge_ttl_seconds,
        );
        self.store.insert_challenge(&challenge).await?;
        Ok((raw, self.config.challenge_ttl_seconds))
    }

    /// Finish a login that stopped at the MFA gate.
    #[tracing::instrument(skip(self, challenge_token, code, device), fields(ip = %device.ip_address))]
    pub async fn complete_login(
        &self,
        challenge_token: &str,
        code: &str,
        device: &DeviceContext,
    ) -> Result<LoginSuccess, IdentityError> {
        // Consume before anything else so two racing requests cannot both pass
        let challenge = self
            .store
            .consume_challenge(&RefreshToken::hash_token(challenge_token), Utc::now())
            .await?
            .ok_or(IdentityError::InvalidToken)?;

        let profile = device.profile();
        let same_device: bool = challenge
            .device_hash
            .as_bytes()
            .ct_eq(profile.fingerprint.as_bytes())
            .into();
        if challenge.ip_address != device.ip_address || !same_device {
            tracing::warn!(user_id = %challenge.user_id, "MFA challenge presented from a different device");
            self.audit.record(
                AuditEvent::new(AuditEventType::MfaFailed)
                    .session(challenge.session_id)
                    .device(device)
                    .data(serde_json::json!({ "reason": "binding_mismatch" })),
            );
            return Err(IdentityError::InvalidToken);
        }

        let identifier = user_identifier(challenge.user_id);
        let lock = self.limiter.check_lock(&identifier).await;
        if lock.locked {
            return Err(IdentityError::AccountLocked {
                retry_after_secs: lock.retry_after_secs,
            });
        }

        let user = self.load_user(challenge.user_id).await?;
        if !user.mfa_enabled {
            return Err(IdentityError::MfaNotConfigured);
        }

        if !self.verify_code(&user, code).await? {
            let status = self.limiter.record_failure(&identifier).await;
            self.audit.record(
                AuditEvent::new(AuditEventType::MfaFailed)
                    .user(user.tenant_id, user.user_id)
                    .session(challenge.session_id)
                    .device(device),
            );
            if status.locked {
                return Err(IdentityError::AccountLocked {
                    retry_after_secs: status.retry_after_secs,
                });
            }
            return Err(IdentityError::InvalidMfaCode);
        }
        self.limiter.clear_failures(&identifier).await;

        let pending = self
            .store
            .find_session(challenge.session_id)
            .await?
            .ok_or(IdentityError::SessionRevoked)?;
        let session = pending.successor(true);
        self.sessions
            .replace_session(pending.session_id, &session, RevocationReason::MfaRotation)
            .await?;

        let tokens = self
            .providers
            .resolve(user.auth_provider)?
            .issue_tokens(&user, &session)
            .await?;

        self.audit.record(
            AuditEvent::new(AuditEventType::MfaVerified)
                .user(user.tenant_id, user.user_id)
                .session(session.session_id)
                .device(device)
                .data(serde_json::json!({ "replaced_session": pending.session_id })),
        );
        tracing::info!(user_id = %user.user_id, session_id = %session.session_id, "MFA login completed");

        let is_new_device = session.is_new_device;
        let mut info = SessionInfo::from(session);
        info.is_current = true;
        Ok(LoginSuccess {
            user: UserResponse::from(&user),
            session: info,
            tokens,
            is_new_device,
        })
    }

    /// Turn MFA off. Self-service needs a valid code; disabling for someone
    /// else needs an administrative role in the same tenant.
    pub async fn disable(
        &self,
        actor: MfaActor,
        target_user_id: Uuid,
        code: Option<&str>,
    ) -> Result<(), IdentityError> {
        let target = self.load_user(target_user_id).await?;

        if actor.user_id == target_user_id {
            let code = code.ok_or(IdentityError::InvalidMfaCode)?;
            if !target.mfa_enabled || !self.verify_code(&target, code).await? {
                return Err(IdentityError::InvalidMfaCode);
            }
        } else {
            let is_admin = self
                .store
                .user_roles(actor.user_id)
                .await?
                .iter()
                .any(|r| r.is_admin);
            if !is_admin || target.tenant_id != actor.tenant_id {
                tracing::warn!(actor = %actor.user_id, target = %target_user_id, "Rejected MFA disable for another user");
                return Err(IdentityError::Forbidden(
                    "administrative role required".to_string(),
                ));
            }
        }

        self.store.disable_mfa(target_user_id).await?;
        self.audit.record(
            AuditEvent::new(AuditEventType::MfaDisabled)
                .user(target.tenant_id, target.user_id)
                .data(serde_json::json!({ "actor": actor.user_id })),
        );
        Ok(())
    }

    pub async fn status(&self, user_id: Uuid) -> Result<MfaStatus, IdentityError> {
        let user = self.load_user(user_id).await?;
        Ok(MfaStatus {
            enabled: user.mfa_enabled,
            verified_at: user.mfa_verified_at,
            provider: user.mfa_enabled.then(|| "totp".to_string()),
        })
    }
}

/// Codes look like `a1b2c-3d4e5`.
fn generate_backup_codes(count: usize) -> Vec<String> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            let bytes: [u8; 5] = rng.gen();
            let code = hex::encode(bytes);
            format!("{}-{}", &code[..5], &code[5..])
        })
        .collect()
}

fn normalize_backup_code(code: &str) -> String {
    code.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_codes_are_unique_and_formatted() {
        let codes = generate_backup_codes(10);
        assert_eq!(codes.len(), 10);
        for code in &codes {
            assert_eq!(code.len(), 11);
            assert_eq!(code.chars().nth(5), Some('-'));
        }
        let mut deduped = codes.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), codes.len());
    }

    #[test]
    fn test_backup_code_normalization() {
        assert_eq!(normalize_backup_code(" A1B2C-3D4E5 "), "a1b2c3d4e5");
        assert_eq!(normalize_backup_code("---"), "");
    }
}
