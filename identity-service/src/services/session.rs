//! Session lifecycle: creation under a concurrency cap, inactivity expiry and
//! revocation with cache-resident markers for request-time checks.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::{AuditEvent, AuditEventType, RevocationReason, Session};
use crate::services::audit::AuditSink;
use crate::services::cache::CacheStore;
use crate::services::device::DeviceProfile;
use crate::services::error::IdentityError;
use crate::services::store::{CreatedSession, IdentityStore, LoginMetadata};

pub const DEFAULT_MAX_CONCURRENT_SESSIONS: usize = 5;
pub const DEFAULT_INACTIVITY_DAYS: i64 = 30;

pub fn revoked_key(session_id: Uuid) -> String {
    format!("session:revoked:{}", session_id)
}

#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub max_concurrent: usize,
    pub inactivity: Duration,
    /// Lifetime of revocation markers. Must cover the longest-lived access token.
    pub revocation_marker_ttl_secs: u64,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT_SESSIONS,
            inactivity: Duration::days(DEFAULT_INACTIVITY_DAYS),
            revocation_marker_ttl_secs: 15 * 60,
        }
    }
}

/// Input for a new session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub ip_address: String,
    pub profile: DeviceProfile,
    pub is_new_device: bool,
}

impl NewSession {
    fn into_session(self) -> Session {
        let now = Utc::now();
        Session {
            session_id: Uuid::new_v4(),
            user_id: self.user_id,
            tenant_id: self.tenant_id,
            device_id: self.profile.device_id,
            ip_address: self.ip_address,
            user_agent_hash: self.profile.user_agent_hash,
            device_type: self.profile.device_type,
            is_new_device: self.is_new_device,
            mfa_verified: false,
            mfa_verified_at: None,
            last_active_at: now,
            created_at: now,
            revoked_at: None,
            revoked_reason: None,
        }
    }
}

#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn IdentityStore>,
    cache: Arc<dyn CacheStore>,
    audit: Arc<dyn AuditSink>,
    policy: SessionPolicy,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        cache: Arc<dyn CacheStore>,
        audit: Arc<dyn AuditSink>,
        policy: SessionPolicy,
    ) -> Self {
        Self {
            store,
            cache,
            audit,
            policy,
        }
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// Create a session, evicting the oldest ones over the cap in the same unit.
    pub async fn create_session(
        &self,
        new: NewSession,
        login: Option<LoginMetadata>,
    ) -> Result<CreatedSession, IdentityError> {
        let session = new.into_session();
        let created = self
            .store
            .create_session(&session, self.policy.max_concurrent, login.as_ref())
            .await?;

        for evicted in &created.evicted {
            self.write_revocation_marker(*evicted).await;
            self.audit.record(
                AuditEvent::new(AuditEventType::SessionEvicted)
                    .user(session.tenant_id, session.user_id)
                    .session(*evicted)
                    .data(serde_json::json!({ "replaced_by": session.session_id })),
            );
        }

        if !created.evicted.is_empty() {
            tracing::info!(
                user_id = %session.user_id,
                evicted = created.evicted.len(),
                "Evicted sessions over concurrency limit"
            );
        }

        Ok(created)
    }

    /// Load an active session, expiring it when idle past the limit.
    pub async fn validate_session(&self, session_id: Uuid) -> Result<Session, IdentityError> {
        let session = self
            .store
            .find_session(session_id)
            .await?
            .ok_or(IdentityError::InvalidToken)?;

        if session.is_revoked() {
            return Err(IdentityError::SessionRevoked);
        }

        if session.is_idle(Utc::now(), self.policy.inactivity) {
            self.revoke_session(session_id, RevocationReason::Inactivity)
                .await?;
            return Err(IdentityError::SessionExpiredInactivity);
        }

        Ok(session)
    }

    /// Revoke one session and its refresh tokens. Returns false if it was already revoked.
    pub async fn revoke_session(
        &self,
        session_id: Uuid,
        reason: RevocationReason,
    ) -> Result<bool, IdentityError> {
        let revoked = self.store.revoke_session(session_id, reason).await?;
        self.write_revocation_marker(session_id).await;

        if revoked {
            tracing::info!(session_id = %session_id, reason = %reason, "Session revoked");
            if let Ok(Some(session)) = self.store.find_session(session_id).await {
                self.audit.record(
                    AuditEvent::new(AuditEventType::SessionRevoked)
                        .user(session.tenant_id, session.user_id)
                        .session(session_id)
                        .data(serde_json::json!({ "reason": reason.as_str() })),
                );
            }
        }
        Ok(revoked)
    }

    /// Revoke every active session of a user, optionally keeping one.
    pub async fn revoke_all_user_sessions(
        &self,
        user_id: Uuid,
        except: Option<Uuid>,
        reason: RevocationReason,
    ) -> Result<Vec<Uuid>, IdentityError> {
        let revoked = self
            .store
            .revoke_user_sessions(user_id, except, reason)
            .await?;
        for session_id in &revoked {
            self.write_revocation_marker(*session_id).await;
        }

        tracing::info!(user_id = %user_id, count = revoked.len(), reason = %reason, "Revoked user sessions");
        Ok(revoked)
    }

    /// Request-time revocation check. A cache marker short-circuits; a miss or
    /// a cache failure is answered by the session row.
    pub async fn is_revoked_fast(&self, session_id: Uuid) -> Result<bool, IdentityError> {
        match self.cache.exists(&revoked_key(session_id)).await {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Revocation cache unavailable, checking database");
            }
        }

        let revoked = self
            .store
            .find_session(session_id)
            .await?
            .map_or(true, |s| s.is_revoked());
        if revoked {
            // Restore a marker lost to an earlier cache outage
            self.write_revocation_marker(session_id).await;
        }
        Ok(revoked)
    }

    pub async fn list_active_sessions(&self, user_id: Uuid) -> Result<Vec<Session>, IdentityError> {
        self.store.list_active_sessions(user_id).await
    }

    /// Record activity so the inactivity limit counts from now.
    pub async fn touch(&self, session_id: Uuid) -> Result<(), IdentityError> {
        self.store.touch_session(session_id, Utc::now()).await
    }

    /// Bulk-revoke sessions idle longer than the inactivity limit.
    pub async fn sweep_inactive(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, IdentityError> {
        let expired = self
            .store
            .revoke_idle_sessions(now - self.policy.inactivity)
            .await?;
        for session_id in &expired {
            self.write_revocation_marker(*session_id).await;
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Swept inactive sessions");
        }
        Ok(expired)
    }

    /// Replace `old_session_id` with `successor`. Used to rotate session
    /// identity once MFA completes.
    pub async fn replace_session(
        &self,
        old_session_id: Uuid,
        successor: &Session,
        reason: RevocationReason,
    ) -> Result<(), IdentityError> {
        self.store
            .replace_session(old_session_id, successor, reason)
            .await?;
        self.write_revocation_marker(old_session_id).await;
        Ok(())
    }

    async fn write_revocation_marker(&self, session_id: Uuid) {
        if let Err(e) = self
            .cache
            .set_ex(
                &revoked_key(session_id),
                "1",
                self.policy.revocation_marker_ttl_secs,
            )
            .await
        {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to write revocation marker");
        }
    }
}
