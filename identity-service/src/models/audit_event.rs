//! Audit event model - security and compliance logging.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::services::DeviceContext;

/// Audit event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    UserRegistered,
    LoginSucceeded,
    LoginFailed,
    LoginBlocked,
    AccountLocked,
    AccountUnlocked,
    SsoRequired,
    MfaChallengeIssued,
    MfaSetupRequired,
    MfaVerified,
    MfaFailed,
    MfaEnabled,
    MfaDisabled,
    NewDeviceDetected,
    SessionRevoked,
    SessionEvicted,
    TokenRefreshed,
    TokenReuseDetected,
    UserLogout,
    RoleCloned,
    RolePermissionsUpdated,
    DefaultRoleChanged,
    RoleAssignmentsMigrated,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::UserRegistered => "user_registered",
            AuditEventType::LoginSucceeded => "login_succeeded",
            AuditEventType::LoginFailed => "login_failed",
            AuditEventType::LoginBlocked => "login_blocked",
            AuditEventType::AccountLocked => "account_locked",
            AuditEventType::AccountUnlocked => "account_unlocked",
            AuditEventType::SsoRequired => "sso_required",
            AuditEventType::MfaChallengeIssued => "mfa_challenge_issued",
            AuditEventType::MfaSetupRequired => "mfa_setup_required",
            AuditEventType::MfaVerified => "mfa_verified",
            AuditEventType::MfaFailed => "mfa_failed",
            AuditEventType::MfaEnabled => "mfa_enabled",
            AuditEventType::MfaDisabled => "mfa_disabled",
            AuditEventType::NewDeviceDetected => "new_device_detected",
            AuditEventType::SessionRevoked => "session_revoked",
            AuditEventType::SessionEvicted => "session_evicted",
            AuditEventType::TokenRefreshed => "token_refreshed",
            AuditEventType::TokenReuseDetected => "token_reuse_detected",
            AuditEventType::UserLogout => "user_logout",
            AuditEventType::RoleCloned => "role_cloned",
            AuditEventType::RolePermissionsUpdated => "role_permissions_updated",
            AuditEventType::DefaultRoleChanged => "default_role_changed",
            AuditEventType::RoleAssignmentsMigrated => "role_assignments_migrated",
        }
    }
}

/// Audit event entity.
#[derive(Debug, Clone, FromRow)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub event_type: String,
    pub session_id: Option<Uuid>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub event_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            tenant_id: None,
            user_id: None,
            event_type: event_type.as_str().to_string(),
            session_id: None,
            ip_address: None,
            user_agent: None,
            event_data: None,
            created_at: Utc::now(),
        }
    }

    pub fn user(mut self, tenant_id: Uuid, user_id: Uuid) -> Self {
        self.tenant_id = Some(tenant_id);
        self.user_id = Some(user_id);
        self
    }

    pub fn tenant(mut self, tenant_id: Uuid) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn device(mut self, device: &DeviceContext) -> Self {
        self.ip_address = Some(device.ip_address.clone());
        self.user_agent = Some(device.user_agent.clone());
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = Some(data);
        self
    }

    pub fn is(&self, event_type: AuditEventType) -> bool {
        self.event_type == event_type.as_str()
    }
}
