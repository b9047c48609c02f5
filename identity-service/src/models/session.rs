//! Session model - one row per authenticated device login.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Coarse device class derived from the user agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Desktop,
    Mobile,
    Tablet,
    Unknown,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Mobile => "mobile",
            DeviceType::Tablet => "tablet",
            DeviceType::Unknown => "unknown",
        }
    }
}

/// Why a session (and its refresh tokens) stopped being usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    Logout,
    LogoutAll,
    Inactivity,
    SessionLimit,
    MfaRotation,
    MfaSetupRequired,
    TokenReuse,
    Rotated,
    Admin,
    Security,
}

impl RevocationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevocationReason::Logout => "logout",
            RevocationReason::LogoutAll => "logout_all",
            RevocationReason::Inactivity => "inactivity",
            RevocationReason::SessionLimit => "session_limit",
            RevocationReason::MfaRotation => "mfa_rotation",
            RevocationReason::MfaSetupRequired => "mfa_setup_required",
            RevocationReason::TokenReuse => "token_reuse",
            RevocationReason::Rotated => "rotated",
            RevocationReason::Admin => "admin",
            RevocationReason::Security => "security",
        }
    }
}

impl std::fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session entity.
#[derive(Debug, Clone, FromRow)]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub device_id: String,
    pub ip_address: String,
    pub user_agent_hash: String,
    pub device_type: DeviceType,
    pub is_new_device: bool,
    pub mfa_verified: bool,
    pub mfa_verified_at: Option<DateTime<Utc>>,
    pub last_active_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_reason: Option<RevocationReason>,
}

impl Session {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// True when the session has been idle for longer than `limit`.
    pub fn is_idle(&self, now: DateTime<Utc>, limit: Duration) -> bool {
        now - self.last_active_at > limit
    }

    /// A fresh session carrying over this session's device metadata.
    pub fn successor(&self, mfa_verified: bool) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            user_id: self.user_id,
            tenant_id: self.tenant_id,
            device_id: self.device_id.clone(),
            ip_address: self.ip_address.clone(),
            user_agent_hash: self.user_agent_hash.clone(),
            device_type: self.device_type,
            is_new_device: self.is_new_device,
            mfa_verified,
            mfa_verified_at: mfa_verified.then_some(now),
            last_active_at: now,
            created_at: now,
            revoked_at: None,
            revoked_reason: None,
        }
    }
}

/// Session info for API responses.
#[derive(Debug, Serialize, ToSchema)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub device_type: DeviceType,
    pub ip_address: String,
    pub is_new_device: bool,
    pub mfa_verified: bool,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub is_current: bool,
}

impl From<Session> for SessionInfo {
    fn from(s: Session) -> Self {
        Self {
            session_id: s.session_id,
            device_type: s.device_type,
            ip_address: s.ip_address,
            is_new_device: s.is_new_device,
            mfa_verified: s.mfa_verified,
            created_at: s.created_at,
            last_active_at: s.last_active_at,
            is_current: false, // Set by caller
        }
    }
}
