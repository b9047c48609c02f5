use thiserror::Error;
use uuid::Uuid;

use crate::models::ProviderKind;

/// Failures raised by the identity core.
///
/// Variants fall into policy rejections the caller can act on (lockout,
/// SSO redirect, MFA setup), deliberately vague authentication failures,
/// security incidents (refresh-token reuse), and infrastructure errors.
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Account temporarily locked")]
    AccountLocked { retry_after_secs: u64 },

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Sign-in for this account must use {0}")]
    SsoRequired(ProviderKind),

    #[error("Identity provider {0} is not configured")]
    ProviderNotConfigured(ProviderKind),

    #[error("Account is inactive")]
    AccountInactive,

    #[error("Multi-factor authentication must be set up before signing in")]
    MfaSetupRequired,

    #[error("Multi-factor authentication is not configured")]
    MfaNotConfigured,

    #[error("Invalid verification code")]
    InvalidMfaCode,

    #[error("Refresh token reuse detected; session revoked")]
    TokenReuseDetected,

    #[error("Session revoked")]
    SessionRevoked,

    #[error("Session expired due to inactivity")]
    SessionExpiredInactivity,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Email already registered")]
    EmailAlreadyRegistered,

    #[error("User not found")]
    UserNotFound,

    #[error("Role not found: {0}")]
    RoleNotFound(Uuid),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Cache(anyhow::Error),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IdentityError {
    /// Stable machine-readable code surfaced to callers.
    pub fn code(&self) -> String {
        match self {
            IdentityError::AccountLocked { .. } => "ACCOUNT_LOCKED".to_string(),
            IdentityError::InvalidCredentials => "INVALID_CREDENTIALS".to_string(),
            IdentityError::SsoRequired(kind) => format!("SSO_REQUIRED:{}", kind),
            IdentityError::ProviderNotConfigured(kind) => {
                format!("PROVIDER_NOT_CONFIGURED:{}", kind)
            }
            IdentityError::AccountInactive => "ACCOUNT_INACTIVE".to_string(),
            IdentityError::MfaSetupRequired => "MFA_SETUP_REQUIRED".to_string(),
            IdentityError::MfaNotConfigured => "MFA_NOT_CONFIGURED".to_string(),
            IdentityError::InvalidMfaCode => "INVALID_MFA_CODE".to_string(),
            IdentityError::TokenReuseDetected => "TOKEN_REUSE_DETECTED".to_string(),
            IdentityError::SessionRevoked => "SESSION_REVOKED".to_string(),
            IdentityError::SessionExpiredInactivity => "SESSION_EXPIRED_INACTIVITY".to_string(),
            IdentityError::InvalidToken => "INVALID_TOKEN".to_string(),
            IdentityError::TokenExpired => "TOKEN_EXPIRED".to_string(),
            IdentityError::Forbidden(_) => "FORBIDDEN".to_string(),
            IdentityError::EmailAlreadyRegistered => "EMAIL_ALREADY_REGISTERED".to_string(),
            IdentityError::UserNotFound => "USER_NOT_FOUND".to_string(),
            IdentityError::RoleNotFound(_) => "ROLE_NOT_FOUND".to_string(),
            IdentityError::Validation(_) => "VALIDATION_ERROR".to_string(),
            IdentityError::Database(_) | IdentityError::Cache(_) | IdentityError::Internal(_) => {
                "INTERNAL_ERROR".to_string()
            }
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            IdentityError::AccountLocked { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}
