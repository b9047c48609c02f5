//! User model - tenant-scoped identities (password or federated).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Which identity provider owns an identity's credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Password,
    Google,
    Microsoft,
    Oidc,
    Saml,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Password => "password",
            ProviderKind::Google => "google",
            ProviderKind::Microsoft => "microsoft",
            ProviderKind::Oidc => "oidc",
            ProviderKind::Saml => "saml",
        }
    }

    /// Anything other than the local password store.
    pub fn is_federated(&self) -> bool {
        !matches!(self, ProviderKind::Password)
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "password" => Ok(ProviderKind::Password),
            "google" => Ok(ProviderKind::Google),
            "microsoft" => Ok(ProviderKind::Microsoft),
            "oidc" => Ok(ProviderKind::Oidc),
            "saml" => Ok(ProviderKind::Saml),
            _ => Err(format!("Invalid identity provider: {}", s)),
        }
    }
}

/// Kind of member an identity represents inside a tenant. Drives default roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    Student,
    Teacher,
    Staff,
    Parent,
    Admin,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::Student => "student",
            UserType::Teacher => "teacher",
            UserType::Staff => "staff",
            UserType::Parent => "parent",
            UserType::Admin => "admin",
        }
    }
}

impl std::fmt::Display for UserType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UserType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "student" => Ok(UserType::Student),
            "teacher" => Ok(UserType::Teacher),
            "staff" => Ok(UserType::Staff),
            "parent" => Ok(UserType::Parent),
            "admin" => Ok(UserType::Admin),
            _ => Err(format!("Invalid user type: {}", s)),
        }
    }
}

/// Identity entity (tenant-scoped).
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    /// Absent for federated identities.
    pub password_hash: Option<String>,
    pub auth_provider: ProviderKind,
    pub user_type: UserType,
    pub is_active: bool,
    pub mfa_enabled: bool,
    /// Base32 TOTP secret. Present but inert until MFA is confirmed.
    pub mfa_secret: Option<String>,
    pub mfa_verified_at: Option<DateTime<Utc>>,
    pub backup_code_hashes: Vec<String>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub last_login_ip: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Create a new password-backed identity.
    pub fn new(tenant_id: Uuid, email: String, password_hash: String, user_type: UserType) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            tenant_id,
            email: email.to_lowercase(),
            password_hash: Some(password_hash),
            auth_provider: ProviderKind::Password,
            user_type,
            is_active: true,
            mfa_enabled: false,
            mfa_secret: None,
            mfa_verified_at: None,
            backup_code_hashes: Vec::new(),
            last_login_at: None,
            last_login_ip: None,
            created_at: Utc::now(),
        }
    }

    /// Create an identity whose credentials live with an external provider.
    pub fn new_federated(
        tenant_id: Uuid,
        email: String,
        provider: ProviderKind,
        user_type: UserType,
    ) -> Self {
        Self {
            password_hash: None,
            auth_provider: provider,
            ..Self::new(tenant_id, email, String::new(), user_type)
        }
    }

    pub fn is_federated(&self) -> bool {
        self.auth_provider.is_federated()
    }

    pub fn sanitized(&self) -> UserResponse {
        UserResponse::from(self)
    }
}

/// User response for API (without credential material).
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UserResponse {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub auth_provider: ProviderKind,
    pub user_type: UserType,
    pub mfa_enabled: bool,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl From<&User> for UserResponse {
    fn from(u: &User) -> Self {
        Self {
            user_id: u.user_id,
            tenant_id: u.tenant_id,
            email: u.email.clone(),
            auth_provider: u.auth_provider,
            user_type: u.user_type,
            mfa_enabled: u.mfa_enabled,
            last_login_at: u.last_login_at,
        }
    }
}
