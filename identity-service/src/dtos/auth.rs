use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::models::{SessionInfo, UserType};

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RegisterRequest {
    pub tenant_id: Uuid,

    /// Subscription plan of the tenant.
    pub plan_id: Uuid,

    #[validate(email(message = "Invalid email format"))]
    #[schema(example = "teacher@school.example.edu")]
    pub email: String,

    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    #[schema(example = "correct-horse-battery", min_length = 8)]
    pub password: String,

    pub user_type: UserType,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct LoginRequest {
    /// Restrict the lookup to one tenant.
    pub tenant_id: Option<Uuid>,

    #[validate(email(message = "Invalid email format"))]
    #[schema(example = "teacher@school.example.edu")]
    pub email: String,

    #[validate(length(min = 1, message = "Password is required"))]
    #[schema(example = "correct-horse-battery")]
    pub password: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct FederatedLoginRequest {
    pub tenant_id: Option<Uuid>,

    #[validate(email(message = "Invalid email format"))]
    pub email: String,

    /// ID token or assertion issued by the external provider.
    #[validate(length(min = 1, message = "Assertion is required"))]
    pub assertion: String,
}

/// Returned by login when the MFA step is still outstanding.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MfaPendingResponse {
    #[schema(example = true)]
    pub mfa_pending: bool,
    pub mfa_token: String,
    #[schema(example = 300)]
    pub expires_in: i64,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RefreshRequest {
    #[validate(length(min = 1, message = "Refresh token is required"))]
    #[schema(example = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08")]
    pub refresh_token: String,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct LogoutAllRequest {
    /// Keep the session the request was made with.
    #[serde(default)]
    pub keep_current: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LogoutAllResponse {
    pub revoked: Vec<Uuid>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionInfo>,
}
