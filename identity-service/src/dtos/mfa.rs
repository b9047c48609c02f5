use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct MfaConfirmRequest {
    #[validate(length(min = 6, max = 6, message = "Code must be 6 digits"))]
    #[schema(example = "123456")]
    pub code: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct MfaVerifyRequest {
    #[validate(length(min = 1, message = "MFA token is required"))]
    pub mfa_token: String,

    /// TOTP code or backup code.
    #[validate(length(min = 6, max = 32, message = "Invalid code"))]
    #[schema(example = "123456")]
    pub code: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct MfaDisableRequest {
    /// Another identity to disable MFA for. Requires an administrative role.
    pub user_id: Option<Uuid>,

    #[validate(length(min = 6, max = 32, message = "Invalid code"))]
    pub code: Option<String>,
}
