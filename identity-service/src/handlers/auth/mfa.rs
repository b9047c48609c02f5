use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

use crate::{
    dtos::{
        mfa::{MfaConfirmRequest, MfaDisableRequest, MfaVerifyRequest},
        MessageResponse,
    },
    error::AppError,
    middleware::{AuthUser, ClientContext},
    services::MfaActor,
    utils::ValidatedJson,
    AppState,
};

/// Start TOTP enrolment
#[utoipa::path(
    post,
    path = "/auth/mfa/setup",
    responses(
        (status = 200, description = "Secret, QR code and backup codes", body = MfaSetup),
        (status = 401, description = "Invalid token", body = ErrorResponse),
        (status = 422, description = "MFA already enabled", body = ErrorResponse)
    ),
    tag = "MFA",
    security(("bearer_auth" = []))
)]
pub async fn mfa_setup(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let setup = state.mfa.generate_setup(claims.sub).await?;
    Ok((StatusCode::OK, Json(setup)))
}

/// Confirm enrolment with a first code
#[utoipa::path(
    post,
    path = "/auth/mfa/confirm",
    request_body = MfaConfirmRequest,
    responses(
        (status = 200, description = "MFA enabled", body = MfaConfirmation),
        (status = 401, description = "Invalid code", body = ErrorResponse)
    ),
    tag = "MFA",
    security(("bearer_auth" = []))
)]
pub async fn mfa_confirm(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ValidatedJson(req): ValidatedJson<MfaConfirmRequest>,
) -> Result<impl IntoResponse, AppError> {
    let confirmation = state.mfa.confirm(claims.sub, &req.code).await?;
    Ok((StatusCode::OK, Json(confirmation)))
}

/// Complete a login that is waiting on MFA
#[utoipa::path(
    post,
    path = "/auth/mfa/verify",
    request_body = MfaVerifyRequest,
    responses(
        (status = 200, description = "Tokens issued on a fresh session", body = LoginSuccess),
        (status = 401, description = "Invalid challenge or code", body = ErrorResponse),
        (status = 429, description = "Too many failed codes", body = ErrorResponse)
    ),
    tag = "MFA"
)]
pub async fn mfa_verify(
    State(state): State<AppState>,
    ClientContext(device): ClientContext,
    ValidatedJson(req): ValidatedJson<MfaVerifyRequest>,
) -> Result<impl IntoResponse, AppError> {
    let success = state
        .mfa
        .complete_login(&req.mfa_token, &req.code, &device)
        .await?;
    Ok((StatusCode::OK, Json(success)))
}

/// Turn MFA off for the caller or, as an administrator, for another identity
#[utoipa::path(
    post,
    path = "/auth/mfa/disable",
    request_body = MfaDisableRequest,
    responses(
        (status = 200, description = "MFA disabled", body = MessageResponse),
        (status = 401, description = "Invalid code", body = ErrorResponse),
        (status = 403, description = "Administrative role required", body = ErrorResponse)
    ),
    tag = "MFA",
    security(("bearer_auth" = []))
)]
pub async fn mfa_disable(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    ValidatedJson(req): ValidatedJson<MfaDisableRequest>,
) -> Result<impl IntoResponse, AppError> {
    let actor = MfaActor {
        user_id: claims.sub,
        tenant_id: claims.tid,
    };
    let target = req.user_id.unwrap_or(claims.sub);

    state
        .mfa
        .disable(actor, target, req.code.as_deref())
        .await?;
    Ok((StatusCode::OK, Json(MessageResponse::new("MFA disabled"))))
}

/// Current MFA enrolment of the caller
#[utoipa::path(
    get,
    path = "/auth/mfa/status",
    responses(
        (status = 200, description = "MFA status", body = MfaStatus),
        (status = 401, description = "Invalid token", body = ErrorResponse)
    ),
    tag = "MFA",
    security(("bearer_auth" = []))
)]
pub async fn mfa_status(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let status = state.mfa.status(claims.sub).await?;
    Ok(Json(status))
}
