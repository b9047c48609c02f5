use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::{
    dtos::{
        auth::{
            LoginRequest, LogoutAllRequest, LogoutAllResponse, MfaPendingResponse, RefreshRequest,
            SessionsResponse,
        },
        MessageResponse,
    },
    error::AppError,
    middleware::{AuthUser, ClientContext},
    models::SessionInfo,
    services::{self, LoginOutcome},
    utils::{Password, ValidatedJson},
    AppState,
};

pub(crate) fn outcome_response(outcome: LoginOutcome) -> Response {
    match outcome {
        LoginOutcome::Authenticated(success) => (StatusCode::OK, Json(success)).into_response(),
        LoginOutcome::MfaPending {
            mfa_token,
            expires_in,
        } => (
            StatusCode::OK,
            Json(MfaPendingResponse {
                mfa_pending: true,
                mfa_token,
                expires_in,
            }),
        )
            .into_response(),
    }
}

/// Login with email and password
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Tokens issued, or MFA challenge pending", body = LoginSuccess),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
        (status = 403, description = "SSO or MFA setup required", body = ErrorResponse),
        (status = 429, description = "Account temporarily locked", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn login(
    State(state): State<AppState>,
    ClientContext(device): ClientContext,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<Response, AppError> {
    let outcome = state
        .identity
        .login(
            services::LoginRequest {
                tenant_id: req.tenant_id,
                email: req.email,
                password: Password::new(req.password),
            },
            device,
        )
        .await?;

    Ok(outcome_response(outcome))
}

/// Exchange a refresh token for a new token pair
#[utoipa::path(
    post,
    path = "/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Token rotated", body = TokenPair),
        (status = 401, description = "Invalid, expired or reused token", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn refresh(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<RefreshRequest>,
) -> Result<impl IntoResponse, AppError> {
    let pair = state.tokens.rotate_refresh_token(&req.refresh_token).await?;
    Ok((StatusCode::OK, Json(pair)))
}

/// Revoke the current session
#[utoipa::path(
    post,
    path = "/auth/logout",
    responses(
        (status = 200, description = "Logged out", body = MessageResponse),
        (status = 401, description = "Invalid token", body = ErrorResponse)
    ),
    tag = "Authentication",
    security(("bearer_auth" = []))
)]
pub async fn logout(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
) -> Result<impl IntoResponse, AppError> {
    state.identity.logout(claims.sub, claims.sid).await?;
    Ok((
        StatusCode::OK,
        Json(MessageResponse::new("Logged out successfully")),
    ))
}

/// Revoke every session of the caller
#[utoipa::path(
    post,
    path = "/auth/logout-all",
    request_body = LogoutAllRequest,
    responses(
        (status = 200, description = "Sessions revoked", body = LogoutAllResponse),
        (status = 401, description = "Invalid token", body = ErrorResponse)
    ),
    tag = "Authentication",
    security(("bearer_auth" = []))
)]
pub async fn logout_all(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    body: Option<Json<LogoutAllRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let keep_current = body.map(|Json(b)| b.keep_current).unwrap_or(false);
    let except = keep_current.then_some(claims.sid);

    let revoked = state.identity.logout_all(claims.sub, except).await?;
    Ok((StatusCode::OK, Json(LogoutAllResponse { revoked })))
}

/// List the caller's active sessions
#[utoipa::path(
    get,
    path = "/auth/sessions",
    responses(
        (status = 200, description = "Active sessions", body = SessionsResponse),
        (status = 401, description = "Invalid token", body = ErrorResponse)
    ),
    tag = "Authentication",
    security(("bearer_auth" = []))
)]
pub async fn list_sessions(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let sessions = state
        .sessions
        .list_active_sessions(claims.sub)
        .await?
        .into_iter()
        .map(|s| {
            let is_current = s.session_id == claims.sid;
            let mut info = SessionInfo::from(s);
            info.is_current = is_current;
            info
        })
        .collect();

    Ok(Json(SessionsResponse { sessions }))
}
