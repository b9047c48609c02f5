use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

use crate::{
    dtos::auth::RegisterRequest,
    error::AppError,
    middleware::ClientContext,
    models::TenantScope,
    services,
    utils::{Password, ValidatedJson},
    AppState,
};

/// Register a password identity in a tenant
#[utoipa::path(
    post,
    path = "/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Identity created", body = UserResponse),
        (status = 409, description = "Email already registered", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn register(
    State(state): State<AppState>,
    ClientContext(device): ClientContext,
    ValidatedJson(req): ValidatedJson<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    let user = state
        .identity
        .register(
            services::RegisterRequest {
                scope: TenantScope::new(req.tenant_id, req.plan_id),
                email: req.email,
                password: Password::new(req.password),
                user_type: req.user_type,
            },
            &device,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(user)))
}
