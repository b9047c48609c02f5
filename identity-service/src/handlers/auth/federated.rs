use axum::{
    extract::{Path, State},
    response::Response,
};

use crate::{
    dtos::auth::FederatedLoginRequest,
    error::AppError,
    handlers::auth::session::outcome_response,
    middleware::ClientContext,
    models::ProviderKind,
    services::ProviderCredentials,
    utils::ValidatedJson,
    AppState,
};

/// Login through an external identity provider
#[utoipa::path(
    post,
    path = "/auth/login/{provider}",
    params(("provider" = String, Path, description = "google, microsoft, oidc or saml")),
    request_body = FederatedLoginRequest,
    responses(
        (status = 200, description = "Tokens issued, or MFA challenge pending", body = LoginSuccess),
        (status = 400, description = "Provider not configured", body = ErrorResponse),
        (status = 401, description = "Assertion rejected", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn login_federated(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    ClientContext(device): ClientContext,
    ValidatedJson(req): ValidatedJson<FederatedLoginRequest>,
) -> Result<Response, AppError> {
    let kind: ProviderKind = provider
        .parse()
        .map_err(|e: String| AppError::BadRequest(anyhow::anyhow!(e)))?;

    let outcome = state
        .identity
        .login_federated(
            kind,
            req.tenant_id,
            ProviderCredentials {
                email: req.email,
                password: None,
                assertion: Some(req.assertion),
            },
            device,
        )
        .await?;

    Ok(outcome_response(outcome))
}
