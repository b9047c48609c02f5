use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::Response,
};

use crate::error::AppError;
use crate::services::{AccessTokenClaims, IdentityError};
use crate::AppState;

/// Require a valid bearer access token whose session is still live.
///
/// The cache revocation marker is the fast path. When the check cannot be
/// answered, the provider that issued the token confirms the session.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(IdentityError::InvalidToken)?;

    let claims = state.tokens.verify_access_token(token)?;

    match state.sessions.is_revoked_fast(claims.sid).await {
        Ok(false) => {}
        Ok(true) => return Err(IdentityError::SessionRevoked.into()),
        Err(e) => {
            tracing::warn!(session_id = %claims.sid, error = %e, "Revocation check failed, asking provider");
            state
                .providers
                .resolve(claims.idp)?
                .verify_session(claims.sid)
                .await?;
        }
    }

    if let Err(e) = state.sessions.touch(claims.sid).await {
        tracing::warn!(session_id = %claims.sid, error = %e, "Failed to record session activity");
    }

    req.extensions_mut().insert(claims);

    Ok(next.run(req).await)
}

/// Extractor to easily get claims in handlers
pub struct AuthUser(pub AccessTokenClaims);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let claims = parts
            .extensions
            .get::<AccessTokenClaims>()
            .ok_or_else(|| {
                AppError::InternalError(anyhow::anyhow!(
                    "Auth claims missing from request extensions"
                ))
            })?;

        Ok(AuthUser(claims.clone()))
    }
}
