use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::services::IdentityError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Unauthorized: {0}")]
    Unauthorized(anyhow::Error),

    #[error("Too many requests: {0}")]
    TooManyRequests(String, Option<u64>),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Service Unavailable")]
    ServiceUnavailable,

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

fn identity_status(err: &IdentityError) -> StatusCode {
    match err {
        IdentityError::AccountLocked { .. } => StatusCode::TOO_MANY_REQUESTS,
        IdentityError::InvalidCredentials
        | IdentityError::InvalidMfaCode
        | IdentityError::TokenReuseDetected
        | IdentityError::SessionRevoked
        | IdentityError::SessionExpiredInactivity
        | IdentityError::InvalidToken
        | IdentityError::TokenExpired => StatusCode::UNAUTHORIZED,
        IdentityError::SsoRequired(_)
        | IdentityError::AccountInactive
        | IdentityError::MfaSetupRequired
        | IdentityError::Forbidden(_) => StatusCode::FORBIDDEN,
        IdentityError::ProviderNotConfigured(_) | IdentityError::MfaNotConfigured => {
            StatusCode::BAD_REQUEST
        }
        IdentityError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        IdentityError::EmailAlreadyRegistered => StatusCode::CONFLICT,
        IdentityError::UserNotFound | IdentityError::RoleNotFound(_) => StatusCode::NOT_FOUND,
        IdentityError::Database(_) | IdentityError::Cache(_) | IdentityError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, code, details, retry_after) = match self {
            AppError::ValidationError(err) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "Validation error".to_string(),
                "VALIDATION_ERROR".to_string(),
                Some(err.to_string()),
                None,
            ),
            AppError::BadRequest(err) => (
                StatusCode::BAD_REQUEST,
                err.to_string(),
                "BAD_REQUEST".to_string(),
                None,
                None,
            ),
            AppError::NotFound(err) => (
                StatusCode::NOT_FOUND,
                err.to_string(),
                "NOT_FOUND".to_string(),
                None,
                None,
            ),
            AppError::Unauthorized(err) => (
                StatusCode::UNAUTHORIZED,
                err.to_string(),
                "UNAUTHORIZED".to_string(),
                None,
                None,
            ),
            AppError::TooManyRequests(msg, retry) => (
                StatusCode::TOO_MANY_REQUESTS,
                msg,
                "RATE_LIMITED".to_string(),
                None,
                retry,
            ),
            AppError::InternalError(err) => {
                tracing::error!(error = ?err, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    "INTERNAL_ERROR".to_string(),
                    None,
                    None,
                )
            }
            AppError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service unavailable".to_string(),
                "SERVICE_UNAVAILABLE".to_string(),
                None,
                None,
            ),
            AppError::ConfigError(err) => {
                tracing::error!(error = ?err, "Configuration error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Configuration error".to_string(),
                    "INTERNAL_ERROR".to_string(),
                    None,
                    None,
                )
            }
            AppError::Identity(err) => {
                let status = identity_status(&err);
                let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
                    tracing::error!(error = %err, "Identity core failure");
                    "Internal server error".to_string()
                } else {
                    err.to_string()
                };
                (status, message, err.code(), None, err.retry_after())
            }
        };

        let mut res = (
            status,
            Json(ErrorResponse {
                error: error_message,
                code,
                details,
                retry_after,
            }),
        )
            .into_response();

        if let Some(retry) = retry_after {
            res.headers_mut()
                .insert(axum::http::header::RETRY_AFTER, retry.into());
        }

        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderKind;

    #[test]
    fn test_lockout_maps_to_429_with_retry_after() {
        let res = AppError::from(IdentityError::AccountLocked {
            retry_after_secs: 600,
        })
        .into_response();

        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            res.headers().get(axum::http::header::RETRY_AFTER).unwrap(),
            "600"
        );
    }

    #[test]
    fn test_policy_rejections_are_forbidden() {
        assert_eq!(
            identity_status(&IdentityError::SsoRequired(ProviderKind::Google)),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            identity_status(&IdentityError::MfaSetupRequired),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_security_failures_are_unauthorized() {
        assert_eq!(
            identity_status(&IdentityError::TokenReuseDetected),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            identity_status(&IdentityError::SessionExpiredInactivity),
            StatusCode::UNAUTHORIZED
        );
    }
}
