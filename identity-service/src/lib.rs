pub mod config;
pub mod db;
pub mod dtos;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod observability;
pub mod services;
pub mod utils;

use std::sync::Arc;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Json, Router,
};
use chrono::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::{openapi::security::SecurityScheme, Modify, OpenApi};

use crate::config::{IdentityConfig, JwtConfig, MfaConfig, RateLimitConfig};
use crate::error::AppError;
use crate::middleware::{
    create_ip_rate_limiter, ip_rate_limit_middleware, metrics_middleware, request_id_middleware,
    security_headers_middleware, IpRateLimiter,
};
use crate::services::{
    AuditSink, CacheStore, Database, IdentityProvider, IdentityStore, IdentityVerifier,
    LoginRateLimiter, MfaChallengeManager, PasswordProvider, PermissionCache, ProviderRegistry,
    RoleAssignmentService, SessionManager, SessionPolicy, TokenService,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health::health_check,
        handlers::metrics::metrics,
        handlers::auth::registration::register,
        handlers::auth::session::login,
        handlers::auth::federated::login_federated,
        handlers::auth::session::refresh,
        handlers::auth::session::logout,
        handlers::auth::session::logout_all,
        handlers::auth::session::list_sessions,
        handlers::auth::mfa::mfa_setup,
        handlers::auth::mfa::mfa_confirm,
        handlers::auth::mfa::mfa_verify,
        handlers::auth::mfa::mfa_disable,
        handlers::auth::mfa::mfa_status,
    ),
    components(
        schemas(
            dtos::ErrorResponse,
            dtos::MessageResponse,
            dtos::auth::RegisterRequest,
            dtos::auth::LoginRequest,
            dtos::auth::FederatedLoginRequest,
            dtos::auth::MfaPendingResponse,
            dtos::auth::RefreshRequest,
            dtos::auth::LogoutAllRequest,
            dtos::auth::LogoutAllResponse,
            dtos::auth::SessionsResponse,
            dtos::mfa::MfaConfirmRequest,
            dtos::mfa::MfaVerifyRequest,
            dtos::mfa::MfaDisableRequest,
            handlers::health::HealthResponse,
            services::LoginSuccess,
            services::TokenPair,
            services::MfaSetup,
            services::MfaConfirmation,
            services::MfaStatus,
            models::UserResponse,
            models::SessionInfo,
            models::DeviceType,
            models::ProviderKind,
            models::UserType,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Authentication", description = "Login, token rotation and session management"),
        (name = "MFA", description = "TOTP enrolment and the MFA step of login"),
        (name = "Observability", description = "Service health and monitoring"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

/// Tunables the identity core is built from.
#[derive(Debug, Clone)]
pub struct CoreSettings {
    pub jwt: JwtConfig,
    pub session: SessionPolicy,
    pub mfa: MfaConfig,
    pub permission_cache_ttl_secs: u64,
    pub rate_limit: RateLimitConfig,
    pub allowed_origins: Vec<String>,
}

impl CoreSettings {
    pub fn from_config(config: &IdentityConfig) -> Self {
        Self {
            jwt: config.jwt.clone(),
            session: SessionPolicy {
                max_concurrent: config.session.max_concurrent,
                inactivity: Duration::days(config.session.inactivity_days),
                // Markers must outlive every access token minted before revocation
                revocation_marker_ttl_secs: (config.jwt.access_token_expiry_minutes.max(1) * 60)
                    as u64,
            },
            mfa: config.mfa.clone(),
            permission_cache_ttl_secs: config.permission_cache.ttl_seconds,
            rate_limit: config.rate_limit.clone(),
            allowed_origins: config.security.allowed_origins.clone(),
        }
    }
}

/// Storage backends behind the core.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn IdentityStore>,
    pub cache: Arc<dyn CacheStore>,
    pub audit: Arc<dyn AuditSink>,
    /// Present when running against Postgres; used for health checks.
    pub database: Option<Database>,
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn IdentityStore>,
    pub cache: Arc<dyn CacheStore>,
    pub database: Option<Database>,
    pub tokens: TokenService,
    pub sessions: SessionManager,
    pub providers: Arc<ProviderRegistry>,
    pub passwords: Arc<PasswordProvider>,
    pub identity: IdentityVerifier,
    pub mfa: MfaChallengeManager,
    pub permissions: PermissionCache,
    pub roles: RoleAssignmentService,
    pub login_rate_limiter: IpRateLimiter,
    pub register_rate_limiter: IpRateLimiter,
    pub allowed_origins: Arc<Vec<String>>,
}

impl AppState {
    /// Wire the identity core. `federated` receives the session manager and
    /// token service and returns the external providers to register next to
    /// the password provider.
    pub fn build<F>(
        backends: Backends,
        settings: &CoreSettings,
        federated: F,
    ) -> Result<Self, anyhow::Error>
    where
        F: FnOnce(&SessionManager, &TokenService) -> Vec<Arc<dyn IdentityProvider>>,
    {
        let Backends {
            store,
            cache,
            audit,
            database,
        } = backends;

        let sessions = SessionManager::new(
            store.clone(),
            cache.clone(),
            audit.clone(),
            settings.session.clone(),
        );
        let tokens = TokenService::new(
            &settings.jwt,
            store.clone(),
            sessions.clone(),
            audit.clone(),
        )?;
        let limiter = LoginRateLimiter::new(cache.clone());

        let passwords = Arc::new(PasswordProvider::new(
            store.clone(),
            sessions.clone(),
            tokens.clone(),
        ));
        let registry = federated(&sessions, &tokens).into_iter().fold(
            ProviderRegistry::new().register(passwords.clone()),
            |registry, provider| registry.register(provider),
        );
        let providers = Arc::new(registry);

        let permissions = PermissionCache::new(
            store.clone(),
            cache.clone(),
            settings.permission_cache_ttl_secs,
        );
        let roles = RoleAssignmentService::new(store.clone(), permissions.clone(), audit.clone());

        let mfa = MfaChallengeManager::new(
            store.clone(),
            limiter.clone(),
            sessions.clone(),
            providers.clone(),
            audit.clone(),
            settings.mfa.clone(),
        );

        let identity = IdentityVerifier::new(
            store.clone(),
            limiter,
            passwords.clone(),
            providers.clone(),
            sessions.clone(),
            mfa.clone(),
            roles.clone(),
            audit,
        );

        Ok(Self {
            store,
            cache,
            database,
            tokens,
            sessions,
            providers,
            passwords,
            identity,
            mfa,
            permissions,
            roles,
            login_rate_limiter: create_ip_rate_limiter(
                settings.rate_limit.login_attempts,
                settings.rate_limit.login_window_seconds,
            ),
            register_rate_limiter: create_ip_rate_limiter(
                settings.rate_limit.register_attempts,
                settings.rate_limit.register_window_seconds,
            ),
            allowed_origins: Arc::new(settings.allowed_origins.clone()),
        })
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!("Invalid CORS origin '{}': {}. Skipping.", o, e);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-device-id"),
            HeaderName::from_static("x-request-id"),
        ])
}

pub async fn build_router(state: AppState) -> Result<Router, AppError> {
    let login_route = Router::new()
        .route("/auth/login", post(handlers::login))
        .route("/auth/login/:provider", post(handlers::login_federated))
        .route("/auth/mfa/verify", post(handlers::mfa_verify))
        .layer(from_fn_with_state(
            state.login_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    let register_route = Router::new()
        .route("/auth/register", post(handlers::register))
        .layer(from_fn_with_state(
            state.register_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    let authenticated = Router::new()
        .route("/auth/logout", post(handlers::logout))
        .route("/auth/logout-all", post(handlers::logout_all))
        .route("/auth/sessions", get(handlers::list_sessions))
        .route("/auth/mfa/setup", post(handlers::mfa_setup))
        .route("/auth/mfa/confirm", post(handlers::mfa_confirm))
        .route("/auth/mfa/disable", post(handlers::mfa_disable))
        .route("/auth/mfa/status", get(handlers::mfa_status))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ));

    let app = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .route(
            "/.well-known/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .route("/auth/refresh", post(handlers::refresh))
        .merge(login_route)
        .merge(register_route)
        .merge(authenticated)
        .with_state(state.clone())
        .layer(from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(middleware::tracing::REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(cors_layer(&state.allowed_origins));

    Ok(app)
}
