use identity_service::{
    build_router,
    config::IdentityConfig,
    db::{create_pool, run_migrations},
    error::AppError,
    observability::init_tracing,
    services::{Database, DatabaseAuditSink, RedisService},
    AppState, Backends, CoreSettings,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Load configuration - fail fast if invalid
    let config = IdentityConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    identity_service::services::metrics::init_metrics()
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to register metrics: {}", e)))?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting identity service"
    );

    tracing::info!("Initializing database connections");
    let pool = create_pool(&config.database)
        .await
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to connect to Postgres: {}", e)))?;

    if config.database.run_migrations {
        run_migrations(&pool)
            .await
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Migration failed: {}", e)))?;
        tracing::info!("Database migrations applied");
    }
    let db = Database::new(pool);

    let redis = RedisService::new(&config.redis).await?;
    tracing::info!("Redis service initialized");

    let backends = Backends {
        store: Arc::new(db.clone()),
        cache: Arc::new(redis),
        audit: Arc::new(DatabaseAuditSink::new(db.clone())),
        database: Some(db),
    };

    let settings = CoreSettings::from_config(&config);
    // Federated providers are registered by deployments that ship them
    let state = AppState::build(backends, &settings, |_, _| Vec::new())?;
    tracing::info!("Identity core initialized");

    spawn_inactivity_sweep(state.clone(), config.session.sweep_interval_seconds);

    let app = build_router(state).await?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));

    let service_span = tracing::info_span!(
        "service",
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
    );
    let _guard = service_span.enter();

    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Service shutdown complete");
    Ok(())
}

/// Periodically revoke sessions idle past the inactivity window.
fn spawn_inactivity_sweep(state: AppState, interval_seconds: u64) {
    if interval_seconds == 0 {
        tracing::info!("Inactivity sweep disabled");
        return;
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));
        loop {
            ticker.tick().await;
            match state.sessions.sweep_inactive(chrono::Utc::now()).await {
                Ok(revoked) if !revoked.is_empty() => {
                    tracing::info!(count = revoked.len(), "Revoked inactive sessions");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Inactivity sweep failed"),
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }

    // Give in-flight requests time to complete
    tokio::time::sleep(tokio::time::Duration::from_secs(10)).await;
}
