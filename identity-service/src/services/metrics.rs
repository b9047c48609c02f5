use prometheus::{Encoder, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

// Global registry
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

// HTTP metrics
pub static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();

// Identity metrics
pub static LOGIN_ATTEMPTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static LOCKOUTS_TOTAL: OnceLock<IntCounter> = OnceLock::new();
pub static TOKEN_REUSE_TOTAL: OnceLock<IntCounter> = OnceLock::new();

/// Build and register every collector. Safe to call more than once; only the
/// first call installs the globals.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let requests_total = IntCounterVec::new(
        Opts::new("http_requests_total", "Total number of HTTP requests"),
        &["method", "path", "status"],
    )?;
    let request_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "http_request_duration_seconds",
            "HTTP request duration in seconds",
        ),
        &["method", "path", "status"],
    )?;
    let login_attempts = IntCounterVec::new(
        Opts::new("identity_login_attempts_total", "Login attempts by outcome"),
        &["outcome"],
    )?;
    let lockouts = IntCounter::new("identity_lockouts_total", "Login identifiers locked")?;
    let token_reuse = IntCounter::new(
        "identity_token_reuse_total",
        "Refresh token reuse incidents",
    )?;

    registry.register(Box::new(requests_total.clone()))?;
    registry.register(Box::new(request_duration.clone()))?;
    registry.register(Box::new(login_attempts.clone()))?;
    registry.register(Box::new(lockouts.clone()))?;
    registry.register(Box::new(token_reuse.clone()))?;

    // Initialize globals
    let _ = REGISTRY.set(registry);
    let _ = HTTP_REQUESTS_TOTAL.set(requests_total);
    let _ = HTTP_REQUEST_DURATION_SECONDS.set(request_duration);
    let _ = LOGIN_ATTEMPTS_TOTAL.set(login_attempts);
    let _ = LOCKOUTS_TOTAL.set(lockouts);
    let _ = TOKEN_REUSE_TOTAL.set(token_reuse);
    Ok(())
}

pub fn record_login(outcome: &str) {
    if let Some(counter) = LOGIN_ATTEMPTS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn record_lockout() {
    if let Some(counter) = LOCKOUTS_TOTAL.get() {
        counter.inc();
    }
}

pub fn record_token_reuse() {
    if let Some(counter) = TOKEN_REUSE_TOTAL.get() {
        counter.inc();
    }
}

pub fn get_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    let registry = match REGISTRY.get() {
        Some(r) => r,
        None => {
            tracing::error!("Metrics registry not initialized");
            return "# Metrics registry not initialized\n".to_string();
        }
    };

    let metric_families = registry.gather();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return format!("# Failed to encode metrics: {}\n", e);
    }

    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to convert metrics to UTF-8: {}", e);
            format!("# Failed to convert metrics to UTF-8: {}\n", e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_counters_are_exported() {
        init_metrics().unwrap();
        record_login("invalid_credentials");
        record_lockout();

        let output = get_metrics();
        assert!(output.contains("identity_login_attempts_total"));
        assert!(output.contains("identity_lockouts_total"));
    }
}
