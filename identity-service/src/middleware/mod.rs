pub mod auth;
pub mod client;
pub mod metrics;
pub mod rate_limit;
pub mod security_headers;
pub mod tracing;

pub use auth::{auth_middleware, AuthUser};
pub use client::ClientContext;
pub use metrics::metrics_middleware;
pub use rate_limit::{create_ip_rate_limiter, ip_rate_limit_middleware, IpRateLimiter};
pub use security_headers::security_headers_middleware;
pub use self::tracing::request_id_middleware;
