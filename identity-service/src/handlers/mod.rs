//! HTTP handlers for the identity service.

pub mod auth;
pub mod health;
pub mod metrics;

pub use auth::*;
pub use health::*;
pub use metrics::*;
