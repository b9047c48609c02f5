//! Services layer for the identity service.
//!
//! Provides the identity core: lockout, login orchestration, sessions,
//! tokens, MFA and role permission resolution.

pub mod audit;
pub mod cache;
pub mod device;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod mfa;
pub mod permissions;
pub mod providers;
pub mod rate_limiter;
pub mod session;
pub mod store;
pub mod token;

pub use audit::{AuditSink, DatabaseAuditSink, MemoryAuditSink};
pub use cache::{CacheStore, MemoryCache, RedisService};
pub use device::{DeviceContext, DeviceProfile};
pub use error::IdentityError;
pub use identity::{IdentityVerifier, LoginOutcome, LoginRequest, LoginSuccess, RegisterRequest};
pub use mfa::{MfaActor, MfaChallengeManager, MfaConfirmation, MfaSetup, MfaStatus};
pub use permissions::{PermissionCache, RoleAssignmentService};
pub use providers::{IdentityProvider, PasswordProvider, ProviderCredentials, ProviderRegistry};
pub use rate_limiter::{LockStatus, LoginRateLimiter};
pub use session::{SessionManager, SessionPolicy};
pub use store::{Database, IdentityStore, MemoryStore};
pub use token::{AccessTokenClaims, TokenPair, TokenService};
