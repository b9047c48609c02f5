pub mod audit_event;
pub mod mfa_challenge;
pub mod refresh_token;
pub mod role;
pub mod session;
pub mod user;

pub use audit_event::{AuditEvent, AuditEventType};
pub use mfa_challenge::MfaChallenge;
pub use refresh_token::RefreshToken;
pub use role::{
    AssetType, AssignmentType, BundleTarget, PermissionBundle, Role, TenantRoleDefaultConfig,
    TenantScope, UserRoleAssignment,
};
pub use session::{DeviceType, RevocationReason, Session, SessionInfo};
pub use user::{ProviderKind, User, UserResponse, UserType};
