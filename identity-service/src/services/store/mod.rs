//! Relational store seams.
//!
//! `Database` (Postgres via sqlx) is the production implementation;
//! `MemoryStore` backs tests and local runs. Every multi-step mutation
//! listed here is a single atomic unit in both.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    BundleTarget, MfaChallenge, PermissionBundle, RefreshToken, RevocationReason, Role, Session,
    TenantRoleDefaultConfig, User, UserRoleAssignment, UserType,
};
use crate::services::error::IdentityError;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::Database;

/// Last-login fields written in the same unit as session creation.
#[derive(Debug, Clone)]
pub struct LoginMetadata {
    pub ip_address: String,
    pub at: DateTime<Utc>,
}

/// Result of the atomic session-creation unit.
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub session: Session,
    /// Sessions revoked to make room under the concurrency cap.
    pub evicted: Vec<Uuid>,
    /// Whether any role held by the user demands MFA.
    pub roles_require_mfa: bool,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Look up by lowercased email, optionally within one tenant.
    async fn find_user_by_email(
        &self,
        tenant_id: Option<Uuid>,
        email: &str,
    ) -> Result<Option<User>, IdentityError>;
    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, IdentityError>;
    /// Fails with `EmailAlreadyRegistered` when the tenant already has the email.
    async fn insert_user(&self, user: &User) -> Result<(), IdentityError>;
    /// Store a pending TOTP secret and backup code hashes without enabling MFA.
    async fn store_pending_mfa(
        &self,
        user_id: Uuid,
        secret: &str,
        backup_code_hashes: &[String],
    ) -> Result<(), IdentityError>;
    async fn enable_mfa(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<(), IdentityError>;
    /// Clears the secret and backup codes as well as the flag.
    async fn disable_mfa(&self, user_id: Uuid) -> Result<(), IdentityError>;
    /// Remove one backup code hash. Returns false when it was not present.
    async fn consume_backup_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
    ) -> Result<bool, IdentityError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Evict the oldest active sessions while the user holds `max_active` or
    /// more, insert `session`, and apply `login` to the user row. One unit.
    async fn create_session(
        &self,
        session: &Session,
        max_active: usize,
        login: Option<&LoginMetadata>,
    ) -> Result<CreatedSession, IdentityError>;
    async fn find_session(&self, session_id: Uuid) -> Result<Option<Session>, IdentityError>;
    async fn has_session_for_device(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> Result<bool, IdentityError>;
    async fn list_active_sessions(&self, user_id: Uuid) -> Result<Vec<Session>, IdentityError>;
    /// Revoke one session and its refresh tokens. False if it was already revoked.
    async fn revoke_session(
        &self,
        session_id: Uuid,
        reason: RevocationReason,
    ) -> Result<bool, IdentityError>;
    /// Revoke every active session of a user except `except`. Returns revoked ids.
    async fn revoke_user_sessions(
        &self,
        user_id: Uuid,
        except: Option<Uuid>,
        reason: RevocationReason,
    ) -> Result<Vec<Uuid>, IdentityError>;
    /// Revoke every active session idle since before `cutoff`.
    async fn revoke_idle_sessions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, IdentityError>;
    async fn touch_session(&self, session_id: Uuid, at: DateTime<Utc>)
        -> Result<(), IdentityError>;
    /// Revoke `old_session_id` with `reason` and insert `successor`, atomically.
    /// Fails with `SessionRevoked` if the old session was no longer active.
    async fn replace_session(
        &self,
        old_session_id: Uuid,
        successor: &Session,
        reason: RevocationReason,
    ) -> Result<(), IdentityError>;
}

#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn insert_refresh_token(&self, token: &RefreshToken) -> Result<(), IdentityError>;
    async fn find_refresh_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshToken>, IdentityError>;
    /// Revoke `old_token_id` (only if still active), insert `successor` and
    /// touch its session. Returns false without writing anything when the old
    /// token had already been revoked.
    async fn rotate_refresh_token(
        &self,
        old_token_id: Uuid,
        successor: &RefreshToken,
    ) -> Result<bool, IdentityError>;
}

#[async_trait]
pub trait ChallengeStore: Send + Sync {
    async fn insert_challenge(&self, challenge: &MfaChallenge) -> Result<(), IdentityError>;
    /// Mark the challenge consumed if it is unconsumed and unexpired,
    /// returning it. Check and invalidate happen in one step.
    async fn consume_challenge(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<MfaChallenge>, IdentityError>;
}

#[async_trait]
pub trait RoleStore: Send + Sync {
    async fn find_role(&self, role_id: Uuid) -> Result<Option<Role>, IdentityError>;
    /// Shared (non-custom) role with the given slug.
    async fn find_system_role_by_slug(&self, slug: &str) -> Result<Option<Role>, IdentityError>;
    /// The tenant's existing custom clone of `source_role_id`, if any.
    async fn find_tenant_clone(
        &self,
        tenant_id: Uuid,
        source_role_id: Uuid,
    ) -> Result<Option<Role>, IdentityError>;
    /// Insert a role together with its permission rows.
    async fn insert_role(&self, role: &Role, permissions: &[String]) -> Result<(), IdentityError>;
    async fn role_permissions(&self, role_id: Uuid) -> Result<Vec<String>, IdentityError>;
    /// Replace the permission rows of a custom role.
    async fn replace_role_permissions(
        &self,
        role_id: Uuid,
        permissions: &[String],
    ) -> Result<(), IdentityError>;
    async fn insert_bundle(&self, bundle: &PermissionBundle) -> Result<(), IdentityError>;
    async fn bundles_for(
        &self,
        target: BundleTarget,
    ) -> Result<Vec<PermissionBundle>, IdentityError>;
    async fn user_roles(&self, user_id: Uuid) -> Result<Vec<Role>, IdentityError>;
    async fn insert_assignment(
        &self,
        assignment: &UserRoleAssignment,
    ) -> Result<(), IdentityError>;
    async fn list_assignments(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<UserRoleAssignment>, IdentityError>;
    /// Move non-explicit assignments of `user_type` from `old_role_id` to
    /// `new_role_id`, recording `old_role_id` as their source. A user who
    /// already holds `new_role_id` just loses the old row. Returns how many
    /// users left the old role.
    async fn migrate_assignments(
        &self,
        tenant_id: Uuid,
        user_type: UserType,
        old_role_id: Uuid,
        new_role_id: Uuid,
    ) -> Result<u64, IdentityError>;
    async fn find_default_config(
        &self,
        tenant_id: Uuid,
        user_type: UserType,
    ) -> Result<Option<TenantRoleDefaultConfig>, IdentityError>;
    async fn upsert_default_config(
        &self,
        config: &TenantRoleDefaultConfig,
    ) -> Result<(), IdentityError>;
}

/// Everything the identity core needs from the relational store.
pub trait IdentityStore:
    UserStore + SessionStore + RefreshTokenStore + ChallengeStore + RoleStore
{
}

impl<T> IdentityStore for T where
    T: UserStore + SessionStore + RefreshTokenStore + ChallengeStore + RoleStore
{
}
