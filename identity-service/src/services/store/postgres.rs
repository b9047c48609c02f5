//! PostgreSQL implementation of the identity store.
//!
//! Multi-statement mutations run inside one transaction each. Session
//! creation additionally locks the owning user row so concurrent logins for
//! the same user serialize on the concurrency cap.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use uuid::Uuid;

use super::{
    ChallengeStore, CreatedSession, LoginMetadata, RefreshTokenStore, RoleStore, SessionStore,
    UserStore,
};
use crate::models::{
    AuditEvent, BundleTarget, MfaChallenge, PermissionBundle, RefreshToken, RevocationReason, Role,
    Session, TenantRoleDefaultConfig, User, UserRoleAssignment, UserType,
};
use crate::services::error::IdentityError;

/// PostgreSQL database wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

#[derive(FromRow)]
struct BundleRow {
    bundle_id: Uuid,
    name: String,
    target_kind: String,
    target_id: Uuid,
    permissions: Vec<String>,
}

impl BundleRow {
    fn into_bundle(self) -> Option<PermissionBundle> {
        let target = BundleTarget::from_parts(&self.target_kind, self.target_id)?;
        Some(PermissionBundle {
            bundle_id: self.bundle_id,
            name: self.name,
            target,
            permissions: self.permissions,
        })
    }
}

impl Database {
    /// Create a new database wrapper from a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Health check - ping the database.
    pub async fn health_check(&self) -> Result<(), IdentityError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!("Database health check failed: {}", e);
                IdentityError::Database(e)
            })?;
        Ok(())
    }

    // ==================== Audit Operations ====================

    /// Insert an audit event.
    pub async fn insert_audit_event(&self, event: &AuditEvent) -> Result<(), IdentityError> {
        sqlx::query(
            r#"
            INSERT INTO audit_events (event_id, tenant_id, user_id, event_type, session_id, ip_address, user_agent, event_data, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event.event_id)
        .bind(event.tenant_id)
        .bind(event.user_id)
        .bind(&event.event_type)
        .bind(event.session_id)
        .bind(&event.ip_address)
        .bind(&event.user_agent)
        .bind(&event.event_data)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ==================== User Operations ====================

#[async_trait]
impl UserStore for Database {
    async fn find_user_by_email(
        &self,
        tenant_id: Option<Uuid>,
        email: &str,
    ) -> Result<Option<User>, IdentityError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT * FROM users
            WHERE LOWER(email) = LOWER($1) AND ($2::uuid IS NULL OR tenant_id = $2)
            ORDER BY created_at
            LIMIT 1
            "#,
        )
        .bind(email)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, IdentityError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn insert_user(&self, user: &User) -> Result<(), IdentityError> {
        sqlx::query(
            r#"
            INSERT INTO users (user_id, tenant_id, email, password_hash, auth_provider, user_type, is_active,
                               mfa_enabled, mfa_secret, mfa_verified_at, backup_code_hashes, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(user.user_id)
        .bind(user.tenant_id)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.auth_provider)
        .bind(user.user_type)
        .bind(user.is_active)
        .bind(user.mfa_enabled)
        .bind(&user.mfa_secret)
        .bind(user.mfa_verified_at)
        .bind(&user.backup_code_hashes)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e.as_database_error() {
            Some(db) if db.is_unique_violation() => IdentityError::EmailAlreadyRegistered,
            _ => IdentityError::Database(e),
        })?;
        Ok(())
    }

    async fn store_pending_mfa(
        &self,
        user_id: Uuid,
        secret: &str,
        backup_code_hashes: &[String],
    ) -> Result<(), IdentityError> {
        let result = sqlx::query(
            "UPDATE users SET mfa_secret = $1, backup_code_hashes = $2 WHERE user_id = $3",
        )
        .bind(secret)
        .bind(backup_code_hashes)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(IdentityError::UserNotFound);
        }
        Ok(())
    }

    async fn enable_mfa(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<(), IdentityError> {
        sqlx::query("UPDATE users SET mfa_enabled = TRUE, mfa_verified_at = $1 WHERE user_id = $2")
            .bind(at)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn disable_mfa(&self, user_id: Uuid) -> Result<(), IdentityError> {
        sqlx::query(
            r#"
            UPDATE users
            SET mfa_enabled = FALSE, mfa_secret = NULL, mfa_verified_at = NULL, backup_code_hashes = '{}'
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn consume_backup_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
    ) -> Result<bool, IdentityError> {
        let result = sqlx::query(
            r#"
            UPDATE users SET backup_code_hashes = array_remove(backup_code_hashes, $1)
            WHERE user_id = $2 AND $1 = ANY(backup_code_hashes)
            "#,
        )
        .bind(code_hash)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

// ==================== Session Operations ====================

#[async_trait]
impl SessionStore for Database {
    async fn create_session(
        &self,
        session: &Session,
        max_active: usize,
        login: Option<&LoginMetadata>,
    ) -> Result<CreatedSession, IdentityError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        // Serializes concurrent logins of one user across the cap check below
        sqlx::query("SELECT user_id FROM users WHERE user_id = $1 FOR UPDATE")
            .bind(session.user_id)
            .fetch_optional(&mut *tx)
            .await?;

        let active: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT session_id FROM sessions
            WHERE user_id = $1 AND revoked_at IS NULL
            ORDER BY created_at ASC
            "#,
        )
        .bind(session.user_id)
        .fetch_all(&mut *tx)
        .await?;

        let excess = (active.len() + 1).saturating_sub(max_active.max(1));
        let evicted: Vec<Uuid> = active.into_iter().take(excess).collect();

        if !evicted.is_empty() {
            sqlx::query(
                "UPDATE sessions SET revoked_at = $1, revoked_reason = $2 WHERE session_id = ANY($3) AND revoked_at IS NULL",
            )
            .bind(now)
            .bind(RevocationReason::SessionLimit)
            .bind(&evicted)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "UPDATE refresh_tokens SET revoked_at = $1, revoked_reason = $2 WHERE session_id = ANY($3) AND revoked_at IS NULL",
            )
            .bind(now)
            .bind(RevocationReason::SessionLimit)
            .bind(&evicted)
            .execute(&mut *tx)
            .await?;
        }

        insert_session(&mut tx, session).await?;

        if let Some(login) = login {
            sqlx::query("UPDATE users SET last_login_at = $1, last_login_ip = $2 WHERE user_id = $3")
                .bind(login.at)
                .bind(&login.ip_address)
                .bind(session.user_id)
                .execute(&mut *tx)
                .await?;
        }

        let roles_require_mfa: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM user_role_assignments a
                JOIN roles r ON r.role_id = a.role_id
                WHERE a.user_id = $1 AND r.requires_mfa
            )
            "#,
        )
        .bind(session.user_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(CreatedSession {
            session: session.clone(),
            evicted,
            roles_require_mfa,
        })
    }

    async fn find_session(&self, session_id: Uuid) -> Result<Option<Session>, IdentityError> {
        let session = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE session_id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(session)
    }

    async fn has_session_for_device(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> Result<bool, IdentityError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM sessions WHERE user_id = $1 AND device_id = $2)",
        )
        .bind(user_id)
        .bind(device_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn list_active_sessions(&self, user_id: Uuid) -> Result<Vec<Session>, IdentityError> {
        let sessions = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE user_id = $1 AND revoked_at IS NULL ORDER BY created_at ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    async fn revoke_session(
        &self,
        session_id: Uuid,
        reason: RevocationReason,
    ) -> Result<bool, IdentityError> {
        let mut tx = self.pool.begin().await?;
        let revoked = revoke_sessions(&mut tx, &[session_id], reason).await?;
        tx.commit().await?;
        Ok(revoked == 1)
    }

    async fn revoke_user_sessions(
        &self,
        user_id: Uuid,
        except: Option<Uuid>,
        reason: RevocationReason,
    ) -> Result<Vec<Uuid>, IdentityError> {
        let mut tx = self.pool.begin().await?;
        let targets: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT session_id FROM sessions
            WHERE user_id = $1 AND revoked_at IS NULL AND ($2::uuid IS NULL OR session_id <> $2)
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .bind(except)
        .fetch_all(&mut *tx)
        .await?;

        revoke_sessions(&mut tx, &targets, reason).await?;
        tx.commit().await?;
        Ok(targets)
    }

    async fn revoke_idle_sessions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, IdentityError> {
        let mut tx = self.pool.begin().await?;
        let idle: Vec<Uuid> = sqlx::query_scalar(
            "SELECT session_id FROM sessions WHERE revoked_at IS NULL AND last_active_at < $1 FOR UPDATE",
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        revoke_sessions(&mut tx, &idle, RevocationReason::Inactivity).await?;
        tx.commit().await?;
        Ok(idle)
    }

    async fn touch_session(
        &self,
        session_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), IdentityError> {
        sqlx::query(
            "UPDATE sessions SET last_active_at = $1 WHERE session_id = $2 AND revoked_at IS NULL",
        )
        .bind(at)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replace_session(
        &self,
        old_session_id: Uuid,
        successor: &Session,
        reason: RevocationReason,
    ) -> Result<(), IdentityError> {
        let mut tx = self.pool.begin().await?;
        if revoke_sessions(&mut tx, &[old_session_id], reason).await? == 0 {
            tx.rollback().await?;
            return Err(IdentityError::SessionRevoked);
        }
        insert_session(&mut tx, successor).await?;
        tx.commit().await?;
        Ok(())
    }
}

async fn insert_session(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    session: &Session,
) -> Result<(), IdentityError> {
    sqlx::query(
        r#"
        INSERT INTO sessions (session_id, user_id, tenant_id, device_id, ip_address, user_agent_hash, device_type,
                              is_new_device, mfa_verified, mfa_verified_at, last_active_at, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(session.session_id)
    .bind(session.user_id)
    .bind(session.tenant_id)
    .bind(&session.device_id)
    .bind(&session.ip_address)
    .bind(&session.user_agent_hash)
    .bind(session.device_type)
    .bind(session.is_new_device)
    .bind(session.mfa_verified)
    .bind(session.mfa_verified_at)
    .bind(session.last_active_at)
    .bind(session.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Revoke sessions and cascade to their refresh tokens. Returns how many
/// sessions changed state.
async fn revoke_sessions(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    session_ids: &[Uuid],
    reason: RevocationReason,
) -> Result<u64, IdentityError> {
    if session_ids.is_empty() {
        return Ok(0);
    }
    let now = Utc::now();

    let result = sqlx::query(
        "UPDATE sessions SET revoked_at = $1, revoked_reason = $2 WHERE session_id = ANY($3) AND revoked_at IS NULL",
    )
    .bind(now)
    .bind(reason)
    .bind(session_ids)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        "UPDATE refresh_tokens SET revoked_at = $1, revoked_reason = $2 WHERE session_id = ANY($3) AND revoked_at IS NULL",
    )
    .bind(now)
    .bind(reason)
    .bind(session_ids)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected())
}

// ==================== Refresh Token Operations ====================

#[async_trait]
impl RefreshTokenStore for Database {
    async fn insert_refresh_token(&self, token: &RefreshToken) -> Result<(), IdentityError> {
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (token_id, session_id, user_id, token_hash, expires_at, rotated_from, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(token.token_id)
        .bind(token.session_id)
        .bind(token.user_id)
        .bind(&token.token_hash)
        .bind(token.expires_at)
        .bind(token.rotated_from)
        .bind(token.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_refresh_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshToken>, IdentityError> {
        let token = sqlx::query_as::<_, RefreshToken>(
            "SELECT * FROM refresh_tokens WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(token)
    }

    async fn rotate_refresh_token(
        &self,
        old_token_id: Uuid,
        successor: &RefreshToken,
    ) -> Result<bool, IdentityError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let revoked = sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = $1, revoked_reason = $2 WHERE token_id = $3 AND revoked_at IS NULL",
        )
        .bind(now)
        .bind(RevocationReason::Rotated)
        .bind(old_token_id)
        .execute(&mut *tx)
        .await?;

        if revoked.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (token_id, session_id, user_id, token_hash, expires_at, rotated_from, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(successor.token_id)
        .bind(successor.session_id)
        .bind(successor.user_id)
        .bind(&successor.token_hash)
        .bind(successor.expires_at)
        .bind(successor.rotated_from)
        .bind(successor.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE sessions SET last_active_at = $1 WHERE session_id = $2 AND revoked_at IS NULL",
        )
        .bind(now)
        .bind(successor.session_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}

// ==================== MFA Challenge Operations ====================

#[async_trait]
impl ChallengeStore for Database {
    async fn insert_challenge(&self, challenge: &MfaChallenge) -> Result<(), IdentityError> {
        sqlx::query(
            r#"
            INSERT INTO mfa_challenges (challenge_id, token_hash, user_id, session_id, ip_address, device_hash, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(challenge.challenge_id)
        .bind(&challenge.token_hash)
        .bind(challenge.user_id)
        .bind(challenge.session_id)
        .bind(&challenge.ip_address)
        .bind(&challenge.device_hash)
        .bind(challenge.expires_at)
        .bind(challenge.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn consume_challenge(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<MfaChallenge>, IdentityError> {
        let challenge = sqlx::query_as::<_, MfaChallenge>(
            r#"
            UPDATE mfa_challenges SET consumed_at = $1
            WHERE token_hash = $2 AND consumed_at IS NULL AND expires_at > $1
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(challenge)
    }
}

// ==================== Role Operations ====================

#[async_trait]
impl RoleStore for Database {
    async fn find_role(&self, role_id: Uuid) -> Result<Option<Role>, IdentityError> {
        let role = sqlx::query_as::<_, Role>("SELECT * FROM roles WHERE role_id = $1")
            .bind(role_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(role)
    }

    async fn find_system_role_by_slug(&self, slug: &str) -> Result<Option<Role>, IdentityError> {
        let role = sqlx::query_as::<_, Role>(
            "SELECT * FROM roles WHERE slug = $1 AND asset_type <> 'custom' ORDER BY created_at LIMIT 1",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        Ok(role)
    }

    async fn find_tenant_clone(
        &self,
        tenant_id: Uuid,
        source_role_id: Uuid,
    ) -> Result<Option<Role>, IdentityError> {
        let role = sqlx::query_as::<_, Role>(
            "SELECT * FROM roles WHERE tenant_id = $1 AND source_role_id = $2 ORDER BY created_at LIMIT 1",
        )
        .bind(tenant_id)
        .bind(source_role_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(role)
    }

    async fn insert_role(&self, role: &Role, permissions: &[String]) -> Result<(), IdentityError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO roles (role_id, slug, name, asset_type, tenant_id, plan_id, source_role_id, requires_mfa, is_admin, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(role.role_id)
        .bind(&role.slug)
        .bind(&role.name)
        .bind(role.asset_type)
        .bind(role.tenant_id)
        .bind(role.plan_id)
        .bind(role.source_role_id)
        .bind(role.requires_mfa)
        .bind(role.is_admin)
        .bind(role.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO role_permissions (role_id, permission_key) SELECT $1, UNNEST($2::text[])",
        )
        .bind(role.role_id)
        .bind(permissions)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn role_permissions(&self, role_id: Uuid) -> Result<Vec<String>, IdentityError> {
        let permissions: Vec<String> = sqlx::query_scalar(
            "SELECT permission_key FROM role_permissions WHERE role_id = $1 ORDER BY permission_key",
        )
        .bind(role_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(permissions)
    }

    async fn replace_role_permissions(
        &self,
        role_id: Uuid,
        permissions: &[String],
    ) -> Result<(), IdentityError> {
        let mut tx = self.pool.begin().await?;

        let role = sqlx::query_as::<_, Role>("SELECT * FROM roles WHERE role_id = $1 FOR UPDATE")
            .bind(role_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(IdentityError::RoleNotFound(role_id))?;
        if role.asset_type.is_shared() {
            return Err(IdentityError::Forbidden(
                "shared roles cannot be modified in place".to_string(),
            ));
        }

        sqlx::query("DELETE FROM role_permissions WHERE role_id = $1")
            .bind(role_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO role_permissions (role_id, permission_key) SELECT $1, UNNEST($2::text[])",
        )
        .bind(role_id)
        .bind(permissions)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn insert_bundle(&self, bundle: &PermissionBundle) -> Result<(), IdentityError> {
        sqlx::query(
            r#"
            INSERT INTO permission_bundles (bundle_id, name, target_kind, target_id, permissions)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(bundle.bundle_id)
        .bind(&bundle.name)
        .bind(bundle.target.kind())
        .bind(bundle.target.id())
        .bind(&bundle.permissions)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn bundles_for(
        &self,
        target: BundleTarget,
    ) -> Result<Vec<PermissionBundle>, IdentityError> {
        let rows = sqlx::query_as::<_, BundleRow>(
            "SELECT * FROM permission_bundles WHERE target_kind = $1 AND target_id = $2",
        )
        .bind(target.kind())
        .bind(target.id())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().filter_map(BundleRow::into_bundle).collect())
    }

    async fn user_roles(&self, user_id: Uuid) -> Result<Vec<Role>, IdentityError> {
        let roles = sqlx::query_as::<_, Role>(
            r#"
            SELECT r.* FROM roles r
            JOIN user_role_assignments a ON a.role_id = r.role_id
            WHERE a.user_id = $1
            ORDER BY a.assigned_at
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(roles)
    }

    async fn insert_assignment(
        &self,
        assignment: &UserRoleAssignment,
    ) -> Result<(), IdentityError> {
        sqlx::query(
            r#"
            INSERT INTO user_role_assignments (assignment_id, tenant_id, user_id, user_type, role_id, assignment_type,
                                               source_role_id, assigned_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (tenant_id, user_id, role_id)
            DO UPDATE SET assignment_type = EXCLUDED.assignment_type, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(assignment.assignment_id)
        .bind(assignment.tenant_id)
        .bind(assignment.user_id)
        .bind(assignment.user_type)
        .bind(assignment.role_id)
        .bind(assignment.assignment_type)
        .bind(assignment.source_role_id)
        .bind(assignment.assigned_at)
        .bind(assignment.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_assignments(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<UserRoleAssignment>, IdentityError> {
        let assignments = sqlx::query_as::<_, UserRoleAssignment>(
            "SELECT * FROM user_role_assignments WHERE tenant_id = $1 AND user_id = $2 ORDER BY assigned_at",
        )
        .bind(tenant_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(assignments)
    }

    async fn migrate_assignments(
        &self,
        tenant_id: Uuid,
        user_type: UserType,
        old_role_id: Uuid,
        new_role_id: Uuid,
    ) -> Result<u64, IdentityError> {
        let mut tx = self.pool.begin().await?;

        // Users already holding the new role only lose the old row
        let dropped = sqlx::query(
            r#"
            DELETE FROM user_role_assignments a
            WHERE a.tenant_id = $1 AND a.user_type = $2 AND a.role_id = $3
              AND a.assignment_type <> 'explicit'
              AND EXISTS (
                  SELECT 1 FROM user_role_assignments b
                  WHERE b.tenant_id = a.tenant_id AND b.user_id = a.user_id AND b.role_id = $4
              )
            "#,
        )
        .bind(tenant_id)
        .bind(user_type)
        .bind(old_role_id)
        .bind(new_role_id)
        .execute(&mut *tx)
        .await?;

        let moved = sqlx::query(
            r#"
            UPDATE user_role_assignments
            SET role_id = $1, source_role_id = $2, updated_at = NOW()
            WHERE tenant_id = $3 AND user_type = $4 AND role_id = $2 AND assignment_type <> 'explicit'
            "#,
        )
        .bind(new_role_id)
        .bind(old_role_id)
        .bind(tenant_id)
        .bind(user_type)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(dropped.rows_affected() + moved.rows_affected())
    }

    async fn find_default_config(
        &self,
        tenant_id: Uuid,
        user_type: UserType,
    ) -> Result<Option<TenantRoleDefaultConfig>, IdentityError> {
        let config = sqlx::query_as::<_, TenantRoleDefaultConfig>(
            "SELECT * FROM tenant_role_defaults WHERE tenant_id = $1 AND user_type = $2",
        )
        .bind(tenant_id)
        .bind(user_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(config)
    }

    async fn upsert_default_config(
        &self,
        config: &TenantRoleDefaultConfig,
    ) -> Result<(), IdentityError> {
        sqlx::query(
            r#"
            INSERT INTO tenant_role_defaults (tenant_id, user_type, default_role_id, previous_role_id, is_system_role, last_changed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (tenant_id, user_type) DO UPDATE
            SET default_role_id = EXCLUDED.default_role_id,
                previous_role_id = EXCLUDED.previous_role_id,
                is_system_role = EXCLUDED.is_system_role,
                last_changed_at = EXCLUDED.last_changed_at
            "#,
        )
        .bind(config.tenant_id)
        .bind(config.user_type)
        .bind(config.default_role_id)
        .bind(config.previous_role_id)
        .bind(config.is_system_role)
        .bind(config.last_changed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
