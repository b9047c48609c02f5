use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    ChallengeStore, CreatedSession, LoginMetadata, RefreshTokenStore, RoleStore, SessionStore,
    UserStore,
};
use crate::models::{
    AssetType, AssignmentType, BundleTarget, MfaChallenge, PermissionBundle, RefreshToken,
    RevocationReason, Role, Session, TenantRoleDefaultConfig, User, UserRoleAssignment, UserType,
};
use crate::services::error::IdentityError;

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    sessions: HashMap<Uuid, Session>,
    refresh_tokens: HashMap<Uuid, RefreshToken>,
    challenges: HashMap<String, MfaChallenge>,
    roles: HashMap<Uuid, Role>,
    role_permissions: HashMap<Uuid, Vec<String>>,
    bundles: Vec<PermissionBundle>,
    assignments: Vec<UserRoleAssignment>,
    defaults: HashMap<(Uuid, UserType), TenantRoleDefaultConfig>,
}

impl Tables {
    fn revoke_session(&mut self, session_id: Uuid, reason: RevocationReason, now: DateTime<Utc>) -> bool {
        let revoked = match self.sessions.get_mut(&session_id) {
            Some(session) if session.revoked_at.is_none() => {
                session.revoked_at = Some(now);
                session.revoked_reason = Some(reason);
                true
            }
            _ => false,
        };
        for token in self
            .refresh_tokens
            .values_mut()
            .filter(|t| t.session_id == session_id && t.revoked_at.is_none())
        {
            token.revoked_at = Some(now);
            token.revoked_reason = Some(reason);
        }
        revoked
    }

    fn active_sessions(&self, user_id: Uuid) -> Vec<&Session> {
        let mut active: Vec<&Session> = self
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && s.revoked_at.is_none())
            .collect();
        active.sort_by_key(|s| s.created_at);
        active
    }
}

/// In-memory relational store. One mutex guards every table, so each trait
/// method is atomic with respect to all others.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_user_by_email(
        &self,
        tenant_id: Option<Uuid>,
        email: &str,
    ) -> Result<Option<User>, IdentityError> {
        let email = email.to_lowercase();
        let tables = self.tables.lock().await;
        Ok(tables
            .users
            .values()
            .find(|u| u.email == email && tenant_id.map_or(true, |t| u.tenant_id == t))
            .cloned())
    }

    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, IdentityError> {
        Ok(self.tables.lock().await.users.get(&user_id).cloned())
    }

    async fn insert_user(&self, user: &User) -> Result<(), IdentityError> {
        let mut tables = self.tables.lock().await;
        if tables
            .users
            .values()
            .any(|u| u.tenant_id == user.tenant_id && u.email == user.email)
        {
            return Err(IdentityError::EmailAlreadyRegistered);
        }
        tables.users.insert(user.user_id, user.clone());
        Ok(())
    }

    async fn store_pending_mfa(
        &self,
        user_id: Uuid,
        secret: &str,
        backup_code_hashes: &[String],
    ) -> Result<(), IdentityError> {
        let mut tables = self.tables.lock().await;
        let user = tables
            .users
            .get_mut(&user_id)
            .ok_or(IdentityError::UserNotFound)?;
        user.mfa_secret = Some(secret.to_string());
        user.backup_code_hashes = backup_code_hashes.to_vec();
        Ok(())
    }

    async fn enable_mfa(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<(), IdentityError> {
        let mut tables = self.tables.lock().await;
        let user = tables
            .users
            .get_mut(&user_id)
            .ok_or(IdentityError::UserNotFound)?;
        user.mfa_enabled = true;
        user.mfa_verified_at = Some(at);
        Ok(())
    }

    async fn disable_mfa(&self, user_id: Uuid) -> Result<(), IdentityError> {
        let mut tables = self.tables.lock().await;
        let user = tables
            .users
            .get_mut(&user_id)
            .ok_or(IdentityError::UserNotFound)?;
        user.mfa_enabled = false;
        user.mfa_secret = None;
        user.mfa_verified_at = None;
        user.backup_code_hashes.clear();
        Ok(())
    }

    async fn consume_backup_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
    ) -> Result<bool, IdentityError> {
        let mut tables = self.tables.lock().await;
        let Some(user) = tables.users.get_mut(&user_id) else {
            return Ok(false);
        };
        let before = user.backup_code_hashes.len();
        user.backup_code_hashes.retain(|h| h != code_hash);
        Ok(user.backup_code_hashes.len() < before)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(
        &self,
        session: &Session,
        max_active: usize,
        login: Option<&LoginMetadata>,
    ) -> Result<CreatedSession, IdentityError> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();

        let active: Vec<Uuid> = tables
            .active_sessions(session.user_id)
            .iter()
            .map(|s| s.session_id)
            .collect();
        let excess = (active.len() + 1).saturating_sub(max_active.max(1));
        let evicted: Vec<Uuid> = active.into_iter().take(excess).collect();
        for id in &evicted {
            tables.revoke_session(*id, RevocationReason::SessionLimit, now);
        }

        tables.sessions.insert(session.session_id, session.clone());

        if let Some(login) = login {
            if let Some(user) = tables.users.get_mut(&session.user_id) {
                user.last_login_at = Some(login.at);
                user.last_login_ip = Some(login.ip_address.clone());
            }
        }

        let role_ids: Vec<Uuid> = tables
            .assignments
            .iter()
            .filter(|a| a.user_id == session.user_id)
            .map(|a| a.role_id)
            .collect();
        let roles_require_mfa = role_ids
            .iter()
            .filter_map(|id| tables.roles.get(id))
            .any(|r| r.requires_mfa);

        Ok(CreatedSession {
            session: session.clone(),
            evicted,
            roles_require_mfa,
        })
    }

    async fn find_session(&self, session_id: Uuid) -> Result<Option<Session>, IdentityError> {
        Ok(self.tables.lock().await.sessions.get(&session_id).cloned())
    }

    async fn has_session_for_device(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> Result<bool, IdentityError> {
        Ok(self
            .tables
            .lock()
            .await
            .sessions
            .values()
            .any(|s| s.user_id == user_id && s.device_id == device_id))
    }

    async fn list_active_sessions(&self, user_id: Uuid) -> Result<Vec<Session>, IdentityError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .active_sessions(user_id)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn revoke_session(
        &self,
        session_id: Uuid,
        reason: RevocationReason,
    ) -> Result<bool, IdentityError> {
        Ok(self
            .tables
            .lock()
            .await
            .revoke_session(session_id, reason, Utc::now()))
    }

    async fn revoke_user_sessions(
        &self,
        user_id: Uuid,
        except: Option<Uuid>,
        reason: RevocationReason,
    ) -> Result<Vec<Uuid>, IdentityError> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        let targets: Vec<Uuid> = tables
            .active_sessions(user_id)
            .iter()
            .map(|s| s.session_id)
            .filter(|id| Some(*id) != except)
            .collect();
        for id in &targets {
            tables.revoke_session(*id, reason, now);
        }
        Ok(targets)
    }

    async fn revoke_idle_sessions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, IdentityError> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        let idle: Vec<Uuid> = tables
            .sessions
            .values()
            .filter(|s| s.revoked_at.is_none() && s.last_active_at < cutoff)
            .map(|s| s.session_id)
            .collect();
        for id in &idle {
            tables.revoke_session(*id, RevocationReason::Inactivity, now);
        }
        Ok(idle)
    }

    async fn touch_session(
        &self,
        session_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), IdentityError> {
        let mut tables = self.tables.lock().await;
        if let Some(session) = tables.sessions.get_mut(&session_id) {
            if session.revoked_at.is_none() {
                session.last_active_at = at;
            }
        }
        Ok(())
    }

    async fn replace_session(
        &self,
        old_session_id: Uuid,
        successor: &Session,
        reason: RevocationReason,
    ) -> Result<(), IdentityError> {
        let mut tables = self.tables.lock().await;
        if !tables.revoke_session(old_session_id, reason, Utc::now()) {
            return Err(IdentityError::SessionRevoked);
        }
        tables
            .sessions
            .insert(successor.session_id, successor.clone());
        Ok(())
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryStore {
    async fn insert_refresh_token(&self, token: &RefreshToken) -> Result<(), IdentityError> {
        self.tables
            .lock()
            .await
            .refresh_tokens
            .insert(token.token_id, token.clone());
        Ok(())
    }

    async fn find_refresh_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshToken>, IdentityError> {
        Ok(self
            .tables
            .lock()
            .await
            .refresh_tokens
            .values()
            .find(|t| t.token_hash == token_hash)
            .cloned())
    }

    async fn rotate_refresh_token(
        &self,
        old_token_id: Uuid,
        successor: &RefreshToken,
    ) -> Result<bool, IdentityError> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        match tables.refresh_tokens.get_mut(&old_token_id) {
            Some(old) if old.revoked_at.is_none() => {
                old.revoked_at = Some(now);
                old.revoked_reason = Some(RevocationReason::Rotated);
            }
            _ => return Ok(false),
        }
        tables
            .refresh_tokens
            .insert(successor.token_id, successor.clone());
        if let Some(session) = tables.sessions.get_mut(&successor.session_id) {
            session.last_active_at = now;
        }
        Ok(true)
    }
}

#[async_trait]
impl ChallengeStore for MemoryStore {
    async fn insert_challenge(&self, challenge: &MfaChallenge) -> Result<(), IdentityError> {
        self.tables
            .lock()
            .await
            .challenges
            .insert(challenge.token_hash.clone(), challenge.clone());
        Ok(())
    }

    async fn consume_challenge(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<MfaChallenge>, IdentityError> {
        let mut tables = self.tables.lock().await;
        match tables.challenges.get_mut(token_hash) {
            Some(challenge) if challenge.is_consumable(now) => {
                challenge.consumed_at = Some(now);
                Ok(Some(challenge.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl RoleStore for MemoryStore {
    async fn find_role(&self, role_id: Uuid) -> Result<Option<Role>, IdentityError> {
        Ok(self.tables.lock().await.roles.get(&role_id).cloned())
    }

    async fn find_system_role_by_slug(&self, slug: &str) -> Result<Option<Role>, IdentityError> {
        Ok(self
            .tables
            .lock()
            .await
            .roles
            .values()
            .find(|r| r.slug == slug && r.asset_type != AssetType::Custom)
            .cloned())
    }

    async fn find_tenant_clone(
        &self,
        tenant_id: Uuid,
        source_role_id: Uuid,
    ) -> Result<Option<Role>, IdentityError> {
        Ok(self
            .tables
            .lock()
            .await
            .roles
            .values()
            .find(|r| r.tenant_id == Some(tenant_id) && r.source_role_id == Some(source_role_id))
            .cloned())
    }

    async fn insert_role(&self, role: &Role, permissions: &[String]) -> Result<(), IdentityError> {
        let mut tables = self.tables.lock().await;
        tables.roles.insert(role.role_id, role.clone());
        tables
            .role_permissions
            .insert(role.role_id, permissions.to_vec());
        Ok(())
    }

    async fn role_permissions(&self, role_id: Uuid) -> Result<Vec<String>, IdentityError> {
        Ok(self
            .tables
            .lock()
            .await
            .role_permissions
            .get(&role_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn replace_role_permissions(
        &self,
        role_id: Uuid,
        permissions: &[String],
    ) -> Result<(), IdentityError> {
        let mut tables = self.tables.lock().await;
        match tables.roles.get(&role_id) {
            Some(role) if role.asset_type == AssetType::Custom => {}
            Some(_) => {
                return Err(IdentityError::Forbidden(
                    "shared roles cannot be modified in place".to_string(),
                ))
            }
            None => return Err(IdentityError::RoleNotFound(role_id)),
        }
        tables
            .role_permissions
            .insert(role_id, permissions.to_vec());
        Ok(())
    }

    async fn insert_bundle(&self, bundle: &PermissionBundle) -> Result<(), IdentityError> {
        self.tables.lock().await.bundles.push(bundle.clone());
        Ok(())
    }

    async fn bundles_for(
        &self,
        target: BundleTarget,
    ) -> Result<Vec<PermissionBundle>, IdentityError> {
        Ok(self
            .tables
            .lock()
            .await
            .bundles
            .iter()
            .filter(|b| b.target == target)
            .cloned()
            .collect())
    }

    async fn user_roles(&self, user_id: Uuid) -> Result<Vec<Role>, IdentityError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .assignments
            .iter()
            .filter(|a| a.user_id == user_id)
            .filter_map(|a| tables.roles.get(&a.role_id).cloned())
            .collect())
    }

    async fn insert_assignment(
        &self,
        assignment: &UserRoleAssignment,
    ) -> Result<(), IdentityError> {
        let mut tables = self.tables.lock().await;
        tables.assignments.retain(|a| {
            !(a.tenant_id == assignment.tenant_id
                && a.user_id == assignment.user_id
                && a.role_id == assignment.role_id)
        });
        tables.assignments.push(assignment.clone());
        Ok(())
    }

    async fn list_assignments(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<UserRoleAssignment>, IdentityError> {
        Ok(self
            .tables
            .lock()
            .await
            .assignments
            .iter()
            .filter(|a| a.tenant_id == tenant_id && a.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn migrate_assignments(
        &self,
        tenant_id: Uuid,
        user_type: UserType,
        old_role_id: Uuid,
        new_role_id: Uuid,
    ) -> Result<u64, IdentityError> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        let holders: HashSet<Uuid> = tables
            .assignments
            .iter()
            .filter(|a| a.tenant_id == tenant_id && a.role_id == new_role_id)
            .map(|a| a.user_id)
            .collect();
        let migrating = |a: &UserRoleAssignment| {
            a.tenant_id == tenant_id
                && a.user_type == user_type
                && a.role_id == old_role_id
                && a.assignment_type != AssignmentType::Explicit
        };

        // Users already holding the new role only lose the old row
        let before = tables.assignments.len();
        tables
            .assignments
            .retain(|a| !(migrating(a) && holders.contains(&a.user_id)));
        let mut moved = (before - tables.assignments.len()) as u64;

        for assignment in tables.assignments.iter_mut().filter(|a| migrating(a)) {
            assignment.role_id = new_role_id;
            assignment.source_role_id = Some(old_role_id);
            assignment.updated_at = now;
            moved += 1;
        }
        Ok(moved)
    }

    async fn find_default_config(
        &self,
        tenant_id: Uuid,
        user_type: UserType,
    ) -> Result<Option<TenantRoleDefaultConfig>, IdentityError> {
        Ok(self
            .tables
            .lock()
            .await
            .defaults
            .get(&(tenant_id, user_type))
            .cloned())
    }

    async fn upsert_default_config(
        &self,
        config: &TenantRoleDefaultConfig,
    ) -> Result<(), IdentityError> {
        self.tables
            .lock()
            .await
            .defaults
            .insert((config.tenant_id, config.user_type), config.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceType;

    fn session_for(user_id: Uuid) -> Session {
        let now = Utc::now();
        Session {
            session_id: Uuid::new_v4(),
            user_id,
            tenant_id: Uuid::new_v4(),
            device_id: Uuid::new_v4().to_string(),
            ip_address: "127.0.0.1".to_string(),
            user_agent_hash: "ua".to_string(),
            device_type: DeviceType::Desktop,
            is_new_device: false,
            mfa_verified: false,
            mfa_verified_at: None,
            last_active_at: now,
            created_at: now,
            revoked_at: None,
            revoked_reason: None,
        }
    }

    #[tokio::test]
    async fn test_create_session_evicts_oldest_at_cap() -> Result<(), IdentityError> {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();

        let mut first = session_for(user_id);
        first.created_at = Utc::now() - chrono::Duration::minutes(10);
        store.create_session(&first, 2, None).await?;
        store.create_session(&session_for(user_id), 2, None).await?;

        let created = store.create_session(&session_for(user_id), 2, None).await?;

        assert_eq!(created.evicted, vec![first.session_id]);
        assert_eq!(store.list_active_sessions(user_id).await?.len(), 2);
        let evicted = store.find_session(first.session_id).await?.unwrap();
        assert_eq!(evicted.revoked_reason, Some(RevocationReason::SessionLimit));
        Ok(())
    }

    #[tokio::test]
    async fn test_rotation_refuses_revoked_token() -> Result<(), IdentityError> {
        let store = MemoryStore::new();
        let session = session_for(Uuid::new_v4());
        store.create_session(&session, 5, None).await?;

        let old = RefreshToken::new(session.session_id, session.user_id, "a", 7, None);
        store.insert_refresh_token(&old).await?;

        let next = RefreshToken::new(session.session_id, session.user_id, "b", 7, Some(old.token_id));
        assert!(store.rotate_refresh_token(old.token_id, &next).await?);

        let again = RefreshToken::new(session.session_id, session.user_id, "c", 7, Some(old.token_id));
        assert!(!store.rotate_refresh_token(old.token_id, &again).await?);
        assert!(store.find_refresh_token_by_hash(&again.token_hash).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_challenge_consumed_once() -> Result<(), IdentityError> {
        let store = MemoryStore::new();
        let challenge = MfaChallenge::new("raw", Uuid::new_v4(), Uuid::new_v4(), "1.1.1.1", "dev", 300);
        store.insert_challenge(&challenge).await?;

        let now = Utc::now();
        assert!(store.consume_challenge(&challenge.token_hash, now).await?.is_some());
        assert!(store.consume_challenge(&challenge.token_hash, now).await?.is_none());
        Ok(())
    }
}
