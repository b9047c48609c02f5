//! Role permission resolution with a read-through cache, plus the tenant
//! role operations (cloning shared roles, default roles, migrations).
//!
//! Shared roles (`public`, `readonly`) are never modified. A tenant that
//! wants different permissions gets its own `custom` clone which points
//! back at the original through `source_role_id`.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::models::{
    AssignmentType, AuditEvent, AuditEventType, BundleTarget, Role, TenantRoleDefaultConfig,
    TenantScope, UserRoleAssignment, UserType,
};
use crate::services::audit::AuditSink;
use crate::services::cache::CacheStore;
use crate::services::error::IdentityError;
use crate::services::store::IdentityStore;

pub const DEFAULT_PERMISSION_CACHE_TTL_SECS: u64 = 3600;

/// Cache key for a role's resolved permissions within a tenant.
///
/// Shared roles are keyed by plan so every tenant on the plan hits the same
/// entry; custom roles are keyed by tenant.
pub fn cache_key(role: &Role, scope: &TenantScope) -> String {
    if role.asset_type.is_shared() {
        let plan_id = role.plan_id.unwrap_or(scope.plan_id);
        format!("plan:{}:role:{}:permissions", plan_id, role.slug)
    } else {
        let tenant_id = role.tenant_id.unwrap_or(scope.tenant_id);
        format!("tenant:{}:role:{}:permissions", tenant_id, role.slug)
    }
}

/// Reject roles a tenant cannot hold or edit.
fn ensure_usable(role: &Role, scope: &TenantScope) -> Result<(), IdentityError> {
    if role.asset_type.is_shared() {
        match role.plan_id {
            Some(plan_id) if plan_id != scope.plan_id => Err(IdentityError::Forbidden(
                "role belongs to another plan".to_string(),
            )),
            _ => Ok(()),
        }
    } else if role.tenant_id == Some(scope.tenant_id) {
        Ok(())
    } else {
        Err(IdentityError::Forbidden(
            "role belongs to another tenant".to_string(),
        ))
    }
}

#[derive(Clone)]
pub struct PermissionCache {
    store: Arc<dyn IdentityStore>,
    cache: Arc<dyn CacheStore>,
    ttl_secs: u64,
}

impl PermissionCache {
    pub fn new(store: Arc<dyn IdentityStore>, cache: Arc<dyn CacheStore>, ttl_secs: u64) -> Self {
        Self {
            store,
            cache,
            ttl_secs,
        }
    }

    async fn load_role(&self, role_id: Uuid) -> Result<Role, IdentityError> {
        self.store
            .find_role(role_id)
            .await?
            .ok_or(IdentityError::RoleNotFound(role_id))
    }

    /// Resolved permission keys of a role, sorted.
    pub async fn permissions_for_role(
        &self,
        role_id: Uuid,
        scope: &TenantScope,
    ) -> Result<Vec<String>, IdentityError> {
        let role = self.load_role(role_id).await?;
        self.resolve(&role, scope).await
    }

    async fn resolve(&self, role: &Role, scope: &TenantScope) -> Result<Vec<String>, IdentityError> {
        let key = cache_key(role, scope);

        match self.cache.get(&key).await {
            Ok(Some(cached)) => match serde_json::from_str::<Vec<String>>(&cached) {
                Ok(permissions) => {
                    tracing::debug!(key = %key, "Permission cache hit");
                    return Ok(permissions);
                }
                Err(e) => tracing::warn!(key = %key, error = %e, "Discarding malformed permission cache entry"),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(key = %key, error = %e, "Permission cache read failed"),
        }

        let permissions = self.load_from_store(role, scope).await?;

        match serde_json::to_string(&permissions) {
            Ok(encoded) => {
                if let Err(e) = self.cache.set_ex(&key, &encoded, self.ttl_secs).await {
                    tracing::warn!(key = %key, error = %e, "Permission cache write failed");
                }
            }
            Err(e) => tracing::warn!(key = %key, error = %e, "Failed to encode permissions"),
        }

        Ok(permissions)
    }

    /// Role rows, then bundles targeting the role, then bundles targeting the plan.
    async fn load_from_store(
        &self,
        role: &Role,
        scope: &TenantScope,
    ) -> Result<Vec<String>, IdentityError> {
        let mut permissions: BTreeSet<String> = self
            .store
            .role_permissions(role.role_id)
            .await?
            .into_iter()
            .collect();

        let plan_id = role.plan_id.unwrap_or(scope.plan_id);
        for target in [BundleTarget::Role(role.role_id), BundleTarget::Plan(plan_id)] {
            for bundle in self.store.bundles_for(target).await? {
                permissions.extend(bundle.permissions);
            }
        }

        Ok(permissions.into_iter().collect())
    }

    /// Union of the permissions of every role the user holds.
    pub async fn permissions_for_user(
        &self,
        user_id: Uuid,
        scope: &TenantScope,
    ) -> Result<Vec<String>, IdentityError> {
        let mut permissions = BTreeSet::new();
        for role in self.store.user_roles(user_id).await? {
            permissions.extend(self.resolve(&role, scope).await?);
        }
        Ok(permissions.into_iter().collect())
    }

    pub async fn has_permission(
        &self,
        user_id: Uuid,
        scope: &TenantScope,
        permission: &str,
    ) -> Result<bool, IdentityError> {
        Ok(self
            .permissions_for_user(user_id, scope)
            .await?
            .iter()
            .any(|p| p == permission))
    }

    pub async fn invalidate(&self, role: &Role, scope: &TenantScope) {
        let key = cache_key(role, scope);
        if let Err(e) = self.cache.delete(&[key.clone()]).await {
            tracing::warn!(key = %key, error = %e, "Permission cache invalidation failed");
        }
    }
}

/// Tenant-facing role administration.
#[derive(Clone)]
pub struct RoleAssignmentService {
    store: Arc<dyn IdentityStore>,
    permissions: PermissionCache,
    audit: Arc<dyn AuditSink>,
}

impl RoleAssignmentService {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        permissions: PermissionCache,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            permissions,
            audit,
        }
    }

    async fn load_role(&self, role_id: Uuid) -> Result<Role, IdentityError> {
        self.store
            .find_role(role_id)
            .await?
            .ok_or(IdentityError::RoleNotFound(role_id))
    }

    /// Clone a shared role into the tenant. Returns the tenant's existing
    /// clone when there already is one.
    #[tracing::instrument(skip(self), fields(tenant_id = %scope.tenant_id))]
    pub async fn clone_role(&self, role_id: Uuid, scope: &TenantScope) -> Result<Role, IdentityError> {
        let source = self.load_role(role_id).await?;
        if !source.asset_type.is_shared() {
            return Err(IdentityError::Validation(
                "only shared roles can be cloned".to_string(),
            ));
        }
        ensure_usable(&source, scope)?;

        if let Some(existing) = self
            .store
            .find_tenant_clone(scope.tenant_id, source.role_id)
            .await?
        {
            return Ok(existing);
        }

        let mut permissions: BTreeSet<String> = self
            .store
            .role_permissions(source.role_id)
            .await?
            .into_iter()
            .collect();
        for bundle in self.store.bundles_for(BundleTarget::Role(source.role_id)).await? {
            permissions.extend(bundle.permissions);
        }
        let permissions: Vec<String> = permissions.into_iter().collect();

        let clone = source.clone_for_tenant(scope.tenant_id);
        self.store.insert_role(&clone, &permissions).await?;

        tracing::info!(source_role_id = %source.role_id, role_id = %clone.role_id, slug = %clone.slug, "Role cloned for tenant");
        self.audit.record(
            AuditEvent::new(AuditEventType::RoleCloned)
                .tenant(scope.tenant_id)
                .data(serde_json::json!({
                    "source_role_id": source.role_id,
                    "role_id": clone.role_id,
                    "slug": clone.slug,
                })),
        );

        Ok(clone)
    }

    /// Replace a role's permissions for the tenant. Shared roles are cloned
    /// first and the clone is changed instead. Returns the role that changed.
    #[tracing::instrument(skip(self, permissions), fields(tenant_id = %scope.tenant_id))]
    pub async fn update_role_permissions(
        &self,
        role_id: Uuid,
        scope: &TenantScope,
        permissions: &[String],
    ) -> Result<Role, IdentityError> {
        let role = self.load_role(role_id).await?;
        ensure_usable(&role, scope)?;

        let target = if role.asset_type.is_shared() {
            self.clone_role(role.role_id, scope).await?
        } else {
            role
        };

        let permissions: Vec<String> = permissions
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        self.store
            .replace_role_permissions(target.role_id, &permissions)
            .await?;
        self.permissions.invalidate(&target, scope).await;

        self.audit.record(
            AuditEvent::new(AuditEventType::RolePermissionsUpdated)
                .tenant(scope.tenant_id)
                .data(serde_json::json!({
                    "role_id": target.role_id,
                    "requested_role_id": role_id,
                    "permissions": permissions.len(),
                })),
        );

        Ok(target)
    }

    /// Record the tenant's default role for a user type. Existing
    /// assignments are left alone.
    pub async fn set_default_role(
        &self,
        scope: &TenantScope,
        user_type: UserType,
        role_id: Uuid,
    ) -> Result<TenantRoleDefaultConfig, IdentityError> {
        let role = self.load_role(role_id).await?;
        ensure_usable(&role, scope)?;

        let previous = self
            .store
            .find_default_config(scope.tenant_id, user_type)
            .await?
            .map(|c| c.default_role_id);

        let config = TenantRoleDefaultConfig {
            tenant_id: scope.tenant_id,
            user_type,
            default_role_id: role.role_id,
            previous_role_id: previous,
            is_system_role: role.asset_type.is_shared(),
            last_changed_at: Utc::now(),
        };
        self.store.upsert_default_config(&config).await?;

        tracing::info!(tenant_id = %scope.tenant_id, user_type = %user_type, role_id = %role.role_id, "Default role changed");
        self.audit.record(
            AuditEvent::new(AuditEventType::DefaultRoleChanged)
                .tenant(scope.tenant_id)
                .data(serde_json::json!({
                    "user_type": user_type.as_str(),
                    "role_id": role.role_id,
                    "previous_role_id": previous,
                })),
        );

        Ok(config)
    }

    async fn resolve_default(
        &self,
        scope: &TenantScope,
        user_type: UserType,
    ) -> Result<(Role, AssignmentType), IdentityError> {
        if let Some(config) = self
            .store
            .find_default_config(scope.tenant_id, user_type)
            .await?
        {
            let role = self.load_role(config.default_role_id).await?;
            return Ok((role, AssignmentType::CustomDefault));
        }

        let role = self
            .store
            .find_system_role_by_slug(user_type.as_str())
            .await?
            .ok_or_else(|| {
                IdentityError::Validation(format!("no default role for user type {}", user_type))
            })?;
        Ok((role, AssignmentType::SystemDefault))
    }

    /// Configured default, else the system role named after the user type.
    pub async fn default_role_for(
        &self,
        scope: &TenantScope,
        user_type: UserType,
    ) -> Result<Role, IdentityError> {
        self.resolve_default(scope, user_type)
            .await
            .map(|(role, _)| role)
    }

    pub async fn assign_default_role(
        &self,
        scope: &TenantScope,
        user_id: Uuid,
        user_type: UserType,
    ) -> Result<UserRoleAssignment, IdentityError> {
        let (role, assignment_type) = self.resolve_default(scope, user_type).await?;
        let assignment =
            UserRoleAssignment::new(scope.tenant_id, user_id, user_type, role.role_id, assignment_type);
        self.store.insert_assignment(&assignment).await?;
        Ok(assignment)
    }

    pub async fn assign_explicit_role(
        &self,
        scope: &TenantScope,
        user_id: Uuid,
        user_type: UserType,
        role_id: Uuid,
    ) -> Result<UserRoleAssignment, IdentityError> {
        let role = self.load_role(role_id).await?;
        ensure_usable(&role, scope)?;

        let assignment = UserRoleAssignment::new(
            scope.tenant_id,
            user_id,
            user_type,
            role.role_id,
            AssignmentType::Explicit,
        );
        self.store.insert_assignment(&assignment).await?;
        Ok(assignment)
    }

    /// Move every non-explicit assignment of `user_type` from `old_role_id`
    /// to `new_role_id`. Returns how many moved.
    #[tracing::instrument(skip(self), fields(tenant_id = %scope.tenant_id))]
    pub async fn migrate_users_to_role(
        &self,
        scope: &TenantScope,
        user_type: UserType,
        old_role_id: Uuid,
        new_role_id: Uuid,
    ) -> Result<u64, IdentityError> {
        let new_role = self.load_role(new_role_id).await?;
        ensure_usable(&new_role, scope)?;

        let moved = self
            .store
            .migrate_assignments(scope.tenant_id, user_type, old_role_id, new_role_id)
            .await?;

        tracing::info!(old_role_id = %old_role_id, new_role_id = %new_role_id, moved, "Role assignments migrated");
        self.audit.record(
            AuditEvent::new(AuditEventType::RoleAssignmentsMigrated)
                .tenant(scope.tenant_id)
                .data(serde_json::json!({
                    "user_type": user_type.as_str(),
                    "old_role_id": old_role_id,
                    "new_role_id": new_role_id,
                    "moved": moved,
                })),
        );

        Ok(moved)
    }

    /// The role followed by each role it was cloned from. Stops at a missing
    /// role or one already visited.
    pub async fn role_lineage(&self, role_id: Uuid) -> Result<Vec<Role>, IdentityError> {
        let mut lineage = Vec::new();
        let mut visited = HashSet::new();
        let mut next = Some(role_id);

        while let Some(id) = next {
            if !visited.insert(id) {
                tracing::warn!(role_id = %id, "Cycle in role lineage");
                break;
            }
            let Some(role) = self.store.find_role(id).await? else {
                break;
            };
            next = role.source_role_id;
            lineage.push(role);
        }

        Ok(lineage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AssetType;

    #[test]
    fn test_shared_roles_keyed_by_plan() {
        let plan = Uuid::new_v4();
        let scope = TenantScope::new(Uuid::new_v4(), plan);
        let role = Role::system("teacher", "Teacher", AssetType::Public, None);

        assert_eq!(
            cache_key(&role, &scope),
            format!("plan:{}:role:teacher:permissions", plan)
        );
    }

    #[test]
    fn test_shared_role_prefers_own_plan() {
        let own_plan = Uuid::new_v4();
        let scope = TenantScope::new(Uuid::new_v4(), Uuid::new_v4());
        let role = Role::system("viewer", "Viewer", AssetType::Readonly, Some(own_plan));

        assert_eq!(
            cache_key(&role, &scope),
            format!("plan:{}:role:viewer:permissions", own_plan)
        );
    }

    #[test]
    fn test_custom_roles_keyed_by_tenant() {
        let tenant = Uuid::new_v4();
        let scope = TenantScope::new(tenant, Uuid::new_v4());
        let role = Role::custom(tenant, "librarian", "Librarian");

        assert_eq!(
            cache_key(&role, &scope),
            format!("tenant:{}:role:librarian:permissions", tenant)
        );
    }

    #[test]
    fn test_custom_role_of_other_tenant_is_not_usable() {
        let scope = TenantScope::new(Uuid::new_v4(), Uuid::new_v4());
        let role = Role::custom(Uuid::new_v4(), "librarian", "Librarian");

        assert!(matches!(
            ensure_usable(&role, &scope),
            Err(IdentityError::Forbidden(_))
        ));
    }
}
