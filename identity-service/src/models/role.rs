//! Role model - asset-classified roles, permission bundles and default-role policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

use super::UserType;

/// Asset classification of a role. Drives both mutability and cache scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    /// Shared template, cloned into `Custom` on first write.
    Public,
    /// Shared template that is never mutated.
    Readonly,
    /// Tenant-private.
    Custom,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::Public => "public",
            AssetType::Readonly => "readonly",
            AssetType::Custom => "custom",
        }
    }

    /// Shared roles are cached per plan, private ones per tenant.
    pub fn is_shared(&self) -> bool {
        matches!(self, AssetType::Public | AssetType::Readonly)
    }
}

/// How a user came to hold a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AssignmentType {
    SystemDefault,
    CustomDefault,
    Explicit,
}

impl AssignmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentType::SystemDefault => "system_default",
            AssignmentType::CustomDefault => "custom_default",
            AssignmentType::Explicit => "explicit",
        }
    }
}

/// Role entity. `tenant_id` is set only for custom roles.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Role {
    pub role_id: Uuid,
    pub slug: String,
    pub name: String,
    pub asset_type: AssetType,
    pub tenant_id: Option<Uuid>,
    pub plan_id: Option<Uuid>,
    /// Role this one was cloned from (self foreign key).
    pub source_role_id: Option<Uuid>,
    pub requires_mfa: bool,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

impl Role {
    /// Create a shared system role.
    pub fn system(slug: &str, name: &str, asset_type: AssetType, plan_id: Option<Uuid>) -> Self {
        Self {
            role_id: Uuid::new_v4(),
            slug: slug.to_string(),
            name: name.to_string(),
            asset_type,
            tenant_id: None,
            plan_id,
            source_role_id: None,
            requires_mfa: false,
            is_admin: false,
            created_at: Utc::now(),
        }
    }

    /// Create a tenant-private role.
    pub fn custom(tenant_id: Uuid, slug: &str, name: &str) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            ..Self::system(slug, name, AssetType::Custom, None)
        }
    }

    /// A tenant-private copy pointing back at this role.
    pub fn clone_for_tenant(&self, tenant_id: Uuid) -> Self {
        Self {
            role_id: Uuid::new_v4(),
            slug: self.slug.clone(),
            name: self.name.clone(),
            asset_type: AssetType::Custom,
            tenant_id: Some(tenant_id),
            plan_id: self.plan_id,
            source_role_id: Some(self.role_id),
            requires_mfa: self.requires_mfa,
            is_admin: self.is_admin,
            created_at: Utc::now(),
        }
    }

    pub fn with_mfa_required(mut self) -> Self {
        self.requires_mfa = true;
        self
    }

    pub fn with_admin(mut self) -> Self {
        self.is_admin = true;
        self
    }
}

/// Tenant and subscription plan a permission lookup runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantScope {
    pub tenant_id: Uuid,
    pub plan_id: Uuid,
}

impl TenantScope {
    pub fn new(tenant_id: Uuid, plan_id: Uuid) -> Self {
        Self { tenant_id, plan_id }
    }
}

/// What a permission bundle attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id")]
pub enum BundleTarget {
    Role(Uuid),
    Plan(Uuid),
}

impl BundleTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            BundleTarget::Role(_) => "role",
            BundleTarget::Plan(_) => "plan",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            BundleTarget::Role(id) | BundleTarget::Plan(id) => *id,
        }
    }

    pub fn from_parts(kind: &str, id: Uuid) -> Option<Self> {
        match kind {
            "role" => Some(BundleTarget::Role(id)),
            "plan" => Some(BundleTarget::Plan(id)),
            _ => None,
        }
    }
}

/// Named set of permissions granted to every holder of the target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionBundle {
    pub bundle_id: Uuid,
    pub name: String,
    pub target: BundleTarget,
    pub permissions: Vec<String>,
}

impl PermissionBundle {
    pub fn new(name: &str, target: BundleTarget, permissions: Vec<String>) -> Self {
        Self {
            bundle_id: Uuid::new_v4(),
            name: name.to_string(),
            target,
            permissions,
        }
    }
}

/// A user's hold on a role within a tenant.
#[derive(Debug, Clone, Serialize, FromRow, ToSchema)]
pub struct UserRoleAssignment {
    pub assignment_id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub user_type: UserType,
    pub role_id: Uuid,
    pub assignment_type: AssignmentType,
    /// Previous role when the assignment was moved by a migration.
    pub source_role_id: Option<Uuid>,
    pub assigned_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRoleAssignment {
    pub fn new(
        tenant_id: Uuid,
        user_id: Uuid,
        user_type: UserType,
        role_id: Uuid,
        assignment_type: AssignmentType,
    ) -> Self {
        let now = Utc::now();
        Self {
            assignment_id: Uuid::new_v4(),
            tenant_id,
            user_id,
            user_type,
            role_id,
            assignment_type,
            source_role_id: None,
            assigned_at: now,
            updated_at: now,
        }
    }
}

/// Per-tenant default role for one user type.
#[derive(Debug, Clone, Serialize, FromRow, ToSchema)]
pub struct TenantRoleDefaultConfig {
    pub tenant_id: Uuid,
    pub user_type: UserType,
    pub default_role_id: Uuid,
    pub previous_role_id: Option<Uuid>,
    pub is_system_role: bool,
    pub last_changed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_for_tenant_points_back_at_source() {
        let plan = Uuid::new_v4();
        let tenant = Uuid::new_v4();
        let role = Role::system("teacher", "Teacher", AssetType::Public, Some(plan)).with_mfa_required();

        let clone = role.clone_for_tenant(tenant);

        assert_ne!(clone.role_id, role.role_id);
        assert_eq!(clone.slug, role.slug);
        assert_eq!(clone.asset_type, AssetType::Custom);
        assert_eq!(clone.tenant_id, Some(tenant));
        assert_eq!(clone.source_role_id, Some(role.role_id));
        assert!(clone.requires_mfa);
    }

    #[test]
    fn test_bundle_target_serializes_as_tagged_union() {
        let id = Uuid::new_v4();
        let json = serde_json::to_value(BundleTarget::Plan(id)).unwrap();

        assert_eq!(json["kind"], "Plan");
        assert_eq!(json["id"], id.to_string());
        assert_eq!(BundleTarget::from_parts("role", id), Some(BundleTarget::Role(id)));
        assert_eq!(BundleTarget::from_parts("org", id), None);
    }

    #[test]
    fn test_asset_type_sharing() {
        assert!(AssetType::Public.is_shared());
        assert!(AssetType::Readonly.is_shared());
        assert!(!AssetType::Custom.is_shared());
    }
}
