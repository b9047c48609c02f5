//! Permission resolution through the cache, scoped by plan or tenant.

mod common;

use common::TestApp;
use identity_service::{
    models::{AssetType, BundleTarget, PermissionBundle, Role, TenantScope, UserType},
    services::{permissions::cache_key, store::RoleStore, CacheStore, IdentityError},
};
use uuid::Uuid;

#[tokio::test]
async fn test_user_permissions_union_roles_and_bundles() {
    let app = TestApp::spawn().await;
    let user = app.register("ari@school.example.edu", UserType::Teacher).await;
    let teacher = app.system_role("teacher").await;

    app.store
        .insert_bundle(&PermissionBundle::new(
            "gradebook",
            BundleTarget::Role(teacher.role_id),
            vec!["grades:write".to_string(), "teacher:read".to_string()],
        ))
        .await
        .unwrap();
    app.store
        .insert_bundle(&PermissionBundle::new(
            "premium",
            BundleTarget::Plan(app.scope.plan_id),
            vec!["analytics:read".to_string()],
        ))
        .await
        .unwrap();

    let permissions = app
        .state
        .permissions
        .permissions_for_user(user.user_id, &app.scope)
        .await
        .unwrap();

    assert_eq!(
        permissions,
        vec![
            "analytics:read".to_string(),
            "grades:write".to_string(),
            "teacher:read".to_string(),
        ]
    );
    assert!(app
        .state
        .permissions
        .has_permission(user.user_id, &app.scope, "grades:write")
        .await
        .unwrap());
    assert!(!app
        .state
        .permissions
        .has_permission(user.user_id, &app.scope, "users:manage")
        .await
        .unwrap());
}

#[tokio::test]
async fn test_shared_role_cached_per_plan() {
    let app = TestApp::spawn().await;
    let teacher = app.system_role("teacher").await;
    let other_tenant = TenantScope::new(Uuid::new_v4(), app.scope.plan_id);

    app.state
        .permissions
        .permissions_for_role(teacher.role_id, &app.scope)
        .await
        .unwrap();

    let key = cache_key(&teacher, &other_tenant);
    assert_eq!(key, cache_key(&teacher, &app.scope));
    assert!(key.starts_with(&format!("plan:{}:", app.scope.plan_id)));
    assert!(app.cache.exists(&key).await.unwrap());
}

#[tokio::test]
async fn test_custom_role_cached_per_tenant() {
    let app = TestApp::spawn().await;
    let role = Role::custom(app.scope.tenant_id, "librarian", "Librarian");
    app.store
        .insert_role(&role, &["books:lend".to_string()])
        .await
        .unwrap();

    let permissions = app
        .state
        .permissions
        .permissions_for_role(role.role_id, &app.scope)
        .await
        .unwrap();

    assert_eq!(permissions, vec!["books:lend".to_string()]);
    let key = cache_key(&role, &app.scope);
    assert_eq!(
        key,
        format!("tenant:{}:role:librarian:permissions", app.scope.tenant_id)
    );
    assert!(app.cache.exists(&key).await.unwrap());
}

#[tokio::test]
async fn test_cached_entry_served_until_invalidated() {
    let app = TestApp::spawn().await;
    let role = Role::custom(app.scope.tenant_id, "coach", "Coach");
    app.store
        .insert_role(&role, &["teams:read".to_string()])
        .await
        .unwrap();

    app.state
        .permissions
        .permissions_for_role(role.role_id, &app.scope)
        .await
        .unwrap();
    app.store
        .replace_role_permissions(role.role_id, &["teams:write".to_string()])
        .await
        .unwrap();

    let stale = app
        .state
        .permissions
        .permissions_for_role(role.role_id, &app.scope)
        .await
        .unwrap();
    assert_eq!(stale, vec!["teams:read".to_string()]);

    app.state.permissions.invalidate(&role, &app.scope).await;
    let fresh = app
        .state
        .permissions
        .permissions_for_role(role.role_id, &app.scope)
        .await
        .unwrap();
    assert_eq!(fresh, vec!["teams:write".to_string()]);
}

#[tokio::test]
async fn test_cache_outage_reads_through_to_store() {
    let app = TestApp::spawn().await;
    let teacher = app.system_role("teacher").await;
    app.cache.set_unavailable(true);

    let permissions = app
        .state
        .permissions
        .permissions_for_role(teacher.role_id, &app.scope)
        .await
        .unwrap();

    assert_eq!(permissions, vec!["teacher:read".to_string()]);
}

#[tokio::test]
async fn test_update_through_service_invalidates() {
    let app = TestApp::spawn().await;
    let role = Role::custom(app.scope.tenant_id, "nurse", "Nurse");
    app.store
        .insert_role(&role, &["health:read".to_string()])
        .await
        .unwrap();
    app.state
        .permissions
        .permissions_for_role(role.role_id, &app.scope)
        .await
        .unwrap();

    app.state
        .roles
        .update_role_permissions(
            role.role_id,
            &app.scope,
            &["health:write".to_string(), " health:read ".to_string()],
        )
        .await
        .unwrap();

    let permissions = app
        .state
        .permissions
        .permissions_for_role(role.role_id, &app.scope)
        .await
        .unwrap();
    assert_eq!(
        permissions,
        vec!["health:read".to_string(), "health:write".to_string()]
    );
}

#[tokio::test]
async fn test_role_of_another_plan_is_refused() {
    let app = TestApp::spawn().await;
    let premium = Role::system("mentor", "Mentor", AssetType::Public, Some(Uuid::new_v4()));
    app.store.insert_role(&premium, &[]).await.unwrap();

    let err = app
        .state
        .roles
        .clone_role(premium.role_id, &app.scope)
        .await
        .unwrap_err();

    assert!(matches!(err, IdentityError::Forbidden(_)));
}
