//! Password login: lockout escalation, SSO routing, MFA gating, device tracking.

mod common;

use std::time::Duration;

use common::{device, TestApp, TEST_PASSWORD};
use identity_service::{
    models::{AuditEventType, ProviderKind, Role, UserType},
    services::{store::RoleStore, IdentityError, LoginOutcome},
};

#[tokio::test]
async fn test_successful_login_issues_tokens() {
    let app = TestApp::spawn().await;
    let user = app.register("ada@school.example.edu", UserType::Teacher).await;

    let success = app
        .login_ok("ada@school.example.edu", device("203.0.113.10"))
        .await;

    assert_eq!(success.user.user_id, user.user_id);
    assert!(success.session.is_current);
    assert_eq!(success.tokens.token_type, "Bearer");

    let claims = app
        .state
        .tokens
        .verify_access_token(&success.tokens.access_token)
        .expect("Access token should verify");
    assert_eq!(claims.sub, user.user_id);
    assert_eq!(claims.sid, success.session.session_id);
    assert_eq!(claims.roles, vec!["teacher".to_string()]);
    assert_eq!(claims.idp, ProviderKind::Password);
    assert_eq!(app.audit.count(AuditEventType::LoginSucceeded), 1);
}

#[tokio::test]
async fn test_fifth_failure_locks_for_ten_minutes() {
    let app = TestApp::spawn().await;
    app.register("bo@school.example.edu", UserType::Student).await;
    let ip = "203.0.113.20";

    for _ in 0..4 {
        let err = app
            .login("bo@school.example.edu", "wrong-password", device(ip))
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::InvalidCredentials));
    }

    let err = app
        .login("bo@school.example.edu", "wrong-password", device(ip))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        IdentityError::AccountLocked {
            retry_after_secs: 600
        }
    ));

    // Correct password is refused while locked
    let err = app
        .login("bo@school.example.edu", TEST_PASSWORD, device(ip))
        .await
        .unwrap_err();
    match err {
        IdentityError::AccountLocked { retry_after_secs } => {
            assert!(retry_after_secs > 0 && retry_after_secs <= 600)
        }
        other => panic!("Expected lockout, got {:?}", other),
    }
    assert_eq!(app.audit.count(AuditEventType::AccountLocked), 1);
    assert_eq!(app.audit.count(AuditEventType::LoginBlocked), 1);
}

#[tokio::test]
async fn test_lockout_is_per_email_and_ip() {
    let app = TestApp::spawn().await;
    app.register("cy@school.example.edu", UserType::Student).await;

    for _ in 0..5 {
        let _ = app
            .login("cy@school.example.edu", "wrong-password", device("203.0.113.30"))
            .await;
    }

    // Same account from another address is unaffected
    app.login_ok("cy@school.example.edu", device("203.0.113.31"))
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_tenth_failure_escalates_to_one_hour() {
    let app = TestApp::spawn().await;
    app.register("di@school.example.edu", UserType::Student).await;
    let ip = "203.0.113.40";

    for _ in 0..5 {
        let _ = app
            .login("di@school.example.edu", "wrong-password", device(ip))
            .await;
    }

    // Wait out the first lock; the failure window is still open
    tokio::time::advance(Duration::from_secs(601)).await;

    for attempt in 6..=9 {
        let err = app
            .login("di@school.example.edu", "wrong-password", device(ip))
            .await
            .unwrap_err();
        // Thresholds 5..9 keep the ten minute lock
        assert!(
            matches!(err, IdentityError::AccountLocked { retry_after_secs: 600 }),
            "attempt {} returned {:?}",
            attempt,
            err
        );
        tokio::time::advance(Duration::from_secs(601)).await;
    }

    let err = app
        .login("di@school.example.edu", "wrong-password", device(ip))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        IdentityError::AccountLocked {
            retry_after_secs: 3600
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_failures_outside_window_are_forgotten() {
    let app = TestApp::spawn().await;
    app.register("ed@school.example.edu", UserType::Student).await;
    let ip = "203.0.113.50";

    for _ in 0..4 {
        let _ = app
            .login("ed@school.example.edu", "wrong-password", device(ip))
            .await;
    }

    tokio::time::advance(Duration::from_secs(15 * 60 + 1)).await;

    let err = app
        .login("ed@school.example.edu", "wrong-password", device(ip))
        .await
        .unwrap_err();
    assert!(matches!(err, IdentityError::InvalidCredentials));
}

#[tokio::test]
async fn test_success_clears_failure_counter() {
    let app = TestApp::spawn().await;
    app.register("fay@school.example.edu", UserType::Student).await;
    let ip = "203.0.113.60";

    for _ in 0..4 {
        let _ = app
            .login("fay@school.example.edu", "wrong-password", device(ip))
            .await;
    }
    app.login_ok("fay@school.example.edu", device(ip)).await;

    // Counter restarted: four more failures do not lock
    for _ in 0..4 {
        let err = app
            .login("fay@school.example.edu", "wrong-password", device(ip))
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::InvalidCredentials));
    }
}

#[tokio::test]
async fn test_unknown_email_is_indistinguishable() {
    let app = TestApp::spawn().await;

    let err = app
        .login("nobody@school.example.edu", TEST_PASSWORD, device("203.0.113.70"))
        .await
        .unwrap_err();

    assert!(matches!(err, IdentityError::InvalidCredentials));
}

#[tokio::test]
async fn test_unknown_email_costs_one_hash_comparison() {
    let app = TestApp::spawn().await;
    let before = app.state.passwords.hash_comparisons();

    app.login("nobody@school.example.edu", TEST_PASSWORD, device("203.0.113.71"))
        .await
        .unwrap_err();

    assert_eq!(app.state.passwords.hash_comparisons(), before + 1);
}

#[tokio::test]
async fn test_wrong_password_costs_one_hash_comparison() {
    let app = TestApp::spawn().await;
    app.register("fox@school.example.edu", UserType::Student).await;
    let before = app.state.passwords.hash_comparisons();

    let err = app
        .login("fox@school.example.edu", "wrong-password", device("203.0.113.72"))
        .await
        .unwrap_err();

    assert!(matches!(err, IdentityError::InvalidCredentials));
    assert_eq!(app.state.passwords.hash_comparisons(), before + 1);
}

#[tokio::test]
async fn test_locked_login_skips_hash_comparison() {
    let app = TestApp::spawn().await;
    app.register("gil@school.example.edu", UserType::Student).await;
    let ip = "203.0.113.73";

    for _ in 0..5 {
        app.login("gil@school.example.edu", "wrong-password", device(ip))
            .await
            .unwrap_err();
    }
    let before = app.state.passwords.hash_comparisons();

    let err = app
        .login("gil@school.example.edu", TEST_PASSWORD, device(ip))
        .await
        .unwrap_err();

    assert!(matches!(err, IdentityError::AccountLocked { .. }));
    assert_eq!(app.state.passwords.hash_comparisons(), before);
}

#[tokio::test]
async fn test_federated_account_requires_sso() {
    let app = TestApp::spawn().await;
    app.register_federated("gus@school.example.edu", ProviderKind::Google)
        .await;

    let err = app
        .login("gus@school.example.edu", TEST_PASSWORD, device("203.0.113.80"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "SSO_REQUIRED:google");
    assert_eq!(app.audit.count(AuditEventType::SsoRequired), 1);
}

#[tokio::test]
async fn test_federated_account_with_unregistered_provider() {
    let app = TestApp::spawn().await;
    app.register_federated("hal@school.example.edu", ProviderKind::Saml)
        .await;

    let err = app
        .login("hal@school.example.edu", TEST_PASSWORD, device("203.0.113.81"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "PROVIDER_NOT_CONFIGURED:saml");
}

#[tokio::test]
async fn test_role_requiring_mfa_blocks_unenrolled_user() {
    let app = TestApp::spawn().await;
    let strict = Role::custom(app.scope.tenant_id, "finance", "Finance").with_mfa_required();
    app.store
        .insert_role(&strict, &["ledger:write".to_string()])
        .await
        .unwrap();
    app.state
        .roles
        .set_default_role(&app.scope, UserType::Staff, strict.role_id)
        .await
        .unwrap();
    let user = app.register("ivy@school.example.edu", UserType::Staff).await;

    let err = app
        .login("ivy@school.example.edu", TEST_PASSWORD, device("203.0.113.90"))
        .await
        .unwrap_err();

    assert!(matches!(err, IdentityError::MfaSetupRequired));
    // The session opened for the attempt is not left usable
    let active = app
        .state
        .sessions
        .list_active_sessions(user.user_id)
        .await
        .unwrap();
    assert!(active.is_empty());
}

#[tokio::test]
async fn test_mfa_enabled_user_gets_challenge() {
    let app = TestApp::spawn().await;
    let user = app.register("jo@school.example.edu", UserType::Teacher).await;
    app.enable_mfa(user.user_id).await;

    let outcome = app
        .login("jo@school.example.edu", TEST_PASSWORD, device("203.0.113.95"))
        .await
        .unwrap();

    match outcome {
        LoginOutcome::MfaPending {
            mfa_token,
            expires_in,
        } => {
            assert!(!mfa_token.is_empty());
            assert_eq!(expires_in, 300);
        }
        LoginOutcome::Authenticated(_) => panic!("MFA step was skipped"),
    }
}

#[tokio::test]
async fn test_new_device_flagged_once() {
    let app = TestApp::spawn().await;
    app.register("kit@school.example.edu", UserType::Student).await;

    let first = app
        .login_ok("kit@school.example.edu", device("203.0.113.100"))
        .await;
    let second = app
        .login_ok("kit@school.example.edu", device("203.0.113.101"))
        .await;

    assert!(first.is_new_device);
    assert!(!second.is_new_device);
    assert_eq!(app.audit.count(AuditEventType::NewDeviceDetected), 1);
}

#[tokio::test]
async fn test_unlock_clears_lock() {
    let app = TestApp::spawn().await;
    let user = app.register("lu@school.example.edu", UserType::Student).await;
    let ip = "203.0.113.110";

    for _ in 0..5 {
        let _ = app
            .login("lu@school.example.edu", "wrong-password", device(ip))
            .await;
    }
    assert!(app
        .login("lu@school.example.edu", TEST_PASSWORD, device(ip))
        .await
        .is_err());

    app.state
        .identity
        .unlock_account("lu@school.example.edu", ip, Some(user.user_id))
        .await;

    app.login_ok("lu@school.example.edu", device(ip)).await;
    assert_eq!(app.audit.count(AuditEventType::AccountUnlocked), 1);
}
