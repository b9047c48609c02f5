//! Refresh token rotation and reuse detection.

mod common;

use common::{device, TestApp};
use identity_service::{
    models::{AuditEventType, RevocationReason, UserType},
    services::{store::SessionStore, IdentityError},
};

#[tokio::test]
async fn test_rotation_returns_new_pair() {
    let app = TestApp::spawn().await;
    app.register("ana@school.example.edu", UserType::Teacher).await;
    let login = app
        .login_ok("ana@school.example.edu", device("192.0.2.10"))
        .await;

    let rotated = app
        .state
        .tokens
        .rotate_refresh_token(&login.tokens.refresh_token)
        .await
        .expect("Rotation should succeed");

    assert_ne!(rotated.refresh_token, login.tokens.refresh_token);
    let claims = app
        .state
        .tokens
        .verify_access_token(&rotated.access_token)
        .unwrap();
    assert_eq!(claims.sid, login.session.session_id);
    assert_eq!(app.audit.count(AuditEventType::TokenRefreshed), 1);
}

#[tokio::test]
async fn test_replayed_token_revokes_session() {
    let app = TestApp::spawn().await;
    app.register("ben@school.example.edu", UserType::Teacher).await;
    let login = app
        .login_ok("ben@school.example.edu", device("192.0.2.20"))
        .await;

    let rotated = app
        .state
        .tokens
        .rotate_refresh_token(&login.tokens.refresh_token)
        .await
        .unwrap();

    let err = app
        .state
        .tokens
        .rotate_refresh_token(&login.tokens.refresh_token)
        .await
        .unwrap_err();
    assert!(matches!(err, IdentityError::TokenReuseDetected));

    let session = app
        .store
        .find_session(login.session.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.revoked_reason, Some(RevocationReason::TokenReuse));
    assert!(app
        .state
        .sessions
        .is_revoked_fast(login.session.session_id)
        .await
        .unwrap());
    let err = app
        .state
        .sessions
        .validate_session(login.session.session_id)
        .await
        .unwrap_err();
    assert!(matches!(err, IdentityError::SessionRevoked));

    // The legitimate successor dies with the session
    let err = app
        .state
        .tokens
        .rotate_refresh_token(&rotated.refresh_token)
        .await
        .unwrap_err();
    assert!(matches!(err, IdentityError::TokenReuseDetected));
}

#[tokio::test]
async fn test_unknown_token_is_invalid() {
    let app = TestApp::spawn().await;

    let err = app
        .state
        .tokens
        .rotate_refresh_token("not-a-real-token")
        .await
        .unwrap_err();

    assert!(matches!(err, IdentityError::InvalidToken));
}

#[tokio::test]
async fn test_logout_invalidates_refresh_token() {
    let app = TestApp::spawn().await;
    let user = app.register("cal@school.example.edu", UserType::Student).await;
    let login = app
        .login_ok("cal@school.example.edu", device("192.0.2.30"))
        .await;

    app.state
        .identity
        .logout(user.user_id, login.session.session_id)
        .await
        .unwrap();

    let err = app
        .state
        .tokens
        .validate_refresh_token(&login.tokens.refresh_token)
        .await
        .unwrap_err();
    // Tokens of a revoked session are revoked too, so presenting one is reuse
    assert!(matches!(err, IdentityError::TokenReuseDetected));
}
