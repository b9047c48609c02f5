//! HTTP surface: routing, status mapping, bearer auth and throttling.

mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use chrono::{Duration, Utc};
use common::{TestApp, TEST_PASSWORD, TEST_USER_AGENT};
use http_body_util::BodyExt;
use identity_service::{
    build_router,
    models::{ProviderKind, UserType},
    services::store::SessionStore,
};
use serde_json::{json, Value};
use tower::util::ServiceExt;

async fn router(app: &TestApp) -> Router {
    build_router(app.state.clone())
        .await
        .expect("Failed to build router")
}

fn post_json(uri: &str, ip: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::USER_AGENT, TEST_USER_AGENT)
        .header("x-forwarded-for", ip)
        .header("x-device-id", "device-laptop")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn authed(method: &str, uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn login_body(app: &TestApp, email: &str, password: &str) -> Value {
    json!({
        "tenant_id": app.scope.tenant_id,
        "email": email,
        "password": password,
    })
}

#[tokio::test]
async fn test_health_without_database() {
    let app = TestApp::spawn().await;

    let response = router(&app)
        .await
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["cache"], "ok");
}

#[tokio::test]
async fn test_register_then_login() {
    let app = TestApp::spawn().await;
    let router = router(&app).await;

    let response = router
        .clone()
        .oneshot(post_json(
            "/auth/register",
            "192.0.2.1",
            json!({
                "tenant_id": app.scope.tenant_id,
                "plan_id": app.scope.plan_id,
                "email": "mia@school.example.edu",
                "password": TEST_PASSWORD,
                "user_type": "teacher",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let user = json_body(response).await;
    assert_eq!(user["email"], "mia@school.example.edu");
    assert!(user.get("password_hash").is_none());

    let response = router
        .oneshot(post_json(
            "/auth/login",
            "192.0.2.1",
            login_body(&app, "mia@school.example.edu", TEST_PASSWORD),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "no-store"
    );
    let body = json_body(response).await;
    assert_eq!(body["tokens"]["token_type"], "Bearer");
    assert_eq!(body["session"]["is_current"], true);
}

#[tokio::test]
async fn test_duplicate_registration_conflicts() {
    let app = TestApp::spawn().await;
    app.register("ned@school.example.edu", UserType::Student).await;

    let response = router(&app)
        .await
        .oneshot(post_json(
            "/auth/register",
            "192.0.2.2",
            json!({
                "tenant_id": app.scope.tenant_id,
                "plan_id": app.scope.plan_id,
                "email": "ned@school.example.edu",
                "password": TEST_PASSWORD,
                "user_type": "student",
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(response).await["code"], "EMAIL_ALREADY_REGISTERED");
}

#[tokio::test]
async fn test_invalid_email_rejected() {
    let app = TestApp::spawn().await;

    let response = router(&app)
        .await
        .oneshot(post_json(
            "/auth/login",
            "192.0.2.3",
            json!({ "email": "not-an-email", "password": "x" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_lockout_returns_retry_after() {
    let app = TestApp::spawn().await;
    app.register("oli@school.example.edu", UserType::Student).await;
    let router = router(&app).await;

    let mut last = None;
    for _ in 0..5 {
        last = Some(
            router
                .clone()
                .oneshot(post_json(
                    "/auth/login",
                    "192.0.2.4",
                    login_body(&app, "oli@school.example.edu", "wrong-password"),
                ))
                .await
                .unwrap(),
        );
    }
    let response = last.unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "600");
    let body = json_body(response).await;
    assert_eq!(body["code"], "ACCOUNT_LOCKED");
    assert_eq!(body["retry_after"], 600);
}

#[tokio::test]
async fn test_sso_account_gets_forbidden_with_provider() {
    let app = TestApp::spawn().await;
    app.register_federated("pia@school.example.edu", ProviderKind::Google)
        .await;

    let response = router(&app)
        .await
        .oneshot(post_json(
            "/auth/login",
            "192.0.2.5",
            login_body(&app, "pia@school.example.edu", TEST_PASSWORD),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["code"], "SSO_REQUIRED:google");
}

#[tokio::test]
async fn test_federated_login_endpoint() {
    let app = TestApp::spawn().await;
    app.register_federated("quin@school.example.edu", ProviderKind::Google)
        .await;
    let router = router(&app).await;

    let response = router
        .clone()
        .oneshot(post_json(
            "/auth/login/google",
            "192.0.2.6",
            json!({
                "tenant_id": app.scope.tenant_id,
                "email": "quin@school.example.edu",
                "assertion": "valid:quin@school.example.edu",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let token = body["tokens"]["access_token"].as_str().unwrap().to_string();
    let claims = app.state.tokens.verify_access_token(&token).unwrap();
    assert_eq!(claims.idp, ProviderKind::Google);

    let response = router
        .oneshot(post_json(
            "/auth/login/saml",
            "192.0.2.6",
            json!({
                "tenant_id": app.scope.tenant_id,
                "email": "quin@school.example.edu",
                "assertion": "anything",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        json_body(response).await["code"],
        "PROVIDER_NOT_CONFIGURED:saml"
    );
}

#[tokio::test]
async fn test_protected_routes_need_live_session() {
    let app = TestApp::spawn().await;
    app.register("ray@school.example.edu", UserType::Teacher).await;
    let router = router(&app).await;

    let response = router
        .clone()
        .oneshot(Request::get("/auth/sessions").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let login = app
        .login_ok("ray@school.example.edu", common::device("192.0.2.7"))
        .await;
    let token = login.tokens.access_token;

    let response = router
        .clone()
        .oneshot(authed("GET", "/auth/sessions", &token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["sessions"].as_array().unwrap().len(), 1);

    let response = router
        .clone()
        .oneshot(authed("POST", "/auth/logout", &token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Same access token, revoked session
    let response = router
        .oneshot(authed("GET", "/auth/sessions", &token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["code"], "SESSION_REVOKED");
}

#[tokio::test]
async fn test_authenticated_request_refreshes_activity() {
    let app = TestApp::spawn().await;
    app.register("rue@school.example.edu", UserType::Teacher).await;
    let login = app
        .login_ok("rue@school.example.edu", common::device("192.0.2.9"))
        .await;
    let session_id = login.session.session_id;
    app.store
        .touch_session(session_id, Utc::now() - Duration::days(10))
        .await
        .unwrap();

    let response = router(&app)
        .await
        .oneshot(authed("GET", "/auth/sessions", &login.tokens.access_token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let session = app.store.find_session(session_id).await.unwrap().unwrap();
    assert!(Utc::now() - session.last_active_at < Duration::minutes(1));
}

#[tokio::test]
async fn test_refresh_reuse_over_http() {
    let app = TestApp::spawn().await;
    app.register("sam@school.example.edu", UserType::Student).await;
    let login = app
        .login_ok("sam@school.example.edu", common::device("192.0.2.8"))
        .await;
    let router = router(&app).await;
    let refresh = json!({ "refresh_token": login.tokens.refresh_token });

    let response = router
        .clone()
        .oneshot(post_json("/auth/refresh", "192.0.2.8", refresh.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .oneshot(post_json("/auth/refresh", "192.0.2.8", refresh))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["code"], "TOKEN_REUSE_DETECTED");
}

#[tokio::test]
async fn test_mfa_flow_over_http() {
    let app = TestApp::spawn().await;
    let user = app.register("tia@school.example.edu", UserType::Teacher).await;
    app.enable_mfa(user.user_id).await;
    let router = router(&app).await;

    let response = router
        .clone()
        .oneshot(post_json(
            "/auth/login",
            "192.0.2.9",
            login_body(&app, "tia@school.example.edu", TEST_PASSWORD),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["mfaPending"], true);
    let mfa_token = body["mfaToken"].as_str().unwrap().to_string();

    let code = app.totp_code(user.user_id).await;
    let response = router
        .oneshot(post_json(
            "/auth/mfa/verify",
            "192.0.2.9",
            json!({ "mfa_token": mfa_token, "code": code }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["session"]["mfa_verified"], true);
}

#[tokio::test]
async fn test_ip_throttle_on_login() {
    let app = TestApp::spawn_with(|settings| {
        settings.rate_limit.login_attempts = 2;
        settings.rate_limit.login_window_seconds = 60;
    })
    .await;
    let router = router(&app).await;

    for _ in 0..2 {
        let response = router
            .clone()
            .oneshot(post_json(
                "/auth/login",
                "192.0.2.10",
                login_body(&app, "nobody@school.example.edu", "whatever"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let response = router
        .clone()
        .oneshot(post_json(
            "/auth/login",
            "192.0.2.10",
            login_body(&app, "nobody@school.example.edu", "whatever"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().get(header::RETRY_AFTER).is_some());

    // Other addresses have their own budget
    let response = router
        .oneshot(post_json(
            "/auth/login",
            "192.0.2.11",
            login_body(&app, "nobody@school.example.edu", "whatever"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_openapi_document_served() {
    let app = TestApp::spawn().await;

    let response = router(&app)
        .await
        .oneshot(
            Request::get("/.well-known/openapi.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert!(body["paths"]["/auth/login"].is_object());
    assert!(body["paths"]["/auth/mfa/verify"].is_object());
}
