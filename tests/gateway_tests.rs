//! End-to-end tests for the gateway pipeline.
//!
//! The full router runs over the in-memory KV store; sessions are seeded
//! directly through the session store (the IdP round trip itself is
//! covered by the `oidc` module tests).

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tower::ServiceExt;

use keyfront::abac::{Effect, Matcher, Operator, Policy, Rule, Target};
use keyfront::config::Config;
use keyfront::exchange::{
    ExchangeClaims, ExchangePolicy, GRANT_TYPE, ScopePolicy, SubjectMatch, TOKEN_TYPE_ACCESS,
};
use keyfront::gateway::{AppState, create_router, server::build_state};
use keyfront::kv::MemoryKv;
use keyfront::logout::LogoutPolicy;
use keyfront::session::{TokenMaterial, UserSession};

fn test_config() -> Config {
    let mut config = Config::default();
    config.session.secret = "test-session-secret".to_string();
    config.tokens.jwt_secret = "test-jwt-secret".to_string();
    config
}

fn test_state(config: Config) -> (Arc<AppState>, Router) {
    let state = build_state(config, Arc::new(MemoryKv::new()));
    let router = create_router(Arc::clone(&state));
    (state, router)
}

fn session(sub: &str, tenant: &str, roles: &[&str]) -> UserSession {
    UserSession {
        sub: sub.to_string(),
        tenant_id: tenant.to_string(),
        email: Some(format!("{sub}@example.com")),
        name: None,
        roles: roles.iter().map(ToString::to_string).collect(),
        permissions: vec![],
        client_id: Some("spa".to_string()),
        access_token_ref: String::new(),
        refresh_token_ref: None,
        expires_at: 0,
        created_at: 0,
        last_activity: 0,
    }
}

async fn seed_session(state: &AppState, sub: &str, tenant: &str, roles: &[&str]) -> String {
    state
        .sessions
        .create(
            session(sub, tenant, roles),
            &TokenMaterial {
                access_token: "idp-access-token".to_string(),
                refresh_token: None,
                expires_in: 3600,
            },
        )
        .await
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

fn get_with_session(path: &str, sid: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header(header::COOKIE, format!("keyfront.sid={sid}"))
        .body(Body::empty())
        .unwrap()
}

// ============================================================================
// Health, envelope, trace propagation
// ============================================================================

#[tokio::test]
async fn health_returns_success_envelope_with_trace_header() {
    let (_, router) = test_state(test_config());
    let response = router.oneshot(get("/api/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let trace_header = response
        .headers()
        .get("x-keyfront-trace-id")
        .expect("trace header must be present")
        .to_str()
        .unwrap()
        .to_string();
    assert!(trace_header.starts_with("kf-"));

    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "ok");
}

#[tokio::test]
async fn liveness_and_readiness_respond() {
    let (_, router) = test_state(test_config());
    let live = router
        .clone()
        .oneshot(get("/api/health/live"))
        .await
        .unwrap();
    assert_eq!(live.status(), StatusCode::OK);

    let ready = router.oneshot(get("/api/health/ready")).await.unwrap();
    assert_eq!(ready.status(), StatusCode::OK);
}

#[tokio::test]
async fn error_body_trace_id_matches_header() {
    let (_, router) = test_state(test_config());
    let response = router.oneshot(get("/api/me")).await.unwrap();

    let header_id = response
        .headers()
        .get("x-keyfront-trace-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let body = body_json(response).await;
    assert_eq!(body["error"]["traceId"], header_id);
}

#[tokio::test]
async fn metrics_endpoint_serves_prometheus_text() {
    let (_, router) = test_state(test_config());
    // One request to have something to count.
    router.clone().oneshot(get("/api/health")).await.unwrap();

    let response = router.oneshot(get("/api/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("keyfront_requests_total"), "got: {text}");
}

// ============================================================================
// Session + profile
// ============================================================================

#[tokio::test]
async fn me_without_cookie_is_unauthorized() {
    let (_, router) = test_state(test_config());
    let response = router.oneshot(get("/api/me")).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn me_with_unknown_cookie_is_session_expired() {
    let (_, router) = test_state(test_config());
    let response = router
        .oneshot(get_with_session("/api/me", "no-such-session"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "SESSION_EXPIRED");
}

#[tokio::test]
async fn me_returns_profile_without_token_refs() {
    let (state, router) = test_state(test_config());
    let sid = seed_session(&state, "user123", "t1", &["USER"]).await;

    let response = router
        .oneshot(get_with_session("/api/me", &sid))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    // Invariant: no token material or refs ever reach the browser.
    assert!(!text.contains("accessTokenRef"));
    assert!(!text.contains("refreshTokenRef"));
    assert!(!text.contains("idp-access-token"));

    let body: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(body["data"]["id"], "user123");
    assert_eq!(body["data"]["tenantId"], "t1");
    assert_eq!(body["data"]["roles"], json!(["USER"]));
}

// ============================================================================
// CSRF double-submit
// ============================================================================

#[tokio::test]
async fn unsafe_request_without_csrf_token_is_blocked() {
    let (state, router) = test_state(test_config());
    let sid = seed_session(&state, "user123", "t1", &["USER"]).await;

    let request = Request::builder()
        .method("POST")
        .uri("/api/logout")
        .header(header::COOKIE, format!("keyfront.sid={sid}"))
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "CSRF_MISSING_TOKEN");
}

#[tokio::test]
async fn unsafe_request_without_any_session_is_csrf_no_session() {
    let (_, router) = test_state(test_config());
    let request = Request::builder()
        .method("POST")
        .uri("/api/logout")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "CSRF_NO_SESSION");
}

#[tokio::test]
async fn csrf_token_flow_permits_then_rejects_replay() {
    let (state, router) = test_state(test_config());
    let sid = seed_session(&state, "user123", "t1", &["USER"]).await;

    // Fetch a token.
    let response = router
        .clone()
        .oneshot(get_with_session("/api/csrf", &sid))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let token = body["data"]["csrfToken"].as_str().unwrap().to_string();

    // Unsafe request with the token succeeds (logout destroys the session).
    let request = Request::builder()
        .method("POST")
        .uri("/api/logout")
        .header(header::COOKIE, format!("keyfront.sid={sid}"))
        .header("x-csrf-token", &token)
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Replaying the same token after the session is gone fails.
    let request = Request::builder()
        .method("POST")
        .uri("/api/logout")
        .header(header::COOKIE, format!("keyfront.sid={sid}"))
        .header("x-csrf-token", &token)
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn csrf_rotation_invalidates_previous_token() {
    let (state, router) = test_state(test_config());
    let sid = seed_session(&state, "user123", "t1", &["ADMIN"]).await;

    let response = router
        .clone()
        .oneshot(get_with_session("/api/csrf", &sid))
        .await
        .unwrap();
    let token = body_json(response).await["data"]["csrfToken"]
        .as_str()
        .unwrap()
        .to_string();

    // Spend the token on a policy write; rotation consumes it.
    let request = Request::builder()
        .method("POST")
        .uri("/api/abac/policies")
        .header(header::COOKIE, format!("keyfront.sid={sid}"))
        .header("x-csrf-token", &token)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"id": "p1", "tenantId": "t1", "rules": []}).to_string(),
        ))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    // The rotated replacement arrives as a cookie.
    assert!(response.headers().get(header::SET_COOKIE).is_some());

    // Replaying the spent token fails.
    let request = Request::builder()
        .method("POST")
        .uri("/api/abac/policies")
        .header(header::COOKIE, format!("keyfront.sid={sid}"))
        .header("x-csrf-token", &token)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"id": "p2", "tenantId": "t1", "rules": []}).to_string(),
        ))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "CSRF_INVALID_TOKEN");
}

// ============================================================================
// Rate limiting
// ============================================================================

#[tokio::test]
async fn fixed_window_limit_denies_after_max() {
    let mut config = test_config();
    config.ratelimit.max_requests = 3;
    let (_, router) = test_state(config);

    for i in 1..=3 {
        let response = router.clone().oneshot(get("/api/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "request {i} should pass");
    }

    let response = router.oneshot(get("/api/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        response.headers().get("x-ratelimit-remaining").unwrap(),
        "0"
    );
    assert!(response.headers().get("retry-after").is_some());
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "RATE_LIMIT_EXCEEDED");
}

#[tokio::test]
async fn allowed_responses_carry_ratelimit_headers() {
    let (_, router) = test_state(test_config());
    let response = router.oneshot(get("/api/health")).await.unwrap();
    assert!(response.headers().get("x-ratelimit-limit").is_some());
    assert!(response.headers().get("x-ratelimit-remaining").is_some());
}

// ============================================================================
// CORS
// ============================================================================

#[tokio::test]
async fn dev_mode_allows_localhost_origin() {
    let (_, router) = test_state(test_config());
    let request = Request::builder()
        .uri("/api/health")
        .header(header::ORIGIN, "http://localhost:3000")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "http://localhost:3000"
    );
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-credentials")
            .unwrap(),
        "true"
    );
}

#[tokio::test]
async fn disallowed_origin_is_rejected() {
    let mut config = test_config();
    config.environment = keyfront::config::Environment::Production;
    let (_, router) = test_state(config);

    let request = Request::builder()
        .uri("/api/health")
        .header(header::ORIGIN, "https://evil.example.com")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "CORS_FORBIDDEN");
}

#[tokio::test]
async fn preflight_echoes_header_intersection() {
    let (_, router) = test_state(test_config());
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/api/proxy/orders")
        .header(header::ORIGIN, "http://localhost:3000")
        .header("access-control-request-method", "POST")
        .header(
            "access-control-request-headers",
            "content-type, x-csrf-token, x-evil",
        )
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-headers")
            .unwrap(),
        "content-type, x-csrf-token"
    );
    assert!(response.headers().get("access-control-max-age").is_some());
}

// ============================================================================
// Admin surfaces + ABAC gating
// ============================================================================

async fn csrf_for(router: &Router, sid: &str) -> String {
    let response = router
        .clone()
        .oneshot(get_with_session("/api/csrf", sid))
        .await
        .unwrap();
    body_json(response).await["data"]["csrfToken"]
        .as_str()
        .unwrap()
        .to_string()
}

fn post_json(path: &str, sid: &str, csrf: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::COOKIE, format!("keyfront.sid={sid}"))
        .header("x-csrf-token", csrf)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn non_admin_cannot_touch_admin_surfaces() {
    let (state, router) = test_state(test_config());
    let sid = seed_session(&state, "user123", "t1", &["USER"]).await;

    let response = router
        .oneshot(get_with_session("/api/abac/policies", &sid))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "FORBIDDEN");
}

#[tokio::test]
async fn admin_crud_roundtrip_for_abac_policies() {
    let (state, router) = test_state(test_config());
    let sid = seed_session(&state, "root", "t1", &["ADMIN"]).await;
    let csrf = csrf_for(&router, &sid).await;

    let policy = json!({
        "id": "read-only",
        "tenantId": "ignored-overwritten",
        "rules": [{
            "id": "allow-read",
            "effect": "permit",
            "target": {"action": [{"attribute": "action.type", "operator": "equals", "value": "read"}]}
        }]
    });
    let response = router
        .clone()
        .oneshot(post_json("/api/abac/policies", &sid, &csrf, policy))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let created = body_json(response).await;
    // The policy is forced into the caller's tenant.
    assert_eq!(created["data"]["tenantId"], "t1");
    assert_eq!(created["data"]["version"], 1);

    let response = router
        .clone()
        .oneshot(get_with_session("/api/abac/policies/read-only", &sid))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .oneshot(get_with_session("/api/abac/policies", &sid))
        .await
        .unwrap();
    let listed = body_json(response).await;
    assert_eq!(listed["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn deny_policy_locks_out_admin() {
    // A tenant deny policy on resource.type=admin overrides the ADMIN role.
    let (state, router) = test_state(test_config());
    let sid = seed_session(&state, "root", "t1", &["ADMIN"]).await;

    let deny_all_admin = Policy {
        id: "lockdown".to_string(),
        tenant_id: "t1".to_string(),
        version: 0,
        enabled: true,
        description: None,
        rules: vec![Rule {
            id: "deny-admin".to_string(),
            effect: Effect::Deny,
            priority: 100,
            enabled: true,
            target: Target {
                resource: vec![Matcher {
                    attribute: "resource.type".to_string(),
                    operator: Operator::Equals,
                    value: Some(json!("admin")),
                }],
                ..Target::default()
            },
            conditions: vec![],
        }],
    };
    state.pdp.store().put(deny_all_admin).await.unwrap();

    let response = router
        .oneshot(get_with_session("/api/audit/logs", &sid))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn tenant_isolation_on_admin_reads() {
    let (state, router) = test_state(test_config());
    state
        .tenants
        .put(&keyfront::tenant::Tenant {
            id: "t2".to_string(),
            name: "Other".to_string(),
            enabled: true,
            allowed_origins: vec![],
            created_at: 0,
        })
        .await
        .unwrap();
    let sid = seed_session(&state, "root", "t1", &["ADMIN"]).await;

    // A t1 admin must never receive a 2xx for t2's tenant record.
    let response = router
        .oneshot(get_with_session("/api/tenants/t2", &sid))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "TENANT_ACCESS_DENIED");
}

// ============================================================================
// Token exchange endpoint
// ============================================================================

fn subject_claims(scope: &[&str]) -> ExchangeClaims {
    let now = chrono::Utc::now().timestamp();
    ExchangeClaims {
        sub: "svc-orders".to_string(),
        aud: "keyfront".to_string(),
        iss: "keyfront".to_string(),
        exp: now + 600,
        iat: now,
        jti: "jti-subject".to_string(),
        tenant_id: "t1".to_string(),
        scope: scope.iter().map(ToString::to_string).collect(),
        roles: vec![],
        exchange_count: 0,
        delegation_chain: vec![],
        original_token_id: None,
    }
}

async fn seed_exchange_policy(state: &AppState) {
    state
        .exchange
        .policy_store()
        .put(&ExchangePolicy {
            id: "ex1".to_string(),
            tenant_id: "t1".to_string(),
            enabled: true,
            allowed_subjects: SubjectMatch {
                services: vec!["svc-orders".to_string()],
                ..SubjectMatch::default()
            },
            allowed_targets: None,
            allowed_audiences: vec!["billing-api".to_string()],
            scope_policy: ScopePolicy {
                allowed_scopes: vec!["read".to_string(), "write".to_string()],
                downscope_only: true,
                ..ScopePolicy::default()
            },
            token_lifetime: keyfront::exchange::TokenLifetime::default(),
            exchange_limits: keyfront::exchange::ExchangeLimits::default(),
            conditions: keyfront::exchange::ExchangeConditions::default(),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn token_exchange_downscopes_and_counts() {
    let (state, router) = test_state(test_config());
    seed_exchange_policy(&state).await;
    let sid = seed_session(&state, "user123", "t1", &["USER"]).await;
    let csrf = csrf_for(&router, &sid).await;

    let subject_token = state
        .exchange
        .sign(&subject_claims(&["read", "write", "admin"]))
        .unwrap();

    let form = serde_urlencoded::to_string([
        ("grant_type", GRANT_TYPE),
        ("subject_token", subject_token.as_str()),
        ("subject_token_type", TOKEN_TYPE_ACCESS),
        ("audience", "billing-api"),
        ("scope", "read"),
    ])
    .unwrap();

    let request = Request::builder()
        .method("POST")
        .uri("/api/token/exchange")
        .header(header::COOKIE, format!("keyfront.sid={sid}"))
        .header("x-csrf-token", &csrf)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(form))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["scope"], "read");
    assert_eq!(body["data"]["token_type"], "Bearer");

    let minted = state
        .exchange
        .validate(body["data"]["access_token"].as_str().unwrap())
        .unwrap();
    assert_eq!(minted.exchange_count, 1);
    assert_eq!(minted.delegation_chain.len(), 1);
    assert_ne!(minted.jti, "jti-subject");
}

#[tokio::test]
async fn token_exchange_rejects_escalation_with_invalid_scope() {
    let (state, router) = test_state(test_config());
    seed_exchange_policy(&state).await;
    let sid = seed_session(&state, "user123", "t1", &["USER"]).await;
    let csrf = csrf_for(&router, &sid).await;

    let subject_token = state
        .exchange
        .sign(&subject_claims(&["read", "write", "admin"]))
        .unwrap();

    let request = post_json(
        "/api/token/exchange",
        &sid,
        &csrf,
        json!({
            "grant_type": GRANT_TYPE,
            "subject_token": subject_token,
            "subject_token_type": TOKEN_TYPE_ACCESS,
            "audience": "billing-api",
            "scope": "admin",
        }),
    );
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "invalid_scope");
    // The specific denial reason stays server-side.
    assert_eq!(body["error"]["message"], "token exchange request was rejected");
}

// ============================================================================
// Back-channel logout
// ============================================================================

#[tokio::test]
async fn admin_backchannel_logout_terminates_all_user_sessions() {
    let (state, router) = test_state(test_config());

    // Terminate-all policy for the tenant.
    let mut policy = LogoutPolicy::default_for("t1");
    policy.id = "strict".to_string();
    policy.priority = 10;
    policy.terminate_all_sessions = true;
    state.logout.policy_store().put(&policy).await.unwrap();

    let sid1 = seed_session(&state, "user123", "t1", &["USER"]).await;
    let sid2 = seed_session(&state, "user123", "t1", &["USER"]).await;
    let admin_sid = seed_session(&state, "root", "t1", &["ADMIN"]).await;
    let csrf = csrf_for(&router, &admin_sid).await;

    let request = post_json(
        "/api/logout/backchannel",
        &admin_sid,
        &csrf,
        json!({"userId": "user123"}),
    );
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["status"], "completed");
    assert_eq!(body["data"]["affectedSessions"].as_array().unwrap().len(), 2);

    // Both user sessions now resolve to SESSION_EXPIRED.
    for sid in [&sid1, &sid2] {
        let response = router
            .clone()
            .oneshot(get_with_session("/api/me", sid))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "SESSION_EXPIRED");
    }

    // The event is visible to the admin.
    let response = router
        .oneshot(get_with_session(
            "/api/logout/backchannel/events",
            &admin_sid,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let events = body_json(response).await;
    assert_eq!(events["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn non_admin_cannot_log_out_other_users() {
    let (state, router) = test_state(test_config());
    seed_session(&state, "victim", "t1", &["USER"]).await;
    let sid = seed_session(&state, "user123", "t1", &["USER"]).await;
    let csrf = csrf_for(&router, &sid).await;

    let request = post_json(
        "/api/logout/backchannel",
        &sid,
        &csrf,
        json!({"userId": "victim"}),
    );
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

// ============================================================================
// Audit invariants
// ============================================================================

#[tokio::test]
async fn every_request_emits_exactly_one_http_audit_event() {
    let (state, router) = test_state(test_config());
    let sid = seed_session(&state, "user123", "t1", &["USER"]).await;

    router
        .clone()
        .oneshot(get_with_session("/api/me", &sid))
        .await
        .unwrap();
    state.audit.flush().await;

    let events = state
        .audit
        .query(
            "t1",
            &keyfront::audit::AuditQuery {
                action: Some("http.request".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].user_id.as_deref(), Some("user123"));
    assert!(events[0].trace_id.starts_with("kf-"));
}
