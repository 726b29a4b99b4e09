//! Session lifecycle, health, and telemetry handlers.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::audit::{AuditEvent, AuditResult};
use crate::error::ApiResponse;
use crate::logout::{LogoutRequest, LogoutTrigger};
use crate::session::{TokenMaterial, UserSession};
use crate::{Error, Result};

use super::middleware::{Auth, set_csrf_cookie};
use super::router::AppState;

/// Wrap a payload in the success envelope.
pub fn ok_json<T: serde::Serialize>(data: T) -> Response {
    Json(ApiResponse::ok(data)).into_response()
}

fn redirect_to(location: &str) -> Response {
    let mut response = StatusCode::FOUND.into_response();
    if let Ok(v) = HeaderValue::from_str(location) {
        response.headers_mut().insert(header::LOCATION, v);
    }
    response
}

/// Reject absolute/protocol-relative redirect targets (open-redirect guard).
fn safe_redirect_target(raw: Option<String>) -> String {
    match raw {
        Some(target) if target.starts_with('/') && !target.starts_with("//") => target,
        _ => "/".to_string(),
    }
}

// ============================================================================
// Login
// ============================================================================

/// Query parameters for `GET /api/login`.
#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    /// Post-login redirect target (relative).
    pub redirect: Option<String>,
    /// Tenant hint.
    #[serde(rename = "tenantId")]
    pub tenant_id: Option<String>,
}

/// `GET /api/login` — 302 to the IdP authorization endpoint.
pub async fn login(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LoginQuery>,
) -> Result<Response> {
    let redirect = safe_redirect_target(query.redirect);
    let (auth_url, _) = state
        .oidc
        .start_login(&redirect, query.tenant_id.as_deref())
        .await?;

    state
        .audit
        .record(
            AuditEvent::new(
                query.tenant_id.as_deref().unwrap_or("public"),
                "login.start",
                "session",
                AuditResult::Allow,
            )
            .metadata(json!({ "redirect": redirect })),
        )
        .await;

    Ok(redirect_to(&auth_url))
}

// ============================================================================
// Callback
// ============================================================================

/// Query parameters for `GET /api/callback`.
#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    /// Authorization code.
    pub code: String,
    /// Opaque state echoed by the IdP.
    pub state: String,
}

/// `GET /api/callback` — consume the login state, exchange the code,
/// verify the ID token, create the session, set the cookie.
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response> {
    let login_state = state.oidc.consume_state(&query.state).await?;
    let tokens = state
        .oidc
        .exchange_code(&query.code, &login_state.code_verifier)
        .await?;

    let id_token = tokens
        .id_token
        .as_deref()
        .ok_or_else(|| Error::OidcInvalidToken("token response carried no id_token".into()))?;
    let claims = state
        .oidc
        .verify_id_token(id_token, Some(&login_state.nonce))
        .await?;

    let tenant_id = claims
        .tenant_id
        .clone()
        .or(login_state.tenant_id.clone())
        .unwrap_or_else(|| "default".to_string());

    let session = UserSession {
        sub: claims.sub.clone(),
        tenant_id: tenant_id.clone(),
        email: claims.email.clone(),
        name: claims.name.clone(),
        roles: claims.roles.clone(),
        permissions: claims.permissions.clone(),
        client_id: Some(state.config.oidc.client_id.clone()),
        access_token_ref: String::new(),
        refresh_token_ref: None,
        expires_at: 0,
        created_at: 0,
        last_activity: 0,
    };
    let material = TokenMaterial {
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        expires_in: tokens.expires_in,
    };
    let sid = state.sessions.create(session, &material).await?;

    state
        .audit
        .record(
            AuditEvent::new(&tenant_id, "login.complete", "session", AuditResult::Allow)
                .user(claims.sub.clone()),
        )
        .await;
    debug!(sub = %claims.sub, tenant = %tenant_id, "Login complete");

    let mut response = redirect_to(&login_state.redirect_uri);
    set_session_cookie(&mut response, state.as_ref(), &sid, material.expires_in);
    Ok(response)
}

/// Session cookie attributes: `HttpOnly; SameSite=Lax; Path=/`, plus
/// `Secure` in production.
fn set_session_cookie(response: &mut Response, state: &AppState, sid: &str, max_age: u64) {
    let secure = if state.config.environment.is_production() {
        "; Secure"
    } else {
        ""
    };
    let cookie = format!(
        "{}={sid}; HttpOnly; SameSite=Lax; Path=/; Max-Age={max_age}{secure}",
        state.config.session.cookie_name
    );
    if let Ok(v) = HeaderValue::from_str(&cookie) {
        response.headers_mut().append(header::SET_COOKIE, v);
    }
}

fn clear_session_cookie(response: &mut Response, state: &AppState) {
    let cookie = format!(
        "{}=; HttpOnly; SameSite=Lax; Path=/; Max-Age=0",
        state.config.session.cookie_name
    );
    if let Ok(v) = HeaderValue::from_str(&cookie) {
        response.headers_mut().append(header::SET_COOKIE, v);
    }
}

// ============================================================================
// Logout
// ============================================================================

/// `POST /api/logout` — destroy the session, clear the cookie, and hand the
/// client the IdP logout URL when the provider supports RP-initiated logout.
pub async fn logout(State(state): State<Arc<AppState>>, Auth(ctx): Auth) -> Result<Response> {
    state.sessions.destroy(&ctx.sid).await?;
    state
        .ws
        .close_sessions(&[ctx.sid.clone()], super::ws::CLOSE_SESSION_REVOKED)
        .await;

    state
        .audit
        .record(
            AuditEvent::new(
                &ctx.session.tenant_id,
                "logout.user",
                "session",
                AuditResult::Allow,
            )
            .user(ctx.session.sub.clone()),
        )
        .await;

    let idp_logout_url = match state.oidc.end_session_url(None).await {
        Ok(url) => url,
        Err(e) => {
            warn!(error = %e, "Could not build IdP logout URL");
            None
        }
    };

    let mut response = ok_json(json!({
        "loggedOut": true,
        "idpLogoutUrl": idp_logout_url,
    }));
    clear_session_cookie(&mut response, state.as_ref());
    Ok(response)
}

// ============================================================================
// Profile and CSRF
// ============================================================================

/// `GET /api/me` — the caller's safe profile (never token refs).
pub async fn me(Auth(ctx): Auth) -> Response {
    ok_json(ctx.session.profile())
}

/// `GET /api/csrf` — issue a fresh CSRF token for the session.
pub async fn csrf_token(State(state): State<Arc<AppState>>, Auth(ctx): Auth) -> Result<Response> {
    let token = state
        .csrf
        .issue(
            &ctx.sid,
            Some(&ctx.session.sub),
            Some(&ctx.session.tenant_id),
        )
        .await?;

    let mut response = ok_json(json!({
        "csrfToken": token.token,
        "expiresAt": token.expires_at,
    }));
    set_csrf_cookie(&mut response, state.as_ref(), &token.token);
    Ok(response)
}

// ============================================================================
// IdP-initiated back-channel logout receiver
// ============================================================================

/// Form body of the IdP's back-channel logout POST.
#[derive(Debug, Deserialize)]
pub struct BackchannelReceiveForm {
    /// The signed logout token.
    pub logout_token: String,
}

/// `POST /api/logout/backchannel/receive` — the IdP tells us a user's
/// sessions are gone; cascade locally.
pub async fn backchannel_receive(
    State(state): State<Arc<AppState>>,
    axum::extract::Form(form): axum::extract::Form<BackchannelReceiveForm>,
) -> Result<Response> {
    let claims = state.oidc.verify_logout_token(&form.logout_token).await?;

    let sub = claims.sub;
    let affected = state
        .sessions
        .scan_sessions(|s| s.sub == sub)
        .await?;

    // Group by tenant; one logout event per tenant.
    let mut tenants: Vec<String> = affected.iter().map(|(_, s)| s.tenant_id.clone()).collect();
    tenants.sort();
    tenants.dedup();

    let mut events = Vec::new();
    for tenant in tenants {
        let event = state
            .logout
            .initiate(
                &tenant,
                &LogoutRequest {
                    trigger: LogoutTrigger::ExternalRequest,
                    session_id: None,
                    user_id: Some(sub.clone()),
                    initiator: "idp".to_string(),
                },
            )
            .await?;
        events.push(event.id);
    }

    Ok(ok_json(json!({ "events": events })))
}

// ============================================================================
// Health and metrics
// ============================================================================

/// `GET /api/health`.
pub async fn health() -> Response {
    ok_json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

/// `GET /api/health/live` — process liveness, no dependencies consulted.
pub async fn health_live() -> Response {
    ok_json(json!({ "status": "alive" }))
}

/// `GET /api/health/ready` — KV reachability gates readiness.
pub async fn health_ready(State(state): State<Arc<AppState>>) -> Result<Response> {
    state
        .kv
        .ping()
        .await
        .map_err(|e| Error::ServiceUnavailable(format!("kv store unreachable: {e}")))?;
    Ok(ok_json(json!({ "status": "ready" })))
}

/// `GET /api/health/detailed` — dependency latencies and configuration
/// summary.
pub async fn health_detailed(State(state): State<Arc<AppState>>) -> Response {
    let kv_started = std::time::Instant::now();
    let kv_ok = state.kv.ping().await.is_ok();
    let kv_latency_ms = kv_started.elapsed().as_millis();

    let oidc_configured = !state.config.oidc.issuer_url.is_empty();
    let downstream_configured = !state.config.downstream.api_base.is_empty();
    let ws_configured = !state.config.downstream.ws_url.is_empty();

    ok_json(json!({
        "status": if kv_ok { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "kv": { "ok": kv_ok, "latencyMs": kv_latency_ms },
        "oidc": { "configured": oidc_configured },
        "downstream": { "api": downstream_configured, "ws": ws_configured },
        "websocket": { "connections": state.ws.connection_count() },
    }))
}

/// `GET /api/metrics` — Prometheus text exposition.
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}
