//! The request middleware chain.
//!
//! Outermost to innermost: trace-ID scoping, audit + metrics, CORS, rate
//! limiting, session resolution (with transparent refresh), CSRF
//! double-submit. Each middleware either passes the request on or fails
//! with a typed [`Error`] that the envelope renderer turns into
//! `{ success: false, error: { code, ... } }`.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{FromRequestParts, State},
    http::{HeaderValue, Method, Request, StatusCode, header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use crate::audit::{AuditEvent, AuditResult};
use crate::cors::{ALLOWED_HEADERS, ALLOWED_METHODS};
use crate::error::TRACE_HEADER;
use crate::ratelimit::{Limit, RateLimitDecision, keys};
use crate::session::{TokenMaterial, UserSession};
use crate::{Error, trace};

use super::router::AppState;

/// Paths that never require a session or CSRF token.
const PUBLIC_PATHS: &[&str] = &[
    "/api/login",
    "/api/callback",
    "/api/health",
    "/api/metrics",
    "/api/logout/backchannel/receive",
];

/// Session resolution outcome attached to the request.
#[derive(Debug, Clone)]
pub enum SessionState {
    /// No session cookie was presented.
    Anonymous,
    /// A cookie was presented but did not resolve (expired/destroyed).
    Invalid,
    /// An authenticated session.
    Active(AuthContext),
}

/// An authenticated caller.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Opaque session id (cookie value).
    pub sid: String,
    /// The resolved session.
    pub session: UserSession,
}

/// Extractor for handlers that require authentication.
///
/// Distinguishes "no cookie" (`UNAUTHORIZED`) from "cookie no longer
/// resolves" (`SESSION_EXPIRED`).
pub struct Auth(pub AuthContext);

impl<S: Send + Sync> FromRequestParts<S> for Auth {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match parts.extensions.get::<SessionState>() {
            Some(SessionState::Active(ctx)) => Ok(Self(ctx.clone())),
            Some(SessionState::Invalid) => Err(Error::SessionExpired),
            _ => Err(Error::Unauthorized),
        }
    }
}

fn is_public_path(path: &str) -> bool {
    PUBLIC_PATHS.iter().any(|p| path.starts_with(p))
}

/// Read a cookie value from the `Cookie` header.
pub fn cookie_value(request_headers: &axum::http::HeaderMap, name: &str) -> Option<String> {
    let header = request_headers.get(header::COOKIE)?.to_str().ok()?;
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

/// Best-effort client IP: `X-Forwarded-For` first hop, then `X-Real-IP`.
fn client_ip(request_headers: &axum::http::HeaderMap) -> String {
    request_headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| {
            request_headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
        })
        .unwrap_or("unknown")
        .to_string()
}

// ============================================================================
// Trace-ID middleware (outermost)
// ============================================================================

/// Mint the request's trace ID, scope the whole pipeline to it, and stamp
/// the response header. Also holds an in-flight permit so shutdown can
/// drain the pipeline.
pub async fn trace_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let trace_id = trace::generate();
    let _permit = Arc::clone(&state.inflight).try_acquire_owned().ok();

    let mut response = trace::with_trace_id(trace_id.clone(), next.run(request)).await;
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_HEADER, value);
    }
    response
}

// ============================================================================
// Audit + metrics middleware
// ============================================================================

/// Emit exactly one audit event per request (after the terminal status is
/// known) and record request metrics. Internal failures feed the error
/// tracker.
pub async fn audit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;
    let status = response.status();

    let labels = vec![
        ("method", method.to_string()),
        ("path", path_class(&path).to_string()),
        ("status", status.as_u16().to_string()),
    ];
    state.metrics.incr("keyfront_requests_total", &labels);
    state.metrics.observe(
        "keyfront_request_duration_seconds",
        &vec![("path", path_class(&path).to_string())],
        started.elapsed().as_secs_f64(),
    );

    if status.is_server_error() {
        state
            .errors
            .record("INTERNAL_ERROR", "unhandled request failure", &path)
            .await;
    }

    let auth = response.extensions().get::<AuthContext>().cloned();
    let result = if status.is_success() || status.is_redirection() {
        AuditResult::Allow
    } else if matches!(
        status,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS
    ) {
        AuditResult::Deny
    } else {
        AuditResult::Error
    };

    let tenant = auth
        .as_ref()
        .map_or_else(|| "public".to_string(), |a| a.session.tenant_id.clone());
    let mut event = AuditEvent::new(tenant, "http.request", "http", result).metadata(
        serde_json::json!({
            "method": method.as_str(),
            "path": path,
            "status": status.as_u16(),
        }),
    );
    if let Some(auth) = auth {
        event = event.user(auth.session.sub);
    }
    state.audit.record(event).await;

    response
}

/// Collapse dynamic path segments so metric label cardinality stays bounded.
fn path_class(path: &str) -> &str {
    if path.starts_with("/api/proxy/") {
        "/api/proxy"
    } else if path.starts_with("/api/abac/policies") {
        "/api/abac/policies"
    } else if path.starts_with("/api/token-exchange/policies") {
        "/api/token-exchange/policies"
    } else if path.starts_with("/api/tenants") {
        "/api/tenants"
    } else {
        path
    }
}

// ============================================================================
// CORS middleware
// ============================================================================

/// Per-tenant CORS with a global fallback; handles preflights in place.
pub async fn cors_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Error> {
    let Some(origin) = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
    else {
        // Same-origin or non-browser request.
        return Ok(next.run(request).await);
    };

    let allowed = if state.cors.is_allowed(&origin, None) {
        true
    } else {
        // Consult tenant allow-lists before refusing.
        let tenants = state.tenants.list().await.unwrap_or_default();
        tenants
            .iter()
            .any(|t| t.enabled && state.cors.is_allowed(&origin, Some(&t.allowed_origins)))
    };

    if !allowed {
        warn!(origin = %origin, "CORS origin rejected");
        return Err(Error::CorsForbidden(origin));
    }

    let is_preflight = request.method() == Method::OPTIONS
        && request
            .headers()
            .contains_key("access-control-request-method");

    if is_preflight {
        let requested = request
            .headers()
            .get("access-control-request-headers")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let allow_headers = if requested.is_empty() {
            ALLOWED_HEADERS.join(", ")
        } else {
            state.cors.allowed_request_headers(requested)
        };

        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors_headers(&mut response, &origin);
        let headers = response.headers_mut();
        if let Ok(v) = HeaderValue::from_str(&allow_headers) {
            headers.insert("access-control-allow-headers", v);
        }
        headers.insert(
            "access-control-allow-methods",
            HeaderValue::from_static(ALLOWED_METHODS),
        );
        if let Ok(v) = HeaderValue::from_str(&state.cors.max_age().to_string()) {
            headers.insert("access-control-max-age", v);
        }
        return Ok(response);
    }

    let mut response = next.run(request).await;
    apply_cors_headers(&mut response, &origin);
    Ok(response)
}

fn apply_cors_headers(response: &mut Response, origin: &str) {
    let headers = response.headers_mut();
    // Credentials are always on (session cookie), so the concrete origin is
    // echoed; `*` is never valid here.
    if let Ok(v) = HeaderValue::from_str(origin) {
        headers.insert("access-control-allow-origin", v);
    }
    headers.insert(
        "access-control-allow-credentials",
        HeaderValue::from_static("true"),
    );
    headers.append(header::VARY, HeaderValue::from_static("origin"));
}

// ============================================================================
// Rate-limit middleware
// ============================================================================

/// Pre-session limits: global per-IP, plus a stricter per-IP limit on the
/// login endpoints. Per-user limits run in the session middleware once the
/// identity is known.
pub async fn ratelimit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Error> {
    if !state.config.ratelimit.enabled {
        return Ok(next.run(request).await);
    }

    let ip = client_ip(request.headers());
    let path = request.uri().path();
    let window = std::time::Duration::from_millis(state.config.ratelimit.window_ms);

    let mut limits = vec![Limit::new(
        keys::global_ip(&ip),
        window,
        state.config.ratelimit.max_requests,
    )];
    if path.starts_with("/api/login") || path.starts_with("/api/callback") {
        limits.push(Limit::new(
            keys::login_ip(&ip),
            window,
            state.config.ratelimit.login_max_requests,
        ));
    }

    let decision = state.limiter.check_all(&limits).await;
    if !decision.allowed {
        state.metrics.incr(
            "keyfront_ratelimit_denials_total",
            &vec![("path", path_class(path).to_string())],
        );
        return Err(Error::RateLimitExceeded {
            retry_after: decision.retry_after.unwrap_or(0),
            limit: decision.limit,
        });
    }

    let mut response = next.run(request).await;
    apply_ratelimit_headers(&mut response, &decision);
    Ok(response)
}

fn apply_ratelimit_headers(response: &mut Response, decision: &RateLimitDecision) {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert("x-ratelimit-limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.reset_time.to_string()) {
        headers.insert("x-ratelimit-reset", v);
    }
}

// ============================================================================
// Session middleware
// ============================================================================

/// Resolve the session cookie, transparently refresh a near-expiry access
/// token, bump activity, and enforce the per-user limit. The outcome is
/// attached to the request as [`SessionState`]; handlers opt in via the
/// [`Auth`] extractor.
pub async fn session_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Error> {
    let cookie_name = state.config.session.cookie_name.clone();
    let session_state = match cookie_value(request.headers(), &cookie_name) {
        None => SessionState::Anonymous,
        Some(sid) => match resolve_session(&state, &sid).await? {
            Some(session) => SessionState::Active(AuthContext { sid, session }),
            None => SessionState::Invalid,
        },
    };

    if let SessionState::Active(ctx) = &session_state {
        // Tenant kill switch.
        if let Some(tenant) = state.tenants.get(&ctx.session.tenant_id).await? {
            if !tenant.enabled {
                return Err(Error::TenantAccessDenied);
            }
        }

        // Per-user fixed-window limit, now that the identity is known.
        if state.config.ratelimit.enabled {
            let limit = Limit::new(
                keys::user(&ctx.session.tenant_id, &ctx.session.sub),
                std::time::Duration::from_millis(state.config.ratelimit.window_ms),
                state.config.ratelimit.max_requests,
            );
            let decision = state.limiter.check(&limit).await;
            if !decision.allowed {
                return Err(Error::RateLimitExceeded {
                    retry_after: decision.retry_after.unwrap_or(0),
                    limit: decision.limit,
                });
            }
        }

        state.sessions.touch(&ctx.sid).await?;
    }

    let auth_for_response = match &session_state {
        SessionState::Active(ctx) => Some(ctx.clone()),
        _ => None,
    };
    request.extensions_mut().insert(session_state);

    let mut response = next.run(request).await;
    // Expose the caller to the (outer) audit middleware.
    if let Some(ctx) = auth_for_response {
        response.extensions_mut().insert(ctx);
    }
    Ok(response)
}

/// Resolve + transparently refresh. Returns `None` when the cookie no
/// longer maps to a live session.
async fn resolve_session(state: &AppState, sid: &str) -> Result<Option<UserSession>, Error> {
    let Some(session) = state.sessions.resolve(sid).await? else {
        return Ok(None);
    };

    // Refresh when within 60 s of expiry and a refresh token exists.
    let now = chrono::Utc::now().timestamp_millis();
    let near_expiry = session.expires_at - now < 60_000;
    if !near_expiry {
        return Ok(Some(session));
    }
    let Some(refresh_token) = state.sessions.refresh_token(&session).await? else {
        return Ok(Some(session));
    };

    match state.oidc.refresh(&refresh_token).await {
        Ok(tokens) => {
            debug!(sub = %session.sub, "Refreshed access token");
            let material = TokenMaterial {
                access_token: tokens.access_token,
                refresh_token: tokens.refresh_token,
                expires_in: tokens.expires_in,
            };
            Ok(Some(
                state.sessions.replace_tokens(sid, &session, &material).await?,
            ))
        }
        Err(e) => {
            // Refresh failure surfaces as SESSION_EXPIRED.
            warn!(sub = %session.sub, error = %e, "Token refresh failed, destroying session");
            state.sessions.destroy(sid).await?;
            Ok(None)
        }
    }
}

// ============================================================================
// CSRF middleware
// ============================================================================

/// Double-submit enforcement on unsafe methods, with rotation.
pub async fn csrf_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Error> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let safe = matches!(method, Method::GET | Method::HEAD | Method::OPTIONS);
    if safe || is_public_path(&path) {
        return Ok(next.run(request).await);
    }

    let ctx = match request.extensions().get::<SessionState>() {
        Some(SessionState::Active(ctx)) => ctx.clone(),
        Some(SessionState::Invalid) => return Err(Error::SessionExpired),
        _ => return Err(Error::CsrfNoSession),
    };

    let token = request
        .headers()
        .get("x-csrf-token")
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
        .or_else(|| cookie_value(request.headers(), &state.config.csrf.cookie_name));
    let Some(token) = token else {
        return Err(Error::CsrfMissingToken);
    };

    // Verify + rotate: the old token is spent by this request.
    let fresh = state
        .csrf
        .rotate(
            &ctx.sid,
            &token,
            Some(&ctx.session.sub),
            Some(&ctx.session.tenant_id),
        )
        .await?;

    let mut response = next.run(request).await;
    set_csrf_cookie(&mut response, state.as_ref(), &fresh.token);
    Ok(response)
}

/// Attach the client-readable CSRF cookie (double-submit copy).
pub fn set_csrf_cookie(response: &mut Response, state: &AppState, token: &str) {
    let secure = if state.config.environment.is_production() {
        "; Secure"
    } else {
        ""
    };
    let cookie = format!(
        "{}={token}; Path=/; SameSite=Lax{secure}",
        state.config.csrf.cookie_name
    );
    if let Ok(v) = HeaderValue::from_str(&cookie) {
        response.headers_mut().append(header::SET_COOKIE, v);
    }
}
