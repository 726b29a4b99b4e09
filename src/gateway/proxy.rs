//! Reverse proxy — streams authorized traffic to the downstream API with
//! identity headers injected.
//!
//! `/api/proxy/{path}` maps to `{DOWNSTREAM_API_BASE}/api/v1/{path}`,
//! preserving method, query, and body. Hop-by-hop and sensitive client
//! headers are stripped; the dereferenced access token and identity
//! context are injected. Transport errors retry with linear backoff
//! (`retry_delay * attempt`); 502/503/504 retry only for idempotent
//! methods. Response bodies stream — they are never buffered.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{HeaderMap, Method, StatusCode},
    response::Response,
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::DownstreamConfig;
use crate::security::{Severity, max_severity, sanitize_value, scan_value};
use crate::session::UserSession;
use crate::{Error, Result, trace};

use super::middleware::Auth;
use super::router::AppState;

/// Headers never forwarded in either direction (RFC 9110 hop-by-hop set).
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Client headers stripped before forwarding (identity is re-injected
/// server-side).
const SENSITIVE: &[&str] = &["cookie", "authorization", "host"];

/// Request body cap for the proxy (bodies are scanned, so they are bounded).
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.contains(&name)
}

fn is_sensitive(name: &str) -> bool {
    SENSITIVE.contains(&name) || name.starts_with("x-forwarded-")
}

/// Identity context injected into downstream requests.
#[derive(Debug, Clone)]
pub struct IdentityContext {
    /// Dereferenced access token.
    pub access_token: String,
    /// Tenant id.
    pub tenant_id: String,
    /// User id.
    pub user_id: String,
    /// Role claims, comma-joined downstream.
    pub roles: Vec<String>,
}

/// The streaming reverse proxy.
pub struct ReverseProxy {
    http: reqwest::Client,
    config: DownstreamConfig,
}

impl ReverseProxy {
    /// Create a proxy for the configured downstream.
    #[must_use]
    pub fn new(config: DownstreamConfig) -> Self {
        Self {
            // The total deadline is enforced around the retry loop, not per
            // attempt.
            http: reqwest::Client::builder().build().unwrap_or_default(),
            config,
        }
    }

    /// Forward one request; the response body is streamed through.
    pub async fn forward(
        &self,
        method: &Method,
        path: &str,
        query: Option<&str>,
        headers_in: &HeaderMap,
        body: bytes::Bytes,
        identity: &IdentityContext,
    ) -> Result<Response> {
        let base = self.config.api_base.trim_end_matches('/');
        let mut url = format!("{base}/api/v1/{path}");
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }

        let outcome = tokio::time::timeout(
            self.config.timeout(),
            self.forward_with_retries(method, &url, headers_in, body, identity),
        )
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(Error::ProxyTimeout),
        }
    }

    async fn forward_with_retries(
        &self,
        method: &Method,
        url: &str,
        headers_in: &HeaderMap,
        body: bytes::Bytes,
        identity: &IdentityContext,
    ) -> Result<Response> {
        let idempotent = matches!(
            *method,
            Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE
        );

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let request = self.build_request(method, url, headers_in, body.clone(), identity)?;

            match self.http.execute(request).await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let retryable_status = matches!(status, 502 | 503 | 504);
                    if retryable_status && idempotent && attempt <= self.config.retries {
                        warn!(url = %url, status, attempt, "Retrying downstream request");
                        self.backoff(attempt).await;
                        continue;
                    }
                    return build_response(response);
                }
                Err(e) => {
                    // Connect-level failures are safe to retry for any method
                    // (the request was never delivered).
                    let transport_retryable = e.is_connect() || e.is_request();
                    if transport_retryable && attempt <= self.config.retries {
                        warn!(url = %url, error = %e, attempt, "Downstream transport error, retrying");
                        self.backoff(attempt).await;
                        continue;
                    }
                    return Err(Error::ProxyFailed(e.to_string()));
                }
            }
        }
    }

    async fn backoff(&self, attempt: u32) {
        let delay = self.config.retry_delay_ms.saturating_mul(u64::from(attempt));
        tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
    }

    fn build_request(
        &self,
        method: &Method,
        url: &str,
        headers_in: &HeaderMap,
        body: bytes::Bytes,
        identity: &IdentityContext,
    ) -> Result<reqwest::Request> {
        let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
            .map_err(|e| Error::Internal(format!("invalid method: {e}")))?;

        let mut builder = self.http.request(method, url);
        for (name, value) in headers_in {
            let name_str = name.as_str();
            if is_hop_by_hop(name_str) || is_sensitive(name_str) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                builder = builder.header(name_str, value);
            }
        }

        let trace_id = trace::current_or_new();
        builder = builder
            .header("authorization", format!("Bearer {}", identity.access_token))
            .header("x-tenant-id", &identity.tenant_id)
            .header("x-user-id", &identity.user_id)
            .header("x-user-roles", identity.roles.join(","))
            .header("x-trace-id", trace_id)
            .header("x-keyfront-gateway", "true");

        if !body.is_empty() {
            builder = builder.body(body);
        }
        builder
            .build()
            .map_err(|e| Error::Internal(format!("request build failed: {e}")))
    }
}

/// Convert the downstream response into a streaming axum response.
fn build_response(response: reqwest::Response) -> Result<Response> {
    let status = StatusCode::from_u16(response.status().as_u16())
        .map_err(|e| Error::Internal(format!("invalid downstream status: {e}")))?;

    let mut builder = Response::builder().status(status);
    for (name, value) in response.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }

    builder
        .body(Body::from_stream(response.bytes_stream()))
        .map_err(|e| Error::Internal(format!("response build failed: {e}")))
}

/// `ALL /api/proxy/{*path}` — authenticated, scanned, then forwarded.
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
    Path(path): Path<String>,
    request: Request,
) -> Result<Response> {
    let method = request.method().clone();
    let query = request.uri().query().map(ToString::to_string);
    let headers = request.headers().clone();

    let body = axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|e| Error::ValidationFailed {
            details: vec![format!("body: {e}")],
        })?;

    let body = scan_payload(&state, &ctx.session, &body, query.as_deref())?;

    let Some(access_token) = state.sessions.access_token(&ctx.session).await? else {
        // The token blob is gone while the session record survived.
        return Err(Error::SessionExpired);
    };
    let identity = IdentityContext {
        access_token,
        tenant_id: ctx.session.tenant_id.clone(),
        user_id: ctx.session.sub.clone(),
        roles: ctx.session.roles.clone(),
    };

    debug!(method = %method, path = %path, "Forwarding to downstream");
    state
        .proxy
        .forward(
            &method,
            &path,
            query.as_deref(),
            &headers,
            body,
            &identity,
        )
        .await
}

/// Threat-scan the body (and query string). Production blocks on
/// high/critical matches; elsewhere matches are logged and sanitized.
fn scan_payload(
    state: &AppState,
    session: &UserSession,
    body: &bytes::Bytes,
    query: Option<&str>,
) -> Result<bytes::Bytes> {
    if !state.config.security.scanner_enabled {
        return Ok(body.clone());
    }
    let max_len = state.config.security.max_string_length;

    let mut matches = Vec::new();
    if let Some(query) = query {
        matches.extend(scan_value(&Value::String(query.to_string()), max_len));
    }

    let parsed: Option<Value> = if body.is_empty() {
        None
    } else {
        serde_json::from_slice(body).ok()
    };
    if let Some(parsed) = &parsed {
        matches.extend(scan_value(parsed, max_len));
    }

    if matches.is_empty() {
        return Ok(body.clone());
    }

    let top = max_severity(&matches);
    let severity_label = match top {
        Some(Severity::Critical) => "critical",
        Some(Severity::High) => "high",
        Some(Severity::Medium) => "medium",
        Some(Severity::Low) => "low",
        None => "none",
    };
    warn!(
        tenant = %session.tenant_id,
        user = %session.sub,
        matches = matches.len(),
        severity = severity_label,
        "Security scanner matched request payload"
    );
    state.metrics.incr(
        "keyfront_security_matches_total",
        &vec![("severity", severity_label.to_string())],
    );

    if state.config.environment.is_production() && top >= Some(Severity::High) {
        let threat_type = matches
            .iter()
            .max_by_key(|m| m.severity)
            .map(|m| m.kind.to_string())
            .unwrap_or_default();
        return Err(Error::SecurityThreatBlocked { threat_type });
    }

    // Non-production: sanitize and forward.
    match parsed {
        Some(parsed) => {
            let cleaned = sanitize_value(&parsed, &matches);
            Ok(bytes::Bytes::from(serde_json::to_vec(&cleaned)?))
        }
        None => Ok(body.clone()),
    }
}
