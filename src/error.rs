//! Error types for the Keyfront gateway.
//!
//! Every failure that can reach a client maps to exactly one wire code from
//! the gateway taxonomy (`UNAUTHORIZED`, `SESSION_EXPIRED`, ...). The
//! middleware chain converts any unhandled error into `INTERNAL_ERROR`;
//! original causes are recorded by the error tracker but never serialized
//! into responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::trace;

/// Result type alias for the gateway.
pub type Result<T> = std::result::Result<T, Error>;

/// Keyfront gateway errors.
///
/// Each variant carries the client-facing message; sensitive detail belongs
/// in tracing/error-tracker output, not here.
#[derive(Error, Debug)]
pub enum Error {
    /// No session cookie, or the cookie does not resolve to a session.
    #[error("Authentication required")]
    Unauthorized,

    /// The session existed but has passed its expiry.
    #[error("Session has expired")]
    SessionExpired,

    /// Authenticated but not allowed.
    #[error("Access denied: {0}")]
    Forbidden(String),

    /// Cross-tenant access attempt.
    #[error("Access to this tenant is denied")]
    TenantAccessDenied,

    /// CSRF check ran without an authenticated session.
    #[error("CSRF validation requires an authenticated session")]
    CsrfNoSession,

    /// Unsafe request arrived without a CSRF token.
    #[error("Missing CSRF token")]
    CsrfMissingToken,

    /// CSRF token unknown, expired, or bound to another session.
    #[error("Invalid CSRF token")]
    CsrfInvalidToken,

    /// Origin not in the allow-list.
    #[error("Origin not allowed: {0}")]
    CorsForbidden(String),

    /// Fixed-window rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded {
        /// Seconds until the current window ends.
        retry_after: u64,
        /// Window limit, echoed in `X-RateLimit-Limit`.
        limit: u32,
    },

    /// Request payload failed schema validation.
    #[error("Request validation failed")]
    ValidationFailed {
        /// Path-qualified validation messages.
        details: Vec<String>,
    },

    /// Security scanner matched a high/critical threat pattern.
    #[error("Request blocked by security policy")]
    SecurityThreatBlocked {
        /// Threat family that triggered the block (e.g. `sql_injection`).
        threat_type: String,
    },

    /// ID token signature/claims verification failed.
    #[error("Identity token verification failed")]
    OidcInvalidToken(String),

    /// Login state missing, expired, or already consumed.
    #[error("OAuth state is invalid or has expired")]
    OauthStateInvalid,

    /// The identity provider could not be reached.
    #[error("Identity provider unavailable: {0}")]
    OidcUnavailable(String),

    /// Downstream did not answer within the request deadline.
    #[error("Downstream request timed out")]
    ProxyTimeout,

    /// Downstream transport failure after the retry budget.
    #[error("Downstream request failed: {0}")]
    ProxyFailed(String),

    /// Referenced policy does not exist for this tenant.
    #[error("Policy not found: {0}")]
    PolicyNotFound(String),

    /// Referenced session does not exist.
    #[error("Session not found")]
    SessionNotFound,

    /// KV store failure on a path that must not fail open.
    #[error("Key-value store error: {0}")]
    Kv(String),

    /// Configuration error at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Outbound HTTP failure not covered by a more specific variant.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Anything else.
    #[error("Internal error: {0}")]
    Internal(String),

    /// A dependency this request needs is down.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl Error {
    /// Wire code for this error, per the gateway taxonomy.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::TenantAccessDenied => "TENANT_ACCESS_DENIED",
            Self::CsrfNoSession => "CSRF_NO_SESSION",
            Self::CsrfMissingToken => "CSRF_MISSING_TOKEN",
            Self::CsrfInvalidToken => "CSRF_INVALID_TOKEN",
            Self::CorsForbidden(_) => "CORS_FORBIDDEN",
            Self::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Self::ValidationFailed { .. } => "VALIDATION_FAILED",
            Self::SecurityThreatBlocked { .. } => "SECURITY_THREAT_BLOCKED",
            Self::OidcInvalidToken(_) => "OIDC_INVALID_TOKEN",
            Self::OauthStateInvalid => "OAUTH_STATE_INVALID",
            Self::OidcUnavailable(_) => "OIDC_UNAVAILABLE",
            Self::ProxyTimeout => "PROXY_TIMEOUT",
            Self::ProxyFailed(_) => "PROXY_FAILED",
            Self::PolicyNotFound(_) => "POLICY_NOT_FOUND",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Kv(_) | Self::Config(_) | Self::Json(_) | Self::Http(_) | Self::Internal(_) => {
                "INTERNAL_ERROR"
            }
        }
    }

    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized | Self::SessionExpired | Self::OidcInvalidToken(_) => {
                StatusCode::UNAUTHORIZED
            }
            Self::Forbidden(_)
            | Self::TenantAccessDenied
            | Self::CsrfNoSession
            | Self::CsrfMissingToken
            | Self::CsrfInvalidToken
            | Self::CorsForbidden(_)
            | Self::SecurityThreatBlocked { .. } => StatusCode::FORBIDDEN,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ValidationFailed { .. } | Self::OauthStateInvalid => StatusCode::BAD_REQUEST,
            Self::PolicyNotFound(_) | Self::SessionNotFound => StatusCode::NOT_FOUND,
            Self::OidcUnavailable(_) | Self::ProxyFailed(_) => StatusCode::BAD_GATEWAY,
            Self::ProxyTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Kv(_) | Self::Config(_) | Self::Json(_) | Self::Http(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Optional structured details for the error body.
    ///
    /// Never includes internal causes; only data the client can act on.
    #[must_use]
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::ValidationFailed { details } => Some(serde_json::json!({ "errors": details })),
            Self::SecurityThreatBlocked { threat_type } => {
                Some(serde_json::json!({ "threat_type": threat_type }))
            }
            _ => None,
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Self::Kv(e.to_string())
    }
}

/// Wire error body carried inside the response envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    /// Taxonomy code (e.g. `SESSION_EXPIRED`).
    pub code: String,
    /// Client-safe message.
    pub message: String,
    /// Trace ID of the failed request.
    #[serde(rename = "traceId")]
    pub trace_id: String,
    /// Optional structured details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Uniform response envelope: `{ success, data?, error? }`.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T: Serialize> {
    /// Whether the request succeeded.
    pub success: bool,
    /// Payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error body on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl<T: Serialize> ApiResponse<T> {
    /// Success envelope wrapping `data`.
    #[must_use]
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<Value> {
    /// Error envelope for `err` with the given trace ID.
    #[must_use]
    pub fn err(err: &Error, trace_id: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: err.code().to_string(),
                message: err.to_string(),
                trace_id,
                details: err.details(),
            }),
        }
    }
}

/// Name of the trace header attached to every response.
pub const TRACE_HEADER: &str = "x-keyfront-trace-id";

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let trace_id = trace::current_or_new();
        let status = self.status();
        let body = ApiResponse::err(&self, trace_id.clone());

        let mut response = (status, axum::Json(body)).into_response();
        if let Ok(value) = trace_id.parse() {
            response.headers_mut().insert(TRACE_HEADER, value);
        }

        // Rate-limit responses carry standard limiter headers.
        if let Self::RateLimitExceeded { retry_after, limit } = &self {
            let headers = response.headers_mut();
            if let Ok(v) = retry_after.to_string().parse() {
                headers.insert("retry-after", v);
            }
            if let Ok(v) = limit.to_string().parse() {
                headers.insert("x-ratelimit-limit", v);
            }
            if let Ok(v) = "0".parse() {
                headers.insert("x-ratelimit-remaining", v);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_maps_to_a_code_and_status() {
        let cases: Vec<(Error, &str, StatusCode)> = vec![
            (Error::Unauthorized, "UNAUTHORIZED", StatusCode::UNAUTHORIZED),
            (Error::SessionExpired, "SESSION_EXPIRED", StatusCode::UNAUTHORIZED),
            (
                Error::Forbidden("nope".into()),
                "FORBIDDEN",
                StatusCode::FORBIDDEN,
            ),
            (
                Error::TenantAccessDenied,
                "TENANT_ACCESS_DENIED",
                StatusCode::FORBIDDEN,
            ),
            (Error::CsrfNoSession, "CSRF_NO_SESSION", StatusCode::FORBIDDEN),
            (
                Error::CsrfMissingToken,
                "CSRF_MISSING_TOKEN",
                StatusCode::FORBIDDEN,
            ),
            (
                Error::CsrfInvalidToken,
                "CSRF_INVALID_TOKEN",
                StatusCode::FORBIDDEN,
            ),
            (
                Error::CorsForbidden("https://evil.test".into()),
                "CORS_FORBIDDEN",
                StatusCode::FORBIDDEN,
            ),
            (
                Error::RateLimitExceeded {
                    retry_after: 60,
                    limit: 5,
                },
                "RATE_LIMIT_EXCEEDED",
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                Error::ValidationFailed { details: vec![] },
                "VALIDATION_FAILED",
                StatusCode::BAD_REQUEST,
            ),
            (
                Error::SecurityThreatBlocked {
                    threat_type: "sql_injection".into(),
                },
                "SECURITY_THREAT_BLOCKED",
                StatusCode::FORBIDDEN,
            ),
            (
                Error::OidcInvalidToken("bad sig".into()),
                "OIDC_INVALID_TOKEN",
                StatusCode::UNAUTHORIZED,
            ),
            (
                Error::OauthStateInvalid,
                "OAUTH_STATE_INVALID",
                StatusCode::BAD_REQUEST,
            ),
            (
                Error::OidcUnavailable("connect refused".into()),
                "OIDC_UNAVAILABLE",
                StatusCode::BAD_GATEWAY,
            ),
            (Error::ProxyTimeout, "PROXY_TIMEOUT", StatusCode::GATEWAY_TIMEOUT),
            (
                Error::ProxyFailed("502".into()),
                "PROXY_FAILED",
                StatusCode::BAD_GATEWAY,
            ),
            (
                Error::PolicyNotFound("p1".into()),
                "POLICY_NOT_FOUND",
                StatusCode::NOT_FOUND,
            ),
            (
                Error::Internal("boom".into()),
                "INTERNAL_ERROR",
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                Error::ServiceUnavailable("redis down".into()),
                "SERVICE_UNAVAILABLE",
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];

        for (err, code, status) in cases {
            assert_eq!(err.code(), code);
            assert_eq!(err.status(), status);
        }
    }

    #[test]
    fn kv_errors_surface_as_internal() {
        // KV outages must not fail open into an authenticated state.
        let err = Error::Kv("connection reset".into());
        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn error_body_serializes_trace_id_camel_case() {
        let body = ErrorBody {
            code: "UNAUTHORIZED".into(),
            message: "Authentication required".into(),
            trace_id: "kf-abc".into(),
            details: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["traceId"], "kf-abc");
        assert!(json.get("details").is_none());
    }

    #[test]
    fn validation_details_carry_paths() {
        let err = Error::ValidationFailed {
            details: vec!["body.name: expected string".into()],
        };
        let details = err.details().unwrap();
        assert_eq!(details["errors"][0], "body.name: expected string");
    }

    #[test]
    fn success_envelope_has_no_error() {
        let resp = ApiResponse::ok(serde_json::json!({"id": "user1"}));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], true);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn error_envelope_has_no_data() {
        let resp = ApiResponse::err(&Error::Unauthorized, "kf-1".into());
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "UNAUTHORIZED");
        assert!(json.get("data").is_none());
    }
}
