//! CORS policy — per-tenant origin allow-lists with a global fallback.
//!
//! The global policy comes from `CORS_ORIGINS` (`*`, `false`, or a comma
//! list); tenants may carry their own allow-list which is consulted first.
//! Because the gateway runs with credentials (the session cookie),
//! `Access-Control-Allow-Origin` always echoes the concrete origin — never
//! `*`. Development mode additionally admits `localhost`/`127.0.0.1` on any
//! port.

use url::Url;

use crate::config::{CorsConfig, Environment};

/// Methods advertised on preflight responses.
pub const ALLOWED_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, OPTIONS";

/// Request headers the gateway accepts from browsers.
pub const ALLOWED_HEADERS: &[&str] = &[
    "accept",
    "content-type",
    "authorization",
    "x-csrf-token",
    "x-requested-with",
    "x-trace-id",
];

/// Parsed global origin policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginPolicy {
    /// Any origin is allowed (still echoed concretely, never `*`).
    Any,
    /// Cross-origin requests are rejected.
    Disabled,
    /// Explicit allow-list.
    List(Vec<String>),
}

impl OriginPolicy {
    /// Parse a `CORS_ORIGINS` value.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "*" => Self::Any,
            "" | "false" => Self::Disabled,
            list => Self::List(
                list.split(',')
                    .map(|o| o.trim().trim_end_matches('/').to_string())
                    .filter(|o| !o.is_empty())
                    .collect(),
            ),
        }
    }
}

/// CORS decision engine.
pub struct CorsManager {
    global: OriginPolicy,
    dev_mode: bool,
    max_age_secs: u64,
}

impl CorsManager {
    /// Build from configuration.
    #[must_use]
    pub fn new(config: &CorsConfig, environment: Environment) -> Self {
        Self {
            global: OriginPolicy::parse(&config.origins),
            dev_mode: !environment.is_production(),
            max_age_secs: config.max_age_secs,
        }
    }

    /// Whether `origin` may make cross-origin requests, given an optional
    /// tenant allow-list (consulted before the global policy).
    #[must_use]
    pub fn is_allowed(&self, origin: &str, tenant_origins: Option<&[String]>) -> bool {
        let origin = origin.trim_end_matches('/');

        if let Some(list) = tenant_origins {
            if list.iter().any(|o| o.trim_end_matches('/') == origin) {
                return true;
            }
        }

        if self.dev_mode && is_loopback_origin(origin) {
            return true;
        }

        match &self.global {
            OriginPolicy::Any => true,
            OriginPolicy::Disabled => false,
            OriginPolicy::List(list) => list.iter().any(|o| o == origin),
        }
    }

    /// Intersect the preflight's `Access-Control-Request-Headers` with the
    /// gateway allow-list; only the intersection is echoed.
    #[must_use]
    pub fn allowed_request_headers(&self, requested: &str) -> String {
        requested
            .split(',')
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| ALLOWED_HEADERS.contains(&h.as_str()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Preflight `Access-Control-Max-Age` value.
    #[must_use]
    pub fn max_age(&self) -> u64 {
        self.max_age_secs
    }
}

/// True for `http(s)://localhost[:port]` and `http(s)://127.0.0.1[:port]`.
fn is_loopback_origin(origin: &str) -> bool {
    let Ok(url) = Url::parse(origin) else {
        return false;
    };
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }
    matches!(url.host_str(), Some("localhost" | "127.0.0.1"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(origins: &str, env: Environment) -> CorsManager {
        CorsManager::new(
            &CorsConfig {
                origins: origins.to_string(),
                max_age_secs: 600,
            },
            env,
        )
    }

    #[test]
    fn parse_star_is_any() {
        assert_eq!(OriginPolicy::parse("*"), OriginPolicy::Any);
    }

    #[test]
    fn parse_false_is_disabled() {
        assert_eq!(OriginPolicy::parse("false"), OriginPolicy::Disabled);
        assert_eq!(OriginPolicy::parse(""), OriginPolicy::Disabled);
    }

    #[test]
    fn parse_csv_is_list() {
        let policy = OriginPolicy::parse("https://app.example.com, https://admin.example.com/");
        assert_eq!(
            policy,
            OriginPolicy::List(vec![
                "https://app.example.com".to_string(),
                "https://admin.example.com".to_string(),
            ])
        );
    }

    #[test]
    fn list_policy_matches_exact_origin() {
        let m = manager("https://app.example.com", Environment::Production);
        assert!(m.is_allowed("https://app.example.com", None));
        assert!(m.is_allowed("https://app.example.com/", None));
        assert!(!m.is_allowed("https://evil.example.com", None));
    }

    #[test]
    fn disabled_policy_rejects_everything_in_production() {
        let m = manager("false", Environment::Production);
        assert!(!m.is_allowed("https://app.example.com", None));
        assert!(!m.is_allowed("http://localhost:3000", None));
    }

    #[test]
    fn tenant_allowlist_overrides_global() {
        // Tenant origins are consulted before the global policy.
        let m = manager("false", Environment::Production);
        let tenant = vec!["https://tenant.example.com".to_string()];
        assert!(m.is_allowed("https://tenant.example.com", Some(&tenant)));
        assert!(!m.is_allowed("https://other.example.com", Some(&tenant)));
    }

    #[test]
    fn dev_mode_admits_loopback_on_any_port() {
        let m = manager("false", Environment::Development);
        assert!(m.is_allowed("http://localhost:3000", None));
        assert!(m.is_allowed("http://localhost:8081", None));
        assert!(m.is_allowed("http://127.0.0.1:5173", None));
        assert!(!m.is_allowed("http://192.168.1.10:3000", None));
    }

    #[test]
    fn production_does_not_admit_loopback() {
        let m = manager("false", Environment::Production);
        assert!(!m.is_allowed("http://localhost:3000", None));
    }

    #[test]
    fn requested_headers_intersected_with_allowlist() {
        let m = manager("*", Environment::Production);
        let echoed = m.allowed_request_headers("Content-Type, X-CSRF-Token, X-Evil-Header");
        assert_eq!(echoed, "content-type, x-csrf-token");
    }

    #[test]
    fn non_http_origin_is_not_loopback() {
        assert!(!is_loopback_origin("file://localhost"));
        assert!(!is_loopback_origin("not a url"));
    }
}
