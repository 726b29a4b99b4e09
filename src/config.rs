//! Configuration management.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then environment variables. The flat environment keys
//! (`SESSION_COOKIE_NAME`, `KC_ISSUER_URL`, `REDIS_URL`, ...) are the
//! deployment surface; the YAML file mirrors the structure below for local
//! development.

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Runtime environment. Controls cookie `Secure`, scanner blocking policy,
/// and CORS localhost allowances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Production hardening: Secure cookies, scanner blocks high/critical.
    Production,
    /// Development: localhost CORS, scanner logs and sanitizes.
    #[default]
    Development,
}

impl Environment {
    /// True in production mode.
    #[must_use]
    pub fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Runtime environment.
    pub environment: Environment,
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Session cookie and store settings.
    pub session: SessionConfig,
    /// CSRF double-submit settings.
    pub csrf: CsrfConfig,
    /// OIDC provider settings.
    pub oidc: OidcConfig,
    /// Key-value store settings.
    pub kv: KvConfig,
    /// Downstream API / WebSocket settings.
    pub downstream: DownstreamConfig,
    /// CORS settings.
    pub cors: CorsConfig,
    /// WebSocket bridge settings.
    pub websocket: WsConfig,
    /// Signing settings for exchanged and logout tokens.
    pub tokens: TokenConfig,
    /// Request rate limiting.
    pub ratelimit: RateLimitConfig,
    /// Input validation / security scanning.
    pub security: SecurityConfig,
    /// Audit log batching.
    pub audit: AuditConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Graceful-shutdown drain timeout in seconds.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            shutdown_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Drain timeout as a [`Duration`].
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Session cookie and store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Cookie name carrying the opaque session id.
    pub cookie_name: String,
    /// HMAC base secret; CSRF falls back to this when `csrf.secret` is unset.
    pub secret: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "keyfront.sid".to_string(),
            secret: String::new(),
        }
    }
}

/// CSRF double-submit settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CsrfConfig {
    /// HMAC secret binding tokens to sessions. Falls back to `session.secret`.
    pub secret: String,
    /// Token lifetime in seconds.
    pub ttl_secs: u64,
    /// Cookie name carrying the client-readable token copy.
    pub cookie_name: String,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            ttl_secs: 3600,
            cookie_name: "keyfront.csrf".to_string(),
        }
    }
}

/// OIDC provider settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OidcConfig {
    /// Issuer URL (discovery base).
    pub issuer_url: String,
    /// Registered client id.
    pub client_id: String,
    /// Client secret.
    pub client_secret: String,
    /// Redirect URI registered for the authorization-code flow.
    pub redirect_uri: String,
}

/// Key-value store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    /// Connection URL (`redis://...`).
    pub url: String,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Downstream API / WebSocket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownstreamConfig {
    /// Base URL of the downstream HTTP API.
    pub api_base: String,
    /// Total per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Transport-level retries (also 502/503/504 for idempotent methods).
    pub retries: u32,
    /// Linear backoff step in milliseconds (`retry_delay * attempt`).
    pub retry_delay_ms: u64,
    /// Downstream WebSocket URL.
    pub ws_url: String,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            api_base: String::new(),
            timeout_ms: 30_000,
            retries: 3,
            retry_delay_ms: 250,
            ws_url: String::new(),
        }
    }
}

impl DownstreamConfig {
    /// Per-request timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// CORS settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Global origin policy: `"*"`, `"false"`, or a comma-separated list.
    pub origins: String,
    /// Preflight `Access-Control-Max-Age` in seconds.
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            origins: "false".to_string(),
            max_age_secs: 600,
        }
    }
}

/// WebSocket bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WsConfig {
    /// Maximum concurrent connections per user.
    pub max_user_connections: usize,
    /// Maximum concurrent connections per tenant.
    pub max_tenant_connections: usize,
    /// Server keepalive ping interval in seconds.
    pub ping_interval_secs: u64,
    /// Idle timeout in seconds before the reaper closes a connection.
    pub idle_timeout_secs: u64,
    /// Per-user `proxy` frame limit (messages per minute).
    pub proxy_messages_per_minute: u32,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            max_user_connections: 5,
            max_tenant_connections: 100,
            ping_interval_secs: 30,
            idle_timeout_secs: 300,
            proxy_messages_per_minute: 120,
        }
    }
}

/// Signing settings for exchanged and logout tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// HS256 signing secret.
    pub jwt_secret: String,
    /// `iss` claim of minted tokens.
    pub issuer: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            issuer: "keyfront".to_string(),
        }
    }
}

/// Request rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable the limiter chain.
    pub enabled: bool,
    /// Global per-IP window in milliseconds.
    pub window_ms: u64,
    /// Global per-IP request limit per window.
    pub max_requests: u32,
    /// Per-IP login attempt limit per window.
    pub login_max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 60_000,
            max_requests: 300,
            login_max_requests: 10,
        }
    }
}

/// Input validation / security scanning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Enable the threat scanner on request bodies.
    pub scanner_enabled: bool,
    /// Maximum string length scanned; longer inputs are truncated first.
    pub max_string_length: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            scanner_enabled: true,
            max_string_length: 10_000,
        }
    }
}

/// Audit log batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Flush interval in milliseconds.
    pub flush_interval_ms: u64,
    /// Flush when the in-memory buffer reaches this size.
    pub batch_size: usize,
    /// Maximum retained queue length in the KV store.
    pub max_queue_len: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 1000,
            batch_size: 50,
            max_queue_len: 100_000,
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the YAML file (if given), then
    /// environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be parsed or required
    /// production secrets are missing.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }

        let mut config: Config = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply the flat environment keys over the file/default values.
    fn apply_env(&mut self) {
        if let Some(v) = env_nonempty("KEYFRONT_ENV").or_else(|| env_nonempty("NODE_ENV")) {
            self.environment = if v.eq_ignore_ascii_case("production") {
                Environment::Production
            } else {
                Environment::Development
            };
        }
        if let Some(v) = env_nonempty("SESSION_COOKIE_NAME") {
            self.session.cookie_name = v;
        }
        if let Some(v) = env_nonempty("SESSION_SECRET") {
            self.session.secret = v;
        }
        if let Some(v) = env_nonempty("CSRF_SECRET") {
            self.csrf.secret = v;
        }
        if let Some(v) = env_nonempty("KC_ISSUER_URL") {
            self.oidc.issuer_url = v;
        }
        if let Some(v) = env_nonempty("KC_CLIENT_ID") {
            self.oidc.client_id = v;
        }
        if let Some(v) = env_nonempty("KC_CLIENT_SECRET") {
            self.oidc.client_secret = v;
        }
        if let Some(v) = env_nonempty("KC_REDIRECT_URI") {
            self.oidc.redirect_uri = v;
        }
        if let Some(v) = env_nonempty("REDIS_URL") {
            self.kv.url = v;
        }
        if let Some(v) = env_nonempty("DOWNSTREAM_API_BASE") {
            self.downstream.api_base = v;
        }
        if let Some(v) = env_parse("DOWNSTREAM_API_TIMEOUT") {
            self.downstream.timeout_ms = v;
        }
        if let Some(v) = env_nonempty("DOWNSTREAM_WS_URL") {
            self.downstream.ws_url = v;
        }
        if let Some(v) = env_nonempty("CORS_ORIGINS") {
            self.cors.origins = v;
        }
        if let Some(v) = env_parse("WS_MAX_USER_CONNECTIONS") {
            self.websocket.max_user_connections = v;
        }
        if let Some(v) = env_parse("WS_MAX_TENANT_CONNECTIONS") {
            self.websocket.max_tenant_connections = v;
        }
        if let Some(v) = env_nonempty("JWT_SECRET") {
            self.tokens.jwt_secret = v;
        }
        if let Some(v) = env_nonempty("TOKEN_ISSUER") {
            self.tokens.issuer = v;
        }
    }

    /// Secret used for CSRF HMAC binding: `csrf.secret`, falling back to
    /// `session.secret`.
    #[must_use]
    pub fn csrf_secret(&self) -> &str {
        if self.csrf.secret.is_empty() {
            &self.session.secret
        } else {
            &self.csrf.secret
        }
    }

    fn validate(&self) -> Result<()> {
        if self.environment.is_production() {
            if self.session.secret.is_empty() {
                return Err(Error::Config(
                    "SESSION_SECRET is required in production".to_string(),
                ));
            }
            if self.tokens.jwt_secret.is_empty() {
                return Err(Error::Config(
                    "JWT_SECRET is required in production".to_string(),
                ));
            }
        }
        if self.websocket.max_user_connections == 0 {
            return Err(Error::Config(
                "websocket.max_user_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_nonempty(key).and_then(|v| v.parse().ok())
}
