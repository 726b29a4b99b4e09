//! HTTP router and shared application state.

use std::sync::Arc;

use axum::{
    Router,
    middleware as axum_middleware,
    routing::{any, get, post},
};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use crate::abac::Pdp;
use crate::audit::AuditLogger;
use crate::config::Config;
use crate::cors::CorsManager;
use crate::csrf::CsrfService;
use crate::errtrack::ErrorTracker;
use crate::exchange::TokenExchangeService;
use crate::kv::Kv;
use crate::logout::BackchannelLogoutService;
use crate::metrics::Metrics;
use crate::oidc::OidcClient;
use crate::ratelimit::RateLimiter;
use crate::session::SessionStore;
use crate::tenant::TenantStore;

use super::middleware::{
    audit_middleware, cors_middleware, csrf_middleware, ratelimit_middleware, session_middleware,
    trace_middleware,
};
use super::proxy::ReverseProxy;
use super::ws::WsRegistry;
use super::{admin, handlers};

/// Shared application state, constructed once at startup and passed
/// explicitly — no process-wide singletons.
pub struct AppState {
    /// Gateway configuration.
    pub config: Config,
    /// KV store handle.
    pub kv: Arc<dyn Kv>,
    /// Session store.
    pub sessions: Arc<SessionStore>,
    /// OIDC client for the configured provider.
    pub oidc: Arc<OidcClient>,
    /// CSRF token service.
    pub csrf: Arc<CsrfService>,
    /// CORS decision engine.
    pub cors: Arc<CorsManager>,
    /// Rate limiter.
    pub limiter: Arc<RateLimiter>,
    /// Audit logger.
    pub audit: Arc<AuditLogger>,
    /// Error tracker.
    pub errors: Arc<ErrorTracker>,
    /// Metric registry.
    pub metrics: Arc<Metrics>,
    /// ABAC decision point.
    pub pdp: Arc<Pdp>,
    /// Token exchange service.
    pub exchange: Arc<TokenExchangeService>,
    /// Back-channel logout orchestrator.
    pub logout: Arc<BackchannelLogoutService>,
    /// Tenant store.
    pub tenants: Arc<TenantStore>,
    /// Reverse proxy to the downstream API.
    pub proxy: Arc<ReverseProxy>,
    /// WebSocket bridge registry.
    pub ws: Arc<WsRegistry>,
    /// In-flight request tracker for graceful drain.
    pub inflight: Arc<tokio::sync::Semaphore>,
}

/// Build the router with the full middleware chain.
///
/// Layer order (outermost first): trace-ID, panic catcher, HTTP tracing,
/// audit, CORS, rate limiting, session resolution, CSRF.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Session lifecycle
        .route("/api/login", get(handlers::login))
        .route("/api/callback", get(handlers::callback))
        .route("/api/logout", post(handlers::logout))
        .route("/api/me", get(handlers::me))
        .route("/api/csrf", get(handlers::csrf_token))
        // Health and telemetry
        .route("/api/health", get(handlers::health))
        .route("/api/health/live", get(handlers::health_live))
        .route("/api/health/ready", get(handlers::health_ready))
        .route("/api/health/detailed", get(handlers::health_detailed))
        .route("/api/metrics", get(handlers::metrics))
        // Reverse proxy and WebSocket bridge
        .route("/api/proxy/{*path}", any(super::proxy::proxy_handler))
        .route("/api/ws", get(super::ws::ws_handler))
        // Token exchange
        .route("/api/token/exchange", post(admin::token_exchange))
        // Back-channel logout
        .route("/api/logout/backchannel", post(admin::backchannel_logout))
        .route(
            "/api/logout/backchannel/receive",
            post(handlers::backchannel_receive),
        )
        .route(
            "/api/logout/backchannel/events",
            get(admin::backchannel_events),
        )
        // Admin CRUD surfaces
        .route(
            "/api/abac/policies",
            get(admin::list_abac_policies).post(admin::put_abac_policy),
        )
        .route(
            "/api/abac/policies/{id}",
            get(admin::get_abac_policy)
                .put(admin::put_abac_policy_by_id)
                .delete(admin::delete_abac_policy),
        )
        .route(
            "/api/token-exchange/policies",
            get(admin::list_exchange_policies).post(admin::put_exchange_policy),
        )
        .route(
            "/api/token-exchange/policies/{id}",
            get(admin::get_exchange_policy)
                .put(admin::put_exchange_policy_by_id)
                .delete(admin::delete_exchange_policy),
        )
        .route("/api/audit/logs", get(admin::audit_logs))
        .route("/api/audit/stats", get(admin::audit_stats))
        .route(
            "/api/tenants",
            get(admin::list_tenants).post(admin::put_tenant),
        )
        .route(
            "/api/tenants/{id}",
            get(admin::get_tenant)
                .put(admin::put_tenant_by_id)
                .delete(admin::delete_tenant),
        )
        // Middleware chain; the last layer added runs first.
        .layer(axum_middleware::from_fn_with_state(
            Arc::clone(&state),
            csrf_middleware,
        ))
        .layer(axum_middleware::from_fn_with_state(
            Arc::clone(&state),
            session_middleware,
        ))
        .layer(axum_middleware::from_fn_with_state(
            Arc::clone(&state),
            ratelimit_middleware,
        ))
        .layer(axum_middleware::from_fn_with_state(
            Arc::clone(&state),
            cors_middleware,
        ))
        .layer(axum_middleware::from_fn_with_state(
            Arc::clone(&state),
            audit_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .layer(axum_middleware::from_fn_with_state(
            Arc::clone(&state),
            trace_middleware,
        ))
        .with_state(state)
}
