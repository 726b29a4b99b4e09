//! Gateway server — component wiring and lifecycle.
//!
//! Every service is constructed once here and passed explicitly through
//! [`AppState`]; nothing is process-global. Signal handlers are installed
//! only by the binary's entrypoint via [`shutdown_signal`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use crate::abac::Pdp;
use crate::audit::{AuditLogger, spawn_flusher};
use crate::config::Config;
use crate::cors::CorsManager;
use crate::csrf::CsrfService;
use crate::errtrack::ErrorTracker;
use crate::exchange::TokenExchangeService;
use crate::kv::{Kv, RedisKv};
use crate::logout::{BackchannelLogoutService, TerminationHook};
use crate::metrics::Metrics;
use crate::oidc::OidcClient;
use crate::ratelimit::RateLimiter;
use crate::session::SessionStore;
use crate::tenant::TenantStore;
use crate::{Error, Result};

use super::proxy::ReverseProxy;
use super::router::{AppState, create_router};
use super::ws::{WsRegistry, spawn_idle_reaper};

/// Permits for the in-flight request drain.
const INFLIGHT_PERMITS: u32 = 10_000;

/// The Keyfront gateway server.
pub struct Gateway {
    config: Config,
}

impl Gateway {
    /// Create a gateway from configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until a shutdown signal arrives, then drain in-flight requests.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("invalid host: {e}")))?,
            self.config.server.port,
        );

        info!(url = %self.config.kv.url, "Connecting to KV store");
        let kv: Arc<dyn Kv> = Arc::new(RedisKv::connect(&self.config.kv.url).await?);

        let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
        let state = build_state(self.config.clone(), kv);

        // Background tasks: audit flusher and WebSocket idle reaper.
        spawn_flusher(
            Arc::clone(&state.audit),
            std::time::Duration::from_millis(state.config.audit.flush_interval_ms),
            shutdown_tx.subscribe(),
        );
        spawn_idle_reaper(Arc::clone(&state.ws), shutdown_tx.subscribe());

        let app = create_router(Arc::clone(&state));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Config(format!("bind {addr} failed: {e}")))?;

        info!("============================================================");
        info!("KEYFRONT v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = self.config.server.port, "Listening");
        info!(
            environment = ?self.config.environment,
            issuer = %self.config.oidc.issuer_url,
            downstream = %self.config.downstream.api_base,
            "Gateway configuration"
        );
        if self.config.oidc.issuer_url.is_empty() {
            warn!("No OIDC issuer configured - login is unavailable");
        }
        if self.config.downstream.api_base.is_empty() {
            warn!("No downstream API configured - /api/proxy is unavailable");
        }

        let inflight = Arc::clone(&state.inflight);
        let audit = Arc::clone(&state.audit);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx.clone()))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        // Drain: each in-flight request holds a permit; acquiring all of
        // them means the pipeline is empty.
        let drain_timeout = self.config.server.shutdown_timeout();
        info!(timeout = ?drain_timeout, "Draining in-flight requests");
        match tokio::time::timeout(drain_timeout, inflight.acquire_many(INFLIGHT_PERMITS)).await {
            Ok(Ok(_permits)) => info!("All in-flight requests completed"),
            Ok(Err(_)) => warn!("Inflight semaphore closed unexpectedly during drain"),
            Err(_) => {
                let remaining =
                    (INFLIGHT_PERMITS as usize).saturating_sub(inflight.available_permits());
                warn!(remaining, "Drain timeout reached, shutting down anyway");
            }
        }

        audit.flush().await;
        info!("Gateway shutdown complete");
        Ok(())
    }
}

/// Construct the full application state over any KV backend.
///
/// Exposed so tests can wire the gateway over an in-memory store.
#[must_use]
pub fn build_state(config: Config, kv: Arc<dyn Kv>) -> Arc<AppState> {
    let metrics = Arc::new(Metrics::new());
    let audit = Arc::new(AuditLogger::new(Arc::clone(&kv), config.audit.clone()));
    let errors = Arc::new(ErrorTracker::new(Arc::clone(&kv), Some(Arc::clone(&audit))));
    let limiter = Arc::new(RateLimiter::new(Arc::clone(&kv)));
    let sessions = Arc::new(SessionStore::new(Arc::clone(&kv)));
    let csrf = Arc::new(CsrfService::new(
        Arc::clone(&kv),
        config.csrf_secret().as_bytes().to_vec(),
        std::time::Duration::from_secs(config.csrf.ttl_secs),
    ));
    let cors = Arc::new(CorsManager::new(&config.cors, config.environment));
    let oidc = Arc::new(OidcClient::new(config.oidc.clone(), Arc::clone(&kv)));
    let pdp = Arc::new(Pdp::new(Arc::clone(&kv), Some(Arc::clone(&audit))));
    let exchange = Arc::new(TokenExchangeService::new(
        Arc::clone(&kv),
        Some(Arc::clone(&audit)),
        config.tokens.jwt_secret.as_bytes().to_vec(),
        config.tokens.issuer.clone(),
    ));
    let ws = Arc::new(WsRegistry::new(
        config.websocket.clone(),
        Arc::clone(&metrics),
    ));
    let logout = Arc::new(BackchannelLogoutService::new(
        Arc::clone(&kv),
        Arc::clone(&sessions),
        Some(Arc::clone(&audit)),
        config.tokens.jwt_secret.as_bytes().to_vec(),
        config.tokens.issuer.clone(),
        Some(Arc::clone(&ws) as Arc<dyn TerminationHook>),
    ));
    let tenants = Arc::new(TenantStore::new(Arc::clone(&kv)));
    let proxy = Arc::new(ReverseProxy::new(config.downstream.clone()));

    Arc::new(AppState {
        config,
        kv,
        sessions,
        oidc,
        csrf,
        cors,
        limiter,
        audit,
        errors,
        metrics,
        pdp,
        exchange,
        logout,
        tenants,
        proxy,
        ws,
        inflight: Arc::new(tokio::sync::Semaphore::new(INFLIGHT_PERMITS as usize)),
    })
}

/// Resolve on SIGINT/SIGTERM and fan the shutdown out to background tasks.
pub async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
