//! Keyfront — Backend-for-Frontend security gateway.
//!
//! Keyfront terminates user sessions established against an external OIDC
//! provider, keeps all tokens server-side (the browser holds one opaque,
//! HttpOnly cookie), enforces CSRF / rate limits / input scanning / ABAC on
//! every request, and proxies authorized HTTP and WebSocket traffic to
//! downstream services with identity headers injected.
//!
//! # Architecture
//!
//! - **State** lives in a Redis-compatible KV store behind the [`kv::Kv`]
//!   trait: sessions, CSRF tokens, login state, rate-limit counters,
//!   policies, and the audit queue.
//! - **The middleware chain** (trace → audit → CORS → rate limit → session
//!   → CSRF) wraps every route; see [`gateway::middleware`].
//! - **Authorization** combines an ABAC decision point ([`abac`]) with an
//!   RFC 8693 token exchange broker ([`exchange`]).
//! - **Session teardown** cascades: back-channel logout ([`logout`])
//!   notifies registered clients and closes WebSocket bridges.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod abac;
pub mod audit;
pub mod cli;
pub mod config;
pub mod cors;
pub mod csrf;
pub mod errtrack;
pub mod error;
pub mod exchange;
pub mod gateway;
pub mod kv;
pub mod logout;
pub mod metrics;
pub mod oidc;
pub mod ratelimit;
pub mod security;
pub mod session;
pub mod tenant;
pub mod trace;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
