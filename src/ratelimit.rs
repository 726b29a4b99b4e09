//! Fixed-window rate limiting over the KV store.
//!
//! For a key `k` and window `W` ms the counter lives at
//! `ratelimit:{k}:{floor(now/W)}`; each check is one pipelined
//! `INCR`+`EXPIRE`. The limiter **fails open**: a KV error returns
//! `allowed = true` with `current = 0` — a limiter outage must not take
//! down the gateway, and the KV problem is visible to outage monitors
//! anyway.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::kv::Kv;

/// Outcome of a limiter check.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Requests counted in the current window (0 on fail-open).
    pub current: u64,
    /// Requests remaining in the current window.
    pub remaining: u64,
    /// Window limit.
    pub limit: u32,
    /// When the current window ends (ms since epoch).
    pub reset_time: i64,
    /// Exact seconds until the window ends; set when denied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// One named limit: key, window, and max requests per window.
#[derive(Debug, Clone)]
pub struct Limit {
    /// Limiter key (already namespaced, e.g. `user:t1:alice`).
    pub key: String,
    /// Window size.
    pub window: Duration,
    /// Maximum requests per window.
    pub max: u32,
}

impl Limit {
    /// Build a limit.
    #[must_use]
    pub fn new(key: impl Into<String>, window: Duration, max: u32) -> Self {
        Self {
            key: key.into(),
            window,
            max,
        }
    }
}

/// Keying policies used across the gateway.
pub mod keys {
    /// Global limiter keyed by client IP.
    #[must_use]
    pub fn global_ip(ip: &str) -> String {
        format!("ip:{ip}")
    }

    /// Per-user limiter.
    #[must_use]
    pub fn user(tenant_id: &str, sub: &str) -> String {
        format!("user:{tenant_id}:{sub}")
    }

    /// Per-tenant limiter.
    #[must_use]
    pub fn tenant(tenant_id: &str) -> String {
        format!("tenant:{tenant_id}")
    }

    /// Login attempts per client IP.
    #[must_use]
    pub fn login_ip(ip: &str) -> String {
        format!("login:{ip}")
    }

    /// Per-endpoint + identity limiter.
    #[must_use]
    pub fn endpoint(path: &str, identity: &str) -> String {
        format!("api:{path}:{identity}")
    }
}

/// Fixed-window limiter over the KV store.
pub struct RateLimiter {
    kv: Arc<dyn Kv>,
}

impl RateLimiter {
    /// Create a limiter over `kv`.
    #[must_use]
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    /// Check and count one request against `limit`.
    pub async fn check(&self, limit: &Limit) -> RateLimitDecision {
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.check_at(limit, now_ms).await
    }

    /// Check at an explicit clock value (deterministic window math).
    pub async fn check_at(&self, limit: &Limit, now_ms: i64) -> RateLimitDecision {
        #[allow(clippy::cast_possible_wrap)]
        let window_ms = limit.window.as_millis() as i64;
        let window_id = now_ms.div_euclid(window_ms);
        let reset_time = (window_id + 1) * window_ms;
        let storage_key = format!("ratelimit:{}:{window_id}", limit.key);

        let current = match self.kv.incr_and_expire(&storage_key, limit.window).await {
            #[allow(clippy::cast_sign_loss)]
            Ok(n) => n.max(0) as u64,
            Err(e) => {
                // Fail open: a limiter outage must not take down the gateway.
                warn!(key = %limit.key, error = %e, "Rate limiter KV error, failing open");
                return RateLimitDecision {
                    allowed: true,
                    current: 0,
                    remaining: u64::from(limit.max),
                    limit: limit.max,
                    reset_time,
                    retry_after: None,
                };
            }
        };

        let allowed = current <= u64::from(limit.max);
        let remaining = u64::from(limit.max).saturating_sub(current);
        // Exact time to the next window, not the window size.
        #[allow(clippy::cast_sign_loss)]
        let to_window_end = ((reset_time - now_ms).max(0) as u64).div_ceil(1000);
        let retry_after = if allowed { None } else { Some(to_window_end) };

        RateLimitDecision {
            allowed,
            current,
            remaining,
            limit: limit.max,
            reset_time,
            retry_after,
        }
    }

    /// Run several limits in order; the first denial wins. When all permit,
    /// the decision with the fewest remaining requests is returned.
    pub async fn check_all(&self, limits: &[Limit]) -> RateLimitDecision {
        let mut most_restrictive: Option<RateLimitDecision> = None;

        for limit in limits {
            let decision = self.check(limit).await;
            if !decision.allowed {
                return decision;
            }
            let tighter = most_restrictive
                .as_ref()
                .is_none_or(|best| decision.remaining < best.remaining);
            if tighter {
                most_restrictive = Some(decision);
            }
        }

        most_restrictive.unwrap_or(RateLimitDecision {
            allowed: true,
            current: 0,
            remaining: u64::MAX,
            limit: u32::MAX,
            reset_time: 0,
            retry_after: None,
        })
    }
}
