//! Audit logging.
//!
//! Every request and every state-changing operation produces exactly one
//! audit event carrying the request's trace ID. Events are buffered
//! in-process and flushed FIFO in batches to the `audit:queue` list in the
//! KV store; a failed flush is logged and dropped rather than failing the
//! request path.
//!
//! Events are also emitted via `tracing::info!` with an `audit` field so
//! log aggregators see them even if the KV store is down.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::AuditConfig;
use crate::kv::Kv;
use crate::{Result, trace};

/// KV list holding flushed audit events (newest at the head).
pub const AUDIT_QUEUE_KEY: &str = "audit:queue";

/// Outcome of an audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    /// The operation was permitted and succeeded.
    Allow,
    /// The operation was denied by policy.
    Deny,
    /// The operation failed.
    Error,
    /// A security-relevant condition worth surfacing.
    Alert,
}

/// A single audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event id (UUID v4).
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Trace ID of the originating request.
    #[serde(rename = "traceId")]
    pub trace_id: String,
    /// Tenant the event belongs to.
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    /// Acting user, when authenticated.
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Action performed (e.g. `login.complete`, `proxy.forward`).
    pub action: String,
    /// Resource class the action touched.
    #[serde(rename = "resourceType")]
    pub resource_type: String,
    /// Specific resource id, when applicable.
    #[serde(rename = "resourceId", skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    /// Outcome.
    pub result: AuditResult,
    /// Denial/error reason, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Free-form structured context.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl AuditEvent {
    /// Build an event for `action` on `resource_type`, stamping the current
    /// trace ID and timestamp.
    #[must_use]
    pub fn new(
        tenant_id: impl Into<String>,
        action: impl Into<String>,
        resource_type: impl Into<String>,
        result: AuditResult,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            trace_id: trace::current_or_new(),
            tenant_id: tenant_id.into(),
            user_id: None,
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: None,
            result,
            reason: None,
            metadata: Value::Null,
        }
    }

    /// Attach the acting user.
    #[must_use]
    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach the specific resource id.
    #[must_use]
    pub fn resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    /// Attach a denial/error reason.
    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach structured metadata.
    #[must_use]
    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Filters for querying the audit queue.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    /// Restrict to one action.
    pub action: Option<String>,
    /// Restrict to one outcome.
    pub result: Option<AuditResult>,
    /// Events at or after this timestamp (ms).
    pub since: Option<i64>,
    /// Events at or before this timestamp (ms).
    pub until: Option<i64>,
    /// Page size.
    pub limit: usize,
    /// Page offset.
    pub offset: usize,
}

/// Aggregate statistics over a tenant's audit events.
#[derive(Debug, Clone, Serialize)]
pub struct AuditStats {
    /// Total events seen for the tenant in the retained queue.
    pub total: usize,
    /// Count per outcome.
    pub by_result: std::collections::BTreeMap<String, usize>,
    /// Count per action.
    pub by_action: std::collections::BTreeMap<String, usize>,
}

/// Batched, append-only audit recorder.
pub struct AuditLogger {
    kv: Arc<dyn Kv>,
    buffer: Mutex<Vec<AuditEvent>>,
    config: AuditConfig,
}

impl AuditLogger {
    /// Create a logger over `kv`.
    #[must_use]
    pub fn new(kv: Arc<dyn Kv>, config: AuditConfig) -> Self {
        Self {
            kv,
            buffer: Mutex::new(Vec::new()),
            config,
        }
    }

    /// Record one event; flushes inline when the batch threshold is hit.
    pub async fn record(&self, event: AuditEvent) {
        if let Ok(json) = serde_json::to_string(&event) {
            tracing::info!(audit = %json, "audit event");
        }

        let should_flush = {
            let mut buffer = self.buffer.lock();
            buffer.push(event);
            buffer.len() >= self.config.batch_size
        };

        if should_flush {
            self.flush().await;
        }
    }

    /// Flush buffered events FIFO to the KV queue.
    ///
    /// KV failures are logged and the batch is dropped; audit flushing must
    /// never fail a request.
    pub async fn flush(&self) {
        let batch: Vec<AuditEvent> = std::mem::take(&mut *self.buffer.lock());
        if batch.is_empty() {
            return;
        }

        for event in &batch {
            let json = match serde_json::to_string(event) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize audit event");
                    continue;
                }
            };
            if let Err(e) = self.kv.lpush(AUDIT_QUEUE_KEY, &json).await {
                warn!(error = %e, "Audit flush failed, dropping batch remainder");
                return;
            }
        }

        #[allow(clippy::cast_possible_wrap)]
        if let Err(e) = self
            .kv
            .ltrim(AUDIT_QUEUE_KEY, 0, self.config.max_queue_len as i64 - 1)
            .await
        {
            warn!(error = %e, "Audit queue trim failed");
        }

        debug!(count = batch.len(), "Flushed audit events");
    }

    /// Number of events currently buffered (test/introspection hook).
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Query the retained queue for one tenant, newest first.
    pub async fn query(&self, tenant_id: &str, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        let limit = if query.limit == 0 { 50 } else { query.limit };
        let raw = self.kv.lrange(AUDIT_QUEUE_KEY, 0, -1).await?;

        let events = raw
            .iter()
            .filter_map(|json| serde_json::from_str::<AuditEvent>(json).ok())
            .filter(|e| e.tenant_id == tenant_id)
            .filter(|e| query.action.as_ref().is_none_or(|a| &e.action == a))
            .filter(|e| query.result.is_none_or(|r| e.result == r))
            .filter(|e| query.since.is_none_or(|t| e.timestamp >= t))
            .filter(|e| query.until.is_none_or(|t| e.timestamp <= t))
            .skip(query.offset)
            .take(limit)
            .collect();
        Ok(events)
    }

    /// Aggregate counts over one tenant's retained events.
    pub async fn stats(&self, tenant_id: &str) -> Result<AuditStats> {
        let raw = self.kv.lrange(AUDIT_QUEUE_KEY, 0, -1).await?;
        let mut stats = AuditStats {
            total: 0,
            by_result: std::collections::BTreeMap::new(),
            by_action: std::collections::BTreeMap::new(),
        };

        for event in raw
            .iter()
            .filter_map(|json| serde_json::from_str::<AuditEvent>(json).ok())
            .filter(|e| e.tenant_id == tenant_id)
        {
            stats.total += 1;
            let result = format!("{:?}", event.result).to_lowercase();
            *stats.by_result.entry(result).or_insert(0) += 1;
            *stats.by_action.entry(event.action).or_insert(0) += 1;
        }
        Ok(stats)
    }
}

/// Spawn a background task flushing the logger every `interval`.
///
/// Exits (after a final flush) when the shutdown receiver fires.
pub fn spawn_flusher(
    logger: Arc<AuditLogger>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    logger.flush().await;
                }
                _ = shutdown.recv() => {
                    logger.flush().await;
                    debug!("Audit flusher shutting down");
                    break;
                }
            }
        }
    });
}
