//! Error tracking.
//!
//! Internal failures are recorded server-side and grouped by fingerprint so
//! recurring errors coalesce; only the trace ID reaches the client. Records
//! live at `error:{id}` with a bounded TTL, group counters at
//! `error_group:{fp}`. Tenant alert rules (`alert_rule:{tenant}:{id}`) fire
//! an `alert` audit event when a group's occurrence count crosses the
//! rule's threshold.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditLogger, AuditResult};
use crate::kv::{self, Kv};
use crate::{Result, trace};

/// Retention for individual error records.
const ERROR_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// A recorded internal error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Record id.
    pub id: String,
    /// Grouping fingerprint.
    pub fingerprint: String,
    /// Wire code the client saw.
    pub code: String,
    /// Internal message (never sent to clients).
    pub message: String,
    /// Route that produced the error.
    pub route: String,
    /// Trace ID of the failed request.
    #[serde(rename = "traceId")]
    pub trace_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// A tenant alert rule over error groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    /// Rule id.
    pub id: String,
    /// Owning tenant.
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    /// Disabled rules never fire.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Restrict to one error group; `None` matches every group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Fire when the group count reaches this value.
    pub threshold: u64,
}

fn default_true() -> bool {
    true
}

/// Fingerprint over code, message, and route: first 16 hex chars of SHA-256.
#[must_use]
pub fn fingerprint(code: &str, message: &str, route: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hasher.update(b"|");
    hasher.update(message.as_bytes());
    hasher.update(b"|");
    hasher.update(route.as_bytes());
    let hash = hasher.finalize();
    hex::encode(hash)[..16].to_string()
}

/// Server-side error recorder.
pub struct ErrorTracker {
    kv: Arc<dyn Kv>,
    audit: Option<Arc<AuditLogger>>,
}

impl ErrorTracker {
    /// Create a tracker over `kv`.
    #[must_use]
    pub fn new(kv: Arc<dyn Kv>, audit: Option<Arc<AuditLogger>>) -> Self {
        Self { kv, audit }
    }

    /// Record an internal error; returns the record id.
    ///
    /// Best-effort: KV failures are logged and swallowed so error tracking
    /// can never mask the original failure.
    pub async fn record(&self, code: &str, message: &str, route: &str) -> String {
        let record = ErrorRecord {
            id: Uuid::new_v4().to_string(),
            fingerprint: fingerprint(code, message, route),
            code: code.to_string(),
            message: message.to_string(),
            route: route.to_string(),
            trace_id: trace::current_or_new(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        };

        if let Ok(json) = serde_json::to_string(&record) {
            let key = format!("error:{}", record.id);
            if let Err(e) = self.kv.set(&key, &json, Some(ERROR_TTL)).await {
                warn!(error = %e, "Failed to persist error record");
            }
        }

        let group_key = format!("error_group:{}", record.fingerprint);
        match self.kv.incr(&group_key).await {
            #[allow(clippy::cast_sign_loss)]
            Ok(count) => self.check_alerts(&record, count.max(0) as u64).await,
            Err(e) => warn!(error = %e, "Failed to bump error group counter"),
        }

        record.id
    }

    /// Fire alert rules whose threshold the group count just crossed.
    async fn check_alerts(&self, record: &ErrorRecord, count: u64) {
        let rules = match self.kv.keys("alert_rule:*").await {
            Ok(keys) => keys,
            Err(_) => return,
        };

        for key in rules {
            let Ok(Some(json)) = self.kv.get(&key).await else {
                continue;
            };
            let Ok(rule) = serde_json::from_str::<AlertRule>(&json) else {
                continue;
            };
            if !rule.enabled {
                continue;
            }
            if rule
                .fingerprint
                .as_ref()
                .is_some_and(|fp| fp != &record.fingerprint)
            {
                continue;
            }
            // Fire exactly once, when the count reaches the threshold.
            if count != rule.threshold {
                continue;
            }

            warn!(
                rule = %rule.id,
                fingerprint = %record.fingerprint,
                count,
                "Error alert threshold reached"
            );
            if let Some(audit) = &self.audit {
                audit
                    .record(
                        AuditEvent::new(&rule.tenant_id, "error.alert", "error_group", AuditResult::Alert)
                            .resource(record.fingerprint.clone())
                            .reason(format!("{count} occurrences of {}", record.code)),
                    )
                    .await;
            }
        }
    }

    /// Create or replace an alert rule.
    pub async fn put_alert_rule(&self, rule: &AlertRule) -> Result<()> {
        let key = format!("alert_rule:{}:{}", rule.tenant_id, rule.id);
        self.kv.set(&key, &serde_json::to_string(rule)?, None).await
    }

    /// Delete an alert rule.
    pub async fn delete_alert_rule(&self, tenant_id: &str, id: &str) -> Result<u64> {
        kv::del_one(self.kv.as_ref(), &format!("alert_rule:{tenant_id}:{id}")).await
    }

    /// Occurrence count for a fingerprint group.
    pub async fn group_count(&self, fp: &str) -> u64 {
        let key = format!("error_group:{fp}");
        match self.kv.get(&key).await {
            Ok(Some(v)) => v.parse().unwrap_or(0),
            _ => 0,
        }
    }
}
