//! Back-channel logout (OIDC Back-Channel Logout profile).
//!
//! A logout can be triggered by the user, an admin, an idle/absolute
//! timeout, a security policy, or an external request (the IdP's own
//! back-channel). The orchestrator resolves the affected session set from
//! the tenant's highest-priority enabled [`LogoutPolicy`], notifies every
//! registered client with a short-lived signed `logout_token` (retried with
//! exponential backoff), then terminates the sessions — the grace period
//! *delays termination*: notifications go out first, removal happens after
//! the grace window so relying parties can react.
//!
//! Event records progress `initiated → in_progress → completed | partial |
//! failed` and persist at `logout:event:{id}`.

use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditLogger, AuditResult};
use crate::kv::{self, Kv};
use crate::session::SessionStore;
use crate::{Error, Result, trace};

/// The security event claim URI carried in logout tokens.
pub const SESSIONS_REVOKED_EVENT: &str =
    "http://schemas.openid.net/secevent/risc/event-type/sessions-revoked";

/// Logout token lifetime ceiling (seconds).
const LOGOUT_TOKEN_TTL: i64 = 300;

/// Retention for logout event records.
const EVENT_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

/// What initiated a logout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogoutTrigger {
    /// The user clicked logout.
    UserInitiated,
    /// An administrator revoked the session(s).
    AdminAction,
    /// Idle timeout fired.
    IdleTimeout,
    /// Absolute session lifetime reached.
    AbsoluteTimeout,
    /// A security policy demanded termination.
    SecurityPolicy,
    /// IdP-initiated back-channel logout.
    ExternalRequest,
}

/// Lifecycle status of a logout event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogoutStatus {
    /// Event created.
    Initiated,
    /// Notifications in flight.
    InProgress,
    /// All required acknowledgments received.
    Completed,
    /// Some notifications failed.
    Partial,
    /// All required notifications failed.
    Failed,
}

/// Per-tenant logout behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutPolicy {
    /// Policy id.
    pub id: String,
    /// Owning tenant.
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    /// Disabled policies are skipped.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Higher priority wins when several policies are enabled.
    #[serde(default)]
    pub priority: i32,
    /// Terminate every session of the user, not just the primary one.
    #[serde(default)]
    pub terminate_all_sessions: bool,
    /// Also terminate related sessions (same device chain).
    #[serde(default)]
    pub terminate_related_sessions: bool,
    /// Notify every registered client, not only those with affected sessions.
    #[serde(default)]
    pub notify_all_clients: bool,
    /// Completion requires acknowledgment from each notified client.
    #[serde(default)]
    pub require_client_acknowledgment: bool,
    /// Overall notification budget in seconds.
    #[serde(default = "default_notification_timeout")]
    pub notification_timeout_seconds: u64,
    /// Retry budget per client.
    #[serde(default = "default_retries")]
    pub max_notification_retries: u32,
    /// Delay between notification dispatch and session termination.
    #[serde(default)]
    pub grace_period_seconds: u64,
    /// Maximum cascade depth for related-session termination.
    #[serde(default = "default_cascade_limit")]
    pub cascade_depth_limit: u32,
}

fn default_true() -> bool {
    true
}
fn default_notification_timeout() -> u64 {
    10
}
fn default_retries() -> u32 {
    2
}
fn default_cascade_limit() -> u32 {
    3
}

impl LogoutPolicy {
    /// Built-in behavior when a tenant has no policy: terminate only the
    /// primary session, notify its client, don't require acks.
    #[must_use]
    pub fn default_for(tenant_id: &str) -> Self {
        Self {
            id: "default".to_string(),
            tenant_id: tenant_id.to_string(),
            enabled: true,
            priority: i32::MIN,
            terminate_all_sessions: false,
            terminate_related_sessions: false,
            notify_all_clients: false,
            require_client_acknowledgment: false,
            notification_timeout_seconds: default_notification_timeout(),
            max_notification_retries: default_retries(),
            grace_period_seconds: 0,
            cascade_depth_limit: default_cascade_limit(),
        }
    }
}

/// Outcome of notifying one client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationResult {
    /// Client that was notified.
    #[serde(rename = "clientId")]
    pub client_id: String,
    /// Delivery status: `acknowledged` or `failed`.
    pub status: String,
    /// Attempts made.
    pub attempts: u32,
    /// Last error, when failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Persisted logout event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutEvent {
    /// Event id.
    pub id: String,
    /// Trace ID of the initiating request.
    #[serde(rename = "traceId")]
    pub trace_id: String,
    /// Owning tenant.
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    /// Always `backchannel_logout`.
    pub event_type: String,
    /// What started the logout.
    pub trigger: LogoutTrigger,
    /// The primary session.
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// The affected user.
    #[serde(rename = "userId")]
    pub user_id: String,
    /// Every session that was terminated.
    #[serde(rename = "affectedSessions")]
    pub affected_sessions: Vec<String>,
    /// Per-client notification outcomes.
    #[serde(rename = "notificationResults")]
    pub notification_results: Vec<NotificationResult>,
    /// Lifecycle status.
    pub status: LogoutStatus,
    /// Who initiated (user sub, admin sub, or `system`).
    pub initiator: String,
    /// Creation time, ms since epoch.
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

/// Downstream client registration, persisted at `client:{clientId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRegistration {
    /// OIDC client id.
    #[serde(rename = "clientId")]
    pub client_id: String,
    /// Where logout tokens are POSTed.
    #[serde(rename = "backchannelLogoutUri", skip_serializing_if = "Option::is_none")]
    pub backchannel_logout_uri: Option<String>,
    /// Whether this client wants logout notifications.
    #[serde(rename = "logoutNotificationEnabled", default = "default_true")]
    pub logout_notification_enabled: bool,
}

/// Claims of a signed logout token.
#[derive(Debug, Serialize, Deserialize)]
pub struct LogoutTokenClaims {
    /// Issuer.
    pub iss: String,
    /// Audience — the notified client.
    pub aud: String,
    /// Issued-at (seconds).
    pub iat: i64,
    /// Expiry (seconds); at most `iat + 300`.
    pub exp: i64,
    /// Token id.
    pub jti: String,
    /// Security events claim.
    pub events: Value,
    /// Affected subject.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Affected session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
}

/// A request to run a back-channel logout.
#[derive(Debug, Clone)]
pub struct LogoutRequest {
    /// What started it.
    pub trigger: LogoutTrigger,
    /// Primary session id, when known.
    pub session_id: Option<String>,
    /// Affected user, when the session id is unknown.
    pub user_id: Option<String>,
    /// Who initiated.
    pub initiator: String,
}

/// Hook invoked after sessions are terminated, used to cascade WebSocket
/// closes without a dependency cycle.
#[async_trait::async_trait]
pub trait TerminationHook: Send + Sync {
    /// Called with the ids of terminated sessions.
    async fn sessions_terminated(&self, sids: &[String]);
}

/// Logout policy persistence at `logout:policy:{tenant}:{id}`.
pub struct LogoutPolicyStore {
    kv: Arc<dyn Kv>,
}

impl LogoutPolicyStore {
    /// Create a store over `kv`.
    #[must_use]
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    fn key(tenant_id: &str, id: &str) -> String {
        format!("logout:policy:{tenant_id}:{id}")
    }

    /// Create or replace a policy.
    pub async fn put(&self, policy: &LogoutPolicy) -> Result<()> {
        self.kv
            .set(
                &Self::key(&policy.tenant_id, &policy.id),
                &serde_json::to_string(policy)?,
                None,
            )
            .await
    }

    /// The highest-priority enabled policy, or the built-in default.
    pub async fn effective(&self, tenant_id: &str) -> Result<LogoutPolicy> {
        let mut best: Option<LogoutPolicy> = None;
        for key in self.kv.keys(&format!("logout:policy:{tenant_id}:*")).await? {
            let Some(json) = self.kv.get(&key).await? else {
                continue;
            };
            let Ok(policy) = serde_json::from_str::<LogoutPolicy>(&json) else {
                continue;
            };
            if !policy.enabled {
                continue;
            }
            if best.as_ref().is_none_or(|b| policy.priority > b.priority) {
                best = Some(policy);
            }
        }
        Ok(best.unwrap_or_else(|| LogoutPolicy::default_for(tenant_id)))
    }

    /// Delete one policy.
    pub async fn delete(&self, tenant_id: &str, id: &str) -> Result<()> {
        let removed = kv::del_one(self.kv.as_ref(), &Self::key(tenant_id, id)).await?;
        if removed == 0 {
            return Err(Error::PolicyNotFound(id.to_string()));
        }
        Ok(())
    }
}

/// Client registration persistence.
pub struct ClientRegistry {
    kv: Arc<dyn Kv>,
}

impl ClientRegistry {
    /// Create a registry over `kv`.
    #[must_use]
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    /// Register or update a client.
    pub async fn put(&self, registration: &ClientRegistration) -> Result<()> {
        self.kv
            .set(
                &format!("client:{}", registration.client_id),
                &serde_json::to_string(registration)?,
                None,
            )
            .await
    }

    /// Look up a client registration.
    pub async fn get(&self, client_id: &str) -> Result<Option<ClientRegistration>> {
        match self.kv.get(&format!("client:{client_id}")).await? {
            Some(json) => Ok(serde_json::from_str(&json).ok()),
            None => Ok(None),
        }
    }

    /// All registered clients.
    pub async fn all(&self) -> Result<Vec<ClientRegistration>> {
        let mut clients = Vec::new();
        for key in self.kv.keys("client:*").await? {
            if let Some(json) = self.kv.get(&key).await? {
                if let Ok(reg) = serde_json::from_str(&json) {
                    clients.push(reg);
                }
            }
        }
        Ok(clients)
    }
}

/// The back-channel logout orchestrator.
pub struct BackchannelLogoutService {
    kv: Arc<dyn Kv>,
    sessions: Arc<SessionStore>,
    policies: LogoutPolicyStore,
    clients: ClientRegistry,
    audit: Option<Arc<AuditLogger>>,
    http: reqwest::Client,
    jwt_secret: Vec<u8>,
    issuer: String,
    hook: Option<Arc<dyn TerminationHook>>,
}

impl BackchannelLogoutService {
    /// Create the orchestrator.
    #[must_use]
    pub fn new(
        kv: Arc<dyn Kv>,
        sessions: Arc<SessionStore>,
        audit: Option<Arc<AuditLogger>>,
        jwt_secret: impl Into<Vec<u8>>,
        issuer: impl Into<String>,
        hook: Option<Arc<dyn TerminationHook>>,
    ) -> Self {
        Self {
            policies: LogoutPolicyStore::new(Arc::clone(&kv)),
            clients: ClientRegistry::new(Arc::clone(&kv)),
            kv,
            sessions,
            audit,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            jwt_secret: jwt_secret.into(),
            issuer: issuer.into(),
            hook,
        }
    }

    /// Policy store accessor (admin CRUD).
    #[must_use]
    pub fn policy_store(&self) -> &LogoutPolicyStore {
        &self.policies
    }

    /// Client registry accessor.
    #[must_use]
    pub fn client_registry(&self) -> &ClientRegistry {
        &self.clients
    }

    /// Run a back-channel logout for `tenant_id`.
    pub async fn initiate(&self, tenant_id: &str, request: &LogoutRequest) -> Result<LogoutEvent> {
        // 1. Resolve the primary session / user.
        let (primary_sid, user_id) = match (&request.session_id, &request.user_id) {
            (Some(sid), _) => {
                let Some(session) = self.sessions.resolve(sid).await? else {
                    return Err(Error::SessionNotFound);
                };
                if session.tenant_id != tenant_id {
                    return Err(Error::TenantAccessDenied);
                }
                (Some(sid.clone()), session.sub)
            }
            (None, Some(user)) => (None, user.clone()),
            (None, None) => return Err(Error::SessionNotFound),
        };

        // 2. Load the effective policy.
        let policy = self.policies.effective(tenant_id).await?;

        // 3. Compute the session set to terminate.
        let user_sessions = self.sessions.sessions_for_user(tenant_id, &user_id).await?;
        if user_sessions.is_empty() {
            return Err(Error::SessionNotFound);
        }
        let affected: Vec<(String, Option<String>)> =
            if policy.terminate_all_sessions || primary_sid.is_none() {
                user_sessions
                    .iter()
                    .map(|(sid, s)| (sid.clone(), s.client_id.clone()))
                    .collect()
            } else {
                user_sessions
                    .iter()
                    .filter(|(sid, _)| Some(sid) == primary_sid.as_ref())
                    .map(|(sid, s)| (sid.clone(), s.client_id.clone()))
                    .collect()
            };

        // 4. Create the event record and move it through its lifecycle.
        let mut event = LogoutEvent {
            id: Uuid::new_v4().to_string(),
            trace_id: trace::current_or_new(),
            tenant_id: tenant_id.to_string(),
            event_type: "backchannel_logout".to_string(),
            trigger: request.trigger,
            session_id: primary_sid.clone(),
            user_id: user_id.clone(),
            affected_sessions: affected.iter().map(|(sid, _)| sid.clone()).collect(),
            notification_results: Vec::new(),
            status: LogoutStatus::Initiated,
            initiator: request.initiator.clone(),
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        self.persist_event(&event).await;

        event.status = LogoutStatus::InProgress;
        self.persist_event(&event).await;

        // 5. Notify registered clients.
        let client_ids = self.clients_to_notify(&policy, &affected).await?;
        for client_id in client_ids {
            let Some(registration) = self.clients.get(&client_id).await? else {
                continue;
            };
            if !registration.logout_notification_enabled {
                continue;
            }
            let Some(uri) = registration.backchannel_logout_uri.clone() else {
                continue;
            };

            let sid_for_client = affected
                .iter()
                .find(|(_, cid)| cid.as_deref() == Some(client_id.as_str()))
                .map(|(sid, _)| sid.clone());
            let result = self
                .notify_client(&client_id, &uri, &user_id, sid_for_client.as_deref(), &policy)
                .await;
            event.notification_results.push(result);
        }

        // 6. Grace delays termination: relying parties react first.
        if policy.grace_period_seconds > 0 {
            tokio::time::sleep(Duration::from_secs(policy.grace_period_seconds)).await;
        }

        // 7. Terminate the sessions and cascade.
        let mut terminated = Vec::new();
        for (sid, _) in &affected {
            if self.sessions.destroy(sid).await? {
                terminated.push(sid.clone());
            }
        }
        if let Some(hook) = &self.hook {
            hook.sessions_terminated(&terminated).await;
        }

        // 8. Finalize.
        let failed = event
            .notification_results
            .iter()
            .filter(|r| r.status == "failed")
            .count();
        event.status = if failed == 0 {
            LogoutStatus::Completed
        } else if !policy.require_client_acknowledgment
            || failed < event.notification_results.len()
        {
            LogoutStatus::Partial
        } else {
            LogoutStatus::Failed
        };
        self.persist_event(&event).await;

        if let Some(audit) = &self.audit {
            audit
                .record(
                    AuditEvent::new(tenant_id, "logout.backchannel", "session", AuditResult::Allow)
                        .user(user_id)
                        .resource(event.id.clone())
                        .metadata(serde_json::json!({
                            "trigger": event.trigger,
                            "affectedSessions": event.affected_sessions.len(),
                            "status": event.status,
                        })),
                )
                .await;
        }

        debug!(event = %event.id, status = ?event.status, "Back-channel logout finished");
        Ok(event)
    }

    /// Which clients to notify for this event.
    async fn clients_to_notify(
        &self,
        policy: &LogoutPolicy,
        affected: &[(String, Option<String>)],
    ) -> Result<Vec<String>> {
        if policy.notify_all_clients {
            return Ok(self.clients.all().await?.into_iter().map(|c| c.client_id).collect());
        }
        let mut ids: Vec<String> = affected
            .iter()
            .filter_map(|(_, client_id)| client_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Mint a logout token for `client_id`.
    fn mint_logout_token(
        &self,
        client_id: &str,
        sub: &str,
        sid: Option<&str>,
    ) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = LogoutTokenClaims {
            iss: self.issuer.clone(),
            aud: client_id.to_string(),
            iat: now,
            exp: now + LOGOUT_TOKEN_TTL,
            jti: Uuid::new_v4().to_string(),
            events: serde_json::json!({ SESSIONS_REVOKED_EVENT: {} }),
            sub: Some(sub.to_string()),
            sid: sid.map(ToString::to_string),
        };
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.jwt_secret),
        )
        .map_err(|e| Error::Internal(format!("logout token signing failed: {e}")))
    }

    /// POST the logout token with retries and an overall timeout.
    async fn notify_client(
        &self,
        client_id: &str,
        uri: &str,
        sub: &str,
        sid: Option<&str>,
        policy: &LogoutPolicy,
    ) -> NotificationResult {
        let token = match self.mint_logout_token(client_id, sub, sid) {
            Ok(token) => token,
            Err(e) => {
                return NotificationResult {
                    client_id: client_id.to_string(),
                    status: "failed".to_string(),
                    attempts: 0,
                    error: Some(e.to_string()),
                };
            }
        };

        let attempts = std::sync::atomic::AtomicU32::new(0);
        let send = || async {
            attempts.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let response = self
                .http
                .post(uri)
                .form(&[("logout_token", token.as_str())])
                .send()
                .await
                .map_err(|e| Error::Internal(e.to_string()))?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(Error::Internal(format!("client returned {}", response.status())))
            }
        };

        let retry = send.retry(
            ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(100))
                .with_max_times(policy.max_notification_retries as usize),
        );
        let outcome = tokio::time::timeout(
            Duration::from_secs(policy.notification_timeout_seconds),
            retry,
        )
        .await;

        let attempts = attempts.load(std::sync::atomic::Ordering::Relaxed);
        match outcome {
            Ok(Ok(())) => NotificationResult {
                client_id: client_id.to_string(),
                status: "acknowledged".to_string(),
                attempts,
                error: None,
            },
            Ok(Err(e)) => {
                warn!(client = %client_id, error = %e, "Logout notification failed");
                NotificationResult {
                    client_id: client_id.to_string(),
                    status: "failed".to_string(),
                    attempts,
                    error: Some(e.to_string()),
                }
            }
            Err(_) => NotificationResult {
                client_id: client_id.to_string(),
                status: "failed".to_string(),
                attempts,
                error: Some("notification timeout".to_string()),
            },
        }
    }

    async fn persist_event(&self, event: &LogoutEvent) {
        let key = format!("logout:event:{}", event.id);
        if let Ok(json) = serde_json::to_string(event) {
            if let Err(e) = self.kv.set(&key, &json, Some(EVENT_TTL)).await {
                warn!(error = %e, "Failed to persist logout event");
            }
        }
    }

    /// List a tenant's logout events, newest first.
    pub async fn events(&self, tenant_id: &str) -> Result<Vec<LogoutEvent>> {
        let mut events = Vec::new();
        for key in self.kv.keys("logout:event:*").await? {
            if let Some(json) = self.kv.get(&key).await? {
                if let Ok(event) = serde_json::from_str::<LogoutEvent>(&json) {
                    if event.tenant_id == tenant_id {
                        events.push(event);
                    }
                }
            }
        }
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(events)
    }
}
