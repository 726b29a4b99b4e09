//! Admin surfaces: policy CRUD, tenants, audit queries, token exchange,
//! and back-channel logout triggering.
//!
//! Every admin endpoint requires an authenticated session carrying the
//! `ADMIN` role **and** passes through the PDP with
//! `resource.type = "admin"`, so tenant deny policies can revoke admin
//! access without touching role claims. All reads and writes are scoped to
//! the caller's tenant.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;

use crate::abac::{AccessRequest, Decision, Policy};
use crate::audit::{AuditEvent, AuditQuery, AuditResult};
use crate::exchange::{ExchangePolicy, ExchangeRequest};
use crate::logout::{LogoutRequest, LogoutTrigger};
use crate::security::{FieldKind, FieldRule, Schema, validate};
use crate::tenant::{Tenant, require_same_tenant};
use crate::{Error, Result, trace};

use super::handlers::ok_json;
use super::middleware::{Auth, AuthContext};
use super::router::AppState;

/// Role required for admin surfaces.
const ADMIN_ROLE: &str = "ADMIN";

/// Gate an admin operation: role check, then a PDP evaluation so deny
/// policies can override the role.
async fn authorize_admin(state: &AppState, ctx: &AuthContext, action: &str) -> Result<()> {
    if !ctx.session.has_role(ADMIN_ROLE) {
        return Err(Error::Forbidden("admin role required".to_string()));
    }

    let request = AccessRequest {
        subject: json!({
            "sub": ctx.session.sub,
            "tenantId": ctx.session.tenant_id,
            "roles": ctx.session.roles,
        }),
        resource: json!({ "type": "admin" }),
        action: json!({ "type": action }),
        environment: json!({ "timestamp": chrono::Utc::now().timestamp_millis() }),
    };
    let evaluation = state.pdp.evaluate(&ctx.session.tenant_id, &request).await?;
    if evaluation.decision == Decision::Deny {
        return Err(Error::Forbidden("denied by policy".to_string()));
    }
    Ok(())
}

// ============================================================================
// ABAC policy CRUD
// ============================================================================

/// `GET /api/abac/policies`.
pub async fn list_abac_policies(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
) -> Result<Response> {
    authorize_admin(&state, &ctx, "abac.read").await?;
    let policies = state.pdp.store().list(&ctx.session.tenant_id).await?;
    Ok(ok_json(policies))
}

/// `POST /api/abac/policies`.
pub async fn put_abac_policy(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
    Json(mut policy): Json<Policy>,
) -> Result<Response> {
    authorize_admin(&state, &ctx, "abac.write").await?;
    // The policy lands in the caller's tenant regardless of the body.
    policy.tenant_id = ctx.session.tenant_id.clone();
    let stored = state.pdp.store().put(policy).await?;

    state
        .audit
        .record(
            AuditEvent::new(&ctx.session.tenant_id, "abac.policy.put", "policy", AuditResult::Allow)
                .user(ctx.session.sub.clone())
                .resource(stored.id.clone()),
        )
        .await;
    Ok(ok_json(stored))
}

/// `GET /api/abac/policies/{id}`.
pub async fn get_abac_policy(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
    Path(id): Path<String>,
) -> Result<Response> {
    authorize_admin(&state, &ctx, "abac.read").await?;
    let policy = state.pdp.store().get(&ctx.session.tenant_id, &id).await?;
    Ok(ok_json(policy))
}

/// `PUT /api/abac/policies/{id}`.
pub async fn put_abac_policy_by_id(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
    Path(id): Path<String>,
    Json(mut policy): Json<Policy>,
) -> Result<Response> {
    authorize_admin(&state, &ctx, "abac.write").await?;
    policy.id = id;
    policy.tenant_id = ctx.session.tenant_id.clone();
    let stored = state.pdp.store().put(policy).await?;
    Ok(ok_json(stored))
}

/// `DELETE /api/abac/policies/{id}`.
pub async fn delete_abac_policy(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
    Path(id): Path<String>,
) -> Result<Response> {
    authorize_admin(&state, &ctx, "abac.write").await?;
    state.pdp.store().delete(&ctx.session.tenant_id, &id).await?;

    state
        .audit
        .record(
            AuditEvent::new(
                &ctx.session.tenant_id,
                "abac.policy.delete",
                "policy",
                AuditResult::Allow,
            )
            .user(ctx.session.sub.clone())
            .resource(id),
        )
        .await;
    Ok(ok_json(json!({ "deleted": true })))
}

// ============================================================================
// Token exchange policy CRUD
// ============================================================================

/// `GET /api/token-exchange/policies`.
pub async fn list_exchange_policies(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
) -> Result<Response> {
    authorize_admin(&state, &ctx, "exchange.read").await?;
    let policies = state
        .exchange
        .policy_store()
        .list(&ctx.session.tenant_id)
        .await?;
    Ok(ok_json(policies))
}

/// `POST /api/token-exchange/policies`.
pub async fn put_exchange_policy(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
    Json(mut policy): Json<ExchangePolicy>,
) -> Result<Response> {
    authorize_admin(&state, &ctx, "exchange.write").await?;
    policy.tenant_id = ctx.session.tenant_id.clone();
    state.exchange.policy_store().put(&policy).await?;
    Ok(ok_json(policy))
}

/// `GET /api/token-exchange/policies/{id}`.
pub async fn get_exchange_policy(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
    Path(id): Path<String>,
) -> Result<Response> {
    authorize_admin(&state, &ctx, "exchange.read").await?;
    let policy = state
        .exchange
        .policy_store()
        .get(&ctx.session.tenant_id, &id)
        .await?;
    Ok(ok_json(policy))
}

/// `PUT /api/token-exchange/policies/{id}`.
pub async fn put_exchange_policy_by_id(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
    Path(id): Path<String>,
    Json(mut policy): Json<ExchangePolicy>,
) -> Result<Response> {
    authorize_admin(&state, &ctx, "exchange.write").await?;
    policy.id = id;
    policy.tenant_id = ctx.session.tenant_id.clone();
    state.exchange.policy_store().put(&policy).await?;
    Ok(ok_json(policy))
}

/// `DELETE /api/token-exchange/policies/{id}`.
pub async fn delete_exchange_policy(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
    Path(id): Path<String>,
) -> Result<Response> {
    authorize_admin(&state, &ctx, "exchange.write").await?;
    state
        .exchange
        .policy_store()
        .delete(&ctx.session.tenant_id, &id)
        .await?;
    Ok(ok_json(json!({ "deleted": true })))
}

// ============================================================================
// Token exchange endpoint (RFC 8693)
// ============================================================================

/// `POST /api/token/exchange` — accepts `application/x-www-form-urlencoded`
/// (per the RFC) or JSON. Requires an authenticated requester.
pub async fn token_exchange(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let request: ExchangeRequest = if content_type.starts_with("application/json") {
        serde_json::from_slice(&body).map_err(|e| Error::ValidationFailed {
            details: vec![format!("body: {e}")],
        })?
    } else {
        serde_urlencoded::from_bytes(&body).map_err(|e| Error::ValidationFailed {
            details: vec![format!("body: {e}")],
        })?
    };

    match state.exchange.exchange(&ctx.session.tenant_id, &request).await {
        Ok(response) => Ok(ok_json(response)),
        Err(denial) => {
            // Wire error only; the specific reason went to the audit trail.
            let trace_id = trace::current_or_new();
            Ok((
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "success": false,
                    "error": {
                        "code": denial.wire_error,
                        "message": "token exchange request was rejected",
                        "traceId": trace_id,
                    }
                })),
            )
                .into_response())
        }
    }
}

// ============================================================================
// Back-channel logout
// ============================================================================

/// Body of `POST /api/logout/backchannel`.
#[derive(Debug, Deserialize)]
pub struct BackchannelBody {
    /// Session to terminate; defaults to the caller's own session.
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    /// User whose sessions to terminate (admin only).
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
}

/// `POST /api/logout/backchannel` — trigger a back-channel logout. Users
/// may log out their own sessions; targeting another user requires admin.
pub async fn backchannel_logout(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
    Json(body): Json<BackchannelBody>,
) -> Result<Response> {
    let targeting_other_user = body
        .user_id
        .as_ref()
        .is_some_and(|target| target != &ctx.session.sub);

    let trigger = if targeting_other_user {
        authorize_admin(&state, &ctx, "logout.trigger").await?;
        LogoutTrigger::AdminAction
    } else {
        LogoutTrigger::UserInitiated
    };

    let request = LogoutRequest {
        trigger,
        session_id: body
            .session_id
            .or_else(|| body.user_id.is_none().then(|| ctx.sid.clone())),
        user_id: body.user_id,
        initiator: ctx.session.sub.clone(),
    };
    let event = state
        .logout
        .initiate(&ctx.session.tenant_id, &request)
        .await?;

    state
        .ws
        .close_sessions(&event.affected_sessions, super::ws::CLOSE_SESSION_REVOKED)
        .await;

    Ok(ok_json(event))
}

/// `GET /api/logout/backchannel/events`.
pub async fn backchannel_events(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
) -> Result<Response> {
    authorize_admin(&state, &ctx, "logout.read").await?;
    let events = state.logout.events(&ctx.session.tenant_id).await?;
    Ok(ok_json(events))
}

// ============================================================================
// Audit queries
// ============================================================================

/// Query string of `GET /api/audit/logs`.
#[derive(Debug, Deserialize, Default)]
pub struct AuditLogsQuery {
    /// Restrict to one action.
    pub action: Option<String>,
    /// Restrict to one result (`allow` / `deny` / `error` / `alert`).
    pub result: Option<String>,
    /// Events at or after this timestamp (ms).
    pub since: Option<i64>,
    /// Events at or before this timestamp (ms).
    pub until: Option<i64>,
    /// Page size (default 50).
    pub limit: Option<usize>,
    /// Page offset.
    pub offset: Option<usize>,
}

/// `GET /api/audit/logs`.
pub async fn audit_logs(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
    Query(query): Query<AuditLogsQuery>,
) -> Result<Response> {
    authorize_admin(&state, &ctx, "audit.read").await?;

    let result = match query.result.as_deref() {
        Some("allow") => Some(AuditResult::Allow),
        Some("deny") => Some(AuditResult::Deny),
        Some("error") => Some(AuditResult::Error),
        Some("alert") => Some(AuditResult::Alert),
        _ => None,
    };
    let events = state
        .audit
        .query(
            &ctx.session.tenant_id,
            &AuditQuery {
                action: query.action,
                result,
                since: query.since,
                until: query.until,
                limit: query.limit.unwrap_or(50),
                offset: query.offset.unwrap_or(0),
            },
        )
        .await?;
    Ok(ok_json(events))
}

/// `GET /api/audit/stats`.
pub async fn audit_stats(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
) -> Result<Response> {
    authorize_admin(&state, &ctx, "audit.read").await?;
    let stats = state.audit.stats(&ctx.session.tenant_id).await?;
    Ok(ok_json(stats))
}

// ============================================================================
// Tenant CRUD
// ============================================================================

/// Declared schema for tenant write bodies.
fn tenant_schema() -> Schema {
    Schema::new()
        .field(
            "id",
            FieldRule::required(FieldKind::String)
                .max_length(64)
                .pattern(r"^[a-z0-9][a-z0-9-]*$"),
        )
        .field("name", FieldRule::required(FieldKind::String).max_length(200))
        .field("enabled", FieldRule::optional(FieldKind::Boolean))
        .field(
            "allowedOrigins",
            FieldRule::optional(FieldKind::Array).max_items(50),
        )
        .field("createdAt", FieldRule::optional(FieldKind::Number))
}

fn validate_tenant_body(tenant: &Tenant) -> Result<()> {
    let body = serde_json::to_value(tenant)?;
    let errors = validate(&tenant_schema(), &body);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::ValidationFailed { details: errors })
    }
}

/// `GET /api/tenants` — the caller's tenant only; cross-tenant listings
/// would break isolation.
pub async fn list_tenants(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
) -> Result<Response> {
    authorize_admin(&state, &ctx, "tenant.read").await?;
    let tenant = state.tenants.get(&ctx.session.tenant_id).await?;
    Ok(ok_json(tenant.into_iter().collect::<Vec<_>>()))
}

/// `POST /api/tenants`.
pub async fn put_tenant(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
    Json(tenant): Json<Tenant>,
) -> Result<Response> {
    authorize_admin(&state, &ctx, "tenant.write").await?;
    require_same_tenant(&ctx.session.tenant_id, &tenant.id)?;
    validate_tenant_body(&tenant)?;
    state.tenants.put(&tenant).await?;
    Ok(ok_json(tenant))
}

/// `GET /api/tenants/{id}`.
pub async fn get_tenant(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
    Path(id): Path<String>,
) -> Result<Response> {
    authorize_admin(&state, &ctx, "tenant.read").await?;
    require_same_tenant(&ctx.session.tenant_id, &id)?;
    match state.tenants.get(&id).await? {
        Some(tenant) => Ok(ok_json(tenant)),
        None => Err(Error::PolicyNotFound(format!("tenant {id}"))),
    }
}

/// `PUT /api/tenants/{id}`.
pub async fn put_tenant_by_id(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
    Path(id): Path<String>,
    Json(mut tenant): Json<Tenant>,
) -> Result<Response> {
    authorize_admin(&state, &ctx, "tenant.write").await?;
    require_same_tenant(&ctx.session.tenant_id, &id)?;
    tenant.id = id;
    validate_tenant_body(&tenant)?;
    state.tenants.put(&tenant).await?;
    Ok(ok_json(tenant))
}

/// `DELETE /api/tenants/{id}`.
pub async fn delete_tenant(
    State(state): State<Arc<AppState>>,
    Auth(ctx): Auth,
    Path(id): Path<String>,
) -> Result<Response> {
    authorize_admin(&state, &ctx, "tenant.write").await?;
    require_same_tenant(&ctx.session.tenant_id, &id)?;
    state.tenants.delete(&id).await?;
    Ok(ok_json(json!({ "deleted": true })))
}
