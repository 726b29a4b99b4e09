//! OAuth 2.0 Token Exchange (RFC 8693).
//!
//! The gateway brokers its own HS256-signed tokens: a subject token is
//! traded for a derived token with (usually) narrower audience and scope,
//! governed by per-tenant exchange policies. Every exchange appends a
//! delegation entry and bumps `exchange_count`, so chains are bounded by
//! policy (`max_exchanges_per_token`, `max_delegation_depth`).
//!
//! Denials carry a specific internal reason into the audit record; the wire
//! only ever sees `invalid_request`, `invalid_scope`, or
//! `unauthorized_client`.

use std::collections::BTreeSet;
use std::sync::Arc;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditLogger, AuditResult};
use crate::kv::{self, Kv};
use crate::{Error, Result};

/// RFC 8693 grant type.
pub const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
/// Access-token token type URN.
pub const TOKEN_TYPE_ACCESS: &str = "urn:ietf:params:oauth:token-type:access_token";
/// JWT token type URN.
pub const TOKEN_TYPE_JWT: &str = "urn:ietf:params:oauth:token-type:jwt";

/// One delegation step attached to an exchanged token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DelegationEntry {
    /// Party that performed the exchange.
    pub actor: String,
    /// Subject the token speaks for.
    pub subject: String,
    /// Audience the derived token was minted for.
    pub audience: String,
    /// Scopes granted at this step.
    pub scope: Vec<String>,
    /// Exchange time, ms since epoch.
    pub timestamp: i64,
}

/// Claims carried by gateway-minted exchangeable tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeClaims {
    /// Subject.
    pub sub: String,
    /// Audience.
    pub aud: String,
    /// Issuer.
    pub iss: String,
    /// Expiry (seconds since epoch).
    pub exp: i64,
    /// Issued-at (seconds since epoch).
    pub iat: i64,
    /// Token id.
    pub jti: String,
    /// Owning tenant.
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    /// Granted scopes.
    #[serde(default)]
    pub scope: Vec<String>,
    /// Roles copied from the original identity.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Number of exchanges this token has been through.
    #[serde(default)]
    pub exchange_count: u32,
    /// Delegation chain, oldest first.
    #[serde(default)]
    pub delegation_chain: Vec<DelegationEntry>,
    /// `jti` of the token that started the chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_token_id: Option<String>,
}

/// Which subjects a policy applies to.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SubjectMatch {
    /// Exact service account subjects.
    #[serde(default)]
    pub services: Vec<String>,
    /// Exact user subjects.
    #[serde(default)]
    pub users: Vec<String>,
    /// Role names; any overlap with the token's roles matches.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Regex patterns over the subject.
    #[serde(default)]
    pub patterns: Vec<String>,
}

impl SubjectMatch {
    fn matches(&self, sub: &str, roles: &[String]) -> bool {
        if self.services.iter().any(|s| s == sub) || self.users.iter().any(|u| u == sub) {
            return true;
        }
        if self.roles.iter().any(|r| roles.contains(r)) {
            return true;
        }
        self.patterns.iter().any(|p| {
            regex::Regex::new(p).is_ok_and(|re| re.is_match(sub))
        })
    }
}

/// Scope computation rules.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScopePolicy {
    /// Scopes that may be granted; empty means "no restriction".
    #[serde(default)]
    pub allowed_scopes: Vec<String>,
    /// Scopes that must be present in the result.
    #[serde(default)]
    pub required_scopes: Vec<String>,
    /// Scopes always removed.
    #[serde(default)]
    pub deny_scopes: Vec<String>,
    /// When no scope is requested, inherit the subject token's scopes.
    #[serde(default)]
    pub inherit_from_subject: bool,
    /// Every requested scope must already be held by the subject token.
    #[serde(default)]
    pub downscope_only: bool,
}

/// Token lifetime bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenLifetime {
    /// Lifetime when the request does not ask for one (seconds).
    #[serde(default = "default_expires")]
    pub default_expires_in: u64,
    /// Hard ceiling (seconds).
    #[serde(default = "default_max_expires")]
    pub max_expires_in: u64,
}

fn default_expires() -> u64 {
    300
}
fn default_max_expires() -> u64 {
    3600
}

impl Default for TokenLifetime {
    fn default() -> Self {
        Self {
            default_expires_in: default_expires(),
            max_expires_in: default_max_expires(),
        }
    }
}

/// Chain-length limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeLimits {
    /// Maximum exchanges any one token lineage may undergo.
    #[serde(default = "default_max_exchanges")]
    pub max_exchanges_per_token: u32,
    /// Maximum delegation chain length.
    #[serde(default = "default_max_depth")]
    pub max_delegation_depth: u32,
}

fn default_max_exchanges() -> u32 {
    5
}
fn default_max_depth() -> u32 {
    3
}

impl Default for ExchangeLimits {
    fn default() -> Self {
        Self {
            max_exchanges_per_token: default_max_exchanges(),
            max_delegation_depth: default_max_depth(),
        }
    }
}

/// Extra conditions on the exchange request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConditions {
    /// Whether an actor token must accompany the request.
    #[serde(default)]
    pub require_actor_token: bool,
    /// Accepted `subject_token_type` values.
    #[serde(default = "default_token_types")]
    pub allowed_token_types: Vec<String>,
}

fn default_token_types() -> Vec<String> {
    vec![TOKEN_TYPE_ACCESS.to_string(), TOKEN_TYPE_JWT.to_string()]
}

impl Default for ExchangeConditions {
    fn default() -> Self {
        Self {
            require_actor_token: false,
            allowed_token_types: default_token_types(),
        }
    }
}

/// A tenant's token exchange policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePolicy {
    /// Policy id.
    pub id: String,
    /// Owning tenant.
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    /// Disabled policies are skipped.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Subjects the policy applies to.
    #[serde(default)]
    pub allowed_subjects: SubjectMatch,
    /// Target services the derived token may address (informational match
    /// on audience when present).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_targets: Option<Vec<String>>,
    /// Audiences the policy covers.
    #[serde(default)]
    pub allowed_audiences: Vec<String>,
    /// Scope rules.
    #[serde(default)]
    pub scope_policy: ScopePolicy,
    /// Lifetime bounds.
    #[serde(default)]
    pub token_lifetime: TokenLifetime,
    /// Chain limits.
    #[serde(default)]
    pub exchange_limits: ExchangeLimits,
    /// Extra conditions.
    #[serde(default)]
    pub conditions: ExchangeConditions,
}

fn default_true() -> bool {
    true
}

/// Wire-level exchange request (RFC 8693 §2.1).
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeRequest {
    /// Must be the token-exchange grant type.
    pub grant_type: String,
    /// The token being exchanged.
    pub subject_token: String,
    /// Declared type of `subject_token`.
    pub subject_token_type: String,
    /// Acting-party token, when delegation is explicit.
    #[serde(default)]
    pub actor_token: Option<String>,
    /// Declared type of `actor_token`.
    #[serde(default)]
    pub actor_token_type: Option<String>,
    /// Audience of the derived token.
    pub audience: String,
    /// Requested scopes, space-separated.
    #[serde(default)]
    pub scope: Option<String>,
    /// Requested lifetime in seconds.
    #[serde(default)]
    pub requested_expires_in: Option<u64>,
}

/// Wire-level success response (RFC 8693 §2.2).
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeResponse {
    /// The derived token.
    pub access_token: String,
    /// Type URN of the issued token.
    pub issued_token_type: String,
    /// Always `Bearer`.
    pub token_type: String,
    /// Lifetime in seconds.
    pub expires_in: u64,
    /// Granted scopes, space-separated.
    pub scope: String,
}

/// Exchange denial: generic wire error + specific audit-only reason.
#[derive(Debug, Clone)]
pub struct ExchangeDenial {
    /// RFC 6749 error code sent on the wire.
    pub wire_error: &'static str,
    /// Specific reason, recorded in the audit trail only.
    pub denial_reason: String,
}

impl ExchangeDenial {
    fn new(wire_error: &'static str, reason: impl Into<String>) -> Self {
        Self {
            wire_error,
            denial_reason: reason.into(),
        }
    }
}

/// Exchange policy persistence at `token_exchange:policy:{tenant}:{id}`.
pub struct ExchangePolicyStore {
    kv: Arc<dyn Kv>,
}

impl ExchangePolicyStore {
    /// Create a store over `kv`.
    #[must_use]
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    fn key(tenant_id: &str, id: &str) -> String {
        format!("token_exchange:policy:{tenant_id}:{id}")
    }

    /// Create or replace a policy.
    pub async fn put(&self, policy: &ExchangePolicy) -> Result<()> {
        self.kv
            .set(
                &Self::key(&policy.tenant_id, &policy.id),
                &serde_json::to_string(policy)?,
                None,
            )
            .await
    }

    /// Fetch one policy; tenant-scoped.
    pub async fn get(&self, tenant_id: &str, id: &str) -> Result<ExchangePolicy> {
        let Some(json) = self.kv.get(&Self::key(tenant_id, id)).await? else {
            return Err(Error::PolicyNotFound(id.to_string()));
        };
        Ok(serde_json::from_str(&json)?)
    }

    /// List a tenant's policies, ordered by id.
    pub async fn list(&self, tenant_id: &str) -> Result<Vec<ExchangePolicy>> {
        let mut policies = Vec::new();
        for key in self
            .kv
            .keys(&format!("token_exchange:policy:{tenant_id}:*"))
            .await?
        {
            if let Some(json) = self.kv.get(&key).await? {
                if let Ok(policy) = serde_json::from_str::<ExchangePolicy>(&json) {
                    policies.push(policy);
                }
            }
        }
        policies.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(policies)
    }

    /// Delete one policy; tenant-scoped.
    pub async fn delete(&self, tenant_id: &str, id: &str) -> Result<()> {
        let removed = kv::del_one(self.kv.as_ref(), &Self::key(tenant_id, id)).await?;
        if removed == 0 {
            return Err(Error::PolicyNotFound(id.to_string()));
        }
        Ok(())
    }
}

/// The token exchange service.
pub struct TokenExchangeService {
    kv: Arc<dyn Kv>,
    policies: ExchangePolicyStore,
    audit: Option<Arc<AuditLogger>>,
    jwt_secret: Vec<u8>,
    issuer: String,
}

impl TokenExchangeService {
    /// Create a service signing with `jwt_secret` as `issuer`.
    #[must_use]
    pub fn new(
        kv: Arc<dyn Kv>,
        audit: Option<Arc<AuditLogger>>,
        jwt_secret: impl Into<Vec<u8>>,
        issuer: impl Into<String>,
    ) -> Self {
        Self {
            policies: ExchangePolicyStore::new(Arc::clone(&kv)),
            kv,
            audit,
            jwt_secret: jwt_secret.into(),
            issuer: issuer.into(),
        }
    }

    /// Access to the policy store (admin CRUD).
    #[must_use]
    pub fn policy_store(&self) -> &ExchangePolicyStore {
        &self.policies
    }

    /// Sign claims into a token. Also used to mint first-party tokens that
    /// later enter the exchange.
    pub fn sign(&self, claims: &ExchangeClaims) -> Result<String> {
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(&self.jwt_secret),
        )
        .map_err(|e| Error::Internal(format!("token signing failed: {e}")))
    }

    /// Validate a gateway-minted token and return its claims.
    pub fn validate(&self, token: &str) -> std::result::Result<ExchangeClaims, ExchangeDenial> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 30;
        validation.validate_aud = false;
        jsonwebtoken::decode::<ExchangeClaims>(
            token,
            &DecodingKey::from_secret(&self.jwt_secret),
            &validation,
        )
        .map(|d| d.claims)
        .map_err(|e| ExchangeDenial::new("invalid_request", format!("invalid token: {e}")))
    }

    /// Perform an exchange for `tenant_id`.
    ///
    /// # Errors
    ///
    /// Returns an [`ExchangeDenial`] whose `wire_error` is one of
    /// `invalid_request` / `invalid_scope` / `unauthorized_client`; the
    /// specific reason goes to the audit trail only.
    pub async fn exchange(
        &self,
        tenant_id: &str,
        request: &ExchangeRequest,
    ) -> std::result::Result<ExchangeResponse, ExchangeDenial> {
        let outcome = self.exchange_inner(tenant_id, request).await;
        self.audit_outcome(tenant_id, request, &outcome).await;
        outcome
    }

    async fn exchange_inner(
        &self,
        tenant_id: &str,
        request: &ExchangeRequest,
    ) -> std::result::Result<ExchangeResponse, ExchangeDenial> {
        if request.grant_type != GRANT_TYPE {
            return Err(ExchangeDenial::new(
                "invalid_request",
                format!("unsupported grant_type {}", request.grant_type),
            ));
        }

        // 1. Validate the subject (and optional actor) token.
        let subject = self.validate(&request.subject_token)?;
        if subject.tenant_id != tenant_id {
            return Err(ExchangeDenial::new(
                "unauthorized_client",
                "subject token belongs to another tenant",
            ));
        }
        let actor = match &request.actor_token {
            Some(token) => Some(self.validate(token)?),
            None => None,
        };

        // 2. Find the applicable policy.
        let policies = self
            .policies
            .list(tenant_id)
            .await
            .map_err(|e| ExchangeDenial::new("invalid_request", format!("policy load: {e}")))?;
        let policy = policies
            .iter()
            .filter(|p| p.enabled)
            .find(|p| {
                p.allowed_subjects.matches(&subject.sub, &subject.roles)
                    && p.allowed_audiences.iter().any(|a| a == &request.audience)
                    && p.conditions
                        .allowed_token_types
                        .iter()
                        .any(|t| t == &request.subject_token_type)
                    && (!p.conditions.require_actor_token || actor.is_some())
            })
            .ok_or_else(|| {
                ExchangeDenial::new(
                    "unauthorized_client",
                    format!(
                        "no policy permits subject {} for audience {}",
                        subject.sub, request.audience
                    ),
                )
            })?;

        // 3. Enforce chain limits.
        if subject.exchange_count >= policy.exchange_limits.max_exchanges_per_token {
            return Err(ExchangeDenial::new(
                "invalid_request",
                format!(
                    "exchange count {} reached policy limit {}",
                    subject.exchange_count, policy.exchange_limits.max_exchanges_per_token
                ),
            ));
        }
        if subject.delegation_chain.len() as u32 >= policy.exchange_limits.max_delegation_depth {
            return Err(ExchangeDenial::new(
                "invalid_request",
                format!(
                    "delegation depth {} reached policy limit {}",
                    subject.delegation_chain.len(),
                    policy.exchange_limits.max_delegation_depth
                ),
            ));
        }

        // 4. Compute the granted scopes.
        let granted = compute_scopes(&policy.scope_policy, request.scope.as_deref(), &subject)?;

        // 5. Lifetime.
        let expires_in = request
            .requested_expires_in
            .unwrap_or(policy.token_lifetime.default_expires_in)
            .min(policy.token_lifetime.max_expires_in);

        // 6. Mint the derived token.
        let now = chrono::Utc::now();
        let jti = Uuid::new_v4().to_string();
        let mut delegation_chain = subject.delegation_chain.clone();
        delegation_chain.push(DelegationEntry {
            actor: actor
                .as_ref()
                .map_or_else(|| subject.sub.clone(), |a| a.sub.clone()),
            subject: subject.sub.clone(),
            audience: request.audience.clone(),
            scope: granted.clone(),
            timestamp: now.timestamp_millis(),
        });

        #[allow(clippy::cast_possible_wrap)]
        let claims = ExchangeClaims {
            sub: subject.sub.clone(),
            aud: request.audience.clone(),
            iss: self.issuer.clone(),
            exp: now.timestamp() + expires_in as i64,
            iat: now.timestamp(),
            jti: jti.clone(),
            tenant_id: tenant_id.to_string(),
            scope: granted.clone(),
            roles: subject.roles.clone(),
            exchange_count: subject.exchange_count + 1,
            delegation_chain,
            original_token_id: subject.original_token_id.clone().or(Some(subject.jti.clone())),
        };

        let token = self
            .sign(&claims)
            .map_err(|e| ExchangeDenial::new("invalid_request", format!("signing: {e}")))?;

        // 7. Persist token metadata for introspection/revocation.
        let meta_key = format!("token_exchange:token:{jti}");
        let ttl = std::time::Duration::from_secs(expires_in.max(1));
        if let Ok(json) = serde_json::to_string(&claims) {
            if let Err(e) = self.kv.set(&meta_key, &json, Some(ttl)).await {
                debug!(error = %e, "Failed to persist exchange token metadata");
            }
        }

        Ok(ExchangeResponse {
            access_token: token,
            issued_token_type: TOKEN_TYPE_ACCESS.to_string(),
            token_type: "Bearer".to_string(),
            expires_in,
            scope: granted.join(" "),
        })
    }

    async fn audit_outcome(
        &self,
        tenant_id: &str,
        request: &ExchangeRequest,
        outcome: &std::result::Result<ExchangeResponse, ExchangeDenial>,
    ) {
        let Some(audit) = &self.audit else { return };
        let event = match outcome {
            Ok(response) => AuditEvent::new(
                tenant_id,
                "token.exchange",
                "token",
                AuditResult::Allow,
            )
            .metadata(serde_json::json!({
                "audience": request.audience,
                "scope": response.scope,
                "expires_in": response.expires_in,
            })),
            Err(denial) => AuditEvent::new(
                tenant_id,
                "token.exchange",
                "token",
                AuditResult::Deny,
            )
            .reason(denial.denial_reason.clone())
            .metadata(serde_json::json!({
                "audience": request.audience,
                "wire_error": denial.wire_error,
            })),
        };
        audit.record(event).await;
    }
}

/// Scope computation per policy.
fn compute_scopes(
    policy: &ScopePolicy,
    requested: Option<&str>,
    subject: &ExchangeClaims,
) -> std::result::Result<Vec<String>, ExchangeDenial> {
    let requested: Vec<String> = requested
        .map(|s| s.split_whitespace().map(ToString::to_string).collect())
        .unwrap_or_default();

    let start: Vec<String> = if requested.is_empty() && policy.inherit_from_subject {
        subject.scope.clone()
    } else {
        requested.clone()
    };

    if policy.downscope_only {
        let held: BTreeSet<&String> = subject.scope.iter().collect();
        if let Some(escalated) = start.iter().find(|s| !held.contains(s)) {
            return Err(ExchangeDenial::new(
                "invalid_scope",
                format!("scope {escalated} not held by subject token"),
            ));
        }
    }

    let mut granted: Vec<String> = start
        .into_iter()
        .filter(|s| policy.allowed_scopes.is_empty() || policy.allowed_scopes.contains(s))
        .filter(|s| !policy.deny_scopes.contains(s))
        .collect();
    granted.dedup();

    for required in &policy.required_scopes {
        if !granted.contains(required) {
            return Err(ExchangeDenial::new(
                "invalid_scope",
                format!("required scope {required} missing from grant"),
            ));
        }
    }

    if granted.is_empty() && !subject.scope.is_empty() {
        return Err(ExchangeDenial::new(
            "invalid_scope",
            "no requested scope is permitted by policy",
        ));
    }

    Ok(granted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    const SECRET: &[u8] = b"exchange-secret";

    fn service() -> TokenExchangeService {
        TokenExchangeService::new(Arc::new(MemoryKv::new()), None, SECRET, "keyfront")
    }

    fn subject_claims(scope: &[&str]) -> ExchangeClaims {
        let now = chrono::Utc::now().timestamp();
        ExchangeClaims {
            sub: "svc-orders".to_string(),
            aud: "keyfront".to_string(),
            iss: "keyfront".to_string(),
            exp: now + 600,
            iat: now,
            jti: Uuid::new_v4().to_string(),
            tenant_id: "t1".to_string(),
            scope: scope.iter().map(ToString::to_string).collect(),
            roles: vec!["SERVICE".to_string()],
            exchange_count: 0,
            delegation_chain: Vec::new(),
            original_token_id: None,
        }
    }

    fn base_policy() -> ExchangePolicy {
        ExchangePolicy {
            id: "ex1".to_string(),
            tenant_id: "t1".to_string(),
            enabled: true,
            allowed_subjects: SubjectMatch {
                services: vec!["svc-orders".to_string()],
                ..SubjectMatch::default()
            },
            allowed_targets: None,
            allowed_audiences: vec!["billing-api".to_string()],
            scope_policy: ScopePolicy {
                allowed_scopes: vec!["read".to_string(), "write".to_string()],
                downscope_only: true,
                ..ScopePolicy::default()
            },
            token_lifetime: TokenLifetime::default(),
            exchange_limits: ExchangeLimits::default(),
            conditions: ExchangeConditions::default(),
        }
    }

    fn request(service: &TokenExchangeService, scope: Option<&str>) -> ExchangeRequest {
        let token = service.sign(&subject_claims(&["read", "write", "admin"])).unwrap();
        ExchangeRequest {
            grant_type: GRANT_TYPE.to_string(),
            subject_token: token,
            subject_token_type: TOKEN_TYPE_ACCESS.to_string(),
            actor_token: None,
            actor_token_type: None,
            audience: "billing-api".to_string(),
            scope: scope.map(ToString::to_string),
            requested_expires_in: None,
        }
    }

    #[tokio::test]
    async fn downscope_exchange_succeeds() {
        // GIVEN: a policy allowing read/write downscoping
        let service = service();
        service.policy_store().put(&base_policy()).await.unwrap();

        // WHEN: exchanging for "read"
        let response = service
            .exchange("t1", &request(&service, Some("read")))
            .await
            .unwrap();

        // THEN: the derived token carries the narrowed scope and a bumped
        // exchange count with one delegation entry
        assert_eq!(response.scope, "read");
        assert_eq!(response.token_type, "Bearer");

        let claims = service.validate(&response.access_token).unwrap();
        assert_eq!(claims.exchange_count, 1);
        assert_eq!(claims.delegation_chain.len(), 1);
        assert_eq!(claims.delegation_chain[0].subject, "svc-orders");
        assert_eq!(claims.aud, "billing-api");
        assert!(claims.original_token_id.is_some());
    }

    #[tokio::test]
    async fn scope_outside_allowed_is_invalid_scope() {
        let service = service();
        service.policy_store().put(&base_policy()).await.unwrap();

        let denial = service
            .exchange("t1", &request(&service, Some("admin")))
            .await
            .unwrap_err();
        assert_eq!(denial.wire_error, "invalid_scope");
    }

    #[tokio::test]
    async fn downscope_only_rejects_escalation() {
        // Subject holds only "read"; requesting "write" escalates.
        let service = service();
        service.policy_store().put(&base_policy()).await.unwrap();

        let token = service.sign(&subject_claims(&["read"])).unwrap();
        let mut req = request(&service, Some("write"));
        req.subject_token = token;

        let denial = service.exchange("t1", &req).await.unwrap_err();
        assert_eq!(denial.wire_error, "invalid_scope");
        assert!(denial.denial_reason.contains("write"));
    }

    #[tokio::test]
    async fn no_matching_policy_is_unauthorized_client() {
        let service = service();
        // No policies at all.
        let denial = service
            .exchange("t1", &request(&service, Some("read")))
            .await
            .unwrap_err();
        assert_eq!(denial.wire_error, "unauthorized_client");
    }

    #[tokio::test]
    async fn audience_mismatch_is_unauthorized_client() {
        let service = service();
        service.policy_store().put(&base_policy()).await.unwrap();

        let mut req = request(&service, Some("read"));
        req.audience = "other-api".to_string();
        let denial = service.exchange("t1", &req).await.unwrap_err();
        assert_eq!(denial.wire_error, "unauthorized_client");
    }

    #[tokio::test]
    async fn tampered_subject_token_is_invalid_request() {
        let service = service();
        service.policy_store().put(&base_policy()).await.unwrap();

        let mut req = request(&service, Some("read"));
        req.subject_token.push('x');
        let denial = service.exchange("t1", &req).await.unwrap_err();
        assert_eq!(denial.wire_error, "invalid_request");
    }

    #[tokio::test]
    async fn cross_tenant_subject_token_is_rejected() {
        let service = service();
        service.policy_store().put(&base_policy()).await.unwrap();

        let mut claims = subject_claims(&["read"]);
        claims.tenant_id = "t2".to_string();
        let mut req = request(&service, Some("read"));
        req.subject_token = service.sign(&claims).unwrap();

        let denial = service.exchange("t1", &req).await.unwrap_err();
        assert_eq!(denial.wire_error, "unauthorized_client");
    }

    #[tokio::test]
    async fn exchange_limit_is_enforced() {
        let service = service();
        let mut policy = base_policy();
        policy.exchange_limits.max_exchanges_per_token = 1;
        service.policy_store().put(&policy).await.unwrap();

        // First exchange is fine.
        let response = service
            .exchange("t1", &request(&service, Some("read")))
            .await
            .unwrap();

        // The derived token has exchange_count = 1, at the policy ceiling.
        let mut req = request(&service, Some("read"));
        req.subject_token = response.access_token;
        let denial = service.exchange("t1", &req).await.unwrap_err();
        assert_eq!(denial.wire_error, "invalid_request");
        assert!(denial.denial_reason.contains("exchange count"));
    }

    #[tokio::test]
    async fn delegation_depth_is_enforced() {
        let service = service();
        let mut policy = base_policy();
        policy.exchange_limits.max_delegation_depth = 1;
        policy.exchange_limits.max_exchanges_per_token = 10;
        service.policy_store().put(&policy).await.unwrap();

        let response = service
            .exchange("t1", &request(&service, Some("read")))
            .await
            .unwrap();

        let mut req = request(&service, Some("read"));
        req.subject_token = response.access_token;
        let denial = service.exchange("t1", &req).await.unwrap_err();
        assert!(denial.denial_reason.contains("delegation depth"));
    }

    #[tokio::test]
    async fn required_actor_token_is_enforced_and_recorded() {
        let service = service();
        let mut policy = base_policy();
        policy.conditions.require_actor_token = true;
        service.policy_store().put(&policy).await.unwrap();

        // Without an actor token: no policy matches.
        let denial = service
            .exchange("t1", &request(&service, Some("read")))
            .await
            .unwrap_err();
        assert_eq!(denial.wire_error, "unauthorized_client");

        // With an actor token: the delegation entry names the actor.
        let mut actor_claims = subject_claims(&[]);
        actor_claims.sub = "svc-gateway".to_string();
        let mut req = request(&service, Some("read"));
        req.actor_token = Some(service.sign(&actor_claims).unwrap());
        req.actor_token_type = Some(TOKEN_TYPE_ACCESS.to_string());

        let response = service.exchange("t1", &req).await.unwrap();
        let claims = service.validate(&response.access_token).unwrap();
        assert_eq!(claims.delegation_chain[0].actor, "svc-gateway");
    }

    #[tokio::test]
    async fn inherit_from_subject_when_no_scope_requested() {
        let service = service();
        let mut policy = base_policy();
        policy.scope_policy.inherit_from_subject = true;
        service.policy_store().put(&policy).await.unwrap();

        let response = service.exchange("t1", &request(&service, None)).await.unwrap();
        // Subject held read/write/admin; allowed filters to read write.
        assert_eq!(response.scope, "read write");
    }

    #[tokio::test]
    async fn lifetime_is_capped_by_policy() {
        let service = service();
        let mut policy = base_policy();
        policy.token_lifetime.max_expires_in = 120;
        service.policy_store().put(&policy).await.unwrap();

        let mut req = request(&service, Some("read"));
        req.requested_expires_in = Some(999_999);
        let response = service.exchange("t1", &req).await.unwrap();
        assert_eq!(response.expires_in, 120);
    }

    #[tokio::test]
    async fn token_metadata_is_persisted() {
        let kv = Arc::new(MemoryKv::new());
        let service =
            TokenExchangeService::new(Arc::clone(&kv) as Arc<dyn Kv>, None, SECRET, "keyfront");
        service.policy_store().put(&base_policy()).await.unwrap();

        let response = service
            .exchange("t1", &request(&service, Some("read")))
            .await
            .unwrap();
        let claims = service.validate(&response.access_token).unwrap();

        let stored = kv
            .get(&format!("token_exchange:token:{}", claims.jti))
            .await
            .unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn policy_store_is_tenant_scoped() {
        let service = service();
        service.policy_store().put(&base_policy()).await.unwrap();
        assert!(service.policy_store().get("t1", "ex1").await.is_ok());
        assert!(service.policy_store().get("t2", "ex1").await.is_err());
    }

    #[test]
    fn subject_match_by_role_and_pattern() {
        let m = SubjectMatch {
            roles: vec!["SERVICE".to_string()],
            patterns: vec!["^svc-.*".to_string()],
            ..SubjectMatch::default()
        };
        assert!(m.matches("anything", &["SERVICE".to_string()]));
        assert!(m.matches("svc-billing", &[]));
        assert!(!m.matches("user-1", &["USER".to_string()]));
    }
}
