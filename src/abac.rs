//! ABAC policy engine.
//!
//! Policies are ordered rule lists stored per tenant at
//! `abac:policy:{tenant}:{id}`. The PDP loads a tenant's enabled policies,
//! enriches the access request through registered attribute providers
//! (attributes are frozen before the rule loop — providers run exactly once
//! per evaluation), evaluates each policy's rules in declaration order, and
//! combines policy decisions with deny-overrides by default.
//!
//! Matchers resolve dotted attribute paths against the request. Unknown
//! paths yield "undefined": `exists`/`not_exists` treat that as a normal
//! answer, every other operator evaluates false. `regex` compiles per
//! evaluation; an invalid pattern evaluates false and leaves a note on the
//! evaluation for the audit trail.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::audit::{AuditEvent, AuditLogger, AuditResult};
use crate::kv::{self, Kv};
use crate::{Error, Result};

/// Rule effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    /// Grant access.
    Permit,
    /// Refuse access.
    Deny,
}

/// Final decision of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Access granted.
    Permit,
    /// Access refused.
    Deny,
    /// No rule applied.
    NotApplicable,
}

/// How per-policy decisions combine into a final decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CombiningAlgorithm {
    /// Any deny wins; else any permit; else not applicable.
    #[default]
    DenyOverrides,
    /// Any permit wins; else any deny; else not applicable.
    PermitOverrides,
    /// The first applicable policy's decision wins.
    FirstApplicable,
}

/// Matcher operators — a closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// Exact value equality.
    Equals,
    /// Negated equality.
    NotEquals,
    /// Array membership or substring containment.
    Contains,
    /// Negated containment.
    NotContains,
    /// Numeric greater-than.
    GreaterThan,
    /// Numeric less-than.
    LessThan,
    /// Actual value is one of the expected array's elements.
    In,
    /// Negated `in`.
    NotIn,
    /// Actual string matches the expected regex.
    Regex,
    /// The attribute path resolves.
    Exists,
    /// The attribute path does not resolve.
    NotExists,
}

/// One attribute condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Matcher {
    /// Dotted attribute path (e.g. `subject.roles`).
    pub attribute: String,
    /// Comparison operator.
    pub operator: Operator,
    /// Expected value; absent for `exists`/`not_exists`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Rule target: all listed matchers must hold. Empty groups match anything.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Target {
    /// Subject matchers.
    #[serde(default)]
    pub subject: Vec<Matcher>,
    /// Resource matchers.
    #[serde(default)]
    pub resource: Vec<Matcher>,
    /// Action matchers.
    #[serde(default)]
    pub action: Vec<Matcher>,
    /// Environment matchers.
    #[serde(default)]
    pub environment: Vec<Matcher>,
}

/// One policy rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Rule id, unique within the policy.
    pub id: String,
    /// Effect when the rule applies.
    pub effect: Effect,
    /// Priority; the policy's maximum rule priority orders policies.
    #[serde(default)]
    pub priority: i32,
    /// Disabled rules never apply.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Target matchers.
    #[serde(default)]
    pub target: Target,
    /// Additional conditions, all of which must hold.
    #[serde(default)]
    pub conditions: Vec<Matcher>,
}

fn default_true() -> bool {
    true
}

/// A tenant policy: an ordered list of rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Policy id.
    pub id: String,
    /// Owning tenant.
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    /// Monotonic version, bumped on update.
    #[serde(default)]
    pub version: u64,
    /// Disabled policies are skipped by the PDP.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Rules in declaration order.
    pub rules: Vec<Rule>,
}

impl Policy {
    fn max_priority(&self) -> i32 {
        self.rules.iter().map(|r| r.priority).max().unwrap_or(0)
    }
}

/// Access request under evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccessRequest {
    /// Who is asking (`tenantId`, `roles`, arbitrary attributes).
    pub subject: Value,
    /// What is being accessed.
    pub resource: Value,
    /// What is being done.
    pub action: Value,
    /// Ambient context (timestamp, ip, userAgent, riskScore).
    pub environment: Value,
}

/// Result of a PDP evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    /// Combined decision.
    pub decision: Decision,
    /// Ids of policies whose rules applied.
    #[serde(rename = "appliedPolicies")]
    pub applied_policies: Vec<String>,
    /// Wall-clock evaluation time in microseconds.
    #[serde(rename = "evaluationMicros")]
    pub evaluation_micros: u64,
    /// Diagnostics (e.g. invalid regex patterns) for the audit trail.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

/// Pure request enricher. Providers must not depend on mutable external
/// state within a single evaluation.
pub trait AttributeProvider: Send + Sync {
    /// Provider name, for diagnostics.
    fn name(&self) -> &'static str;
    /// Add derived attributes to the request.
    fn enrich(&self, request: &mut AccessRequest);
}

/// Derives `environment.hourOfDay` and `environment.businessHours` from the
/// request's `environment.timestamp` (ms since epoch).
pub struct TimeAttributeProvider;

impl AttributeProvider for TimeAttributeProvider {
    fn name(&self) -> &'static str {
        "time"
    }

    fn enrich(&self, request: &mut AccessRequest) {
        let Some(ts) = request.environment.get("timestamp").and_then(Value::as_i64) else {
            return;
        };
        let Some(dt) = chrono::DateTime::from_timestamp_millis(ts) else {
            return;
        };
        use chrono::Timelike;
        let hour = dt.hour();
        if let Some(env) = request.environment.as_object_mut() {
            env.insert("hourOfDay".to_string(), Value::from(hour));
            env.insert(
                "businessHours".to_string(),
                Value::from((9..18).contains(&hour)),
            );
        }
    }
}

/// Policy persistence at `abac:policy:{tenant}:{id}`.
pub struct PolicyStore {
    kv: Arc<dyn Kv>,
}

impl PolicyStore {
    /// Create a store over `kv`.
    #[must_use]
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    fn key(tenant_id: &str, id: &str) -> String {
        format!("abac:policy:{tenant_id}:{id}")
    }

    /// Create or replace a policy, bumping its version.
    pub async fn put(&self, mut policy: Policy) -> Result<Policy> {
        policy.version += 1;
        let key = Self::key(&policy.tenant_id, &policy.id);
        self.kv
            .set(&key, &serde_json::to_string(&policy)?, None)
            .await?;
        Ok(policy)
    }

    /// Fetch one policy; tenant-scoped.
    pub async fn get(&self, tenant_id: &str, id: &str) -> Result<Policy> {
        let Some(json) = self.kv.get(&Self::key(tenant_id, id)).await? else {
            return Err(Error::PolicyNotFound(id.to_string()));
        };
        Ok(serde_json::from_str(&json)?)
    }

    /// List a tenant's policies.
    pub async fn list(&self, tenant_id: &str) -> Result<Vec<Policy>> {
        let mut policies = Vec::new();
        for key in self.kv.keys(&format!("abac:policy:{tenant_id}:*")).await? {
            if let Some(json) = self.kv.get(&key).await? {
                if let Ok(policy) = serde_json::from_str::<Policy>(&json) {
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

/// The policy decision point.
pub struct Pdp {
    store: PolicyStore,
    providers: Vec<Box<dyn AttributeProvider>>,
    audit: Option<Arc<AuditLogger>>,
    algorithm: CombiningAlgorithm,
}

impl Pdp {
    /// Create a PDP with the default deny-overrides combining algorithm and
    /// the built-in time attribute provider.
    #[must_use]
    pub fn new(kv: Arc<dyn Kv>, audit: Option<Arc<AuditLogger>>) -> Self {
        Self {
            store: PolicyStore::new(kv),
            providers: vec![Box::new(TimeAttributeProvider)],
            audit,
            algorithm: CombiningAlgorithm::default(),
        }
    }

    /// Register an additional attribute provider.
    pub fn register_provider(&mut self, provider: Box<dyn AttributeProvider>) {
        self.providers.push(provider);
    }

    /// Override the combining algorithm.
    pub fn set_algorithm(&mut self, algorithm: CombiningAlgorithm) {
        self.algorithm = algorithm;
    }

    /// Access to the underlying policy store (admin CRUD).
    #[must_use]
    pub fn store(&self) -> &PolicyStore {
        &self.store
    }

    /// Evaluate `request` against the tenant's enabled policies.
    pub async fn evaluate(&self, tenant_id: &str, request: &AccessRequest) -> Result<Evaluation> {
        let started = Instant::now();

        // Freeze attributes: providers run once, before any rule is read.
        let mut request = request.clone();
        for provider in &self.providers {
            provider.enrich(&mut request);
        }

        let mut policies: Vec<Policy> = self
            .store
            .list(tenant_id)
            .await?
            .into_iter()
            .filter(|p| p.enabled)
            .collect();
        policies.sort_by(|a, b| b.max_priority().cmp(&a.max_priority()));

        let mut notes = Vec::new();
        let mut applied = Vec::new();
        let mut decisions = Vec::new();

        for policy in &policies {
            match evaluate_policy(policy, &request, &mut notes) {
                Decision::NotApplicable => {}
                decision => {
                    applied.push(policy.id.clone());
                    decisions.push(decision);
                    if self.algorithm == CombiningAlgorithm::FirstApplicable {
                        break;
                    }
                }
            }
        }

        let decision = combine(self.algorithm, &decisions);
        #[allow(clippy::cast_possible_truncation)]
        let evaluation = Evaluation {
            decision,
            applied_policies: applied,
            evaluation_micros: started.elapsed().as_micros() as u64,
            notes,
        };

        if let Some(audit) = &self.audit {
            let result = match decision {
                Decision::Deny => AuditResult::Deny,
                Decision::Permit | Decision::NotApplicable => AuditResult::Allow,
            };
            audit
                .record(
                    AuditEvent::new(tenant_id, "abac.evaluate", "policy", result).metadata(
                        serde_json::json!({
                            "appliedPolicies": evaluation.applied_policies,
                            "decision": decision,
                            "evaluationMicros": evaluation.evaluation_micros,
                        }),
                    ),
                )
                .await;
        }

        debug!(tenant = %tenant_id, ?decision, "ABAC evaluation");
        Ok(evaluation)
    }
}

/// Evaluate one policy: rules in declaration order, first applicable rule
/// decides; others contribute nothing.
fn evaluate_policy(policy: &Policy, request: &AccessRequest, notes: &mut Vec<String>) -> Decision {
    for rule in policy.rules.iter().filter(|r| r.enabled) {
        if rule_applies(rule, request, notes) {
            return match rule.effect {
                Effect::Permit => Decision::Permit,
                Effect::Deny => Decision::Deny,
            };
        }
    }
    Decision::NotApplicable
}

fn rule_applies(rule: &Rule, request: &AccessRequest, notes: &mut Vec<String>) -> bool {
    let groups = [
        (&rule.target.subject, "subject"),
        (&rule.target.resource, "resource"),
        (&rule.target.action, "action"),
        (&rule.target.environment, "environment"),
    ];
    for (matchers, section) in groups {
        for m in matchers {
            if !matcher_holds(m, section, request, notes) {
                return false;
            }
        }
    }
    rule.conditions
        .iter()
        .all(|m| matcher_holds(m, "", request, notes))
}

fn matcher_holds(
    matcher: &Matcher,
    section: &str,
    request: &AccessRequest,
    notes: &mut Vec<String>,
) -> bool {
    let actual = resolve_attribute(request, &matcher.attribute, section);

    match matcher.operator {
        Operator::Exists => return actual.is_some(),
        Operator::NotExists => return actual.is_none(),
        _ => {}
    }

    // Every other operator on an unresolved path evaluates false.
    let Some(actual) = actual else {
        return false;
    };
    let expected = matcher.value.as_ref().unwrap_or(&Value::Null);

    match matcher.operator {
        Operator::Equals => actual == expected,
        Operator::NotEquals => actual != expected,
        Operator::Contains => contains(actual, expected),
        Operator::NotContains => !contains(actual, expected),
        Operator::GreaterThan => numeric_cmp(actual, expected).is_some_and(|o| o.is_gt()),
        Operator::LessThan => numeric_cmp(actual, expected).is_some_and(|o| o.is_lt()),
        Operator::In => expected
            .as_array()
            .is_some_and(|arr| arr.iter().any(|v| v == actual)),
        Operator::NotIn => expected
            .as_array()
            .is_some_and(|arr| !arr.iter().any(|v| v == actual)),
        Operator::Regex => {
            let (Some(pattern), Some(text)) = (expected.as_str(), actual.as_str()) else {
                return false;
            };
            // Compiled per evaluation; invalid patterns fail closed.
            match regex::Regex::new(pattern) {
                Ok(re) => re.is_match(text),
                Err(e) => {
                    notes.push(format!(
                        "invalid regex in matcher {}: {e}",
                        matcher.attribute
                    ));
                    false
                }
            }
        }
        Operator::Exists | Operator::NotExists => unreachable!("handled above"),
    }
}

/// Resolve a dotted path: absolute against the whole request first, then
/// relative to the matcher's target section.
fn resolve_attribute<'a>(
    request: &'a AccessRequest,
    path: &str,
    section: &str,
) -> Option<&'a Value> {
    if let Some(found) = resolve_absolute(request, path) {
        return Some(found);
    }
    if section.is_empty() {
        return None;
    }
    resolve_absolute(request, &format!("{section}.{path}"))
}

fn resolve_absolute<'a>(request: &'a AccessRequest, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = match parts.next()? {
        "subject" => &request.subject,
        "resource" => &request.resource,
        "action" => &request.action,
        "environment" => &request.environment,
        _ => return None,
    };
    for part in parts {
        current = current.get(part)?;
    }
    Some(current)
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::Array(arr) => arr.iter().any(|v| v == expected),
        Value::String(s) => expected.as_str().is_some_and(|needle| s.contains(needle)),
        _ => false,
    }
}

fn numeric_cmp(actual: &Value, expected: &Value) -> Option<std::cmp::Ordering> {
    actual.as_f64()?.partial_cmp(&expected.as_f64()?)
}

fn combine(algorithm: CombiningAlgorithm, decisions: &[Decision]) -> Decision {
    let any_deny = decisions.contains(&Decision::Deny);
    let any_permit = decisions.contains(&Decision::Permit);
    match algorithm {
        CombiningAlgorithm::DenyOverrides => {
            if any_deny {
                Decision::Deny
            } else if any_permit {
                Decision::Permit
            } else {
                Decision::NotApplicable
            }
        }
        CombiningAlgorithm::PermitOverrides => {
            if any_permit {
                Decision::Permit
            } else if any_deny {
                Decision::Deny
            } else {
                Decision::NotApplicable
            }
        }
        CombiningAlgorithm::FirstApplicable => {
            decisions.first().copied().unwrap_or(Decision::NotApplicable)
        }
    }
}
