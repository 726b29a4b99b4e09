//! Server-side session store.
//!
//! The browser holds only an opaque session id; the session record lives at
//! `sess:{sid}` with a TTL equal to the access-token lifetime. IdP tokens
//! never enter the record — it carries opaque refs into token blobs stored
//! separately at `token:{ref}`, so a serialized session (or anything built
//! from it) can never leak a token.
//!
//! Expiry is enforced on read: resolving a session past its `expiresAt`
//! deletes the record. `destroy` wins over a concurrent `touch` because
//! `touch` re-checks existence and never re-creates a deleted record.

use std::sync::Arc;

use base64::Engine;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::kv::Kv;
use crate::{Error, Result};

/// A user session as persisted in the KV store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSession {
    /// OIDC subject.
    pub sub: String,
    /// Owning tenant.
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    /// Email claim, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Display name, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Role claims.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Permission claims.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// OIDC client the session was established through.
    #[serde(rename = "clientId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Opaque handle to the access-token blob.
    #[serde(rename = "accessTokenRef")]
    pub access_token_ref: String,
    /// Opaque handle to the refresh-token blob.
    #[serde(rename = "refreshTokenRef", skip_serializing_if = "Option::is_none")]
    pub refresh_token_ref: Option<String>,
    /// Hard expiry, ms since epoch.
    #[serde(rename = "expiresAt")]
    pub expires_at: i64,
    /// Creation time, ms since epoch.
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    /// Last authenticated activity, ms since epoch.
    #[serde(rename = "lastActivity")]
    pub last_activity: i64,
}

impl UserSession {
    /// `expiresAt == now` already counts as expired.
    #[must_use]
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }

    /// True if the user carries `role`.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Client-safe view for `/api/me` — no token refs.
    #[must_use]
    pub fn profile(&self) -> Profile {
        Profile {
            id: self.sub.clone(),
            tenant_id: self.tenant_id.clone(),
            email: self.email.clone(),
            name: self.name.clone(),
            roles: self.roles.clone(),
            permissions: self.permissions.clone(),
        }
    }
}

/// Client-facing profile; intentionally omits every token field.
#[derive(Debug, Clone, Serialize)]
pub struct Profile {
    /// OIDC subject.
    pub id: String,
    /// Owning tenant.
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    /// Email claim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Role claims.
    pub roles: Vec<String>,
    /// Permission claims.
    pub permissions: Vec<String>,
}

/// IdP token material attached to a new or refreshed session.
#[derive(Debug, Clone)]
pub struct TokenMaterial {
    /// Access token value.
    pub access_token: String,
    /// Refresh token value, when granted.
    pub refresh_token: Option<String>,
    /// Access-token lifetime in seconds.
    pub expires_in: u64,
}

/// Generate an opaque, URL-safe session id (256 bits of entropy).
#[must_use]
pub fn generate_sid() -> String {
    let raw: [u8; 32] = rand::rng().random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
}

fn generate_token_ref() -> String {
    let raw: [u8; 16] = rand::rng().random();
    hex::encode(raw)
}

fn session_key(sid: &str) -> String {
    format!("sess:{sid}")
}

fn token_key(token_ref: &str) -> String {
    format!("token:{token_ref}")
}

/// Session persistence over the KV store.
pub struct SessionStore {
    kv: Arc<dyn Kv>,
}

impl SessionStore {
    /// Create a store over `kv`.
    #[must_use]
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    /// Create a session from verified identity claims and token material.
    ///
    /// Returns the new opaque `sid`.
    pub async fn create(
        &self,
        mut session: UserSession,
        tokens: &TokenMaterial,
    ) -> Result<String> {
        let sid = generate_sid();
        let now = chrono::Utc::now().timestamp_millis();
        let ttl = std::time::Duration::from_secs(tokens.expires_in.max(1));

        let access_ref = generate_token_ref();
        self.kv
            .set(&token_key(&access_ref), &tokens.access_token, Some(ttl))
            .await?;
        session.access_token_ref = access_ref;

        session.refresh_token_ref = match &tokens.refresh_token {
            Some(refresh) => {
                let refresh_ref = generate_token_ref();
                self.kv
                    .set(&token_key(&refresh_ref), refresh, Some(ttl))
                    .await?;
                Some(refresh_ref)
            }
            None => None,
        };

        #[allow(clippy::cast_possible_wrap)]
        {
            session.created_at = now;
            session.last_activity = now;
            session.expires_at = now + (tokens.expires_in as i64) * 1000;
        }

        let json = serde_json::to_string(&session)?;
        self.kv.set(&session_key(&sid), &json, Some(ttl)).await?;
        debug!(sub = %session.sub, tenant = %session.tenant_id, "Created session");
        Ok(sid)
    }

    /// Resolve `sid`, deleting the record when it is past expiry.
    pub async fn resolve(&self, sid: &str) -> Result<Option<UserSession>> {
        let Some(json) = self.kv.get(&session_key(sid)).await? else {
            return Ok(None);
        };
        let session: UserSession = serde_json::from_str(&json)?;

        if session.is_expired(chrono::Utc::now().timestamp_millis()) {
            self.destroy(sid).await?;
            return Ok(None);
        }
        Ok(Some(session))
    }

    /// Update `lastActivity`. Never extends `expiresAt`; a destroyed session
    /// stays destroyed (the write is skipped when the record is gone).
    pub async fn touch(&self, sid: &str) -> Result<()> {
        let key = session_key(sid);
        let Some(json) = self.kv.get(&key).await? else {
            return Ok(());
        };
        let mut session: UserSession = serde_json::from_str(&json)?;

        let now = chrono::Utc::now().timestamp_millis();
        if session.is_expired(now) {
            self.destroy(sid).await?;
            return Ok(());
        }

        session.last_activity = now;
        let remaining = session.expires_at - now;
        #[allow(clippy::cast_sign_loss)]
        let ttl = std::time::Duration::from_millis(remaining.max(1) as u64);
        // Update-not-create: a concurrent destroy wins over this bump.
        self.kv
            .set_if_exists(&key, &serde_json::to_string(&session)?, Some(ttl))
            .await?;
        Ok(())
    }

    /// Destroy `sid`: removes the record, its token blobs, and every CSRF
    /// token issued to it.
    ///
    /// Returns `true` when a record was present.
    pub async fn destroy(&self, sid: &str) -> Result<bool> {
        let key = session_key(sid);
        let existing = self.kv.get(&key).await?;

        let mut keys = vec![key];
        if let Some(json) = &existing {
            if let Ok(session) = serde_json::from_str::<UserSession>(json) {
                keys.push(token_key(&session.access_token_ref));
                if let Some(refresh_ref) = &session.refresh_token_ref {
                    keys.push(token_key(refresh_ref));
                }
            }
        }
        keys.extend(self.kv.keys(&format!("csrf:{sid}:*")).await?);

        self.kv.del(&keys).await?;
        if existing.is_some() {
            debug!(sid = %redact_sid(sid), "Destroyed session");
        }
        Ok(existing.is_some())
    }

    /// Dereference the session's access token for downstream injection.
    pub async fn access_token(&self, session: &UserSession) -> Result<Option<String>> {
        self.kv.get(&token_key(&session.access_token_ref)).await
    }

    /// Dereference the session's refresh token.
    pub async fn refresh_token(&self, session: &UserSession) -> Result<Option<String>> {
        match &session.refresh_token_ref {
            Some(r) => self.kv.get(&token_key(r)).await,
            None => Ok(None),
        }
    }

    /// Rewrite the session in place after a token refresh: same `sid`, new
    /// expiry, new token blobs (the old blobs are deleted).
    pub async fn replace_tokens(
        &self,
        sid: &str,
        session: &UserSession,
        tokens: &TokenMaterial,
    ) -> Result<UserSession> {
        let key = session_key(sid);
        if self.kv.get(&key).await?.is_none() {
            return Err(Error::SessionExpired);
        }

        let mut old_blobs = vec![token_key(&session.access_token_ref)];
        if let Some(r) = &session.refresh_token_ref {
            old_blobs.push(token_key(r));
        }

        let now = chrono::Utc::now().timestamp_millis();
        let ttl = std::time::Duration::from_secs(tokens.expires_in.max(1));

        let access_ref = generate_token_ref();
        self.kv
            .set(&token_key(&access_ref), &tokens.access_token, Some(ttl))
            .await?;

        let refresh_ref = match &tokens.refresh_token {
            Some(refresh) => {
                let r = generate_token_ref();
                self.kv.set(&token_key(&r), refresh, Some(ttl)).await?;
                Some(r)
            }
            None => session.refresh_token_ref.clone(),
        };

        #[allow(clippy::cast_possible_wrap)]
        let updated = UserSession {
            access_token_ref: access_ref,
            refresh_token_ref: refresh_ref,
            expires_at: now + (tokens.expires_in as i64) * 1000,
            last_activity: now,
            ..session.clone()
        };

        // Update-not-create: if the session was destroyed mid-refresh, the
        // rewrite is dropped and the new blobs expire on their own TTL.
        if !self
            .kv
            .set_if_exists(&key, &serde_json::to_string(&updated)?, Some(ttl))
            .await?
        {
            return Err(Error::SessionExpired);
        }
        self.kv.del(&old_blobs).await?;
        Ok(updated)
    }

    /// All live sessions for one user. Pattern scan; admin/logout paths only.
    pub async fn sessions_for_user(
        &self,
        tenant_id: &str,
        sub: &str,
    ) -> Result<Vec<(String, UserSession)>> {
        self.scan_sessions(|s| s.tenant_id == tenant_id && s.sub == sub)
            .await
    }

    /// All live sessions matching `filter`. Pattern scan; admin paths only.
    pub async fn scan_sessions(
        &self,
        filter: impl Fn(&UserSession) -> bool,
    ) -> Result<Vec<(String, UserSession)>> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut found = Vec::new();
        for key in self.kv.keys("sess:*").await? {
            let Some(json) = self.kv.get(&key).await? else {
                continue;
            };
            let Ok(session) = serde_json::from_str::<UserSession>(&json) else {
                continue;
            };
            if !session.is_expired(now) && filter(&session) {
                let sid = key.trim_start_matches("sess:").to_string();
                found.push((sid, session));
            }
        }
        Ok(found)
    }
}

/// First 8 chars of a sid for log lines.
fn redact_sid(sid: &str) -> &str {
    &sid[..sid.len().min(8)]
}
