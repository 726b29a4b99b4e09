//! CSRF protection — double-submit tokens bound to the session.
//!
//! Each token is 32 random bytes (hex) plus
//! `hash = HMAC_SHA256(secret, token || sid)`, stored at
//! `csrf:{sid}:{token}`. Verification checks existence, expiry (evicting
//! expired records on access), the session binding, and the HMAC in
//! constant time. Unsafe requests rotate the token.

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::kv::{self, Kv};
use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// A stored CSRF token record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsrfToken {
    /// Hex token value the client echoes back.
    pub token: String,
    /// Session the token is bound to.
    #[serde(rename = "sessionId")]
    pub session_id: String,
    /// `HMAC_SHA256(secret, token || sid)`, hex.
    pub hash: String,
    /// Expiry, ms since epoch.
    #[serde(rename = "expiresAt")]
    pub expires_at: i64,
    /// Owning user, when known.
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Owning tenant, when known.
    #[serde(rename = "tenantId", skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

/// Compute the session-binding HMAC for a token.
#[must_use]
pub fn token_hash(secret: &[u8], token: &str, sid: &str) -> String {
    // HMAC-SHA256 accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(token.as_bytes());
    mac.update(sid.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time verification of a token's HMAC against a session.
#[must_use]
pub fn verify_token_hash(secret: &[u8], token: &str, hash: &str, sid: &str) -> bool {
    let expected = token_hash(secret, token, sid);
    let (Ok(a), Ok(b)) = (hex::decode(expected), hex::decode(hash)) else {
        return false;
    };
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(&b).into()
}

/// CSRF token service.
pub struct CsrfService {
    kv: Arc<dyn Kv>,
    secret: Vec<u8>,
    ttl: Duration,
}

impl CsrfService {
    /// Create a service binding tokens with `secret` for `ttl`.
    #[must_use]
    pub fn new(kv: Arc<dyn Kv>, secret: impl Into<Vec<u8>>, ttl: Duration) -> Self {
        Self {
            kv,
            secret: secret.into(),
            ttl,
        }
    }

    fn storage_key(sid: &str, token: &str) -> String {
        format!("csrf:{sid}:{token}")
    }

    /// Issue a fresh token for `sid`.
    pub async fn issue(
        &self,
        sid: &str,
        user_id: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Result<CsrfToken> {
        let raw: [u8; 32] = rand::rng().random();
        let token = hex::encode(raw);

        #[allow(clippy::cast_possible_wrap)]
        let record = CsrfToken {
            hash: token_hash(&self.secret, &token, sid),
            token: token.clone(),
            session_id: sid.to_string(),
            expires_at: chrono::Utc::now().timestamp_millis() + self.ttl.as_millis() as i64,
            user_id: user_id.map(ToString::to_string),
            tenant_id: tenant_id.map(ToString::to_string),
        };

        let json = serde_json::to_string(&record)?;
        self.kv
            .set(&Self::storage_key(sid, &token), &json, Some(self.ttl))
            .await?;
        Ok(record)
    }

    /// Verify `token` for `sid`.
    ///
    /// # Errors
    ///
    /// [`Error::CsrfInvalidToken`] when the token is unknown, expired,
    /// bound to another session, or fails the HMAC check.
    pub async fn verify(&self, sid: &str, token: &str) -> Result<()> {
        let key = Self::storage_key(sid, token);
        let Some(json) = self.kv.get(&key).await? else {
            return Err(Error::CsrfInvalidToken);
        };
        let record: CsrfToken = serde_json::from_str(&json)?;

        if chrono::Utc::now().timestamp_millis() >= record.expires_at {
            // Evict expired tokens on access.
            kv::del_one(self.kv.as_ref(), &key).await?;
            return Err(Error::CsrfInvalidToken);
        }
        if record.session_id != sid {
            return Err(Error::CsrfInvalidToken);
        }
        if !verify_token_hash(&self.secret, &record.token, &record.hash, sid) {
            return Err(Error::CsrfInvalidToken);
        }
        Ok(())
    }

    /// Verify `old_token` then replace it with a fresh one (rotation on
    /// unsafe requests).
    pub async fn rotate(
        &self,
        sid: &str,
        old_token: &str,
        user_id: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Result<CsrfToken> {
        self.verify(sid, old_token).await?;
        kv::del_one(self.kv.as_ref(), &Self::storage_key(sid, old_token)).await?;
        self.issue(sid, user_id, tenant_id).await
    }

    /// Invalidate every token issued to `sid` (session destruction).
    pub async fn invalidate_session(&self, sid: &str) -> Result<u64> {
        let keys = self.kv.keys(&format!("csrf:{sid}:*")).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        self.kv.del(&keys).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    const SECRET: &[u8] = b"test-csrf-secret";

    fn service() -> CsrfService {
        CsrfService::new(Arc::new(MemoryKv::new()), SECRET, Duration::from_secs(3600))
    }

    #[test]
    fn hash_roundtrip_verifies() {
        let hash = token_hash(SECRET, "tok", "sid1");
        assert!(verify_token_hash(SECRET, "tok", &hash, "sid1"));
    }

    #[test]
    fn hash_bound_to_session() {
        // A token hash minted for one session must fail for another.
        let hash = token_hash(SECRET, "tok", "sid1");
        assert!(!verify_token_hash(SECRET, "tok", &hash, "sid2"));
    }

    #[test]
    fn hash_bound_to_secret() {
        let hash = token_hash(SECRET, "tok", "sid1");
        assert!(!verify_token_hash(b"other-secret", "tok", &hash, "sid1"));
    }

    #[test]
    fn malformed_hash_fails_closed() {
        assert!(!verify_token_hash(SECRET, "tok", "not-hex!", "sid1"));
        assert!(!verify_token_hash(SECRET, "tok", "abcd", "sid1"));
    }

    #[tokio::test]
    async fn issue_then_verify_succeeds() {
        let service = service();
        let token = service.issue("sid1", Some("alice"), Some("t1")).await.unwrap();
        assert_eq!(token.token.len(), 64); // 32 bytes hex
        assert!(service.verify("sid1", &token.token).await.is_ok());
    }

    #[tokio::test]
    async fn verify_unknown_token_fails() {
        let service = service();
        let err = service.verify("sid1", "deadbeef").await.unwrap_err();
        assert_eq!(err.code(), "CSRF_INVALID_TOKEN");
    }

    #[tokio::test]
    async fn token_is_bound_to_one_session() {
        // GIVEN: a token issued to sid1
        let service = service();
        let token = service.issue("sid1", None, None).await.unwrap();

        // WHEN: another session replays it
        let err = service.verify("sid2", &token.token).await.unwrap_err();

        // THEN: rejected (the record key is scoped to sid1)
        assert_eq!(err.code(), "CSRF_INVALID_TOKEN");
    }

    #[tokio::test]
    async fn expired_token_is_evicted_on_access() {
        let kv = Arc::new(MemoryKv::new());
        let service = CsrfService::new(Arc::clone(&kv) as Arc<dyn Kv>, SECRET, Duration::ZERO);
        let token = service.issue("sid1", None, None).await.unwrap();

        // The KV TTL is clamped to 1s, so force expiry via the record clock.
        let _ = token;
        tokio::time::sleep(Duration::from_millis(5)).await;
        // expires_at == issue time, so the record-level check fires even if
        // the store entry is still present.
        let err = service.verify("sid1", &token.token).await.unwrap_err();
        assert_eq!(err.code(), "CSRF_INVALID_TOKEN");
    }

    #[tokio::test]
    async fn rotation_invalidates_the_old_token() {
        // GIVEN: an issued token
        let service = service();
        let old = service.issue("sid1", None, None).await.unwrap();

        // WHEN: the token is rotated
        let new = service.rotate("sid1", &old.token, None, None).await.unwrap();

        // THEN: the new token verifies, the old one no longer does
        assert!(service.verify("sid1", &new.token).await.is_ok());
        assert!(service.verify("sid1", &old.token).await.is_err());
    }

    #[tokio::test]
    async fn multiple_tokens_all_verify_until_invalidated() {
        // GIVEN: several tokens for one session
        let service = service();
        let tokens: Vec<CsrfToken> = {
            let mut v = Vec::new();
            for _ in 0..3 {
                v.push(service.issue("sid1", None, None).await.unwrap());
            }
            v
        };

        // THEN: each verifies
        for t in &tokens {
            assert!(service.verify("sid1", &t.token).await.is_ok());
        }

        // WHEN: the session's tokens are invalidated
        let removed = service.invalidate_session("sid1").await.unwrap();
        assert_eq!(removed, 3);

        // THEN: none verifies
        for t in &tokens {
            assert!(service.verify("sid1", &t.token).await.is_err());
        }
    }
}
