//! OIDC client — discovery, authorization-code + PKCE login, token and
//! refresh calls, and ID-token verification.
//!
//! # Login flow
//!
//! 1. `start_login` mints `state`, `nonce`, and a PKCE verifier, persists
//!    them at `oauth:state:{state}` (TTL 600 s), and builds the IdP
//!    authorization URL.
//! 2. The IdP redirects back with `code` + `state`; `consume_state`
//!    atomically retrieves-and-deletes the record (a second consume fails).
//! 3. `exchange_code` posts `code` + `code_verifier` to the token endpoint.
//! 4. `verify_id_token` validates the ID token: HS256 against the client
//!    secret, or RS256/ES256 against the provider JWKS (cached one hour,
//!    refreshed once on an unknown `kid`), then checks `iss` and `nonce`.
//!
//! Transport failures to the IdP surface as `OIDC_UNAVAILABLE`; signature
//! and claim failures as `OIDC_INVALID_TOKEN`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use jsonwebtoken::{
    Algorithm, DecodingKey, Validation,
    jwk::{AlgorithmParameters, JwkSet},
};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use url::Url;

use crate::config::OidcConfig;
use crate::kv::{self, Kv};
use crate::{Error, Result};

/// TTL for persisted login state.
const STATE_TTL: Duration = Duration::from_secs(600);

/// How long a fetched discovery document / JWKS is cached.
const METADATA_TTL: Duration = Duration::from_secs(3600);

/// OIDC discovery document (the subset the gateway uses).
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryDocument {
    /// Issuer URL; must match the configured issuer.
    pub issuer: String,
    /// Authorization endpoint.
    pub authorization_endpoint: String,
    /// Token endpoint.
    pub token_endpoint: String,
    /// UserInfo endpoint.
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    /// RP-initiated logout endpoint.
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
    /// JWKS endpoint.
    pub jwks_uri: String,
}

/// Persisted login state for one authorization request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginState {
    /// Opaque `state` parameter.
    pub state: String,
    /// PKCE code verifier.
    #[serde(rename = "codeVerifier")]
    pub code_verifier: String,
    /// Nonce bound into the ID token.
    pub nonce: String,
    /// Post-login redirect target.
    #[serde(rename = "redirectUri")]
    pub redirect_uri: String,
    /// Tenant hint, when the login was tenant-scoped.
    #[serde(rename = "tenantId", skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Creation time, ms since epoch.
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

/// Token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    /// Access token.
    pub access_token: String,
    /// Refresh token, when granted.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// ID token (present on the authorization-code grant).
    #[serde(default)]
    pub id_token: Option<String>,
    /// Access-token lifetime in seconds.
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
    /// Token type (`Bearer`).
    #[serde(default)]
    pub token_type: Option<String>,
}

fn default_expires_in() -> u64 {
    300
}

/// Claims extracted from a verified ID token.
#[derive(Debug, Clone, Deserialize)]
pub struct IdClaims {
    /// Issuer.
    pub iss: String,
    /// Subject.
    pub sub: String,
    /// Expiry (validated by the JWT library).
    #[allow(dead_code)]
    pub exp: u64,
    /// Nonce echoed from the authorization request.
    #[serde(default)]
    pub nonce: Option<String>,
    /// Email claim.
    #[serde(default)]
    pub email: Option<String>,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Tenant claim.
    #[serde(rename = "tenantId", default)]
    pub tenant_id: Option<String>,
    /// Role claims.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Permission claims.
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Claims of an IdP-issued back-channel logout token.
#[derive(Debug, Clone, Deserialize)]
pub struct LogoutReceiverClaims {
    /// Issuer.
    pub iss: String,
    /// Affected subject.
    pub sub: String,
    /// Expiry (validated by the JWT library).
    #[allow(dead_code)]
    pub exp: u64,
    /// Security events claim; must be present and non-empty.
    #[serde(default)]
    pub events: serde_json::Value,
    /// IdP session id, when session-scoped.
    #[serde(default)]
    pub sid: Option<String>,
    /// Must be absent on logout tokens.
    #[serde(default)]
    pub nonce: Option<String>,
}

struct CachedDiscovery {
    doc: DiscoveryDocument,
    fetched_at: Instant,
}

struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

/// OIDC client bound to one provider.
pub struct OidcClient {
    config: OidcConfig,
    http: reqwest::Client,
    kv: Arc<dyn Kv>,
    discovery: RwLock<Option<CachedDiscovery>>,
    jwks: RwLock<Option<CachedJwks>>,
}

impl OidcClient {
    /// Create a client for the configured provider.
    #[must_use]
    pub fn new(config: OidcConfig, kv: Arc<dyn Kv>) -> Self {
        Self {
            config,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            kv,
            discovery: RwLock::new(None),
            jwks: RwLock::new(None),
        }
    }

    /// Fetch (or return cached) provider discovery metadata.
    pub async fn discover(&self) -> Result<DiscoveryDocument> {
        if let Some(cached) = self.discovery.read().as_ref() {
            if cached.fetched_at.elapsed() < METADATA_TTL {
                return Ok(cached.doc.clone());
            }
        }

        let url = format!(
            "{}/.well-known/openid-configuration",
            self.config.issuer_url.trim_end_matches('/')
        );
        debug!(url = %url, "Fetching OIDC discovery document");
        let doc: DiscoveryDocument = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::OidcUnavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::OidcUnavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::OidcUnavailable(e.to_string()))?;

        *self.discovery.write() = Some(CachedDiscovery {
            doc: doc.clone(),
            fetched_at: Instant::now(),
        });
        Ok(doc)
    }

    /// Begin a login: persist state + PKCE verifier, return the IdP
    /// authorization URL.
    pub async fn start_login(
        &self,
        redirect_target: &str,
        tenant_id: Option<&str>,
    ) -> Result<(String, LoginState)> {
        let doc = self.discover().await?;

        let state = random_urlsafe(24);
        let nonce = random_urlsafe(24);
        let code_verifier = random_urlsafe(48);
        let code_challenge = pkce_challenge(&code_verifier);

        let login_state = LoginState {
            state: state.clone(),
            code_verifier,
            nonce: nonce.clone(),
            redirect_uri: redirect_target.to_string(),
            tenant_id: tenant_id.map(ToString::to_string),
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        self.kv
            .set(
                &state_key(&state),
                &serde_json::to_string(&login_state)?,
                Some(STATE_TTL),
            )
            .await?;

        let mut url = Url::parse(&doc.authorization_endpoint)
            .map_err(|e| Error::Config(format!("invalid authorization endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("scope", "openid profile email")
            .append_pair("state", &state)
            .append_pair("nonce", &nonce)
            .append_pair("code_challenge", &code_challenge)
            .append_pair("code_challenge_method", "S256");

        Ok((url.to_string(), login_state))
    }

    /// Atomically consume the persisted login state for `state`.
    ///
    /// # Errors
    ///
    /// [`Error::OauthStateInvalid`] when the state is unknown, expired, or
    /// already consumed.
    pub async fn consume_state(&self, state: &str) -> Result<LoginState> {
        let key = state_key(state);
        let Some(json) = self.kv.get(&key).await? else {
            return Err(Error::OauthStateInvalid);
        };
        // Delete before use so a concurrent replay of the same state fails.
        kv::del_one(self.kv.as_ref(), &key).await?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<TokenResponse> {
        let doc = self.discover().await?;
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &self.config.redirect_uri),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
            ("code_verifier", code_verifier),
        ];
        self.token_request(&doc.token_endpoint, &params).await
    }

    /// Refresh an access token.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        let doc = self.discover().await?;
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
        ];
        self.token_request(&doc.token_endpoint, &params).await
    }

    async fn token_request(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<TokenResponse> {
        let response = self
            .http
            .post(endpoint)
            .form(params)
            .send()
            .await
            .map_err(|e| Error::OidcUnavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(Error::OidcUnavailable(format!(
                "token endpoint returned {status}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Token endpoint rejected the request");
            return Err(Error::OidcInvalidToken(format!(
                "token endpoint returned {status}: {body}"
            )));
        }
        response
            .json()
            .await
            .map_err(|e| Error::OidcUnavailable(e.to_string()))
    }

    /// Verify an ID token's signature and claims, returning its claims.
    ///
    /// HS256 tokens verify against the client secret (OIDC Core §10.1);
    /// asymmetric algorithms verify against the provider JWKS.
    pub async fn verify_id_token(
        &self,
        id_token: &str,
        expected_nonce: Option<&str>,
    ) -> Result<IdClaims> {
        let header = jsonwebtoken::decode_header(id_token)
            .map_err(|e| Error::OidcInvalidToken(e.to_string()))?;

        let (key, alg) = match header.alg {
            Algorithm::HS256 => (
                DecodingKey::from_secret(self.config.client_secret.as_bytes()),
                Algorithm::HS256,
            ),
            Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 | Algorithm::ES256
            | Algorithm::ES384 => {
                let kid = header
                    .kid
                    .as_deref()
                    .ok_or_else(|| Error::OidcInvalidToken("missing kid".to_string()))?;
                (self.find_jwk(kid).await?, header.alg)
            }
            other => {
                return Err(Error::OidcInvalidToken(format!(
                    "unsupported algorithm {other:?}"
                )));
            }
        };

        let mut validation = Validation::new(alg);
        validation.leeway = 60;
        // Audience is checked against the client id.
        validation.set_audience(&[&self.config.client_id]);

        let data = jsonwebtoken::decode::<IdClaims>(id_token, &key, &validation)
            .map_err(|e| Error::OidcInvalidToken(e.to_string()))?;
        let claims = data.claims;

        let expected_issuer = self.config.issuer_url.trim_end_matches('/');
        if claims.iss.trim_end_matches('/') != expected_issuer {
            return Err(Error::OidcInvalidToken(format!(
                "issuer mismatch: {}",
                claims.iss
            )));
        }
        if let Some(nonce) = expected_nonce {
            if claims.nonce.as_deref() != Some(nonce) {
                return Err(Error::OidcInvalidToken("nonce mismatch".to_string()));
            }
        }
        Ok(claims)
    }

    /// Verify an IdP back-channel logout token (OIDC Back-Channel Logout).
    ///
    /// Checks signature, `iss`, `aud`, `exp`, the presence of an `events`
    /// claim, and the *absence* of `nonce` (required by the profile).
    pub async fn verify_logout_token(&self, token: &str) -> Result<LogoutReceiverClaims> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| Error::OidcInvalidToken(e.to_string()))?;

        let (key, alg) = match header.alg {
            Algorithm::HS256 => (
                DecodingKey::from_secret(self.config.client_secret.as_bytes()),
                Algorithm::HS256,
            ),
            Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 | Algorithm::ES256
            | Algorithm::ES384 => {
                let kid = header
                    .kid
                    .as_deref()
                    .ok_or_else(|| Error::OidcInvalidToken("missing kid".to_string()))?;
                (self.find_jwk(kid).await?, header.alg)
            }
            other => {
                return Err(Error::OidcInvalidToken(format!(
                    "unsupported algorithm {other:?}"
                )));
            }
        };

        let mut validation = Validation::new(alg);
        validation.leeway = 60;
        validation.set_audience(&[&self.config.client_id]);

        let data = jsonwebtoken::decode::<LogoutReceiverClaims>(token, &key, &validation)
            .map_err(|e| Error::OidcInvalidToken(e.to_string()))?;
        let claims = data.claims;

        if claims.iss.trim_end_matches('/') != self.config.issuer_url.trim_end_matches('/') {
            return Err(Error::OidcInvalidToken("issuer mismatch".to_string()));
        }
        if claims.events.as_object().is_none_or(serde_json::Map::is_empty) {
            return Err(Error::OidcInvalidToken("missing events claim".to_string()));
        }
        if claims.nonce.is_some() {
            return Err(Error::OidcInvalidToken(
                "logout token must not carry a nonce".to_string(),
            ));
        }
        Ok(claims)
    }

    /// Find a decoding key by `kid`, refreshing the JWKS once when unknown.
    async fn find_jwk(&self, kid: &str) -> Result<DecodingKey> {
        if let Some(key) = self.cached_jwk(kid) {
            return Ok(key);
        }

        // Unknown kid: refresh once and retry.
        let doc = self.discover().await?;
        debug!(kid = %kid, "Key not in cached JWKS, refreshing");
        let jwks: JwkSet = self
            .http
            .get(&doc.jwks_uri)
            .send()
            .await
            .map_err(|e| Error::OidcUnavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::OidcUnavailable(e.to_string()))?;
        *self.jwks.write() = Some(CachedJwks {
            keys: jwks,
            fetched_at: Instant::now(),
        });

        self.cached_jwk(kid)
            .ok_or_else(|| Error::OidcInvalidToken(format!("unknown key id {kid}")))
    }

    fn cached_jwk(&self, kid: &str) -> Option<DecodingKey> {
        let guard = self.jwks.read();
        let cached = guard.as_ref()?;
        if cached.fetched_at.elapsed() >= METADATA_TTL {
            return None;
        }
        find_key_in_jwks(&cached.keys, kid)
    }

    /// RP-initiated logout URL at the IdP, when the provider supports it.
    pub async fn end_session_url(&self, post_logout_redirect: Option<&str>) -> Result<Option<String>> {
        let doc = self.discover().await?;
        let Some(endpoint) = doc.end_session_endpoint else {
            return Ok(None);
        };
        let mut url = Url::parse(&endpoint)
            .map_err(|e| Error::Config(format!("invalid end_session endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id);
        if let Some(target) = post_logout_redirect {
            url.query_pairs_mut()
                .append_pair("post_logout_redirect_uri", target);
        }
        Ok(Some(url.to_string()))
    }
}

fn state_key(state: &str) -> String {
    format!("oauth:state:{state}")
}

/// URL-safe random string from `n` random bytes.
fn random_urlsafe(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    rand::rng().fill(bytes.as_mut_slice());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// PKCE S256 challenge: `BASE64URL(SHA256(verifier))`.
#[must_use]
pub fn pkce_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    for jwk in &jwks.keys {
        if jwk.common.key_id.as_deref() != Some(kid) {
            continue;
        }
        return match &jwk.algorithm {
            AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
            AlgorithmParameters::EllipticCurve(ec) => {
                DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
            }
            _ => None,
        };
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use jsonwebtoken::{EncodingKey, Header, encode};

    fn client() -> OidcClient {
        OidcClient::new(
            OidcConfig {
                issuer_url: "https://idp.example.com/realms/main".to_string(),
                client_id: "keyfront".to_string(),
                client_secret: "client-secret".to_string(),
                redirect_uri: "https://bff.example.com/api/callback".to_string(),
            },
            Arc::new(MemoryKv::new()),
        )
    }

    #[test]
    fn pkce_challenge_matches_rfc7636_vector() {
        // RFC 7636 appendix B test vector.
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            pkce_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn random_urlsafe_has_no_padding() {
        let s = random_urlsafe(48);
        assert!(!s.contains('='));
        assert!(s.len() >= 64);
        assert_ne!(random_urlsafe(48), random_urlsafe(48));
    }

    #[tokio::test]
    async fn consume_state_is_single_use() {
        // GIVEN: a persisted login state
        let client = client();
        let state = LoginState {
            state: "abc".to_string(),
            code_verifier: "ver".to_string(),
            nonce: "n".to_string(),
            redirect_uri: "/home".to_string(),
            tenant_id: Some("t1".to_string()),
            created_at: 0,
        };
        client
            .kv
            .set(
                "oauth:state:abc",
                &serde_json::to_string(&state).unwrap(),
                None,
            )
            .await
            .unwrap();

        // WHEN: consumed twice
        let first = client.consume_state("abc").await.unwrap();
        let second = client.consume_state("abc").await;

        // THEN: the first succeeds, the replay fails
        assert_eq!(first.code_verifier, "ver");
        assert_eq!(second.unwrap_err().code(), "OAUTH_STATE_INVALID");
    }

    #[tokio::test]
    async fn consume_unknown_state_fails() {
        let client = client();
        let err = client.consume_state("nope").await.unwrap_err();
        assert_eq!(err.code(), "OAUTH_STATE_INVALID");
    }

    fn make_id_token(claims: &serde_json::Value, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn base_claims() -> serde_json::Value {
        let now = chrono::Utc::now().timestamp();
        serde_json::json!({
            "iss": "https://idp.example.com/realms/main",
            "sub": "user123",
            "aud": "keyfront",
            "exp": now + 300,
            "iat": now,
            "nonce": "nonce-1",
            "email": "alice@example.com",
            "tenantId": "t1",
            "roles": ["USER"],
        })
    }

    #[tokio::test]
    async fn verify_id_token_accepts_valid_hs256() {
        let client = client();
        let token = make_id_token(&base_claims(), "client-secret");

        let claims = client
            .verify_id_token(&token, Some("nonce-1"))
            .await
            .unwrap();
        assert_eq!(claims.sub, "user123");
        assert_eq!(claims.tenant_id.as_deref(), Some("t1"));
        assert_eq!(claims.roles, vec!["USER"]);
    }

    #[tokio::test]
    async fn verify_id_token_rejects_wrong_signature() {
        let client = client();
        let token = make_id_token(&base_claims(), "wrong-secret");
        let err = client.verify_id_token(&token, None).await.unwrap_err();
        assert_eq!(err.code(), "OIDC_INVALID_TOKEN");
    }

    #[tokio::test]
    async fn verify_id_token_rejects_wrong_issuer() {
        let client = client();
        let mut claims = base_claims();
        claims["iss"] = serde_json::json!("https://evil.example.com");
        let token = make_id_token(&claims, "client-secret");
        let err = client.verify_id_token(&token, None).await.unwrap_err();
        assert_eq!(err.code(), "OIDC_INVALID_TOKEN");
    }

    #[tokio::test]
    async fn verify_id_token_rejects_nonce_mismatch() {
        let client = client();
        let token = make_id_token(&base_claims(), "client-secret");
        let err = client
            .verify_id_token(&token, Some("other-nonce"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "OIDC_INVALID_TOKEN");
    }

    #[tokio::test]
    async fn verify_id_token_rejects_expired() {
        let client = client();
        let mut claims = base_claims();
        let past = chrono::Utc::now().timestamp() - 600;
        claims["exp"] = serde_json::json!(past);
        claims["iat"] = serde_json::json!(past - 300);
        let token = make_id_token(&claims, "client-secret");
        let err = client.verify_id_token(&token, None).await.unwrap_err();
        assert_eq!(err.code(), "OIDC_INVALID_TOKEN");
    }

    #[tokio::test]
    async fn verify_id_token_rejects_wrong_audience() {
        let client = client();
        let mut claims = base_claims();
        claims["aud"] = serde_json::json!("other-client");
        let token = make_id_token(&claims, "client-secret");
        let err = client.verify_id_token(&token, None).await.unwrap_err();
        assert_eq!(err.code(), "OIDC_INVALID_TOKEN");
    }

    #[test]
    fn malformed_token_is_invalid() {
        let header = jsonwebtoken::decode_header("not-a-jwt");
        assert!(header.is_err());
    }

    fn logout_claims() -> serde_json::Value {
        let now = chrono::Utc::now().timestamp();
        serde_json::json!({
            "iss": "https://idp.example.com/realms/main",
            "sub": "user123",
            "aud": "keyfront",
            "iat": now,
            "exp": now + 120,
            "jti": "jti-1",
            "events": {"http://schemas.openid.net/event/backchannel-logout": {}},
        })
    }

    #[tokio::test]
    async fn verify_logout_token_accepts_valid_token() {
        let client = client();
        let token = make_id_token(&logout_claims(), "client-secret");
        let claims = client.verify_logout_token(&token).await.unwrap();
        assert_eq!(claims.sub, "user123");
    }

    #[tokio::test]
    async fn verify_logout_token_requires_events_claim() {
        let client = client();
        let mut claims = logout_claims();
        claims.as_object_mut().unwrap().remove("events");
        let token = make_id_token(&claims, "client-secret");
        let err = client.verify_logout_token(&token).await.unwrap_err();
        assert_eq!(err.code(), "OIDC_INVALID_TOKEN");
    }

    #[tokio::test]
    async fn verify_logout_token_rejects_nonce() {
        let client = client();
        let mut claims = logout_claims();
        claims["nonce"] = serde_json::json!("n-1");
        let token = make_id_token(&claims, "client-secret");
        let err = client.verify_logout_token(&token).await.unwrap_err();
        assert_eq!(err.code(), "OIDC_INVALID_TOKEN");
    }
}
