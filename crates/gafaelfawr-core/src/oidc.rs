//! A minimal authorization-code OIDC provider for federating Gafaelfawr
//! with the services it sits in front of.
//!
//! Deliberately unlike a general-purpose provider: no refresh tokens, no
//! PKCE, no dynamic client registration. Clients are a static list read at
//! startup.

use std::sync::Arc;

use base64::Engine as _;
use chrono::{Duration, Utc};
use gafaelfawr_storage::StorageBackend;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OidcError;
use crate::model::{Token, UserMetadata};

const CODE_KEY_PREFIX: &str = "oidc-codes/";
const CODE_TTL_SECONDS: i64 = 300;

/// A registered OIDC client.
#[derive(Debug, Clone)]
pub struct OidcClient {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri_prefix: String,
}

/// Configuration for the provider.
#[derive(Debug, Clone)]
pub struct OidcConfig {
    pub issuer: String,
    pub id_token_lifetime: Duration,
    pub clients: Vec<OidcClient>,
    pub key_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCode {
    client_id: String,
    redirect_uri: String,
    username: String,
    uid: i64,
    name: Option<String>,
    email: Option<String>,
}

/// Claims embedded in the minted ID/access token. `Serialize` drives JWT
/// encoding; `Deserialize` drives the `/userinfo` passthrough response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenClaims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub preferred_username: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub scope: String,
    pub uid_number: i64,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
}

/// The reply body for a successful `/token` redemption.
#[derive(Debug, Clone, Serialize)]
pub struct OidcTokenReply {
    pub access_token: String,
    pub id_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
}

/// The OIDC authorization-code provider.
pub struct OidcProvider {
    backend: Arc<dyn StorageBackend>,
    signing_key: RsaPrivateKey,
    config: OidcConfig,
}

impl OidcProvider {
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>, signing_key: RsaPrivateKey, config: OidcConfig) -> Self {
        Self { backend, signing_key, config }
    }

    fn find_client(&self, client_id: &str) -> Option<&OidcClient> {
        self.config.clients.iter().find(|c| c.client_id == client_id)
    }

    /// Whether `client_id` is a registered client.
    #[must_use]
    pub fn is_valid_client(&self, client_id: &str) -> bool {
        self.find_client(client_id).is_some()
    }

    /// Whether `redirect_uri` starts with the registered client's
    /// `redirect_uri_prefix`. `false` for an unknown client.
    #[must_use]
    pub fn redirect_uri_allowed(&self, client_id: &str, redirect_uri: &str) -> bool {
        self.find_client(client_id)
            .is_some_and(|c| redirect_uri.starts_with(&c.redirect_uri_prefix))
    }

    /// Mint and store a one-shot authorization code.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::Storage`] if the backend write fails.
    pub async fn issue_code(
        &self,
        client_id: &str,
        redirect_uri: &str,
        username: &str,
        user: &UserMetadata,
    ) -> Result<Token, OidcError> {
        let code = Token::new();
        let stored = StoredCode {
            client_id: client_id.to_owned(),
            redirect_uri: redirect_uri.to_owned(),
            username: username.to_owned(),
            uid: user.uid,
            name: user.name.clone(),
            email: user.email.clone(),
        };
        let bytes = serde_json::to_vec(&stored)
            .map_err(|e| OidcError::SigningFailed(format!("failed to serialize code: {e}")))?;
        self.backend
            .put(
                &Self::code_key(&code.key),
                &bytes,
                Some(Duration::seconds(CODE_TTL_SECONDS)),
            )
            .await?;
        Ok(code)
    }

    fn code_key(key: &str) -> String {
        format!("{CODE_KEY_PREFIX}{key}")
    }

    /// Redeem an authorization code for a signed JWT.
    ///
    /// Deletes the code before minting the token so a retried or replayed
    /// redemption always misses.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::InvalidClient`], [`OidcError::InvalidGrant`], or
    /// [`OidcError::SigningFailed`].
    pub async fn redeem_code(
        &self,
        client_id: &str,
        client_secret: &str,
        redirect_uri: &str,
        code: &Token,
    ) -> Result<OidcTokenReply, OidcError> {
        let client = self.find_client(client_id).ok_or(OidcError::InvalidClient)?;
        if client.client_secret != client_secret {
            return Err(OidcError::InvalidClient);
        }

        let key = Self::code_key(&code.key);
        let Some(bytes) = self.backend.get(&key).await? else {
            return Err(OidcError::InvalidGrant("authorization code unknown or expired".to_owned()));
        };
        self.backend.delete(&key).await?;

        let stored: StoredCode = serde_json::from_slice(&bytes)
            .map_err(|e| OidcError::SigningFailed(format!("failed to deserialize code: {e}")))?;

        if stored.client_id != client_id {
            return Err(OidcError::InvalidGrant("client mismatch".to_owned()));
        }
        if stored.redirect_uri != redirect_uri {
            return Err(OidcError::InvalidGrant("redirect_uri mismatch".to_owned()));
        }

        let now = Utc::now();
        let claims = IdTokenClaims {
            iss: self.config.issuer.clone(),
            aud: client_id.to_owned(),
            sub: stored.username.clone(),
            preferred_username: stored.username.clone(),
            name: stored.name.clone(),
            email: stored.email.clone(),
            scope: "openid".to_owned(),
            uid_number: stored.uid,
            exp: (now + self.config.id_token_lifetime).timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        let encoded = self.sign(&claims)?;
        let expires_in = claims.exp - now.timestamp();

        tracing::info!(username = %stored.username, %client_id, "retrieved token via OpenID Connect");

        Ok(OidcTokenReply {
            access_token: encoded.clone(),
            id_token: encoded,
            token_type: "Bearer",
            expires_in,
        })
    }

    fn sign(&self, claims: &IdTokenClaims) -> Result<String, OidcError> {
        let pem = self
            .signing_key
            .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
            .map_err(|e| OidcError::SigningFailed(e.to_string()))?;
        let encoding_key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| OidcError::SigningFailed(e.to_string()))?;
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.config.key_id.clone());
        jsonwebtoken::encode(&header, claims, &encoding_key)
            .map_err(|e| OidcError::SigningFailed(e.to_string()))
    }

    /// The JWKS document (RFC 7517) advertising the public signing key.
    #[must_use]
    pub fn jwks(&self) -> serde_json::Value {
        let public = self.signing_key.to_public_key();
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let n = engine.encode(public.n().to_bytes_be());
        let e = engine.encode(public.e().to_bytes_be());
        serde_json::json!({
            "keys": [{
                "kty": "RSA",
                "alg": "RS256",
                "use": "sig",
                "kid": self.config.key_id,
                "n": n,
                "e": e,
            }]
        })
    }

    /// The `/.well-known/openid-configuration` discovery document.
    #[must_use]
    pub fn openid_configuration(&self, base_url: &str) -> serde_json::Value {
        serde_json::json!({
            "issuer": self.config.issuer,
            "authorization_endpoint": format!("{base_url}/auth/openid/login"),
            "token_endpoint": format!("{base_url}/auth/openid/token"),
            "userinfo_endpoint": format!("{base_url}/auth/openid/userinfo"),
            "jwks_uri": format!("{base_url}/.well-known/jwks.json"),
            "scopes_supported": ["openid"],
            "response_types_supported": ["code"],
            "grant_types_supported": ["authorization_code"],
            "token_endpoint_auth_methods_supported": ["client_secret_post"],
            "id_token_signing_alg_values_supported": ["RS256"],
            "subject_types_supported": ["public"],
        })
    }

    /// Verify a bearer JWT's signature against the local signing key and
    /// return its claims.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::InvalidGrant`] if the token fails validation.
    pub fn verify_token(&self, token: &str) -> Result<IdTokenClaims, OidcError> {
        let public = self.signing_key.to_public_key();
        let pem = rsa::pkcs1::EncodeRsaPublicKey::to_pkcs1_pem(&public, rsa::pkcs1::LineEnding::LF)
            .map_err(|e| OidcError::SigningFailed(e.to_string()))?;
        let decoding_key = jsonwebtoken::DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| OidcError::SigningFailed(e.to_string()))?;
        let mut validation = jsonwebtoken::Validation::new(Algorithm::RS256);
        validation.set_audience(&self.config.clients.iter().map(|c| c.client_id.clone()).collect::<Vec<_>>());
        let data = jsonwebtoken::decode::<IdTokenClaims>(token, &decoding_key, &validation)
            .map_err(|e| OidcError::InvalidGrant(e.to_string()))?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gafaelfawr_storage::MemoryBackend;

    fn provider() -> OidcProvider {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("key generation");
        OidcProvider::new(
            Arc::new(MemoryBackend::new()),
            key,
            OidcConfig {
                issuer: "https://gafaelfawr.example.com".to_owned(),
                id_token_lifetime: Duration::minutes(10),
                clients: vec![OidcClient {
                    client_id: "client-a".to_owned(),
                    client_secret: "s3cret".to_owned(),
                    redirect_uri_prefix: "https://downstream.example.com/".to_owned(),
                }],
                key_id: "gafaelfawr".to_owned(),
            },
        )
    }

    fn user() -> UserMetadata {
        UserMetadata {
            name: Some("Alice Example".to_owned()),
            email: Some("alice@example.com".to_owned()),
            uid: 1000,
            gid: None,
            groups: vec![],
        }
    }

    #[tokio::test]
    async fn is_valid_client_reflects_configured_clients() {
        let provider = provider();
        assert!(provider.is_valid_client("client-a"));
        assert!(!provider.is_valid_client("unknown"));
    }

    #[tokio::test]
    async fn issue_then_redeem_code_mints_a_token() {
        let provider = provider();
        let code = provider
            .issue_code(
                "client-a",
                "https://downstream.example.com/cb",
                "alice",
                &user(),
            )
            .await
            .unwrap();

        let reply = provider
            .redeem_code(
                "client-a",
                "s3cret",
                "https://downstream.example.com/cb",
                &code,
            )
            .await
            .unwrap();

        assert_eq!(reply.token_type, "Bearer");
        assert!(reply.expires_in > 0);
    }

    #[tokio::test]
    async fn redeem_code_is_one_shot() {
        let provider = provider();
        let code = provider
            .issue_code("client-a", "https://downstream.example.com/cb", "alice", &user())
            .await
            .unwrap();

        provider
            .redeem_code("client-a", "s3cret", "https://downstream.example.com/cb", &code)
            .await
            .unwrap();

        let replay = provider
            .redeem_code("client-a", "s3cret", "https://downstream.example.com/cb", &code)
            .await;
        assert!(matches!(replay, Err(OidcError::InvalidGrant(_))));
    }

    #[tokio::test]
    async fn redeem_code_rejects_wrong_secret() {
        let provider = provider();
        let code = provider
            .issue_code("client-a", "https://downstream.example.com/cb", "alice", &user())
            .await
            .unwrap();

        let result = provider
            .redeem_code("client-a", "wrong-secret", "https://downstream.example.com/cb", &code)
            .await;
        assert!(matches!(result, Err(OidcError::InvalidClient)));
    }

    #[tokio::test]
    async fn redirect_uri_allowed_enforces_the_registered_prefix() {
        let provider = provider();
        assert!(provider.redirect_uri_allowed("client-a", "https://downstream.example.com/cb"));
        assert!(!provider.redirect_uri_allowed("client-a", "https://evil.example.com/"));
        assert!(!provider.redirect_uri_allowed("unknown", "https://downstream.example.com/cb"));
    }

    #[tokio::test]
    async fn redeem_code_rejects_redirect_uri_mismatch() {
        let provider = provider();
        let code = provider
            .issue_code("client-a", "https://downstream.example.com/cb", "alice", &user())
            .await
            .unwrap();

        let result = provider
            .redeem_code("client-a", "s3cret", "https://downstream.example.com/other", &code)
            .await;
        assert!(matches!(result, Err(OidcError::InvalidGrant(_))));
    }

    #[tokio::test]
    async fn verify_token_accepts_a_token_this_provider_minted() {
        let provider = provider();
        let code = provider
            .issue_code("client-a", "https://downstream.example.com/cb", "alice", &user())
            .await
            .unwrap();
        let reply = provider
            .redeem_code("client-a", "s3cret", "https://downstream.example.com/cb", &code)
            .await
            .unwrap();

        let claims = provider.verify_token(&reply.access_token).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.scope, "openid");
    }

    #[test]
    fn jwks_exposes_the_configured_key_id() {
        let provider = provider();
        let jwks = provider.jwks();
        assert_eq!(jwks["keys"][0]["kid"], "gafaelfawr");
        assert_eq!(jwks["keys"][0]["kty"], "RSA");
    }

    #[test]
    fn openid_configuration_lists_expected_endpoints() {
        let provider = provider();
        let doc = provider.openid_configuration("https://gafaelfawr.example.com");
        assert_eq!(
            doc["token_endpoint"],
            "https://gafaelfawr.example.com/auth/openid/token"
        );
        assert_eq!(doc["scopes_supported"][0], "openid");
    }
}
