//! Authentication
//!
//! Bearer JWTs are verified against a remote JWKS document; the verified
//! email resolves to a candidate record. Extractors keep handlers free of
//! auth plumbing: `CurrentUser` is any allow-listed user, `AdminUser`
//! additionally requires the admin role.

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use chrono::Utc;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use charon_core::config::ADMIN_BOOTSTRAP_QUOTA_DOLLARS;
use charon_core::model::{Candidate, Role};
use charon_core::{Error, Result};

use crate::error::ApiError;
use crate::state::AppState;

/// How long a fetched JWKS document is trusted before re-fetching
const JWKS_TTL: Duration = Duration::from_secs(3600);

/// Identity extracted from a verified token
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub email: String,
    pub name: String,
}

/// Token verification seam
///
/// The production implementation talks to a JWKS endpoint; tests and the
/// local dev mode substitute a static map.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<AuthUser>;
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    sub: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    kty: String,
    #[serde(default)]
    n: String,
    #[serde(default)]
    e: String,
}

#[derive(Debug, Clone, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

/// JWKS-backed verifier for RS256 bearer tokens
pub struct JwksVerifier {
    jwks_url: String,
    issuer: Option<String>,
    audience: Option<String>,
    http: reqwest::Client,
    cache: RwLock<Option<(Instant, JwksDocument)>>,
}

impl JwksVerifier {
    pub fn new(jwks_url: impl Into<String>, issuer: Option<String>, audience: Option<String>) -> Self {
        Self {
            jwks_url: jwks_url.into(),
            issuer,
            audience,
            http: reqwest::Client::new(),
            cache: RwLock::new(None),
        }
    }

    async fn jwks(&self) -> Result<JwksDocument> {
        {
            let cache = self.cache.read().await;
            if let Some((fetched_at, document)) = cache.as_ref() {
                if fetched_at.elapsed() < JWKS_TTL {
                    return Ok(document.clone());
                }
            }
        }
        self.fetch_jwks().await
    }

    async fn fetch_jwks(&self) -> Result<JwksDocument> {
        let document: JwksDocument = self
            .http
            .get(&self.jwks_url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| Error::unauthenticated(format!("jwks fetch failed: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::unauthenticated(format!("jwks parse failed: {}", e)))?;

        let mut cache = self.cache.write().await;
        *cache = Some((Instant::now(), document.clone()));
        Ok(document)
    }

    fn decoding_key(jwks: &JwksDocument, kid: Option<&str>) -> Result<DecodingKey> {
        let jwk = match kid {
            Some(kid) => jwks.keys.iter().find(|k| k.kid.as_deref() == Some(kid)),
            None => jwks.keys.first(),
        }
        .ok_or_else(|| Error::unauthenticated("no matching signing key"))?;

        if jwk.kty != "RSA" {
            return Err(Error::unauthenticated("unsupported key type"));
        }
        DecodingKey::from_rsa_components(&jwk.n, &jwk.e)
            .map_err(|e| Error::unauthenticated(format!("bad signing key: {}", e)))
    }
}

#[async_trait]
impl TokenVerifier for JwksVerifier {
    async fn verify(&self, token: &str) -> Result<AuthUser> {
        let header = decode_header(token)
            .map_err(|e| Error::unauthenticated(format!("malformed token: {}", e)))?;
        let jwks = self.jwks().await?;
        let key = match Self::decoding_key(&jwks, header.kid.as_deref()) {
            Ok(key) => key,
            Err(_) => {
                // Unknown kid usually means the provider rotated keys since
                // our last fetch; refresh once before giving up
                let jwks = self.fetch_jwks().await?;
                Self::decoding_key(&jwks, header.kid.as_deref())?
            }
        };

        let mut validation = Validation::new(Algorithm::RS256);
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }

        let data = decode::<Claims>(token, &key, &validation)
            .map_err(|e| Error::unauthenticated(format!("invalid token: {}", e)))?;

        let email = data
            .claims
            .email
            .or(data.claims.sub)
            .ok_or_else(|| Error::unauthenticated("token carries no email"))?
            .to_lowercase();
        let name = data.claims.name.unwrap_or_else(|| email.clone());
        Ok(AuthUser { email, name })
    }
}

/// Static token map for tests and the local dev mode
#[derive(Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, AuthUser>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, email: impl Into<String>, name: impl Into<String>) -> Self {
        self.tokens.insert(
            token.into(),
            AuthUser {
                email: email.into().to_lowercase(),
                name: name.into(),
            },
        );
        self
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<AuthUser> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| Error::unauthenticated("unknown token"))
    }
}

/// Pull the bearer token out of the Authorization header
fn bearer_token(parts: &Parts) -> Result<&str> {
    parts
        .headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::unauthenticated("missing Authorization header"))?
        .strip_prefix("Bearer ")
        .ok_or_else(|| Error::unauthenticated("expected a Bearer token"))
}

/// Resolve a verified identity to a candidate record
///
/// First sign-in of a configured admin email bootstraps the admin record;
/// everyone else must already be on the allow-list and not deactivated.
async fn resolve_candidate(state: &AppState, user: &AuthUser) -> Result<Candidate> {
    if let Some(candidate) = state.store.candidate(&user.email).await? {
        if !candidate.is_active() {
            return Err(Error::forbidden("account has been deactivated"));
        }
        return Ok(candidate);
    }

    if state.config.is_admin_email(&user.email) {
        let candidate = Candidate {
            email: user.email.clone(),
            name: user.name.clone(),
            role: Role::Admin,
            quota_dollars: ADMIN_BOOTSTRAP_QUOTA_DOLLARS,
            spent_cents: 0,
            added_at: Utc::now(),
            added_by: "bootstrap".to_string(),
            spent_reset_at: None,
            deactivated_at: None,
        };
        state.store.put_candidate(&candidate).await?;
        tracing::info!(email = %candidate.email, "Bootstrapped admin candidate");
        return Ok(candidate);
    }

    Err(Error::forbidden("not on the allow-list"))
}

/// Any authenticated, allow-listed user
pub struct CurrentUser(pub Candidate);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> std::result::Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        let user = state.verifier.verify(token).await?;
        let candidate = resolve_candidate(state, &user).await?;
        Ok(CurrentUser(candidate))
    }
}

/// An authenticated admin
pub struct AdminUser(pub Candidate);

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> std::result::Result<Self, Self::Rejection> {
        let CurrentUser(candidate) = CurrentUser::from_request_parts(parts, state).await?;
        if !candidate.is_admin() {
            return Err(ApiError(Error::forbidden("admin access required")));
        }
        Ok(AdminUser(candidate))
    }
}
