//! Bearer token verification for services that trust tokens minted by the issuer.
//!
//! ```no_run
//! # async fn demo() -> Result<(), game_auth::verifier::VerifyError> {
//! use std::sync::Arc;
//! use game_auth::verifier::{TokenVerifier, VerifierConfig, require_bearer, spawn_key_refresher};
//!
//! let config = VerifierConfig::default();
//! let verifier = Arc::new(TokenVerifier::from_config(&config, None)?);
//! let (_stop, stop_rx) = tokio::sync::watch::channel(false);
//! spawn_key_refresher(verifier.key_cache().clone(), config.key_refresh_interval(), stop_rx);
//! let app: axum::Router = axum::Router::new()
//!     .layer(axum::middleware::from_fn_with_state(verifier, require_bearer));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod key_cache;
pub mod middleware;

use crate::auth::config::DEFAULT_ISSUER;
use crate::keys::SIGNING_ALGORITHM;
use crate::revocation::RevocationStore;
use axum::http::{HeaderMap, header::AUTHORIZATION};
use chrono::Utc;
use jsonwebtoken::{Validation, decode, decode_header};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub use self::config::{FailMode, VerifierConfig};
pub use self::error::VerifyError;
pub use self::key_cache::{PublicKeyCache, parse_public_key, spawn_key_refresher};
pub use self::middleware::require_bearer;

/// Identity attached to a request once its bearer token has been accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: String,
    pub telegram_id: i64,
    pub token_id: String,
    /// Unix seconds
    pub expires_at: i64,
}

/// Claims as they appear on the wire; presence is checked after decoding so each
/// missing field gets its own error code.
#[derive(Debug, Deserialize)]
struct RawClaims {
    sub: Option<String>,
    telegram_id: Option<i64>,
    jti: Option<String>,
    iss: Option<String>,
    exp: Option<i64>,
}

pub struct TokenVerifier {
    keys: Arc<PublicKeyCache>,
    issuer: String,
    revocation: Option<Arc<dyn RevocationStore>>,
    revocation_timeout: Duration,
    fail_mode: FailMode,
}

impl TokenVerifier {
    pub fn new(keys: Arc<PublicKeyCache>) -> Self {
        Self {
            keys,
            issuer: DEFAULT_ISSUER.to_string(),
            revocation: None,
            revocation_timeout: Duration::from_secs(2),
            fail_mode: FailMode::Open,
        }
    }

    pub fn from_config(
        config: &VerifierConfig,
        revocation: Option<Arc<dyn RevocationStore>>,
    ) -> Result<Self, VerifyError> {
        let keys = PublicKeyCache::remote(
            config.key_url.clone(),
            config.key_cache_ttl(),
            config.fetch_timeout(),
        )?;

        let mut verifier = Self::new(Arc::new(keys))
            .with_issuer(config.issuer.clone())
            .with_revocation_timeout(config.revocation_timeout())
            .with_fail_mode(config.fail_mode);
        if let Some(store) = revocation {
            verifier = verifier.with_revocation_store(store);
        }
        Ok(verifier)
    }

    /// Tokens whose `iss` differs are rejected with `invalid_token_claims`.
    /// Defaults to `game-auth`.
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    pub fn with_revocation_store(mut self, store: Arc<dyn RevocationStore>) -> Self {
        self.revocation = Some(store);
        self
    }

    pub fn with_revocation_timeout(mut self, timeout: Duration) -> Self {
        self.revocation_timeout = timeout;
        self
    }

    pub fn with_fail_mode(mut self, fail_mode: FailMode) -> Self {
        self.fail_mode = fail_mode;
        self
    }

    pub fn key_cache(&self) -> &Arc<PublicKeyCache> {
        &self.keys
    }

    /// Verifies the bearer token in `Authorization`.
    pub async fn verify_header(&self, headers: &HeaderMap) -> Result<AuthContext, VerifyError> {
        let token = extract_bearer(headers)?;
        self.verify(token).await
    }

    pub async fn verify(&self, token: &str) -> Result<AuthContext, VerifyError> {
        self.verify_at(token, Utc::now().timestamp()).await
    }

    /// Verification against an explicit clock (unix seconds).
    pub async fn verify_at(&self, token: &str, now: i64) -> Result<AuthContext, VerifyError> {
        let result = self.verify_inner(token, now).await;
        crate::metrics::track_token_verification(match &result {
            Ok(_) => "success",
            Err(err) => err.code(),
        });
        result
    }

    async fn verify_inner(&self, token: &str, now: i64) -> Result<AuthContext, VerifyError> {
        if token.split('.').count() != 3 {
            return Err(VerifyError::InvalidTokenFormat);
        }
        let header = decode_header(token).map_err(|_| VerifyError::InvalidTokenFormat)?;
        if header.alg != SIGNING_ALGORITHM {
            return Err(VerifyError::InvalidSignature);
        }

        let key = self.keys.current().await?;
        let claims = decode::<RawClaims>(token, &key, &signature_only_validation())?.claims;
        let context = self.check_claims(claims, now)?;
        self.check_revocation(&context).await?;
        Ok(context)
    }

    fn check_claims(&self, claims: RawClaims, now: i64) -> Result<AuthContext, VerifyError> {
        let user_id = claims
            .sub
            .filter(|sub| !sub.is_empty())
            .ok_or(VerifyError::MissingUserId)?;
        let telegram_id = claims.telegram_id.ok_or(VerifyError::MissingTelegramId)?;
        let token_id = claims
            .jti
            .filter(|jti| !jti.is_empty())
            .ok_or(VerifyError::MissingTokenId)?;

        if claims.iss.as_deref() != Some(self.issuer.as_str()) {
            return Err(VerifyError::InvalidTokenClaims);
        }

        let expires_at = claims.exp.ok_or(VerifyError::InvalidTokenClaims)?;
        if expires_at <= now {
            return Err(VerifyError::TokenExpired);
        }

        Ok(AuthContext {
            user_id,
            telegram_id,
            token_id,
            expires_at,
        })
    }

    async fn check_revocation(&self, context: &AuthContext) -> Result<(), VerifyError> {
        let Some(store) = &self.revocation else {
            return Ok(());
        };

        let outcome = tokio::time::timeout(self.revocation_timeout, store.is_revoked(&context.token_id))
            .await
            .map_err(|_| format!("lookup exceeded {:?}", self.revocation_timeout))
            .and_then(|result| result.map_err(|e| e.to_string()));

        match outcome {
            Ok(true) => Err(VerifyError::TokenRevoked),
            Ok(false) => Ok(()),
            Err(reason) => match self.fail_mode {
                FailMode::Open => {
                    warn!(
                        token_id = %context.token_id,
                        error = %reason,
                        "Revocation check unavailable, accepting token"
                    );
                    Ok(())
                }
                FailMode::Closed => Err(VerifyError::RevocationUnavailable(reason)),
            },
        }
    }
}

/// Signature check only; every claim is validated by hand afterwards.
fn signature_only_validation() -> Validation {
    let mut validation = Validation::new(SIGNING_ALGORITHM);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();
    validation
}

/// Token from an `Authorization: Bearer <token>` header. An absent header is
/// `missing_token`; anything else that is not a bearer credential is `invalid_token_format`.
pub fn extract_bearer(headers: &HeaderMap) -> Result<&str, VerifyError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or(VerifyError::MissingToken)?
        .to_str()
        .map_err(|_| VerifyError::InvalidTokenFormat)?;

    let (scheme, token) = value
        .trim()
        .split_once(' ')
        .ok_or(VerifyError::InvalidTokenFormat)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(VerifyError::InvalidTokenFormat);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(VerifyError::InvalidTokenFormat);
    }
    Ok(token)
}
