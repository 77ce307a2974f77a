use crate::error::AppError;
use crate::keys::{SIGNING_ALGORITHM, SigningKeys};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

pub const TOKEN_TYPE: &str = "Bearer";

/// Claims carried by every access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Internal user id (UUID)
    pub sub: String,
    pub telegram_id: i64,
    pub jti: String,
    pub iss: String,
    pub iat: i64,
    /// Always equal to `iat`
    pub nbf: i64,
    pub exp: i64,
}

impl TokenClaims {
    pub fn new(
        user_id: Uuid,
        telegram_id: i64,
        issuer: &str,
        issued_at: DateTime<Utc>,
        lifetime: Duration,
    ) -> Self {
        let iat = issued_at.timestamp();
        Self {
            sub: user_id.to_string(),
            telegram_id,
            jti: Uuid::new_v4().to_string(),
            iss: issuer.to_string(),
            iat,
            nbf: iat,
            exp: iat + lifetime.num_seconds(),
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: TokenClaims,
    /// Seconds until expiry at issuance
    pub expires_in: i64,
}

/// Mints RS256 access tokens with the issuer's signing key.
#[derive(Clone)]
pub struct TokenService {
    keys: Arc<SigningKeys>,
    issuer: String,
    lifetime: Duration,
}

impl TokenService {
    pub fn new(keys: Arc<SigningKeys>, issuer: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            keys,
            issuer: issuer.into(),
            lifetime,
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn mint(&self, user_id: Uuid, telegram_id: i64) -> Result<IssuedToken, AppError> {
        self.mint_at(user_id, telegram_id, Utc::now())
    }

    pub fn mint_at(
        &self,
        user_id: Uuid,
        telegram_id: i64,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken, AppError> {
        let claims = TokenClaims::new(user_id, telegram_id, &self.issuer, now, self.lifetime);
        let header = Header::new(SIGNING_ALGORITHM);
        let token = encode(&header, &claims, self.keys.encoding_key())?;

        Ok(IssuedToken {
            token,
            expires_in: claims.exp - claims.iat,
            claims,
        })
    }

    /// Decodes one of our own tokens, checking signature, issuer and expiry.
    pub fn decode(&self, token: &str) -> Result<TokenClaims, AppError> {
        let mut validation = Validation::new(SIGNING_ALGORITHM);
        validation.leeway = 0;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        let token_data = decode::<TokenClaims>(token, self.keys.decoding_key(), &validation)?;
        Ok(token_data.claims)
    }
}
