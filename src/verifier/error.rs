use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Why a bearer token was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("no bearer token in request")]
    MissingToken,
    #[error("token is not a well-formed compact JWT")]
    InvalidTokenFormat,
    #[error("token signature does not verify")]
    InvalidSignature,
    #[error("token has expired")]
    TokenExpired,
    #[error("token claims are malformed")]
    InvalidTokenClaims,
    #[error("token has no jti claim")]
    MissingTokenId,
    #[error("token has no sub claim")]
    MissingUserId,
    #[error("token has no telegram_id claim")]
    MissingTelegramId,
    #[error("token has been revoked")]
    TokenRevoked,
    #[error("issuer public key unavailable: {0}")]
    KeyUnavailable(String),
    #[error("revocation store unavailable: {0}")]
    RevocationUnavailable(String),
}

impl VerifyError {
    pub fn code(&self) -> &'static str {
        match self {
            VerifyError::MissingToken => "missing_token",
            VerifyError::InvalidTokenFormat => "invalid_token_format",
            VerifyError::InvalidSignature => "invalid_signature",
            VerifyError::TokenExpired => "token_expired",
            VerifyError::InvalidTokenClaims => "invalid_token_claims",
            VerifyError::MissingTokenId => "missing_token_id",
            VerifyError::MissingUserId => "missing_user_id",
            VerifyError::MissingTelegramId => "missing_telegram_id",
            VerifyError::TokenRevoked => "token_revoked",
            VerifyError::KeyUnavailable(_) => "key_unavailable",
            VerifyError::RevocationUnavailable(_) => "revocation_unavailable",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            VerifyError::KeyUnavailable(_) | VerifyError::RevocationUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

impl From<jsonwebtoken::errors::Error> for VerifyError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::InvalidSignature
            | ErrorKind::InvalidAlgorithm
            | ErrorKind::InvalidAlgorithmName
            | ErrorKind::InvalidRsaKey(_)
            | ErrorKind::InvalidKeyFormat
            | ErrorKind::Crypto(_) => VerifyError::InvalidSignature,
            ErrorKind::ExpiredSignature => VerifyError::TokenExpired,
            ErrorKind::Json(_)
            | ErrorKind::MissingRequiredClaim(_)
            | ErrorKind::InvalidIssuer
            | ErrorKind::InvalidSubject
            | ErrorKind::ImmatureSignature => VerifyError::InvalidTokenClaims,
            _ => VerifyError::InvalidTokenFormat,
        }
    }
}

impl IntoResponse for VerifyError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.code() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::errors::{Error, ErrorKind};

    #[test]
    fn test_token_failures_are_unauthorized() {
        for err in [
            VerifyError::MissingToken,
            VerifyError::InvalidTokenFormat,
            VerifyError::InvalidSignature,
            VerifyError::TokenExpired,
            VerifyError::InvalidTokenClaims,
            VerifyError::MissingTokenId,
            VerifyError::MissingUserId,
            VerifyError::MissingTelegramId,
            VerifyError::TokenRevoked,
        ] {
            assert_eq!(err.status(), StatusCode::UNAUTHORIZED, "{}", err.code());
        }
        assert_eq!(
            VerifyError::KeyUnavailable("down".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_jwt_error_mapping() {
        assert_eq!(
            VerifyError::from(Error::from(ErrorKind::InvalidSignature)),
            VerifyError::InvalidSignature
        );
        assert_eq!(
            VerifyError::from(Error::from(ErrorKind::InvalidToken)),
            VerifyError::InvalidTokenFormat
        );
        assert_eq!(
            VerifyError::from(Error::from(ErrorKind::ExpiredSignature)),
            VerifyError::TokenExpired
        );
    }
}
