use crate::{
    database::DatabaseError, keys::KeyError, revocation::RevocationError,
    telegram::TelegramAuthError,
};
use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("Revocation store error: {0}")]
    Revocation(#[from] RevocationError),
    #[error("Key error: {0}")]
    Keys(#[from] KeyError),
    #[error("Telegram authentication failed: {0}")]
    TelegramAuth(#[from] TelegramAuthError),
    #[error("Token signing failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("User is deactivated")]
    UserInactive,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Rate limit exceeded, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Wire code placed in the `error` field of the response body.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::TelegramAuth(err) => err.code(),
            AppError::BadRequest(_) => "invalid_request",
            AppError::UserInactive => "user_inactive",
            AppError::NotFound(_) => "not_found",
            AppError::RateLimited { .. } => "rate_limited",
            AppError::ServiceUnavailable(_) => "service_unavailable",
            AppError::Config(_)
            | AppError::Database(_)
            | AppError::Revocation(_)
            | AppError::Keys(_)
            | AppError::Jwt(_)
            | AppError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::TelegramAuth(_) | AppError::UserInactive => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Config(_)
            | AppError::Database(_)
            | AppError::Revocation(_)
            | AppError::Keys(_)
            | AppError::Jwt(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) fn log(&self) {
        let status = self.status();
        if status.is_server_error() {
            error!(code = self.code(), "Request failed: {}", self);
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            warn!(code = self.code(), "Request rejected: {}", self);
        } else {
            info!(code = self.code(), "Request rejected: {}", self);
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.status();
        match self {
            AppError::RateLimited { retry_after } => {
                let body = Json(json!({
                    "error": "rate_limited",
                    "limit": "per_ip",
                    "retry_after": retry_after,
                }));
                let mut response = (status, body).into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
                response
            }
            other => (status, Json(json!({ "error": other.code() }))).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_app_error_display() {
        let internal_err = AppError::Internal("test message".to_string());
        assert_eq!(internal_err.to_string(), "Internal error: test message");

        let bad_request = AppError::BadRequest("missing init_data".to_string());
        assert_eq!(bad_request.to_string(), "Bad request: missing init_data");
    }

    #[test]
    fn test_app_error_codes() {
        assert_eq!(
            AppError::TelegramAuth(TelegramAuthError::InvalidSignature).code(),
            "invalid_signature"
        );
        assert_eq!(
            AppError::TelegramAuth(TelegramAuthError::Stale { age_seconds: 90000 }).code(),
            "stale_auth_date"
        );
        assert_eq!(AppError::UserInactive.code(), "user_inactive");
        assert_eq!(
            AppError::Revocation(RevocationError::Timeout(std::time::Duration::from_secs(2)))
                .code(),
            "internal"
        );
        assert_eq!(
            AppError::Config(config::ConfigError::NotFound("test".to_string())).code(),
            "internal"
        );
    }

    #[tokio::test]
    async fn test_internal_details_are_not_echoed() {
        let response = AppError::Internal("db password wrong".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body, json!({ "error": "internal" }));
    }

    #[tokio::test]
    async fn test_auth_failures_are_unauthorized() {
        let response = AppError::TelegramAuth(TelegramAuthError::MissingHash).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "invalid_signature");

        let response = AppError::UserInactive.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "user_inactive");
    }

    #[tokio::test]
    async fn test_rate_limited_response() {
        let response = AppError::RateLimited { retry_after: 42 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "42");
        let body = body_json(response).await;
        assert_eq!(body["error"], "rate_limited");
        assert_eq!(body["limit"], "per_ip");
        assert_eq!(body["retry_after"], 42);
    }

    #[tokio::test]
    async fn test_bad_request_response() {
        let response = AppError::BadRequest("no body".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "invalid_request");
    }
}
