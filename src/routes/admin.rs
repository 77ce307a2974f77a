//! Token and user administration, served on the internal listener only.
//!
//! Every response uses the `{"ok":true,"data":...}` envelope; failures answer
//! `{"ok":false,"error":"<code>"}` with the matching status.

use crate::{
    database::{DatabaseError, entities::UserRecord},
    error::AppError,
    jobs::run_cleanup,
    revocation::{
        CleanupReport, LiveToken, RevocationError, RevocationStats, revoke_token,
        revoke_user_tokens,
    },
    server::Server,
};
use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub data: T,
}

fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse { ok: true, data })
}

/// Admin flavour of [`AppError`] that renders the envelope.
#[derive(Debug)]
pub struct AdminError(AppError);

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        self.0.log();
        (
            self.0.status(),
            Json(json!({ "ok": false, "error": self.0.code() })),
        )
            .into_response()
    }
}

impl From<AppError> for AdminError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl From<RevocationError> for AdminError {
    fn from(err: RevocationError) -> Self {
        Self(err.into())
    }
}

impl From<DatabaseError> for AdminError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound => Self(AppError::NotFound("user".to_string())),
            other => Self(other.into()),
        }
    }
}

type AdminResult<T> = Result<Json<ApiResponse<T>>, AdminError>;

#[derive(Debug, Serialize, Deserialize)]
pub struct UserTokensResponse {
    pub user_id: String,
    pub tokens: Vec<LiveToken>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RevokeUserResponse {
    pub user_id: String,
    pub count: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RevokeTokenResponse {
    pub token_id: String,
    pub revoked: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub telegram_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub language_code: Option<String>,
    pub photo_url: Option<String>,
    pub is_premium: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login: DateTime<Utc>,
}

impl From<UserRecord> for UserResponse {
    fn from(user: UserRecord) -> Self {
        Self {
            id: user.id,
            telegram_id: user.telegram_id,
            username: user.username,
            first_name: user.first_name,
            last_name: user.last_name,
            language_code: user.language_code,
            photo_url: user.photo_url,
            is_premium: user.is_premium,
            is_active: user.is_active,
            created_at: user.created_at,
            updated_at: user.updated_at,
            last_login: user.last_login,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SetActiveRequest {
    pub active: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetActiveResponse {
    pub user: UserResponse,
    pub revoked_tokens: u64,
}

pub fn create_admin_routes() -> Router<Server> {
    Router::new()
        .route("/tokens/stats", get(token_stats))
        .route(
            "/tokens/user/{user_id}",
            get(list_user_tokens).delete(revoke_user),
        )
        .route("/tokens/cleanup", post(cleanup_tokens))
        .route("/tokens/{token_id}", delete(revoke_single_token))
        .route("/users/{user_id}", get(get_user))
        .route("/users/{user_id}/active", put(set_user_active))
}

fn parse_user_id(raw: &str) -> Result<Uuid, AdminError> {
    Uuid::parse_str(raw)
        .map_err(|_| AdminError(AppError::BadRequest(format!("invalid user id `{raw}`"))))
}

async fn token_stats(State(server): State<Server>) -> AdminResult<RevocationStats> {
    Ok(ok(server.revocation.stats().await?))
}

async fn list_user_tokens(
    State(server): State<Server>,
    Path(user_id): Path<String>,
) -> AdminResult<UserTokensResponse> {
    parse_user_id(&user_id)?;
    let tokens = server.revocation.list_user_tokens(&user_id).await?;
    Ok(ok(UserTokensResponse { user_id, tokens }))
}

async fn revoke_user(
    State(server): State<Server>,
    Path(user_id): Path<String>,
) -> AdminResult<RevokeUserResponse> {
    parse_user_id(&user_id)?;
    let count = revoke_user_tokens(server.revocation.as_ref(), &user_id).await?;
    Ok(ok(RevokeUserResponse { user_id, count }))
}

async fn revoke_single_token(
    State(server): State<Server>,
    Path(token_id): Path<String>,
) -> AdminResult<RevokeTokenResponse> {
    let revoked = revoke_token(server.revocation.as_ref(), &token_id).await?;
    Ok(ok(RevokeTokenResponse { token_id, revoked }))
}

async fn cleanup_tokens(State(server): State<Server>) -> AdminResult<CleanupReport> {
    let report = run_cleanup(server.revocation.as_ref(), server.config.cleanup.timeout()).await?;
    Ok(ok(report))
}

async fn get_user(
    State(server): State<Server>,
    Path(user_id): Path<String>,
) -> AdminResult<UserResponse> {
    let id = parse_user_id(&user_id)?;
    let user = server
        .database
        .users()
        .find_by_id(id)
        .await?
        .ok_or(DatabaseError::NotFound)?;
    Ok(ok(user.into()))
}

/// Deactivation also revokes every live token of the user.
async fn set_user_active(
    State(server): State<Server>,
    Path(user_id): Path<String>,
    payload: Result<Json<SetActiveRequest>, JsonRejection>,
) -> AdminResult<SetActiveResponse> {
    let id = parse_user_id(&user_id)?;
    let Json(request) =
        payload.map_err(|rejection| AdminError(AppError::BadRequest(rejection.body_text())))?;

    let user = server.database.users().set_active(id, request.active).await?;
    let revoked_tokens = if request.active {
        0
    } else {
        revoke_user_tokens(server.revocation.as_ref(), &user_id).await?
    };

    tracing::info!(
        user_id = %id,
        active = request.active,
        revoked_tokens,
        "User activation changed"
    );
    Ok(ok(SetActiveResponse {
        user: user.into(),
        revoked_tokens,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TestServerBuilder, init_data_for};
    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn call(server: &Server, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = create_admin_routes()
            .with_state(server.clone())
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn login(server: &Server, telegram_id: i64) -> crate::auth::LoginResponse {
        server
            .login_service
            .login(&init_data_for(telegram_id, "Alice", Utc::now().timestamp()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_stats_envelope() {
        let server = TestServerBuilder::new().build().await;
        login(&server, 1).await;

        let (status, json) = call(&server, Method::GET, "/tokens/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["ok"], true);
        assert_eq!(json["data"]["active_tokens"], 1);
        assert_eq!(json["data"]["revoked_tokens"], 0);
        assert_eq!(json["data"]["indexed_users"], 1);
    }

    #[tokio::test]
    async fn test_list_and_revoke_user_tokens() {
        let server = TestServerBuilder::new().build().await;
        let first = login(&server, 7).await;
        login(&server, 7).await;
        let user_id = first.user.id.to_string();

        let (status, json) =
            call(&server, Method::GET, &format!("/tokens/user/{user_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["tokens"].as_array().unwrap().len(), 2);

        let (status, json) =
            call(&server, Method::DELETE, &format!("/tokens/user/{user_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["count"], 2);

        let (_, json) = call(&server, Method::GET, &format!("/tokens/user/{user_id}"), None).await;
        assert!(json["data"]["tokens"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_revoke_single_token_is_idempotent() {
        let server = TestServerBuilder::new().build().await;
        let response = login(&server, 9).await;
        let claims = server
            .login_service
            .tokens()
            .decode(&response.access_token)
            .unwrap();

        let uri = format!("/tokens/{}", claims.jti);
        let (status, json) = call(&server, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["revoked"], true);
        assert!(server.revocation.is_revoked(&claims.jti).await.unwrap());

        let (status, json) = call(&server, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["ok"], true);
        assert_eq!(json["data"]["revoked"], false);

        let (status, json) = call(&server, Method::DELETE, "/tokens/never-issued", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["revoked"], false);
    }

    #[tokio::test]
    async fn test_cleanup_endpoint() {
        let server = TestServerBuilder::new().build().await;
        let (status, json) = call(&server, Method::POST, "/tokens/cleanup", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["expired_count"], 0);
        assert_eq!(json["data"]["users_seen"], 0);
    }

    #[tokio::test]
    async fn test_get_user_and_errors() {
        let server = TestServerBuilder::new().build().await;
        let response = login(&server, 11).await;

        let (status, json) =
            call(&server, Method::GET, &format!("/users/{}", response.user.id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["telegram_id"], 11);
        assert_eq!(json["data"]["is_active"], true);

        let (status, json) =
            call(&server, Method::GET, &format!("/users/{}", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json, serde_json::json!({ "ok": false, "error": "not_found" }));

        let (status, json) = call(&server, Method::GET, "/users/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "invalid_request");
    }

    #[tokio::test]
    async fn test_deactivation_revokes_tokens() {
        let server = TestServerBuilder::new().build().await;
        let response = login(&server, 13).await;
        let uri = format!("/users/{}/active", response.user.id);

        let (status, json) = call(
            &server,
            Method::PUT,
            &uri,
            Some(serde_json::json!({ "active": false })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["user"]["is_active"], false);
        assert_eq!(json["data"]["revoked_tokens"], 1);

        let (status, json) = call(
            &server,
            Method::PUT,
            &uri,
            Some(serde_json::json!({ "active": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["user"]["is_active"], true);
        assert_eq!(json["data"]["revoked_tokens"], 0);

        let (status, _) = call(&server, Method::PUT, &uri, Some(serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
