#![allow(dead_code)]

use axum::{
    Router,
    body::Body,
    extract::ConnectInfo,
    http::{Method, Request, StatusCode},
};
use chrono::Utc;
use game_auth::{
    Config, Server,
    database::{DatabaseConfig, DatabaseManager, DatabaseManagerImpl},
    keys::SigningKeys,
    revocation::{MemoryRevocationStore, RedisConfig, RevocationStore},
    telegram::sign_init_data,
};
use http_body_util::BodyExt;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;

pub const TEST_PRIVATE_KEY_PEM: &str = include_str!("../fixtures/test_private_key.pem");
pub const OTHER_PRIVATE_KEY_PEM: &str = include_str!("../fixtures/other_private_key.pem");
pub const BOT_TOKEN: &str = "12345:test-bot-token";
pub const SECONDARY_BOT_TOKEN: &str = "67890:second-bot-token";

/// Full issuer over SQLite in memory and the memory revocation store
pub struct TestHarness {
    pub server: Server,
    pub public: Router,
    pub internal: Router,
    pub store: Arc<MemoryRevocationStore>,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(update: impl FnOnce(&mut Config)) -> Self {
        let mut config = Config::default();
        config.telegram.bot_token = BOT_TOKEN.to_string();
        config.telegram.secondary_bot_tokens = vec![SECONDARY_BOT_TOKEN.to_string()];
        config.redis = RedisConfig::memory();
        config.metrics.enabled = false;
        config.logging.log_request = false;
        update(&mut config);
        config.validate().unwrap();

        let database = DatabaseManagerImpl::new_from_config(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        database.migrate().await.unwrap();
        let database: Arc<dyn DatabaseManager> = Arc::new(database);

        let store = Arc::new(MemoryRevocationStore::new());
        let keys = Arc::new(SigningKeys::from_private_pem(TEST_PRIVATE_KEY_PEM).unwrap());
        let server =
            Server::from_components(config, database, store.clone(), keys, None).await;

        Self {
            public: server.create_public_app(),
            internal: server.create_internal_app(),
            server,
            store,
        }
    }

    pub fn revocation(&self) -> Arc<dyn RevocationStore> {
        self.store.clone()
    }

    pub async fn login(&self, init_data: &str) -> (StatusCode, Value) {
        self.login_from(init_data, "203.0.113.7").await
    }

    /// `/auth` request arriving from socket peer `ip`.
    pub async fn login_from(&self, init_data: &str, ip: &str) -> (StatusCode, Value) {
        send(&self.public, auth_request(init_data, ip, &[])).await
    }

    /// Logs in and returns the access token and internal user id.
    pub async fn issue_token(&self, telegram_id: i64) -> (String, String) {
        let (status, body) = self.login(&init_data(telegram_id, "Alice", now())).await;
        assert_eq!(status, StatusCode::OK, "login failed: {body}");
        (
            body["access_token"].as_str().unwrap().to_string(),
            body["user"]["id"].as_str().unwrap().to_string(),
        )
    }

    pub async fn admin(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        send(&self.internal, builder.body(body).unwrap()).await
    }

    pub async fn get_public(&self, uri: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let response = self
            .public
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, body.to_vec())
    }
}

/// `POST /auth` from socket peer `ip` with extra request headers.
pub fn auth_request(init_data: &str, ip: &str, headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/auth")
        .header("content-type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let mut request = builder
        .body(Body::from(
            serde_json::json!({ "init_data": init_data }).to_string(),
        ))
        .unwrap();
    let peer = SocketAddr::new(ip.parse().unwrap(), 40000);
    request.extensions_mut().insert(ConnectInfo(peer));
    request
}

pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

pub fn now() -> i64 {
    Utc::now().timestamp()
}

pub fn init_data(telegram_id: i64, first_name: &str, auth_date: i64) -> String {
    init_data_signed_by(BOT_TOKEN, telegram_id, first_name, auth_date)
}

pub fn init_data_signed_by(
    bot_token: &str,
    telegram_id: i64,
    first_name: &str,
    auth_date: i64,
) -> String {
    let user = serde_json::json!({
        "id": telegram_id,
        "first_name": first_name,
        "username": first_name.to_lowercase(),
        "language_code": "en",
        "is_premium": true,
    })
    .to_string();
    let auth_date = auth_date.to_string();
    sign_init_data(
        bot_token,
        &[
            ("auth_date", auth_date.as_str()),
            ("query_id", "AAHdF6IQAAAAAN0XohDhrOrc"),
            ("user", user.as_str()),
        ],
    )
}

/// Decodes the payload segment without verifying the signature.
pub fn token_payload(token: &str) -> Value {
    use base64::Engine;
    let payload = token.split('.').nth(1).unwrap();
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
