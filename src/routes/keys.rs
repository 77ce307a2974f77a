use crate::{keys::Jwks, server::Server};
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderValue, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;

const PEM_CONTENT_TYPE: &str = "application/x-pem-file";
/// Keys only change on operator rotation.
const KEY_CACHE_CONTROL: &str = "public, max-age=3600";

#[derive(Debug, Serialize)]
pub struct PublicKeyResponse {
    pub public_key: String,
    pub algorithm: &'static str,
    pub kid: String,
}

pub fn create_key_routes() -> Router<Server> {
    Router::new()
        .route("/public-key.pem", get(public_key_pem))
        .route("/public-key", get(public_key_json))
        .route("/jwks", get(jwks))
}

async fn public_key_pem(State(server): State<Server>) -> Response {
    let mut response = server.keys.public_key_pem().to_string().into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(PEM_CONTENT_TYPE),
    );
    with_cache_control(response)
}

async fn public_key_json(State(server): State<Server>) -> Response {
    let body = PublicKeyResponse {
        public_key: server.keys.public_key_pem().to_string(),
        algorithm: "RS256",
        kid: server.keys.kid().to_string(),
    };
    with_cache_control(Json(body).into_response())
}

async fn jwks(State(server): State<Server>) -> Response {
    let body: &Jwks = server.keys.jwks();
    with_cache_control(Json(body).into_response())
}

fn with_cache_control(mut response: Response) -> Response {
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(KEY_CACHE_CONTROL),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestServerBuilder;
    use crate::verifier::parse_public_key;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn fetch(uri: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let server = TestServerBuilder::new().build().await;
        let response = create_key_routes()
            .with_state(server)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, body.to_vec())
    }

    #[tokio::test]
    async fn test_public_key_pem() {
        let (status, headers, body) = fetch("/public-key.pem").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], PEM_CONTENT_TYPE);
        assert_eq!(headers[header::CACHE_CONTROL], KEY_CACHE_CONTROL);

        let pem = String::from_utf8(body).unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));
        assert!(parse_public_key(&pem).is_ok());
    }

    #[tokio::test]
    async fn test_public_key_json() {
        let (status, headers, body) = fetch("/public-key").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CACHE_CONTROL], KEY_CACHE_CONTROL);

        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["algorithm"], "RS256");
        assert_eq!(json["kid"].as_str().unwrap().len(), 16);
        assert!(
            json["public_key"]
                .as_str()
                .unwrap()
                .starts_with("-----BEGIN PUBLIC KEY-----")
        );
    }

    #[tokio::test]
    async fn test_jwks() {
        let (status, _, body) = fetch("/jwks").await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let key = &json["keys"][0];
        assert_eq!(key["kty"], "RSA");
        assert_eq!(key["alg"], "RS256");
        assert_eq!(key["use"], "sig");
        assert_eq!(key["e"], "AQAB");
        assert!(parse_public_key(std::str::from_utf8(&body).unwrap()).is_ok());
    }
}
