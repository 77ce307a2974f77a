use crate::{
    config::Config,
    utils::{RequestIdExt, client_ip},
};
use axum::{
    Json,
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{any::Any, sync::Arc, time::Instant};
use tracing::{error, info};

/// Request/response logging middleware. Never logs bodies or the `Authorization` header.
pub async fn request_response_logger(
    State(config): State<Arc<Config>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let request_id = req.extensions().request_id();
    let ip = client_ip(
        req.headers(),
        req.extensions(),
        config.security.trust_forwarded_headers,
    );

    info!(
        method = %method,
        path = %path,
        ip = %ip,
        request_id = %request_id,
        "HTTP request"
    );

    let start = Instant::now();
    let response = next.run(req).await;

    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        request_id = %request_id,
        "HTTP response"
    );

    response
}

/// Handler for `CatchPanicLayer`: the panic is logged and the client gets a plain 500.
///
/// Only the payload is logged. The location and backtrace belong to the panic hook, which has
/// already run on the panicking thread by the time the layer sees the unwind.
pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    error!(panic = panic_message(panic.as_ref()), "Request handler panicked");
    crate::metrics::track_handler_panic();

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal" })),
    )
        .into_response()
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        *s
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, routing::get};
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use tower_http::catch_panic::CatchPanicLayer;

    async fn boom() -> &'static str {
        panic!("handler exploded")
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let app = Router::new()
            .route("/boom", get(boom))
            .route("/ok", get(|| async { "fine" }))
            .layer(CatchPanicLayer::custom(panic_response));

        let response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/boom")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body, json!({ "error": "internal" }));

        // The process keeps serving.
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/ok")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_panic_message_from_payload() {
        let owned: Box<dyn Any + Send> = Box::new(format!("index {} out of range", 7));
        assert_eq!(panic_message(owned.as_ref()), "index 7 out of range");

        let literal: Box<dyn Any + Send> = Box::new("handler exploded");
        assert_eq!(panic_message(literal.as_ref()), "handler exploded");

        let other: Box<dyn Any + Send> = Box::new(42_u32);
        assert_eq!(panic_message(other.as_ref()), "unknown panic payload");
    }

    #[tokio::test]
    async fn test_request_logger_passes_response_through() {
        let config = Arc::new(Config::default());
        let app = Router::new()
            .route("/teapot", get(|| async { StatusCode::IM_A_TEAPOT }))
            .layer(axum::middleware::from_fn_with_state(
                config,
                request_response_logger,
            ));

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/teapot")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    }
}
