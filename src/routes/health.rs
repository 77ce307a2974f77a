use crate::{error::AppError, health::HealthReport, server::Server};
use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct HealthCheckQuery {
    /// Restrict the report to one dependency (`postgres`, `redis`, `keys`).
    #[serde(default)]
    check: Option<String>,
}

/// `/health` and `/metrics`, mounted on both listeners
pub fn create_health_routes() -> Router<Server> {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
}

async fn health_check(
    State(server): State<Server>,
    Query(params): Query<HealthCheckQuery>,
) -> (StatusCode, Json<HealthReport>) {
    let report = server
        .health_service
        .check_health(params.check.as_deref())
        .await;

    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn metrics(State(server): State<Server>) -> Result<Response, AppError> {
    let handle = server
        .metrics_handle
        .as_ref()
        .ok_or_else(|| AppError::NotFound("metrics are disabled".to_string()))?;

    let mut response = handle.render().into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    Ok(response)
}
