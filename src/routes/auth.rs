use crate::{auth::LoginResponse, error::AppError, server::Server};
use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    routing::post,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AuthRequest {
    pub init_data: String,
}

pub fn create_auth_routes() -> Router<Server> {
    Router::new().route("/auth", post(authenticate))
}

/// Exchange a Telegram Web App `initData` payload for a bearer token.
async fn authenticate(
    State(server): State<Server>,
    payload: Result<Json<AuthRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, AppError> {
    let Json(request) = payload.map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;
    if request.init_data.trim().is_empty() {
        return Err(AppError::BadRequest("init_data must not be empty".to_string()));
    }

    let response = server.login_service.login(&request.init_data).await?;
    Ok(Json(response))
}
