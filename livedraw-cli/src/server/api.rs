use super::AppState;
use axum::{
    extract::{rejection::JsonRejection, Request, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use livedraw_core::{ConfigUpdate, DrawError, StatusReport};
use serde_json::{json, Value};

pub enum ApiError {
    Unauthorized,
    BadRequest(String),
    Draw(DrawError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<DrawError> for ApiError {
    fn from(err: DrawError) -> Self {
        ApiError::Draw(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Draw(err) => {
                let status = match err {
                    DrawError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
                    DrawError::NoActiveRound => StatusCode::CONFLICT,
                    DrawError::EngineStopped => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.to_string())
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Token from `x-admin-token` or `Authorization: Bearer <token>`.
fn provided_token(headers: &HeaderMap) -> Option<&str> {
    if let Some(token) = headers.get("x-admin-token").and_then(|v| v.to_str().ok()) {
        return Some(token);
    }

    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split_whitespace().nth(1))
}

pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    match provided_token(request.headers()) {
        Some(token) if token == &*state.admin_token => Ok(next.run(request).await),
        _ => {
            tracing::warn!("Rejected admin request to {}", request.uri().path());
            Err(ApiError::Unauthorized)
        }
    }
}

pub async fn health() -> &'static str {
    "ok"
}

pub async fn status(State(state): State<AppState>) -> Result<Json<StatusReport>, ApiError> {
    Ok(Json(state.engine.status().await?))
}

pub async fn update_config(
    State(state): State<AppState>,
    body: Result<Json<ConfigUpdate>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(update) = body?;
    let config = state.engine.update_config(update).await?;
    Ok(Json(json!({
        "ok": true,
        "samplesPlanned": config.samples_planned,
        "previewOffset": config.preview_offset_secs,
    })))
}

pub async fn force_preview(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.engine.force_preview().await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn force_final(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let sealed = state.engine.force_final().await?;
    Ok(Json(json!({ "ok": true, "result": sealed })))
}
