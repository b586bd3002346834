//! API handlers for the local status API

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ota_common::{Error, EventId};
use std::sync::Arc;
use tracing::info;

use crate::controller::OtaHandle;
use crate::history::CycleHistory;

/// Shared application state
pub struct AppState {
    pub handle: OtaHandle,
    pub history: CycleHistory,
}

/// API Error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message
        });

        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::CycleInProgress(_) => StatusCode::CONFLICT,
            Error::TransportUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

/// Health check
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "ota-agent"
    }))
}

/// Active and recently finished cycles
pub async fn list_cycles_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.history.stats().await;
    let active = state.history.active_cycles().await;
    let finished = state.history.finished().await;

    Json(serde_json::json!({
        "stats": stats,
        "active": active,
        "finished": finished,
    }))
}

/// Current and last cycle of one module
pub async fn get_module_handler(
    State(state): State<Arc<AppState>>,
    Path(module): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let active = state.history.active(&module).await;
    let last = state.history.last_finished(&module).await;

    if active.is_none() && last.is_none() {
        return Err(ApiError {
            status: StatusCode::NOT_FOUND,
            message: format!("No upgrade cycles for module: {}", module),
        });
    }

    Ok(Json(serde_json::json!({
        "module": module,
        "active": active,
        "last_finished": last,
    })))
}

/// Ask the platform for a package for `module`
pub async fn check_module_handler(
    State(state): State<Arc<AppState>>,
    Path(module): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let event_id = EventId::generate();
    info!("Upgrade check requested for module {} (event {})", module, event_id);

    let message_id = state
        .handle
        .request_package(&module, event_id.clone())
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "module": module,
            "event_id": event_id,
            "message_id": message_id,
        })),
    ))
}
