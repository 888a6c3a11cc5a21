use axum::{
    extract::{Path, State},
    response::Json,
};

use crate::{
    error::AppError,
    models::{ComponentHealth, HealthSummary},
    ok_response,
    response::ApiResponse,
    services::StatusRegistry,
};

/// Shared state for the health routes
#[derive(Clone, Debug)]
pub struct AppState {
    pub registry: StatusRegistry,
}

/// Aggregated bridge status
///
/// Always answers 200; a degraded bridge is reported in the body.
pub async fn health_summary(State(state): State<AppState>) -> Json<ApiResponse<HealthSummary>> {
    Json(ok_response!(state.registry.snapshot().await))
}

/// Last known state of one component
pub async fn component_health(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ApiResponse<ComponentHealth>>, AppError> {
    let component = state
        .registry
        .component(&name)
        .await
        .ok_or_else(|| AppError::not_found(format!("component {}", name)))?;

    Ok(Json(ok_response!(component)))
}
