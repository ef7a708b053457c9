//! Health check endpoints

use axum::{extract::State, Json};
use serde::Serialize;

use crate::{
    error::AppResult, repository::LedgerStore, services::status_document::StatusDocumentApi,
    AppState,
};

#[derive(Serialize)]
pub struct HealthResponse {
    /// Current status of the service
    pub status: String,
    /// Version of the service
    pub version: String,
}

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check endpoint (checks database connectivity)
pub async fn readiness_check<S, D>(
    State(state): State<AppState<S, D>>,
) -> AppResult<Json<HealthResponse>>
where
    S: LedgerStore + 'static,
    D: StatusDocumentApi + 'static,
{
    state.circulation.store().ping().await?;
    Ok(Json(HealthResponse {
        status: "ready".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}
