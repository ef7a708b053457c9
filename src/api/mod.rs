//! HTTP surface: health probes and the distributor callback

pub mod health;
pub mod notifications;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{repository::LedgerStore, services::status_document::StatusDocumentApi, AppState};

/// Create the application router
pub fn router<S, D>(state: AppState<S, D>) -> Router
where
    S: LedgerStore + 'static,
    D: StatusDocumentApi + 'static,
{
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check::<S, D>))
        .route(
            "/odl/notify/:loan_id",
            post(notifications::loan_notification::<S, D>),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
