//! ODL circulation
//!
//! Lends distributor-licensed e-books and audiobooks: checkout, fulfillment,
//! early return and FIFO holds over a pool of licenses, kept consistent with the
//! distributor's License Status Documents.

use std::sync::Arc;

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod repository;
pub mod services;

pub use config::AppConfig;
pub use error::{AppError, AppResult};

use repository::PgLedgerStore;
use services::{circulation::CirculationService, status_document::HttpStatusDocumentClient};

/// Application state shared across all handlers
pub struct AppState<S = PgLedgerStore, D = HttpStatusDocumentClient> {
    pub config: Arc<AppConfig>,
    pub circulation: CirculationService<S, D>,
}

impl<S, D> Clone for AppState<S, D> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            circulation: self.circulation.clone(),
        }
    }
}
