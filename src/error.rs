//! Error types for ODL circulation

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Numeric error codes exposed in response bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    Success = 0,
    Failure = 1,
    DbFailure = 3,
    NotFound = 5,
    NotAvailable = 7,
    Duplicate = 8,
    RemoteFailure = 9,
    LimitReached = 11,
    NotBorrowable = 12,
    BadValue = 18,
    InvariantViolation = 30,
}

/// Expected, caller-recoverable circulation outcomes
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "failure", rename_all = "snake_case")]
pub enum CirculationFailure {
    #[error("Patron already has this title checked out")]
    AlreadyCheckedOut,

    #[error("Patron already has this title on hold")]
    AlreadyOnHold,

    #[error("Patron does not have this title checked out")]
    NotCheckedOut,

    #[error("Patron does not have this title on hold")]
    NotOnHold,

    #[error("No copies available to check out")]
    NoAvailableCopies,

    #[error("Title is currently available; check it out instead")]
    CurrentlyAvailable,

    #[error("Holds cannot be placed on unlimited-access titles")]
    HoldOnUnlimitedAccess,

    #[error("Holds are not permitted in this collection")]
    HoldsNotPermitted,

    #[error("Patron loan limit reached ({limit})")]
    PatronLoanLimitReached { limit: i32 },

    #[error("Patron hold limit reached ({limit})")]
    PatronHoldLimitReached { limit: i32 },

    #[error("No active licenses for this title")]
    NoLicenses,

    #[error("Requested format is not available")]
    FormatNotAvailable,

    #[error("Distributor refused the loan")]
    CannotLoan,

    #[error("Loan can no longer be fulfilled")]
    CannotFulfill,
}

/// Main application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Circulation(#[from] CirculationFailure),

    /// Remote protocol failure; transient, safe to retry with backoff
    #[error("Bad response from {url}: {message}")]
    BadResponse { url: String, message: String },

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn bad_response(url: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::BadResponse {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Whether the caller may retry the operation
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::BadResponse { .. })
    }

    /// The domain failure tag, if this is one
    pub fn failure(&self) -> Option<CirculationFailure> {
        match self {
            AppError::Circulation(f) => Some(*f),
            _ => None,
        }
    }
}

/// Error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub code: u32,
    pub error: String,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Circulation(failure) => {
                let (status, code) = match failure {
                    CirculationFailure::NotCheckedOut | CirculationFailure::NotOnHold => {
                        (StatusCode::NOT_FOUND, ErrorCode::NotFound)
                    }
                    CirculationFailure::AlreadyCheckedOut | CirculationFailure::AlreadyOnHold => {
                        (StatusCode::CONFLICT, ErrorCode::Duplicate)
                    }
                    CirculationFailure::PatronLoanLimitReached { .. }
                    | CirculationFailure::PatronHoldLimitReached { .. } => {
                        (StatusCode::FORBIDDEN, ErrorCode::LimitReached)
                    }
                    CirculationFailure::FormatNotAvailable => {
                        (StatusCode::BAD_REQUEST, ErrorCode::BadValue)
                    }
                    CirculationFailure::HoldOnUnlimitedAccess
                    | CirculationFailure::HoldsNotPermitted => {
                        (StatusCode::UNPROCESSABLE_ENTITY, ErrorCode::NotBorrowable)
                    }
                    _ => (StatusCode::CONFLICT, ErrorCode::NotAvailable),
                };
                (status, code, failure.to_string())
            }
            AppError::BadResponse { url, message } => {
                tracing::warn!("Distributor error from {}: {}", url, message);
                (
                    StatusCode::BAD_GATEWAY,
                    ErrorCode::RemoteFailure,
                    message.clone(),
                )
            }
            AppError::Invariant(msg) => {
                tracing::error!("Invariant violation: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::InvariantViolation,
                    "Internal server error".to_string(),
                )
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::DbFailure,
                    "Database error".to_string(),
                )
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, ErrorCode::NotFound, msg.clone()),
            AppError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, ErrorCode::BadValue, msg.clone())
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::Failure,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            code: code as u32,
            error: format!("{:?}", code),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for application operations
pub type AppResult<T> = Result<T, AppError>;
