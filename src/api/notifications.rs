//! Distributor loan-status notifications

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    repository::LedgerStore,
    services::status_document::{parse_status_document, StatusDocumentApi},
    AppState,
};

/// Receive a status document pushed by the distributor for one loan.
///
/// A terminal status ends the loan. Unknown loans and repeated notifications
/// are acknowledged with 204.
pub async fn loan_notification<S, D>(
    State(state): State<AppState<S, D>>,
    Path(loan_id): Path<Uuid>,
    body: Bytes,
) -> AppResult<StatusCode>
where
    S: LedgerStore + 'static,
    D: StatusDocumentApi + 'static,
{
    let source = format!("notification for loan {}", loan_id);
    let document = parse_status_document(&source, &body).map_err(|e| match e {
        AppError::BadResponse { message, .. } => AppError::Validation(message),
        other => other,
    })?;

    let removed = state.circulation.update_loan(loan_id, &document).await?;
    tracing::debug!(
        "Notification for loan {} ({}), removed: {}",
        loan_id,
        document.status.as_str(),
        removed
    );
    Ok(StatusCode::NO_CONTENT)
}
