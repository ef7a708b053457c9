//! Loan model and related types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Loan row. Owned exclusively by the circulation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Loan {
    pub id: Uuid,
    pub patron_id: i32,
    pub license_pool_id: i32,
    /// License consumed; `None` for open-access and unlimited pools
    pub license_id: Option<i32>,
    #[sqlx(rename = "start_date")]
    pub start: Option<DateTime<Utc>>,
    /// `None` means open-ended
    #[sqlx(rename = "end_date")]
    pub end: Option<DateTime<Utc>>,
    /// URL of the distributor's License Status Document
    pub external_identifier: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Loan {
    /// Bound to a license but the remote checkout has not been confirmed yet
    pub fn is_provisional(&self) -> bool {
        self.license_id.is_some() && self.external_identifier.is_none()
    }

    /// Whether the loan still occupies a slot at `now`
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.end.map(|end| end > now).unwrap_or(true)
    }

    /// Licensed loans count toward the loan limit until they end, provisional ones included
    pub fn counts_toward_limit(&self, now: DateTime<Utc>) -> bool {
        self.license_id.is_some() && self.is_active_at(now)
    }
}

/// Loan snapshot returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanInfo {
    pub loan_id: Uuid,
    pub license_pool_id: i32,
    pub license_identifier: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub external_identifier: Option<String>,
}

impl LoanInfo {
    pub fn from_loan(loan: &Loan, license_identifier: Option<String>) -> Self {
        Self {
            loan_id: loan.id,
            license_pool_id: loan.license_pool_id,
            license_identifier,
            start: loan.start,
            end: loan.end,
            external_identifier: loan.external_identifier.clone(),
        }
    }
}
