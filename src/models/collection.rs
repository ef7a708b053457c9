//! Collection lending policy

use chrono::Duration;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub const STANDARD_DEFAULT_LOAN_PERIOD_DAYS: i32 = 21;
pub const STANDARD_DEFAULT_RESERVATION_PERIOD_DAYS: i32 = 3;

/// Per-collection circulation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct CollectionSettings {
    pub id: i32,
    pub name: String,
    /// `None` (or 0) means no per-patron loan limit
    pub loan_limit: Option<i32>,
    /// `None` means unlimited, 0 disallows holds entirely
    pub hold_limit: Option<i32>,
    pub default_loan_period_days: i32,
    pub default_reservation_period_days: i32,
}

impl CollectionSettings {
    pub fn periods(&self) -> LendingPeriods {
        LendingPeriods {
            loan: Duration::days(self.default_loan_period_days as i64),
            reservation: Duration::days(self.default_reservation_period_days as i64),
        }
    }

    /// The effective loan limit, if any
    pub fn effective_loan_limit(&self) -> Option<i32> {
        self.loan_limit.filter(|limit| *limit > 0)
    }
}

/// Loan and reservation durations, in whole days
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LendingPeriods {
    pub loan: Duration,
    pub reservation: Duration,
}

impl LendingPeriods {
    /// One full cycle: a reservation claimed at the last moment, then held for the full loan
    pub fn cycle(&self) -> Duration {
        self.loan + self.reservation
    }
}

impl Default for LendingPeriods {
    fn default() -> Self {
        Self {
            loan: Duration::days(STANDARD_DEFAULT_LOAN_PERIOD_DAYS as i64),
            reservation: Duration::days(STANDARD_DEFAULT_RESERVATION_PERIOD_DAYS as i64),
        }
    }
}
