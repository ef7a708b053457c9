//! Hold model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A patron's place in a title's wait queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Hold {
    pub id: Uuid,
    pub patron_id: i32,
    pub license_pool_id: i32,
    #[sqlx(rename = "start_date")]
    pub start: DateTime<Utc>,
    /// Estimated availability date while queued, reservation deadline once ready
    #[sqlx(rename = "end_date")]
    pub end: Option<DateTime<Utc>>,
    /// 0 = ready to borrow, >0 = queue depth
    pub position: i32,
    pub notify_email: Option<String>,
}

impl Hold {
    /// Still competing for a license at `now`
    pub fn is_in_contention(&self, now: DateTime<Utc>) -> bool {
        self.end.map(|end| end > now).unwrap_or(true) || self.position > 0
    }

    /// A reservation whose claim window has passed
    pub fn is_lapsed_reservation(&self, now: DateTime<Utc>) -> bool {
        self.position == 0 && self.end.map(|end| end < now).unwrap_or(false)
    }

    /// Ready to be converted into a loan at `now`
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.position == 0 && !self.end.map(|end| end < now).unwrap_or(false)
    }
}

/// Hold snapshot returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldInfo {
    pub hold_id: Uuid,
    pub license_pool_id: i32,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub position: i32,
}

impl From<&Hold> for HoldInfo {
    fn from(hold: &Hold) -> Self {
        Self {
            hold_id: hold.id,
            license_pool_id: hold.license_pool_id,
            start: hold.start,
            end: hold.end,
            position: hold.position,
        }
    }
}
