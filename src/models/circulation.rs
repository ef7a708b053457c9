//! Value types returned by circulation operations

use serde::{Deserialize, Serialize};

use super::{hold::HoldInfo, license::LicensePool, loan::LoanInfo};

/// Pool counters as seen by a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolAvailability {
    pub license_pool_id: i32,
    pub licenses_owned: i32,
    pub licenses_available: i32,
    pub licenses_reserved: i32,
    pub patrons_in_hold_queue: i32,
}

impl From<&LicensePool> for PoolAvailability {
    fn from(pool: &LicensePool) -> Self {
        Self {
            license_pool_id: pool.id,
            licenses_owned: pool.licenses_owned,
            licenses_available: pool.licenses_available,
            licenses_reserved: pool.licenses_reserved,
            patrons_in_hold_queue: pool.patrons_in_hold_queue,
        }
    }
}

/// One entry of a patron's bookshelf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PatronActivity {
    Loan(LoanInfo),
    Hold(HoldInfo),
}
