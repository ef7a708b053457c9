//! License and license pool models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::{AppError, AppResult};

/// How a pool's copies are lent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolAccess {
    /// Finite, distributor-managed licenses
    Licensed,
    OpenAccess,
    Unlimited,
}

impl PoolAccess {
    /// Open-access and unlimited pools never consult the distributor
    pub fn is_unlimited(self) -> bool {
        !matches!(self, PoolAccess::Licensed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PoolAccess::Licensed => "licensed",
            PoolAccess::OpenAccess => "open_access",
            PoolAccess::Unlimited => "unlimited",
        }
    }
}

impl std::str::FromStr for PoolAccess {
    type Err = AppError;

    fn from_str(s: &str) -> AppResult<Self> {
        match s {
            "licensed" => Ok(PoolAccess::Licensed),
            "open_access" => Ok(PoolAccess::OpenAccess),
            "unlimited" => Ok(PoolAccess::Unlimited),
            other => Err(AppError::Validation(format!("Unknown pool access kind '{}'", other))),
        }
    }
}

/// A distributor-issued license, imported from the catalog feed.
///
/// Read-only to circulation except for `is_inactive` and the
/// `checkouts_left` counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct License {
    pub id: i32,
    pub license_pool_id: i32,
    pub identifier: String,
    /// RFC 6570 template of the checkout endpoint
    pub checkout_url: Option<String>,
    pub status_url: String,
    /// Maximum simultaneous loans
    pub terms_concurrency: i32,
    /// Remaining lifetime checkouts; `None` means not loan-limited
    pub checkouts_left: Option<i32>,
    pub expires: Option<DateTime<Utc>>,
    pub is_inactive: bool,
    pub content_types: Vec<String>,
}

impl License {
    /// Whether the license can back new loans at `now`
    pub fn is_available_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_inactive
            && self.checkouts_left != Some(0)
            && self.expires.map(|e| e > now).unwrap_or(true)
    }

    /// Effective concurrency: zero once exhausted, expired or inactive
    pub fn concurrency_at(&self, now: DateTime<Utc>) -> i32 {
        if self.is_available_at(now) {
            self.terms_concurrency.max(0)
        } else {
            0
        }
    }

    pub fn is_time_limited(&self) -> bool {
        self.expires.is_some()
    }

    pub fn is_loan_limited(&self) -> bool {
        self.checkouts_left.is_some()
    }

    /// Consume one lifetime checkout
    pub fn checkout(&mut self) -> AppResult<()> {
        if let Some(left) = self.checkouts_left {
            if left <= 0 {
                return Err(AppError::Invariant(format!(
                    "License {} checked out with no checkouts left",
                    self.identifier
                )));
            }
            self.checkouts_left = Some(left - 1);
        }
        Ok(())
    }
}

/// All licenses for one title within one collection, with derived aggregates.
///
/// The aggregate fields are only ever written by `refresh`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LicensePool {
    pub id: i32,
    pub collection_id: i32,
    /// Title identifier within the collection
    pub identifier: String,
    pub access: PoolAccess,
    pub licenses_owned: i32,
    pub licenses_available: i32,
    pub licenses_reserved: i32,
    pub patrons_in_hold_queue: i32,
    pub last_refreshed: Option<DateTime<Utc>>,
}

impl LicensePool {
    pub fn aggregates(&self) -> PoolAggregates {
        PoolAggregates {
            licenses_owned: self.licenses_owned,
            licenses_available: self.licenses_available,
            licenses_reserved: self.licenses_reserved,
            patrons_in_hold_queue: self.patrons_in_hold_queue,
        }
    }

    pub fn apply(&mut self, aggregates: PoolAggregates, as_of: DateTime<Utc>) {
        self.licenses_owned = aggregates.licenses_owned;
        self.licenses_available = aggregates.licenses_available;
        self.licenses_reserved = aggregates.licenses_reserved;
        self.patrons_in_hold_queue = aggregates.patrons_in_hold_queue;
        self.last_refreshed = Some(as_of);
    }
}

/// The four derived pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolAggregates {
    pub licenses_owned: i32,
    pub licenses_available: i32,
    pub licenses_reserved: i32,
    pub patrons_in_hold_queue: i32,
}

impl PoolAggregates {
    /// Check the capacity invariant
    pub fn validate(&self, pool_id: i32) -> AppResult<()> {
        let ok = self.licenses_owned >= 0
            && self.licenses_available >= 0
            && self.licenses_available <= self.licenses_owned
            && self.licenses_reserved >= 0
            && self.licenses_reserved <= self.licenses_owned
            && self.patrons_in_hold_queue >= 0;
        if ok {
            Ok(())
        } else {
            Err(AppError::Invariant(format!(
                "Pool {} aggregates out of bounds: {:?}",
                pool_id, self
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn license() -> License {
        License {
            id: 1,
            license_pool_id: 1,
            identifier: "urn:license:1".to_string(),
            checkout_url: Some("https://lcp.example/checkout{?id}".to_string()),
            status_url: "https://lcp.example/status/1".to_string(),
            terms_concurrency: 2,
            checkouts_left: Some(1),
            expires: None,
            is_inactive: false,
            content_types: vec!["application/epub+zip".to_string()],
        }
    }

    #[test]
    fn test_concurrency_drops_to_zero_when_exhausted() {
        let now = Utc::now();
        let mut l = license();
        assert_eq!(l.concurrency_at(now), 2);

        l.checkout().unwrap();
        assert_eq!(l.checkouts_left, Some(0));
        assert_eq!(l.concurrency_at(now), 0);
        assert!(l.checkout().is_err());
    }

    #[test]
    fn test_expired_and_inactive_licenses_are_unavailable() {
        let now = Utc::now();
        let mut l = license();
        l.expires = Some(now - Duration::days(1));
        assert!(!l.is_available_at(now));

        l.expires = Some(now + Duration::days(1));
        assert!(l.is_available_at(now));

        l.is_inactive = true;
        assert!(!l.is_available_at(now));
    }

    #[test]
    fn test_aggregate_validation() {
        let ok = PoolAggregates {
            licenses_owned: 2,
            licenses_available: 1,
            licenses_reserved: 1,
            patrons_in_hold_queue: 1,
        };
        assert!(ok.validate(1).is_ok());

        let negative = PoolAggregates { licenses_available: -1, ..ok };
        assert!(matches!(negative.validate(1), Err(AppError::Invariant(_))));

        let over_reserved = PoolAggregates { licenses_reserved: 3, ..ok };
        assert!(over_reserved.validate(1).is_err());
    }

    #[test]
    fn test_pool_access_parsing() {
        assert_eq!("unlimited".parse::<PoolAccess>().unwrap(), PoolAccess::Unlimited);
        assert!(PoolAccess::OpenAccess.is_unlimited());
        assert!(!PoolAccess::Licensed.is_unlimited());
        assert!("borrowed".parse::<PoolAccess>().is_err());
    }
}
