//! Per-pool ledger: licenses, loans and holds loaded under lock, plus the
//! refresh that derives pool aggregates from them.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{
        CollectionSettings, DeliveryMechanism, Hold, License, LicensePool, Loan, PoolAggregates,
    },
    services::hold_queue::{self, QueueSnapshot},
};

/// A hold that became ready during a refresh
#[derive(Debug, Clone, PartialEq)]
pub struct HoldPromotion {
    pub hold_id: Uuid,
    pub patron_id: i32,
    pub license_pool_id: i32,
    pub pool_identifier: String,
    pub end: Option<DateTime<Utc>>,
    pub notify_email: Option<String>,
}

/// One pool's rows, as seen inside the locked unit of work
#[derive(Debug, Clone, PartialEq)]
pub struct PoolLedger {
    pub pool: LicensePool,
    pub collection: CollectionSettings,
    pub licenses: Vec<License>,
    pub loans: Vec<Loan>,
    pub holds: Vec<Hold>,
    pub delivery_mechanisms: Vec<DeliveryMechanism>,
}

impl PoolLedger {
    pub fn loan_for(&self, patron_id: i32) -> Option<&Loan> {
        self.loans.iter().find(|l| l.patron_id == patron_id)
    }

    pub fn loan_mut(&mut self, loan_id: Uuid) -> Option<&mut Loan> {
        self.loans.iter_mut().find(|l| l.id == loan_id)
    }

    pub fn hold_for(&self, patron_id: i32) -> Option<&Hold> {
        self.holds.iter().find(|h| h.patron_id == patron_id)
    }

    pub fn license(&self, license_id: i32) -> Option<&License> {
        self.licenses.iter().find(|l| l.id == license_id)
    }

    pub fn license_mut(&mut self, license_id: i32) -> Option<&mut License> {
        self.licenses.iter_mut().find(|l| l.id == license_id)
    }

    /// Remove a loan, returning it if present
    pub fn remove_loan(&mut self, loan_id: Uuid) -> Option<Loan> {
        let index = self.loans.iter().position(|l| l.id == loan_id)?;
        Some(self.loans.remove(index))
    }

    /// Remove a hold, returning it if present
    pub fn remove_hold(&mut self, hold_id: Uuid) -> Option<Hold> {
        let index = self.holds.iter().position(|h| h.id == hold_id)?;
        Some(self.holds.remove(index))
    }

    /// Whether the pool offers this format
    pub fn offers(&self, mechanism: &DeliveryMechanism) -> bool {
        self.delivery_mechanisms
            .iter()
            .any(|m| m.same_format(mechanism))
    }

    /// The stored mechanism matching the requested format
    pub fn mechanism_like(&self, mechanism: &DeliveryMechanism) -> Option<&DeliveryMechanism> {
        self.delivery_mechanisms
            .iter()
            .find(|m| m.same_format(mechanism))
    }

    /// Unexpired loans bound to a license that can currently back loans
    fn counted_loans(&self, as_of: DateTime<Utc>) -> Vec<&Loan> {
        self.loans
            .iter()
            .filter(|loan| loan.is_active_at(as_of))
            .filter(|loan| {
                loan.license_id
                    .and_then(|id| self.license(id))
                    .map(|license| license.is_available_at(as_of))
                    .unwrap_or(false)
            })
            .collect()
    }

    fn loans_per_license(&self, as_of: DateTime<Utc>) -> HashMap<i32, i32> {
        let mut counts = HashMap::new();
        for loan in self.counted_loans(as_of) {
            if let Some(id) = loan.license_id {
                *counts.entry(id).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Total concurrency of the licenses that can back loans
    pub fn licenses_owned(&self, as_of: DateTime<Utc>) -> i32 {
        self.licenses.iter().map(|l| l.concurrency_at(as_of)).sum()
    }

    /// Whether any license has not been withdrawn by the distributor
    pub fn has_active_license(&self) -> bool {
        self.licenses.iter().any(|l| !l.is_inactive)
    }

    pub fn snapshot(&self, as_of: DateTime<Utc>) -> QueueSnapshot {
        QueueSnapshot::new(
            self.licenses_owned(as_of),
            self.counted_loans(as_of),
            &self.holds,
            as_of,
        )
    }

    /// Re-derive the pool aggregates from the ledger
    pub fn refresh(&mut self, as_of: DateTime<Utc>) -> AppResult<PoolAggregates> {
        let aggregates = self.compute_aggregates(as_of)?;
        aggregates.validate(self.pool.id)?;
        self.pool.apply(aggregates, as_of);
        tracing::debug!(
            "Refreshed pool {}: owned={} available={} reserved={} queue={}",
            self.pool.id,
            aggregates.licenses_owned,
            aggregates.licenses_available,
            aggregates.licenses_reserved,
            aggregates.patrons_in_hold_queue
        );
        Ok(aggregates)
    }

    fn compute_aggregates(&self, as_of: DateTime<Utc>) -> AppResult<PoolAggregates> {
        if self.pool.access.is_unlimited() {
            return Ok(PoolAggregates::default());
        }

        // Each license can carry at most its concurrency in loans
        for (license_id, count) in self.loans_per_license(as_of) {
            let concurrency = self
                .license(license_id)
                .map(|l| l.concurrency_at(as_of))
                .unwrap_or(0);
            if count > concurrency {
                return Err(AppError::Invariant(format!(
                    "License {} carries {} loans with concurrency {}",
                    license_id, count, concurrency
                )));
            }
        }

        let owned = self.licenses_owned(as_of);
        let loans = self.counted_loans(as_of).len() as i32;
        let holds = self
            .holds
            .iter()
            .filter(|h| h.is_in_contention(as_of))
            .count() as i32;

        let remaining = owned - loans;
        let reserved = remaining.min(holds).max(0);

        Ok(PoolAggregates {
            licenses_owned: owned,
            licenses_available: remaining - reserved,
            licenses_reserved: reserved,
            patrons_in_hold_queue: holds,
        })
    }

    /// Recompute one hold's position and end date
    pub fn update_hold(
        &mut self,
        hold_id: Uuid,
        as_of: DateTime<Utc>,
    ) -> Option<hold_queue::HoldTransition> {
        let snapshot = self.snapshot(as_of);
        let periods = self.collection.periods();
        let hold = self.holds.iter_mut().find(|h| h.id == hold_id)?;
        Some(hold_queue::update_hold(hold, &snapshot, periods, as_of))
    }

    /// Refresh, then move the holds now backed by a reserved license to the
    /// front of the queue.
    pub fn refresh_and_cascade(&mut self, as_of: DateTime<Utc>) -> AppResult<Vec<HoldPromotion>> {
        let aggregates = self.refresh(as_of)?;

        let mut contending: Vec<&Hold> = self
            .holds
            .iter()
            .filter(|h| h.is_in_contention(as_of))
            .collect();
        contending.sort_by_key(|h| (h.start, h.id));
        let pending: Vec<Uuid> = contending
            .into_iter()
            .take(aggregates.licenses_reserved.max(0) as usize)
            .filter(|h| h.position != 0)
            .map(|h| h.id)
            .collect();

        let mut promotions = Vec::new();
        for hold_id in pending {
            let transition = self.update_hold(hold_id, as_of);
            if !matches!(transition, Some(t) if t.promoted) {
                continue;
            }
            if let Some(hold) = self.holds.iter().find(|h| h.id == hold_id) {
                tracing::info!(
                    "Hold {} for patron {} is ready on pool {}",
                    hold.id,
                    hold.patron_id,
                    self.pool.id
                );
                promotions.push(HoldPromotion {
                    hold_id: hold.id,
                    patron_id: hold.patron_id,
                    license_pool_id: hold.license_pool_id,
                    pool_identifier: self.pool.identifier.clone(),
                    end: hold.end,
                    notify_email: hold.notify_email.clone(),
                });
            }
        }

        Ok(promotions)
    }

    /// Pick the license a new loan should consume
    pub fn best_available_license(&self, as_of: DateTime<Utc>) -> Option<&License> {
        let loans = self.loans_per_license(as_of);
        self.licenses
            .iter()
            .filter(|l| l.is_available_at(as_of))
            .filter(|l| l.concurrency_at(as_of) - loans.get(&l.id).copied().unwrap_or(0) > 0)
            .min_by_key(|l| license_rank(l))
    }

    /// Drop reservations nobody claimed in time
    pub fn expire_reservations(&mut self, as_of: DateTime<Utc>) -> Vec<Hold> {
        let (lapsed, kept): (Vec<Hold>, Vec<Hold>) = std::mem::take(&mut self.holds)
            .into_iter()
            .partition(|h| h.is_lapsed_reservation(as_of));
        self.holds = kept;
        lapsed
    }

    /// Drop provisional loans whose remote checkout never completed
    pub fn expire_provisional_loans(&mut self, created_before: DateTime<Utc>) -> Vec<Loan> {
        let (stale, kept): (Vec<Loan>, Vec<Loan>) = std::mem::take(&mut self.loans)
            .into_iter()
            .partition(|l| l.is_provisional() && l.created_at < created_before);
        self.loans = kept;
        stale
    }
}

/// Soonest-expiring time-limited licenses first, then loan-limited ones with the
/// fewest checkouts left, then perpetual ones.
fn license_rank(license: &License) -> (u8, i64, i32) {
    match (license.expires, license.checkouts_left) {
        (Some(expires), left) => (0, expires.timestamp(), left.unwrap_or(i32::MAX)),
        (None, Some(left)) => (1, 0, left),
        (None, None) => (2, 0, 0),
    }
}

/// Row-level difference between two states of the same ledger
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerChanges {
    pub pool: Option<LicensePool>,
    pub licenses: Vec<License>,
    pub upserted_loans: Vec<Loan>,
    pub deleted_loans: Vec<Uuid>,
    pub upserted_holds: Vec<Hold>,
    pub deleted_holds: Vec<Uuid>,
}

impl LedgerChanges {
    pub fn between(before: &PoolLedger, after: &PoolLedger) -> Self {
        let pool = (before.pool != after.pool).then(|| after.pool.clone());

        let licenses = after
            .licenses
            .iter()
            .filter(|l| before.license(l.id) != Some(l))
            .cloned()
            .collect();

        let upserted_loans = after
            .loans
            .iter()
            .filter(|l| !before.loans.contains(l))
            .cloned()
            .collect();
        let deleted_loans = before
            .loans
            .iter()
            .filter(|l| !after.loans.iter().any(|a| a.id == l.id))
            .map(|l| l.id)
            .collect();

        let upserted_holds = after
            .holds
            .iter()
            .filter(|h| !before.holds.contains(h))
            .cloned()
            .collect();
        let deleted_holds = before
            .holds
            .iter()
            .filter(|h| !after.holds.iter().any(|a| a.id == h.id))
            .map(|h| h.id)
            .collect();

        Self {
            pool,
            licenses,
            upserted_loans,
            deleted_loans,
            upserted_holds,
            deleted_holds,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_none()
            && self.licenses.is_empty()
            && self.upserted_loans.is_empty()
            && self.deleted_loans.is_empty()
            && self.upserted_holds.is_empty()
            && self.deleted_holds.is_empty()
    }
}
