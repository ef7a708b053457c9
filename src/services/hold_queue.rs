//! Hold queue calculator
//!
//! Pure functions over a snapshot of one pool's loans and holds. Positions are
//! ordered strictly by hold start; availability estimates assume every patron
//! keeps their reservation and their loan for the maximum allowed time, so they
//! are never optimistic.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Hold, LendingPeriods, Loan};

/// A loan occupying a license slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoanSlot {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// A hold still competing for a license
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedHold {
    pub id: Uuid,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub position: i32,
}

/// Everything the calculator needs to know about a pool
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSnapshot {
    pub licenses_owned: i32,
    /// Ordered by start
    pub current_loans: Vec<LoanSlot>,
    /// Holds in contention, ordered by start
    pub current_holds: Vec<QueuedHold>,
}

impl QueueSnapshot {
    /// Build a snapshot from counted loans and all holds on the pool
    pub fn new<'a, L, H>(licenses_owned: i32, loans: L, holds: H, now: DateTime<Utc>) -> Self
    where
        L: IntoIterator<Item = &'a Loan>,
        H: IntoIterator<Item = &'a Hold>,
    {
        let mut current_loans: Vec<LoanSlot> = loans
            .into_iter()
            .filter(|l| l.is_active_at(now))
            .map(|l| LoanSlot { start: l.start, end: l.end })
            .collect();
        // Provisional loans have no start yet; they sort last
        current_loans.sort_by_key(|l| (l.start.is_none(), l.start));

        let mut current_holds: Vec<QueuedHold> = holds
            .into_iter()
            .filter(|h| h.is_in_contention(now))
            .map(|h| QueuedHold {
                id: h.id,
                start: h.start,
                end: h.end,
                position: h.position,
            })
            .collect();
        current_holds.sort_by_key(|h| (h.start, h.id));

        Self {
            licenses_owned,
            current_loans,
            current_holds,
        }
    }

    pub fn loans_count(&self) -> usize {
        self.current_loans.len()
    }

    /// Licenses not on loan
    pub fn remaining_licenses(&self) -> i64 {
        self.licenses_owned as i64 - self.loans_count() as i64
    }

    /// Licenses currently held for the front of the queue
    pub fn licenses_reserved(&self) -> i64 {
        self.remaining_licenses()
            .min(self.current_holds.len() as i64)
            .max(0)
    }
}

/// Result of recomputing a hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoldTransition {
    pub previous_position: i32,
    pub position: i32,
    /// The hold just became ready to borrow
    pub promoted: bool,
}

/// Count contending holds that started strictly before `start`
pub fn count_holds_before(start: DateTime<Utc>, holds: &[QueuedHold]) -> usize {
    holds.iter().filter(|h| h.start < start).count()
}

/// Queue position from raw counts: 0 when a license is free for this hold
pub fn position_for(licenses_owned: i32, loans_count: usize, holds_before: usize) -> i32 {
    let remaining = licenses_owned as i64 - loans_count as i64;
    if remaining > holds_before as i64 {
        0
    } else {
        // Add 1 since position 0 means ready
        holds_before as i32 + 1
    }
}

/// Queue position of `hold` within the snapshot
pub fn position_of(hold: &Hold, snapshot: &QueueSnapshot) -> i32 {
    let holds_before = count_holds_before(hold.start, &snapshot.current_holds);
    position_for(snapshot.licenses_owned, snapshot.loans_count(), holds_before)
}

/// Worst-case date at which `hold` can borrow (or must borrow by, when ready).
///
/// `hold` carries the position and end date from before this update;
/// `position` is the freshly computed one.
pub fn estimated_end_date(
    hold: &Hold,
    position: i32,
    snapshot: &QueueSnapshot,
    periods: LendingPeriods,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if position == 0 {
        // Already reserved with a deadline: leave it alone
        if hold.position == 0 && hold.end.is_some() {
            return hold.end;
        }
        // Freshly available: the reservation window starts now
        return Some(now + periods.reservation);
    }

    let owned = snapshot.licenses_owned as i64;
    if owned <= 0 {
        return None;
    }

    let reserved = snapshot.licenses_reserved();
    let current_reservations = &snapshot.current_holds[..reserved as usize];

    // Holds ahead of this one that are not already holding a reservation
    let offset = (position as i64 - reserved - 1).max(0);
    // Full cycles every license must go through before reaching this hold
    let cycles = offset / owned;
    // Which license this hold will eventually get
    let copy_index = (offset % owned) as usize;

    let loans = &snapshot.current_loans;
    let first_cycle_end = if copy_index < loans.len() {
        let loan = loans[copy_index];
        loan.end
            .unwrap_or_else(|| loan.start.unwrap_or(now) + periods.loan)
    } else {
        let reservation_end = current_reservations
            .get(copy_index - loans.len())
            .and_then(|r| r.end)
            .unwrap_or(now + periods.reservation);
        reservation_end + periods.loan
    };

    Some(first_cycle_end + periods.cycle() * cycles as i32)
}

/// Recompute position then end date of `hold` in place
pub fn update_hold(
    hold: &mut Hold,
    snapshot: &QueueSnapshot,
    periods: LendingPeriods,
    now: DateTime<Utc>,
) -> HoldTransition {
    let previous_position = hold.position;
    let position = position_of(hold, snapshot);
    let end = estimated_end_date(hold, position, snapshot, periods, now);

    hold.position = position;
    hold.end = end;

    HoldTransition {
        previous_position,
        position,
        promoted: position == 0 && previous_position != 0,
    }
}
