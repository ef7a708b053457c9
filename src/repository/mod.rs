//! Repository layer: locked access to one pool's ledger

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    error::AppResult,
    models::Loan,
    services::{ledger::PoolLedger, passphrase::PatronPassphrase},
};

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

/// What a unit of work locks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockScope {
    pub pool_id: i32,
    /// Serializes all of one patron's decisions when set
    pub patron_id: Option<i32>,
    /// Instant used to decide which of the patron's loans still count
    pub as_of: DateTime<Utc>,
}

impl LockScope {
    pub fn pool(pool_id: i32, as_of: DateTime<Utc>) -> Self {
        Self {
            pool_id,
            patron_id: None,
            as_of,
        }
    }

    pub fn patron(pool_id: i32, patron_id: i32, as_of: DateTime<Utc>) -> Self {
        Self {
            pool_id,
            patron_id: Some(patron_id),
            as_of,
        }
    }
}

/// A patron's loans and holds on the collection's other pools
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatronUsage {
    /// Unexpired, dated loans on licensed pools, plus in-flight checkouts
    pub loans: i32,
    pub holds: i32,
}

/// State handed to a unit of work
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerView {
    pub ledger: PoolLedger,
    /// Present when the scope names a patron
    pub usage: Option<PatronUsage>,
}

/// Transactional store for pool ledgers.
///
/// `with_pool` runs `f` with the pool row locked (and the patron, when the
/// scope names one). Changes `f` makes to the ledger are persisted only when it
/// returns `Ok`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn with_pool<T, F>(&self, scope: LockScope, f: F) -> AppResult<T>
    where
        T: Send,
        F: FnOnce(&mut LedgerView) -> AppResult<T> + Send;

    /// Cheap connectivity check for readiness probes
    async fn ping(&self) -> AppResult<()>;

    /// The patron's passphrase, created on first use
    async fn patron_secret(&self, patron_id: i32) -> AppResult<PatronPassphrase>;

    async fn find_loan(&self, loan_id: Uuid) -> AppResult<Option<Loan>>;

    /// Pools in the collection where the patron has a loan or hold
    async fn patron_pools(&self, patron_id: i32, collection_id: i32) -> AppResult<Vec<i32>>;

    /// Pools holding a reservation whose window closed before `as_of`
    async fn pools_with_lapsed_reservations(&self, as_of: DateTime<Utc>) -> AppResult<Vec<i32>>;

    /// Pools with a provisional loan created before `created_before`
    async fn pools_with_stale_provisional_loans(
        &self,
        created_before: DateTime<Utc>,
    ) -> AppResult<Vec<i32>>;
}
