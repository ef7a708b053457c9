//! In-memory ledger store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{LedgerStore, LedgerView, LockScope, PatronUsage};
use crate::{
    error::{AppError, AppResult},
    models::{CollectionSettings, DeliveryMechanism, Hold, License, LicensePool, Loan},
    services::{ledger::PoolLedger, passphrase::PatronPassphrase},
};

#[derive(Debug, Default)]
struct MemoryState {
    collections: HashMap<i32, CollectionSettings>,
    pools: HashMap<i32, LicensePool>,
    mechanisms: HashMap<i32, Vec<DeliveryMechanism>>,
    licenses: Vec<License>,
    loans: Vec<Loan>,
    holds: Vec<Hold>,
    secrets: HashMap<i32, PatronPassphrase>,
}

impl MemoryState {
    fn load(&self, pool_id: i32) -> AppResult<PoolLedger> {
        let pool = self
            .pools
            .get(&pool_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("License pool {} not found", pool_id)))?;
        let collection = self
            .collections
            .get(&pool.collection_id)
            .cloned()
            .ok_or_else(|| {
                AppError::NotFound(format!("Collection {} not found", pool.collection_id))
            })?;

        Ok(PoolLedger {
            collection,
            licenses: self
                .licenses
                .iter()
                .filter(|l| l.license_pool_id == pool_id)
                .cloned()
                .collect(),
            loans: self
                .loans
                .iter()
                .filter(|l| l.license_pool_id == pool_id)
                .cloned()
                .collect(),
            holds: self
                .holds
                .iter()
                .filter(|h| h.license_pool_id == pool_id)
                .cloned()
                .collect(),
            delivery_mechanisms: self.mechanisms.get(&pool_id).cloned().unwrap_or_default(),
            pool,
        })
    }

    fn usage(&self, scope: &LockScope, patron_id: i32, collection_id: i32) -> PatronUsage {
        let in_scope = |pool_id: i32| {
            pool_id != scope.pool_id
                && self
                    .pools
                    .get(&pool_id)
                    .map(|p| p.collection_id == collection_id)
                    .unwrap_or(false)
        };
        PatronUsage {
            loans: self
                .loans
                .iter()
                .filter(|l| l.patron_id == patron_id && in_scope(l.license_pool_id))
                .filter(|l| l.counts_toward_limit(scope.as_of))
                .count() as i32,
            holds: self
                .holds
                .iter()
                .filter(|h| h.patron_id == patron_id && in_scope(h.license_pool_id))
                .count() as i32,
        }
    }

    fn store(&mut self, ledger: PoolLedger) {
        let pool_id = ledger.pool.id;
        self.licenses.retain(|l| l.license_pool_id != pool_id);
        self.licenses.extend(ledger.licenses);
        self.loans.retain(|l| l.license_pool_id != pool_id);
        self.loans.extend(ledger.loans);
        self.holds.retain(|h| h.license_pool_id != pool_id);
        self.holds.extend(ledger.holds);
        self.pools.insert(pool_id, ledger.pool);
    }
}

/// Mutex-guarded ledger store. Every unit of work is serialized.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    state: Mutex<MemoryState>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_collection(&self, collection: CollectionSettings) {
        let mut state = self.state.lock().await;
        state.collections.insert(collection.id, collection);
    }

    pub async fn add_pool(&self, pool: LicensePool, mechanisms: Vec<DeliveryMechanism>) {
        let mut state = self.state.lock().await;
        state.mechanisms.insert(pool.id, mechanisms);
        state.pools.insert(pool.id, pool);
    }

    pub async fn add_license(&self, license: License) {
        self.state.lock().await.licenses.push(license);
    }

    pub async fn insert_loan(&self, loan: Loan) {
        self.state.lock().await.loans.push(loan);
    }

    pub async fn insert_hold(&self, hold: Hold) {
        self.state.lock().await.holds.push(hold);
    }

    pub async fn pool(&self, pool_id: i32) -> Option<LicensePool> {
        self.state.lock().await.pools.get(&pool_id).cloned()
    }

    pub async fn license(&self, license_id: i32) -> Option<License> {
        let state = self.state.lock().await;
        state.licenses.iter().find(|l| l.id == license_id).cloned()
    }

    pub async fn loans(&self) -> Vec<Loan> {
        self.state.lock().await.loans.clone()
    }

    pub async fn holds(&self) -> Vec<Hold> {
        self.state.lock().await.holds.clone()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn with_pool<T, F>(&self, scope: LockScope, f: F) -> AppResult<T>
    where
        T: Send,
        F: FnOnce(&mut LedgerView) -> AppResult<T> + Send,
    {
        let mut state = self.state.lock().await;
        let ledger = state.load(scope.pool_id)?;
        let usage = scope
            .patron_id
            .map(|patron_id| state.usage(&scope, patron_id, ledger.pool.collection_id));

        let mut view = LedgerView { ledger, usage };
        let value = f(&mut view)?;
        state.store(view.ledger);
        Ok(value)
    }

    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }

    async fn patron_secret(&self, patron_id: i32) -> AppResult<PatronPassphrase> {
        let mut state = self.state.lock().await;
        Ok(state
            .secrets
            .entry(patron_id)
            .or_insert_with(PatronPassphrase::generate)
            .clone())
    }

    async fn find_loan(&self, loan_id: Uuid) -> AppResult<Option<Loan>> {
        let state = self.state.lock().await;
        Ok(state.loans.iter().find(|l| l.id == loan_id).cloned())
    }

    async fn patron_pools(&self, patron_id: i32, collection_id: i32) -> AppResult<Vec<i32>> {
        let state = self.state.lock().await;
        let in_collection = |pool_id: &i32| {
            state
                .pools
                .get(pool_id)
                .map(|p| p.collection_id == collection_id)
                .unwrap_or(false)
        };
        let pools: BTreeSet<i32> = state
            .loans
            .iter()
            .filter(|l| l.patron_id == patron_id)
            .map(|l| l.license_pool_id)
            .chain(
                state
                    .holds
                    .iter()
                    .filter(|h| h.patron_id == patron_id)
                    .map(|h| h.license_pool_id),
            )
            .filter(in_collection)
            .collect();
        Ok(pools.into_iter().collect())
    }

    async fn pools_with_lapsed_reservations(&self, as_of: DateTime<Utc>) -> AppResult<Vec<i32>> {
        let state = self.state.lock().await;
        let pools: BTreeSet<i32> = state
            .holds
            .iter()
            .filter(|h| h.is_lapsed_reservation(as_of))
            .map(|h| h.license_pool_id)
            .collect();
        Ok(pools.into_iter().collect())
    }

    async fn pools_with_stale_provisional_loans(
        &self,
        created_before: DateTime<Utc>,
    ) -> AppResult<Vec<i32>> {
        let state = self.state.lock().await;
        let pools: BTreeSet<i32> = state
            .loans
            .iter()
            .filter(|l| l.is_provisional() && l.created_at < created_before)
            .map(|l| l.license_pool_id)
            .collect();
        Ok(pools.into_iter().collect())
    }
}
