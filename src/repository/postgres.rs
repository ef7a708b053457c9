//! Postgres ledger store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Pool, Postgres, Row, Transaction};
use uuid::Uuid;

use super::{LedgerStore, LedgerView, LockScope, PatronUsage};
use crate::{
    error::{AppError, AppResult},
    models::{
        delivery::DeliveryMechanismRow, CollectionSettings, DeliveryMechanism, Hold, License,
        LicensePool, Loan, PoolAccess,
    },
    services::{
        ledger::{LedgerChanges, PoolLedger},
        passphrase::{hash_secret, PatronPassphrase},
    },
};

/// First key of the per-patron advisory lock
const PATRON_LOCK_CLASS: i32 = 0x0D1C;

const LICENSE_COLUMNS: &str = "id, license_pool_id, identifier, checkout_url, status_url, \
     terms_concurrency, checkouts_left, expires, is_inactive, content_types";
const LOAN_COLUMNS: &str = "id, patron_id, license_pool_id, license_id, start_date, end_date, \
     external_identifier, created_at";
const HOLD_COLUMNS: &str =
    "id, patron_id, license_pool_id, start_date, end_date, position, notify_email";

#[derive(Clone)]
pub struct PgLedgerStore {
    pool: Pool<Postgres>,
}

impl PgLedgerStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Lock and read the pool row
    async fn lock_pool(
        tx: &mut Transaction<'static, Postgres>,
        pool_id: i32,
    ) -> AppResult<LicensePool> {
        let row = sqlx::query(
            r#"
            SELECT id, collection_id, identifier, access_kind, licenses_owned,
                   licenses_available, licenses_reserved, patrons_in_hold_queue,
                   last_refreshed
            FROM license_pools
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(pool_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("License pool {} not found", pool_id)))?;

        pool_from_row(&row)
    }

    async fn load_ledger(
        tx: &mut Transaction<'static, Postgres>,
        pool: LicensePool,
    ) -> AppResult<PoolLedger> {
        let collection =
            sqlx::query_as::<_, CollectionSettings>("SELECT * FROM collections WHERE id = $1")
                .bind(pool.collection_id)
                .fetch_optional(&mut **tx)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!("Collection {} not found", pool.collection_id))
                })?;

        let licenses = sqlx::query_as::<_, License>(&format!(
            "SELECT {} FROM licenses WHERE license_pool_id = $1 ORDER BY id",
            LICENSE_COLUMNS
        ))
        .bind(pool.id)
        .fetch_all(&mut **tx)
        .await?;

        let loans = sqlx::query_as::<_, Loan>(&format!(
            "SELECT {} FROM loans WHERE license_pool_id = $1 ORDER BY created_at, id",
            LOAN_COLUMNS
        ))
        .bind(pool.id)
        .fetch_all(&mut **tx)
        .await?;

        let holds = sqlx::query_as::<_, Hold>(&format!(
            "SELECT {} FROM holds WHERE license_pool_id = $1 ORDER BY start_date, id",
            HOLD_COLUMNS
        ))
        .bind(pool.id)
        .fetch_all(&mut **tx)
        .await?;

        let delivery_mechanisms = sqlx::query_as::<_, DeliveryMechanismRow>(
            "SELECT * FROM pool_delivery_mechanisms WHERE license_pool_id = $1 ORDER BY id",
        )
        .bind(pool.id)
        .fetch_all(&mut **tx)
        .await?
        .into_iter()
        .map(DeliveryMechanism::from)
        .collect();

        Ok(PoolLedger {
            pool,
            collection,
            licenses,
            loans,
            holds,
            delivery_mechanisms,
        })
    }

    async fn load_usage(
        tx: &mut Transaction<'static, Postgres>,
        scope: &LockScope,
        patron_id: i32,
        collection_id: i32,
    ) -> AppResult<PatronUsage> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*)
                 FROM loans l JOIN license_pools p ON p.id = l.license_pool_id
                 WHERE l.patron_id = $1 AND p.collection_id = $2 AND p.id <> $3
                   AND l.license_id IS NOT NULL
                   AND (l.end_date IS NULL OR l.end_date > $4)) AS loans,
                (SELECT COUNT(*)
                 FROM holds h JOIN license_pools p ON p.id = h.license_pool_id
                 WHERE h.patron_id = $1 AND p.collection_id = $2 AND p.id <> $3) AS holds
            "#,
        )
        .bind(patron_id)
        .bind(collection_id)
        .bind(scope.pool_id)
        .bind(scope.as_of)
        .fetch_one(&mut **tx)
        .await?;

        Ok(PatronUsage {
            loans: row.get::<i64, _>("loans") as i32,
            holds: row.get::<i64, _>("holds") as i32,
        })
    }

    /// Write a ledger diff back
    async fn apply(tx: &mut Transaction<'static, Postgres>, changes: LedgerChanges) -> AppResult<()> {
        if !changes.deleted_loans.is_empty() {
            sqlx::query("DELETE FROM loans WHERE id = ANY($1)")
                .bind(&changes.deleted_loans)
                .execute(&mut **tx)
                .await?;
        }
        if !changes.deleted_holds.is_empty() {
            sqlx::query("DELETE FROM holds WHERE id = ANY($1)")
                .bind(&changes.deleted_holds)
                .execute(&mut **tx)
                .await?;
        }

        for license in &changes.licenses {
            sqlx::query("UPDATE licenses SET checkouts_left = $2, is_inactive = $3 WHERE id = $1")
                .bind(license.id)
                .bind(license.checkouts_left)
                .bind(license.is_inactive)
                .execute(&mut **tx)
                .await?;
        }

        for loan in &changes.upserted_loans {
            sqlx::query(
                r#"
                INSERT INTO loans (id, patron_id, license_pool_id, license_id, start_date,
                                   end_date, external_identifier, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (id) DO UPDATE SET
                    license_id = EXCLUDED.license_id,
                    start_date = EXCLUDED.start_date,
                    end_date = EXCLUDED.end_date,
                    external_identifier = EXCLUDED.external_identifier
                "#,
            )
            .bind(loan.id)
            .bind(loan.patron_id)
            .bind(loan.license_pool_id)
            .bind(loan.license_id)
            .bind(loan.start)
            .bind(loan.end)
            .bind(&loan.external_identifier)
            .bind(loan.created_at)
            .execute(&mut **tx)
            .await?;
        }

        for hold in &changes.upserted_holds {
            sqlx::query(
                r#"
                INSERT INTO holds (id, patron_id, license_pool_id, start_date, end_date,
                                   position, notify_email)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (id) DO UPDATE SET
                    start_date = EXCLUDED.start_date,
                    end_date = EXCLUDED.end_date,
                    position = EXCLUDED.position,
                    notify_email = EXCLUDED.notify_email
                "#,
            )
            .bind(hold.id)
            .bind(hold.patron_id)
            .bind(hold.license_pool_id)
            .bind(hold.start)
            .bind(hold.end)
            .bind(hold.position)
            .bind(&hold.notify_email)
            .execute(&mut **tx)
            .await?;
        }

        if let Some(pool) = &changes.pool {
            sqlx::query(
                r#"
                UPDATE license_pools SET
                    licenses_owned = $2,
                    licenses_available = $3,
                    licenses_reserved = $4,
                    patrons_in_hold_queue = $5,
                    last_refreshed = $6
                WHERE id = $1
                "#,
            )
            .bind(pool.id)
            .bind(pool.licenses_owned)
            .bind(pool.licenses_available)
            .bind(pool.licenses_reserved)
            .bind(pool.patrons_in_hold_queue)
            .bind(pool.last_refreshed)
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }
}

fn pool_from_row(row: &PgRow) -> AppResult<LicensePool> {
    let access: String = row.get("access_kind");
    Ok(LicensePool {
        id: row.get("id"),
        collection_id: row.get("collection_id"),
        identifier: row.get("identifier"),
        access: access.parse::<PoolAccess>()?,
        licenses_owned: row.get("licenses_owned"),
        licenses_available: row.get("licenses_available"),
        licenses_reserved: row.get("licenses_reserved"),
        patrons_in_hold_queue: row.get("patrons_in_hold_queue"),
        last_refreshed: row.get("last_refreshed"),
    })
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn with_pool<T, F>(&self, scope: LockScope, f: F) -> AppResult<T>
    where
        T: Send,
        F: FnOnce(&mut LedgerView) -> AppResult<T> + Send,
    {
        let mut tx = self.pool.begin().await?;

        // Patron lock first, then the pool row, always in that order
        if let Some(patron_id) = scope.patron_id {
            sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
                .bind(PATRON_LOCK_CLASS)
                .bind(patron_id)
                .execute(&mut *tx)
                .await?;
        }

        let pool = Self::lock_pool(&mut tx, scope.pool_id).await?;
        let ledger = Self::load_ledger(&mut tx, pool).await?;
        let usage = match scope.patron_id {
            Some(patron_id) => Some(
                Self::load_usage(&mut tx, &scope, patron_id, ledger.pool.collection_id).await?,
            ),
            None => None,
        };

        let before = ledger.clone();
        let mut view = LedgerView { ledger, usage };
        // Dropping the transaction on error rolls it back
        let value = f(&mut view)?;

        let changes = LedgerChanges::between(&before, &view.ledger);
        if !changes.is_empty() {
            Self::apply(&mut tx, changes).await?;
        }
        tx.commit().await?;

        Ok(value)
    }

    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn patron_secret(&self, patron_id: i32) -> AppResult<PatronPassphrase> {
        let fresh = PatronPassphrase::generate();
        sqlx::query(
            r#"
            INSERT INTO patron_credentials (patron_id, passphrase, hashed_passphrase)
            VALUES ($1, $2, $3)
            ON CONFLICT (patron_id) DO NOTHING
            "#,
        )
        .bind(patron_id)
        .bind(&fresh.secret)
        .bind(&fresh.hashed)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT passphrase, hashed_passphrase FROM patron_credentials WHERE patron_id = $1",
        )
        .bind(patron_id)
        .fetch_one(&self.pool)
        .await?;

        let secret: String = row.get("passphrase");
        let hashed: Option<String> = row.get("hashed_passphrase");
        let hashed = hashed.unwrap_or_else(|| hash_secret(&secret));
        Ok(PatronPassphrase { secret, hashed })
    }

    async fn find_loan(&self, loan_id: Uuid) -> AppResult<Option<Loan>> {
        let loan = sqlx::query_as::<_, Loan>(&format!(
            "SELECT {} FROM loans WHERE id = $1",
            LOAN_COLUMNS
        ))
        .bind(loan_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(loan)
    }

    async fn patron_pools(&self, patron_id: i32, collection_id: i32) -> AppResult<Vec<i32>> {
        let rows = sqlx::query(
            r#"
            SELECT p.id
            FROM license_pools p
            WHERE p.collection_id = $2
              AND (EXISTS (SELECT 1 FROM loans l WHERE l.license_pool_id = p.id AND l.patron_id = $1)
                   OR EXISTS (SELECT 1 FROM holds h WHERE h.license_pool_id = p.id AND h.patron_id = $1))
            ORDER BY p.id
            "#,
        )
        .bind(patron_id)
        .bind(collection_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    async fn pools_with_lapsed_reservations(&self, as_of: DateTime<Utc>) -> AppResult<Vec<i32>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT license_pool_id
            FROM holds
            WHERE position = 0 AND end_date < $1
            ORDER BY license_pool_id
            "#,
        )
        .bind(as_of)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get("license_pool_id")).collect())
    }

    async fn pools_with_stale_provisional_loans(
        &self,
        created_before: DateTime<Utc>,
    ) -> AppResult<Vec<i32>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT license_pool_id
            FROM loans
            WHERE license_id IS NOT NULL
              AND external_identifier IS NULL
              AND created_at < $1
            ORDER BY license_pool_id
            "#,
        )
        .bind(created_before)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get("license_pool_id")).collect())
    }
}
