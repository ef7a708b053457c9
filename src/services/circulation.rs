//! Circulation orchestrator: checkout, fulfillment, checkin, holds and
//! reconciliation against the distributor.
//!
//! Every decide-then-write step runs inside `LedgerStore::with_pool`. Remote
//! calls happen outside the lock: a checkout first commits a provisional loan
//! that already occupies its license slot, then confirms it with the
//! distributor, then either finalizes or deletes it.

use chrono::{DateTime, Duration, Utc};
use std::{collections::HashSet, sync::Arc};
use uuid::Uuid;

use crate::{
    config::{CirculationConfig, DistributorConfig},
    error::{AppError, AppResult, CirculationFailure},
    models::{
        DeliveryMechanism, Fulfillment, FulfillmentStrategy, Hold, HoldInfo, Loan, LoanInfo,
        PatronActivity, PoolAvailability, PoolAccess, StatusDocument,
    },
    repository::{LedgerStore, LockScope},
    services::{
        ledger::{HoldPromotion, PoolLedger},
        notifier::{HoldNotifier, NoopNotifier},
        providers::{Clock, RandomUuids, SystemClock, UuidSource},
        status_document::{terminate, CheckoutRequest, StatusDocumentApi, StatusRequest},
    },
};

/// What the locked part of a checkout decided
enum CheckoutPlan {
    /// No remote call needed
    Complete(LoanInfo),
    /// A provisional loan was committed; confirm it remotely
    Remote {
        license_id: i32,
        license_identifier: String,
        template: String,
        loan_period: Duration,
    },
}

/// What the locked part of a checkin decided
enum CheckinPlan {
    Complete,
    Remote { loan_id: Uuid, url: String },
}

/// The loan being fulfilled and how
struct FulfillmentPlan {
    loan: Loan,
    access: PoolAccess,
    mechanism: DeliveryMechanism,
}

pub struct CirculationService<S, D> {
    store: Arc<S>,
    distributor: Arc<D>,
    notifier: Arc<dyn HoldNotifier>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn UuidSource>,
    config: DistributorConfig,
    provisional_loan_ttl: Duration,
}

impl<S, D> Clone for CirculationService<S, D> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            distributor: self.distributor.clone(),
            notifier: self.notifier.clone(),
            clock: self.clock.clone(),
            ids: self.ids.clone(),
            config: self.config.clone(),
            provisional_loan_ttl: self.provisional_loan_ttl,
        }
    }
}

impl<S, D> CirculationService<S, D>
where
    S: LedgerStore,
    D: StatusDocumentApi,
{
    pub fn new(
        store: Arc<S>,
        distributor: Arc<D>,
        config: DistributorConfig,
        circulation: &CirculationConfig,
    ) -> Self {
        Self {
            store,
            distributor,
            notifier: Arc::new(NoopNotifier),
            clock: Arc::new(SystemClock),
            ids: Arc::new(RandomUuids),
            config,
            provisional_loan_ttl: Duration::seconds(circulation.provisional_loan_ttl_seconds),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn HoldNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_ids(mut self, ids: Arc<dyn UuidSource>) -> Self {
        self.ids = ids;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Borrow a title
    pub async fn checkout(
        &self,
        patron_id: i32,
        pool_id: i32,
        mechanism: &DeliveryMechanism,
    ) -> AppResult<LoanInfo> {
        let now = self.clock.now();
        let loan_id = self.ids.next_uuid();
        let requested = mechanism.clone();

        let (plan, promotions) = self
            .store
            .with_pool(LockScope::patron(pool_id, patron_id, now), move |view| {
                let limit = view.ledger.collection.effective_loan_limit();
                let loans_elsewhere = view.usage.map(|u| u.loans).unwrap_or(0);
                plan_checkout(
                    &mut view.ledger,
                    patron_id,
                    loan_id,
                    &requested,
                    limit,
                    loans_elsewhere,
                    now,
                )
            })
            .await?;
        self.notify(promotions).await;

        let (license_id, license_identifier, template, loan_period) = match plan {
            CheckoutPlan::Complete(info) => {
                tracing::info!("Patron {} borrowed unlimited pool {}", patron_id, pool_id);
                return Ok(info);
            }
            CheckoutPlan::Remote {
                license_id,
                license_identifier,
                template,
                loan_period,
            } => (license_id, license_identifier, template, loan_period),
        };

        tracing::debug!(
            "Provisional loan {} on license {} for patron {}",
            loan_id,
            license_identifier,
            patron_id
        );
        let remote = self
            .create_remote_loan(patron_id, loan_id, license_identifier, template, now + loan_period)
            .await;

        let now = self.clock.now();
        let (result, promotions) = self
            .store
            .with_pool(LockScope::patron(pool_id, patron_id, now), move |view| {
                finish_checkout(&mut view.ledger, patron_id, loan_id, license_id, remote, now)
            })
            .await?;
        self.notify(promotions).await;

        if result.is_ok() {
            tracing::info!(
                "Patron {} checked out pool {} (loan {})",
                patron_id,
                pool_id,
                loan_id
            );
        }
        result
    }

    async fn create_remote_loan(
        &self,
        patron_id: i32,
        loan_id: Uuid,
        license_identifier: String,
        template: String,
        expires: DateTime<Utc>,
    ) -> AppResult<StatusDocument> {
        let passphrase = self.store.patron_secret(patron_id).await?.encoded()?;
        let request = StatusRequest::Checkout(CheckoutRequest {
            template,
            license_identifier,
            checkout_id: self.ids.next_uuid(),
            patron_correlation_id: self.ids.next_uuid(),
            expires,
            notification_url: self.config.notification_url(loan_id),
            passphrase,
            hint: self.config.passphrase_hint.clone(),
            hint_url: self.config.passphrase_hint_url.clone(),
        });
        self.distributor.fetch_or_create(&request).await
    }

    /// Get delivery instructions for a loan
    pub async fn fulfill(
        &self,
        patron_id: i32,
        pool_id: i32,
        mechanism: &DeliveryMechanism,
    ) -> AppResult<Fulfillment> {
        let now = self.clock.now();
        let requested = mechanism.clone();

        let plan = self
            .store
            .with_pool(LockScope::patron(pool_id, patron_id, now), move |view| {
                let ledger = &view.ledger;
                let loan = ledger
                    .loan_for(patron_id)
                    .filter(|l| !l.is_provisional())
                    .cloned()
                    .ok_or(CirculationFailure::NotCheckedOut)?;
                let mechanism = ledger
                    .mechanism_like(&requested)
                    .cloned()
                    .ok_or(CirculationFailure::FormatNotAvailable)?;
                Ok(FulfillmentPlan {
                    loan,
                    access: ledger.pool.access,
                    mechanism,
                })
            })
            .await?;

        let strategy = FulfillmentStrategy::select(plan.access, &plan.mechanism);
        match strategy {
            FulfillmentStrategy::OpenAccessRedirect => {
                let url = plan
                    .mechanism
                    .resource_url
                    .ok_or(CirculationFailure::FormatNotAvailable)?;
                return Ok(Fulfillment::Redirect {
                    url,
                    content_type: plan.mechanism.content_type,
                });
            }
            FulfillmentStrategy::BearerToken => {
                let location = plan
                    .mechanism
                    .resource_url
                    .ok_or(CirculationFailure::FormatNotAvailable)?;
                return Ok(Fulfillment::BearerToken { location });
            }
            _ => {}
        }

        let url = plan
            .loan
            .external_identifier
            .clone()
            .ok_or(CirculationFailure::NotCheckedOut)?;
        let document = self
            .distributor
            .fetch_or_create(&StatusRequest::Existing { url })
            .await?;
        if document.status.is_terminal() {
            self.update_loan(plan.loan.id, &document).await?;
            return Err(CirculationFailure::CannotFulfill.into());
        }

        let (rel, media_type) = strategy
            .status_link()
            .ok_or(CirculationFailure::FormatNotAvailable)?;
        let link = match media_type {
            Some(media_type) => document.link_of_type(rel, media_type),
            None => document.link(rel),
        }
        .ok_or(CirculationFailure::FormatNotAvailable)?;

        tracing::debug!("Fulfilling loan {} via {} link", plan.loan.id, rel);
        Ok(match strategy {
            FulfillmentStrategy::PublicationLink { .. } => Fulfillment::Redirect {
                url: link.href.clone(),
                content_type: link.media_type.clone(),
            },
            _ => Fulfillment::Fetch {
                url: link.href.clone(),
                content_type: link.media_type.clone(),
                expires: plan.loan.end,
            },
        })
    }

    /// Return a loan early.
    ///
    /// `Ok(true)` once the distributor confirms the return; `Ok(false)` when
    /// the return is left to the DRM system and the loan stays in place.
    pub async fn checkin(&self, patron_id: i32, pool_id: i32) -> AppResult<bool> {
        let now = self.clock.now();

        let (plan, promotions) = self
            .store
            .with_pool(LockScope::patron(pool_id, patron_id, now), move |view| {
                let ledger = &mut view.ledger;
                let loan = ledger
                    .loan_for(patron_id)
                    .cloned()
                    .ok_or(CirculationFailure::NotCheckedOut)?;

                if ledger.pool.access.is_unlimited() {
                    ledger.remove_loan(loan.id);
                    let promotions = ledger.refresh_and_cascade(now)?;
                    return Ok((CheckinPlan::Complete, promotions));
                }

                let url = loan
                    .external_identifier
                    .clone()
                    .ok_or(CirculationFailure::NotCheckedOut)?;
                Ok((CheckinPlan::Remote { loan_id: loan.id, url }, Vec::new()))
            })
            .await?;
        self.notify(promotions).await;

        let (loan_id, url) = match plan {
            CheckinPlan::Complete => return Ok(true),
            CheckinPlan::Remote { loan_id, url } => (loan_id, url),
        };

        let request = StatusRequest::Existing { url };
        let document = self.distributor.fetch_or_create(&request).await?;
        if document.status.is_terminal() {
            // Already returned, revoked or expired remotely
            self.update_loan(loan_id, &document).await?;
            return Err(CirculationFailure::NotCheckedOut.into());
        }

        let Some(return_url) = terminate(&document) else {
            tracing::debug!("Loan {} has no return link, leaving it to the DRM", loan_id);
            return Ok(false);
        };

        self.distributor.request_return(&return_url).await?;
        let document = self.distributor.fetch_or_create(&request).await?;
        let removed = self.update_loan(loan_id, &document).await?;
        if removed {
            tracing::info!("Patron {} returned pool {}", patron_id, pool_id);
        }
        Ok(removed)
    }

    /// Join the wait queue for a title
    pub async fn place_hold(
        &self,
        patron_id: i32,
        pool_id: i32,
        notify_email: Option<String>,
    ) -> AppResult<HoldInfo> {
        let now = self.clock.now();
        let hold_id = self.ids.next_uuid();

        let (info, promotions) = self
            .store
            .with_pool(LockScope::patron(pool_id, patron_id, now), move |view| {
                let holds_elsewhere = view.usage.map(|u| u.holds).unwrap_or(0);
                let ledger = &mut view.ledger;

                if ledger.pool.access.is_unlimited() {
                    return Err(CirculationFailure::HoldOnUnlimitedAccess.into());
                }
                if ledger.hold_for(patron_id).is_some() {
                    return Err(CirculationFailure::AlreadyOnHold.into());
                }
                if ledger.loan_for(patron_id).is_some() {
                    return Err(CirculationFailure::AlreadyCheckedOut.into());
                }
                match ledger.collection.hold_limit {
                    Some(0) => return Err(CirculationFailure::HoldsNotPermitted.into()),
                    Some(limit) if holds_elsewhere >= limit => {
                        return Err(CirculationFailure::PatronHoldLimitReached { limit }.into())
                    }
                    _ => {}
                }

                let promotions = ledger.refresh_and_cascade(now)?;
                if ledger.pool.licenses_available > 0 {
                    return Err(CirculationFailure::CurrentlyAvailable.into());
                }

                ledger.holds.push(Hold {
                    id: hold_id,
                    patron_id,
                    license_pool_id: ledger.pool.id,
                    start: now,
                    end: None,
                    position: 0,
                    notify_email,
                });
                ledger.update_hold(hold_id, now);
                ledger.refresh(now)?;

                let hold = ledger
                    .holds
                    .iter()
                    .find(|h| h.id == hold_id)
                    .ok_or_else(|| AppError::Internal(format!("Hold {} vanished", hold_id)))?;
                Ok((HoldInfo::from(hold), promotions))
            })
            .await?;
        self.notify(promotions).await;

        tracing::info!(
            "Patron {} placed hold on pool {} at position {}",
            patron_id,
            pool_id,
            info.position
        );
        Ok(info)
    }

    /// Leave the wait queue
    pub async fn release_hold(&self, patron_id: i32, pool_id: i32) -> AppResult<()> {
        let now = self.clock.now();

        let promotions = self
            .store
            .with_pool(LockScope::patron(pool_id, patron_id, now), move |view| {
                let ledger = &mut view.ledger;
                let hold_id = ledger
                    .hold_for(patron_id)
                    .map(|h| h.id)
                    .ok_or(CirculationFailure::NotOnHold)?;
                ledger.remove_hold(hold_id);
                ledger.refresh_and_cascade(now)
            })
            .await?;
        self.notify(promotions).await;

        tracing::info!("Patron {} released hold on pool {}", patron_id, pool_id);
        Ok(())
    }

    /// Re-derive a pool from its ledger, dropping lapsed reservations and
    /// checkouts that never got confirmed.
    pub async fn reconcile(&self, pool_id: i32) -> AppResult<PoolAvailability> {
        let now = self.clock.now();
        let provisional_cutoff = now - self.provisional_loan_ttl;

        let (availability, promotions) = self
            .store
            .with_pool(LockScope::pool(pool_id, now), move |view| {
                let ledger = &mut view.ledger;
                let lapsed = ledger.expire_reservations(now);
                let stale = ledger.expire_provisional_loans(provisional_cutoff);
                for hold in &lapsed {
                    tracing::info!(
                        "Reservation {} for patron {} lapsed on pool {}",
                        hold.id,
                        hold.patron_id,
                        pool_id
                    );
                }
                for loan in &stale {
                    tracing::warn!(
                        "Dropping unconfirmed checkout {} for patron {} on pool {}",
                        loan.id,
                        loan.patron_id,
                        pool_id
                    );
                }
                let promotions = ledger.refresh_and_cascade(now)?;
                Ok((PoolAvailability::from(&ledger.pool), promotions))
            })
            .await?;
        self.notify(promotions).await;

        Ok(availability)
    }

    /// Reconcile every pool with a lapsed reservation or a stale checkout.
    /// Returns the number of pools reconciled.
    pub async fn reap_expired_holds(&self) -> AppResult<usize> {
        let now = self.clock.now();
        let mut pools: Vec<i32> = self.store.pools_with_lapsed_reservations(now).await?;
        pools.extend(
            self.store
                .pools_with_stale_provisional_loans(now - self.provisional_loan_ttl)
                .await?,
        );
        let mut seen = HashSet::new();
        pools.retain(|id| seen.insert(*id));

        let mut reconciled = 0;
        for pool_id in pools {
            match self.reconcile(pool_id).await {
                Ok(_) => reconciled += 1,
                Err(e) => tracing::warn!("Failed to reconcile pool {}: {}", pool_id, e),
            }
        }
        Ok(reconciled)
    }

    /// Apply a status document to a loan. A terminal status removes the loan;
    /// anything else, or an unknown loan, is a no-op. Returns whether the loan
    /// was removed.
    pub async fn update_loan(&self, loan_id: Uuid, document: &StatusDocument) -> AppResult<bool> {
        if document.status.is_active() {
            return Ok(false);
        }
        let Some(loan) = self.store.find_loan(loan_id).await? else {
            tracing::debug!("Loan {} already gone", loan_id);
            return Ok(false);
        };

        let now = self.clock.now();
        let status = document.status;
        let (removed, promotions) = self
            .store
            .with_pool(LockScope::pool(loan.license_pool_id, now), move |view| {
                let ledger = &mut view.ledger;
                if ledger.remove_loan(loan_id).is_none() {
                    return Ok((false, Vec::new()));
                }
                let promotions = ledger.refresh_and_cascade(now)?;
                Ok((true, promotions))
            })
            .await?;
        self.notify(promotions).await;

        if removed {
            tracing::info!("Loan {} ended remotely ({})", loan_id, status.as_str());
        }
        Ok(removed)
    }

    /// The patron's current loans and holds in a collection
    pub async fn patron_activity(
        &self,
        patron_id: i32,
        collection_id: i32,
    ) -> AppResult<Vec<PatronActivity>> {
        let now = self.clock.now();
        let mut activity = Vec::new();

        for pool_id in self.store.patron_pools(patron_id, collection_id).await? {
            let (entries, promotions) = self
                .store
                .with_pool(LockScope::patron(pool_id, patron_id, now), move |view| {
                    let ledger = &mut view.ledger;
                    ledger.expire_reservations(now);
                    let promotions = ledger.refresh_and_cascade(now)?;
                    if let Some(hold_id) = ledger.hold_for(patron_id).map(|h| h.id) {
                        ledger.update_hold(hold_id, now);
                    }
                    Ok((activity_for(ledger, patron_id, now), promotions))
                })
                .await?;
            self.notify(promotions).await;
            activity.extend(entries);
        }

        Ok(activity)
    }

    async fn notify(&self, promotions: Vec<HoldPromotion>) {
        for promotion in promotions {
            if let Err(e) = self.notifier.hold_ready(&promotion).await {
                tracing::warn!(
                    "Failed to notify patron {} about hold {}: {}",
                    promotion.patron_id,
                    promotion.hold_id,
                    e
                );
            }
        }
    }
}

/// Validate a checkout and commit its provisional loan
fn plan_checkout(
    ledger: &mut PoolLedger,
    patron_id: i32,
    loan_id: Uuid,
    requested: &DeliveryMechanism,
    loan_limit: Option<i32>,
    loans_elsewhere: i32,
    now: DateTime<Utc>,
) -> AppResult<(CheckoutPlan, Vec<HoldPromotion>)> {
    if ledger.loan_for(patron_id).is_some() {
        return Err(CirculationFailure::AlreadyCheckedOut.into());
    }
    if !ledger.offers(requested) {
        return Err(CirculationFailure::FormatNotAvailable.into());
    }

    if ledger.pool.access.is_unlimited() {
        let loan = Loan {
            id: loan_id,
            patron_id,
            license_pool_id: ledger.pool.id,
            license_id: None,
            start: None,
            end: None,
            external_identifier: None,
            created_at: now,
        };
        let info = LoanInfo::from_loan(&loan, None);
        ledger.loans.push(loan);
        ledger.refresh(now)?;
        return Ok((CheckoutPlan::Complete(info), Vec::new()));
    }

    if let Some(limit) = loan_limit {
        if loans_elsewhere >= limit {
            return Err(CirculationFailure::PatronLoanLimitReached { limit }.into());
        }
    }
    if !ledger.has_active_license() {
        return Err(CirculationFailure::NoLicenses.into());
    }

    let promotions = ledger.refresh_and_cascade(now)?;
    if let Some(hold_id) = ledger.hold_for(patron_id).map(|h| h.id) {
        ledger.update_hold(hold_id, now);
    }

    // With a queue, only a ready hold may take a copy
    let has_ready_hold = ledger
        .hold_for(patron_id)
        .map(|h| h.is_ready(now))
        .unwrap_or(false);
    if !has_ready_hold && ledger.pool.licenses_available < 1 {
        return Err(CirculationFailure::NoAvailableCopies.into());
    }

    let license = ledger
        .best_available_license(now)
        .ok_or(CirculationFailure::NoAvailableCopies)?;
    let Some(template) = license.checkout_url.clone() else {
        tracing::warn!("License {} has no checkout URL", license.identifier);
        return Err(CirculationFailure::CannotLoan.into());
    };
    let plan = CheckoutPlan::Remote {
        license_id: license.id,
        license_identifier: license.identifier.clone(),
        template,
        loan_period: ledger.collection.periods().loan,
    };

    ledger.loans.push(Loan {
        id: loan_id,
        patron_id,
        license_pool_id: ledger.pool.id,
        license_id: Some(license.id),
        start: None,
        end: None,
        external_identifier: None,
        created_at: now,
    });
    ledger.refresh(now)?;

    Ok((plan, promotions))
}

/// Finalize or roll back a provisional loan once the distributor answered
fn finish_checkout(
    ledger: &mut PoolLedger,
    patron_id: i32,
    loan_id: Uuid,
    license_id: i32,
    remote: AppResult<StatusDocument>,
    now: DateTime<Utc>,
) -> AppResult<(AppResult<LoanInfo>, Vec<HoldPromotion>)> {
    let confirmed = remote.and_then(|document| {
        match document.self_href() {
            Some(href) if document.status.is_active() => {
                Ok((href.to_string(), document.potential_rights.end))
            }
            _ => {
                tracing::warn!(
                    "Distributor refused loan {} (status {})",
                    loan_id,
                    document.status.as_str()
                );
                Err(CirculationFailure::CannotLoan.into())
            }
        }
    });

    let (external_identifier, end) = match confirmed {
        Ok(confirmed) => confirmed,
        Err(e) => {
            ledger.remove_loan(loan_id);
            let promotions = ledger.refresh_and_cascade(now)?;
            return Ok((Err(e), promotions));
        }
    };

    let Some(loan) = ledger.loan_mut(loan_id) else {
        tracing::warn!("Provisional loan {} was swept before confirmation", loan_id);
        return Ok((Err(CirculationFailure::CannotLoan.into()), Vec::new()));
    };
    loan.start = Some(now);
    loan.end = end;
    loan.external_identifier = Some(external_identifier);
    let loan = loan.clone();

    let license = ledger.license_mut(license_id).ok_or_else(|| {
        AppError::Invariant(format!("Loan {} bound to missing license {}", loan_id, license_id))
    })?;
    license.checkout()?;
    let license_identifier = license.identifier.clone();

    // The hold, if any, has become this loan
    if let Some(hold_id) = ledger.hold_for(patron_id).map(|h| h.id) {
        ledger.remove_hold(hold_id);
    }
    let promotions = ledger.refresh_and_cascade(now)?;

    Ok((Ok(LoanInfo::from_loan(&loan, Some(license_identifier))), promotions))
}

fn activity_for(ledger: &PoolLedger, patron_id: i32, now: DateTime<Utc>) -> Vec<PatronActivity> {
    let mut entries = Vec::new();
    if let Some(loan) = ledger
        .loan_for(patron_id)
        .filter(|l| l.is_active_at(now) && !l.is_provisional())
    {
        let identifier = loan
            .license_id
            .and_then(|id| ledger.license(id))
            .map(|l| l.identifier.clone());
        entries.push(PatronActivity::Loan(LoanInfo::from_loan(loan, identifier)));
    }
    if let Some(hold) = ledger.hold_for(patron_id) {
        entries.push(PatronActivity::Hold(HoldInfo::from(hold)));
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{DrmScheme, LoanStatus, StatusLink},
        repository::MemoryLedgerStore,
        services::{
            ledger::tests::{collection, ledger, license},
            notifier::MockHoldNotifier,
            providers::{FixedClock, SequentialUuids},
            status_document::MockStatusDocumentApi,
        },
    };
    use chrono::TimeZone;
    use tokio_test::{assert_err, assert_ok};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap()
    }

    fn lcp() -> DeliveryMechanism {
        DeliveryMechanism::new(Some("application/epub+zip"), DrmScheme::Lcp)
    }

    fn document(status: LoanStatus, self_href: &str) -> StatusDocument {
        StatusDocument {
            id: Some("lsd".to_string()),
            status,
            message: None,
            updated: None,
            links: vec![
                StatusLink {
                    rel: "self".to_string(),
                    href: self_href.to_string(),
                    media_type: None,
                    templated: false,
                },
                StatusLink {
                    rel: "return".to_string(),
                    href: format!("{}/return", self_href),
                    media_type: None,
                    templated: false,
                },
                StatusLink {
                    rel: "license".to_string(),
                    href: format!("{}/license", self_href),
                    media_type: Some(crate::models::delivery::LCP_DRM.to_string()),
                    templated: false,
                },
            ],
            potential_rights: crate::models::status_document::PotentialRights {
                end: Some(t0() + Duration::days(21)),
            },
        }
    }

    /// Distributor that accepts every checkout
    fn accepting() -> MockStatusDocumentApi {
        let mut api = MockStatusDocumentApi::new();
        api.expect_fetch_or_create().returning(|request| {
            let href = match request {
                StatusRequest::Checkout(c) => format!("https://lsd.example/loans/{}", c.checkout_id),
                StatusRequest::Existing { url } => url.clone(),
            };
            Ok(document(LoanStatus::Ready, &href))
        });
        api
    }

    async fn store_with(concurrency: i32) -> Arc<MemoryLedgerStore> {
        let store = Arc::new(MemoryLedgerStore::new());
        store.add_collection(collection()).await;
        for pool_id in [1, 2] {
            let l = ledger(pool_id, vec![]);
            store.add_pool(l.pool, l.delivery_mechanisms).await;
            store
                .add_license(license(pool_id * 10, pool_id, concurrency))
                .await;
        }
        store
    }

    fn service(
        store: Arc<MemoryLedgerStore>,
        api: MockStatusDocumentApi,
    ) -> (CirculationService<MemoryLedgerStore, MockStatusDocumentApi>, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(t0()));
        let service = CirculationService::new(
            store,
            Arc::new(api),
            DistributorConfig::default(),
            &CirculationConfig::default(),
        )
        .with_clock(clock.clone())
        .with_ids(Arc::new(SequentialUuids::default()));
        (service, clock)
    }

    #[tokio::test]
    async fn test_checkout_confirms_provisional_loan() {
        let store = store_with(1).await;
        let mut api = MockStatusDocumentApi::new();
        api.expect_fetch_or_create()
            .withf(|request| {
                matches!(request, StatusRequest::Checkout(c)
                    if c.license_identifier == "urn:license:10"
                        && c.notification_url.ends_with("/odl/notify/00000000-0000-0000-0000-000000000001")
                        && c.checkout_id != c.patron_correlation_id)
            })
            .times(1)
            .returning(|_| Ok(document(LoanStatus::Ready, "https://lsd.example/loans/1")));
        let (service, _) = service(store.clone(), api);

        let info = service.checkout(7, 1, &lcp()).await.unwrap();

        assert_eq!(info.start, Some(t0()));
        assert_eq!(info.end, Some(t0() + Duration::days(21)));
        assert_eq!(info.license_identifier.as_deref(), Some("urn:license:10"));
        assert_eq!(
            info.external_identifier.as_deref(),
            Some("https://lsd.example/loans/1")
        );
        let pool = store.pool(1).await.unwrap();
        assert_eq!(pool.licenses_owned, 1);
        assert_eq!(pool.licenses_available, 0);
    }

    #[tokio::test]
    async fn test_checkout_failures_before_remote_call() {
        let store = store_with(1).await;
        let (service, _) = service(store.clone(), accepting());

        service.checkout(7, 1, &lcp()).await.unwrap();
        let again = service.checkout(7, 1, &lcp()).await;
        assert_eq!(
            again.unwrap_err().failure(),
            Some(CirculationFailure::AlreadyCheckedOut)
        );

        let other = service.checkout(8, 1, &lcp()).await;
        assert_eq!(
            other.unwrap_err().failure(),
            Some(CirculationFailure::NoAvailableCopies)
        );

        let pdf = DeliveryMechanism::new(Some("application/pdf"), DrmScheme::Adobe);
        let wrong_format = service.checkout(8, 2, &pdf).await;
        assert_eq!(
            wrong_format.unwrap_err().failure(),
            Some(CirculationFailure::FormatNotAvailable)
        );
    }

    #[tokio::test]
    async fn test_checkout_without_active_license() {
        let store = Arc::new(MemoryLedgerStore::new());
        store.add_collection(collection()).await;
        let l = ledger(1, vec![]);
        store.add_pool(l.pool, l.delivery_mechanisms).await;
        let mut inactive = license(10, 1, 1);
        inactive.is_inactive = true;
        store.add_license(inactive).await;
        let (service, _) = service(store, MockStatusDocumentApi::new());

        let result = service.checkout(7, 1, &lcp()).await;
        assert_eq!(result.unwrap_err().failure(), Some(CirculationFailure::NoLicenses));
    }

    #[tokio::test]
    async fn test_loan_limit_counts_other_pools() {
        let store = store_with(1).await;
        let mut limited = collection();
        limited.loan_limit = Some(1);
        store.add_collection(limited).await;
        let (service, _) = service(store.clone(), accepting());

        service.checkout(7, 1, &lcp()).await.unwrap();
        let second = service.checkout(7, 2, &lcp()).await;
        assert_eq!(
            second.unwrap_err().failure(),
            Some(CirculationFailure::PatronLoanLimitReached { limit: 1 })
        );
        // No provisional loan was left behind
        assert_eq!(store.loans().await.len(), 1);
    }

    #[tokio::test]
    async fn test_loan_limit_counts_loans_without_end_date() {
        let store = store_with(1).await;
        let mut limited = collection();
        limited.loan_limit = Some(1);
        store.add_collection(limited).await;
        let mut api = MockStatusDocumentApi::new();
        api.expect_fetch_or_create().times(1).returning(|_| {
            let mut doc = document(LoanStatus::Ready, "https://lsd.example/loans/1");
            doc.potential_rights.end = None;
            Ok(doc)
        });
        let (service, _) = service(store.clone(), api);

        let first = service.checkout(7, 1, &lcp()).await.unwrap();
        assert_eq!(first.end, None);

        let second = service.checkout(7, 2, &lcp()).await;
        assert_eq!(
            second.unwrap_err().failure(),
            Some(CirculationFailure::PatronLoanLimitReached { limit: 1 })
        );
        assert_eq!(store.loans().await.len(), 1);
    }

    #[tokio::test]
    async fn test_zero_loan_limit_means_unlimited() {
        let store = store_with(1).await;
        let mut zero = collection();
        zero.loan_limit = Some(0);
        store.add_collection(zero).await;
        let (service, _) = service(store, accepting());

        assert_ok!(service.checkout(7, 1, &lcp()).await);
        assert_ok!(service.checkout(7, 2, &lcp()).await);
    }

    #[tokio::test]
    async fn test_refused_checkout_removes_provisional_loan() {
        let store = store_with(1).await;
        let mut api = MockStatusDocumentApi::new();
        api.expect_fetch_or_create()
            .returning(|_| Ok(document(LoanStatus::Revoked, "https://lsd.example/loans/1")));
        let (service, _) = service(store.clone(), api);

        let result = service.checkout(7, 1, &lcp()).await;
        assert_eq!(result.unwrap_err().failure(), Some(CirculationFailure::CannotLoan));
        assert!(store.loans().await.is_empty());
        assert_eq!(store.pool(1).await.unwrap().licenses_available, 1);
    }

    #[tokio::test]
    async fn test_missing_self_link_is_cannot_loan() {
        let store = store_with(1).await;
        let mut api = MockStatusDocumentApi::new();
        api.expect_fetch_or_create().returning(|_| {
            let mut doc = document(LoanStatus::Ready, "https://lsd.example/loans/1");
            doc.links.retain(|l| l.rel != "self");
            Ok(doc)
        });
        let (service, _) = service(store.clone(), api);

        let result = service.checkout(7, 1, &lcp()).await;
        assert_eq!(result.unwrap_err().failure(), Some(CirculationFailure::CannotLoan));
        assert!(store.loans().await.is_empty());
    }

    #[tokio::test]
    async fn test_bad_response_rolls_back_and_is_transient() {
        let store = store_with(1).await;
        let mut api = MockStatusDocumentApi::new();
        api.expect_fetch_or_create()
            .returning(|_| Err(AppError::bad_response("https://lcp.example", "bogus status")));
        let (service, _) = service(store.clone(), api);

        let err = assert_err!(service.checkout(7, 1, &lcp()).await);
        assert!(err.is_transient());
        assert!(store.loans().await.is_empty());
        assert_eq!(store.pool(1).await.unwrap().licenses_available, 1);
    }

    #[tokio::test]
    async fn test_concurrent_checkouts_never_oversubscribe() {
        let store = store_with(1).await;
        let (service, _) = service(store.clone(), accepting());

        let mechanism = lcp();
        let (a, b) = tokio::join!(
            service.checkout(7, 1, &mechanism),
            service.checkout(8, 1, &mechanism)
        );

        assert!(a.is_ok() ^ b.is_ok());
        let failure = a.err().or(b.err()).and_then(|e| e.failure());
        assert_eq!(failure, Some(CirculationFailure::NoAvailableCopies));
        assert_eq!(store.loans().await.len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_license_stops_lending() {
        let store = Arc::new(MemoryLedgerStore::new());
        store.add_collection(collection()).await;
        let l = ledger(1, vec![]);
        store.add_pool(l.pool, l.delivery_mechanisms).await;
        let mut counted = license(10, 1, 2);
        counted.checkouts_left = Some(1);
        store.add_license(counted).await;
        let (service, _) = service(store.clone(), accepting());

        service.checkout(7, 1, &lcp()).await.unwrap();
        assert_eq!(store.license(10).await.unwrap().checkouts_left, Some(0));

        let next = service.checkout(8, 1, &lcp()).await;
        assert_eq!(
            next.unwrap_err().failure(),
            Some(CirculationFailure::NoAvailableCopies)
        );
    }

    #[tokio::test]
    async fn test_unlimited_pool_lends_without_distributor() {
        let store = Arc::new(MemoryLedgerStore::new());
        store.add_collection(collection()).await;
        let mut l = ledger(1, vec![]);
        l.pool.access = PoolAccess::Unlimited;
        let mut mechanism = lcp();
        mechanism.drm_scheme = DrmScheme::BearerToken;
        mechanism.resource_url = Some("https://cdn.example/book.epub".to_string());
        store.add_pool(l.pool, vec![mechanism.clone()]).await;
        let (service, _) = service(store.clone(), MockStatusDocumentApi::new());

        let info = service.checkout(7, 1, &mechanism).await.unwrap();
        assert_eq!(info.start, None);
        assert_eq!(info.end, None);
        assert_eq!(info.external_identifier, None);

        let fulfillment = service.fulfill(7, 1, &mechanism).await.unwrap();
        assert_eq!(
            fulfillment,
            Fulfillment::BearerToken {
                location: "https://cdn.example/book.epub".to_string()
            }
        );

        let hold = service.place_hold(8, 1, None).await;
        assert_eq!(
            hold.unwrap_err().failure(),
            Some(CirculationFailure::HoldOnUnlimitedAccess)
        );

        assert!(service.checkin(7, 1).await.unwrap());
        assert!(store.loans().await.is_empty());
    }

    #[tokio::test]
    async fn test_hold_queue_round_trip() {
        let store = store_with(1).await;
        let (service, _) = service(store.clone(), accepting());
        service.checkout(7, 1, &lcp()).await.unwrap();
        let before = store.pool(1).await.unwrap().aggregates();

        let hold = service.place_hold(8, 1, None).await.unwrap();
        assert_eq!(hold.position, 1);
        assert_eq!(hold.end, Some(t0() + Duration::days(21)));
        assert_eq!(store.pool(1).await.unwrap().patrons_in_hold_queue, 1);

        service.release_hold(8, 1).await.unwrap();
        assert_eq!(store.pool(1).await.unwrap().aggregates(), before);

        let missing = service.release_hold(8, 1).await;
        assert_eq!(missing.unwrap_err().failure(), Some(CirculationFailure::NotOnHold));
    }

    #[tokio::test]
    async fn test_place_hold_rules() {
        let store = store_with(1).await;
        let (service, _) = service(store.clone(), accepting());

        let available = service.place_hold(8, 1, None).await;
        assert_eq!(
            available.unwrap_err().failure(),
            Some(CirculationFailure::CurrentlyAvailable)
        );

        service.checkout(7, 1, &lcp()).await.unwrap();
        let own_loan = service.place_hold(7, 1, None).await;
        assert_eq!(
            own_loan.unwrap_err().failure(),
            Some(CirculationFailure::AlreadyCheckedOut)
        );

        service.place_hold(8, 1, None).await.unwrap();
        let twice = service.place_hold(8, 1, None).await;
        assert_eq!(twice.unwrap_err().failure(), Some(CirculationFailure::AlreadyOnHold));
    }

    #[tokio::test]
    async fn test_hold_limits() {
        let store = store_with(1).await;
        let mut one = collection();
        one.hold_limit = Some(1);
        store.add_collection(one).await;
        let (service, _) = service(store.clone(), accepting());
        service.checkout(7, 1, &lcp()).await.unwrap();
        service.checkout(7, 2, &lcp()).await.unwrap();

        service.place_hold(8, 1, None).await.unwrap();
        let second = service.place_hold(8, 2, None).await;
        assert_eq!(
            second.unwrap_err().failure(),
            Some(CirculationFailure::PatronHoldLimitReached { limit: 1 })
        );

        let mut none = collection();
        none.hold_limit = Some(0);
        store.add_collection(none).await;
        let disallowed = service.place_hold(9, 2, None).await;
        assert_eq!(
            disallowed.unwrap_err().failure(),
            Some(CirculationFailure::HoldsNotPermitted)
        );
    }

    #[tokio::test]
    async fn test_checkin_promotes_next_hold_and_notifies() {
        let store = store_with(1).await;
        let mut api = MockStatusDocumentApi::new();
        api.expect_fetch_or_create().returning(|request| match request {
            StatusRequest::Checkout(_) => Ok(document(LoanStatus::Ready, "https://lsd.example/a")),
            StatusRequest::Existing { .. } => {
                Ok(document(LoanStatus::Returned, "https://lsd.example/a"))
            }
        });
        let mut notifier = MockHoldNotifier::new();
        notifier
            .expect_hold_ready()
            .withf(|p| p.patron_id == 8 && p.end == Some(t0() + Duration::days(3)))
            .times(1)
            .returning(|_| Ok(()));
        let (service, _) = service(store.clone(), api);
        let service = service.with_notifier(Arc::new(notifier));

        service.checkout(7, 1, &lcp()).await.unwrap();
        service
            .place_hold(8, 1, Some("patron8@library.example".to_string()))
            .await
            .unwrap();

        // The distributor already reports the loan returned
        let result = service.checkin(7, 1).await;
        assert_eq!(result.unwrap_err().failure(), Some(CirculationFailure::NotCheckedOut));

        let holds = store.holds().await;
        assert_eq!(holds.len(), 1);
        assert_eq!(holds[0].position, 0);
        let pool = store.pool(1).await.unwrap();
        assert_eq!(pool.licenses_reserved, 1);
        assert_eq!(pool.licenses_available, 0);

        // The ready hold can borrow despite zero availability
        let loan = service.checkout(8, 1, &lcp()).await.unwrap();
        assert!(loan.external_identifier.is_some());
        assert!(store.holds().await.is_empty());
    }

    #[tokio::test]
    async fn test_checkin_through_return_link() {
        let store = store_with(1).await;
        let returned = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = returned.clone();
        let mut api = MockStatusDocumentApi::new();
        api.expect_fetch_or_create().returning(move |request| {
            let status = match request {
                StatusRequest::Checkout(_) => LoanStatus::Ready,
                StatusRequest::Existing { .. }
                    if flag.load(std::sync::atomic::Ordering::SeqCst) =>
                {
                    LoanStatus::Returned
                }
                StatusRequest::Existing { .. } => LoanStatus::Active,
            };
            Ok(document(status, "https://lsd.example/a"))
        });
        let set = returned.clone();
        api.expect_request_return()
            .withf(|url| url == "https://lsd.example/a/return")
            .times(1)
            .returning(move |_| {
                set.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            });
        let (service, _) = service(store.clone(), api);

        service.checkout(7, 1, &lcp()).await.unwrap();
        assert!(service.checkin(7, 1).await.unwrap());
        assert!(store.loans().await.is_empty());
        assert_eq!(store.pool(1).await.unwrap().licenses_available, 1);

        let again = service.checkin(7, 1).await;
        assert_eq!(again.unwrap_err().failure(), Some(CirculationFailure::NotCheckedOut));
    }

    #[tokio::test]
    async fn test_checkin_without_return_link_keeps_loan() {
        let store = store_with(1).await;
        let mut api = MockStatusDocumentApi::new();
        api.expect_fetch_or_create().returning(|_| {
            let mut doc = document(LoanStatus::Active, "https://lsd.example/a");
            doc.links.retain(|l| l.rel != "return");
            Ok(doc)
        });
        api.expect_request_return().never();
        let (service, _) = service(store.clone(), api);

        service.checkout(7, 1, &lcp()).await.unwrap();
        assert!(!service.checkin(7, 1).await.unwrap());
        assert_eq!(store.loans().await.len(), 1);
    }

    #[tokio::test]
    async fn test_checkin_remote_failure_keeps_loan() {
        let store = store_with(1).await;
        let mut api = MockStatusDocumentApi::new();
        api.expect_fetch_or_create().returning(|request| match request {
            StatusRequest::Checkout(_) => Ok(document(LoanStatus::Ready, "https://lsd.example/a")),
            StatusRequest::Existing { .. } => {
                Ok(document(LoanStatus::Active, "https://lsd.example/a"))
            }
        });
        api.expect_request_return()
            .times(1)
            .returning(|url| Err(AppError::bad_response(url, "HTTP 502")));
        let (service, _) = service(store.clone(), api);

        service.checkout(7, 1, &lcp()).await.unwrap();
        let before = store.pool(1).await.unwrap();

        let err = assert_err!(service.checkin(7, 1).await);
        assert!(err.is_transient());
        assert_eq!(store.loans().await.len(), 1);
        assert_eq!(store.pool(1).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_update_loan_is_idempotent() {
        let store = store_with(1).await;
        let (service, _) = service(store.clone(), accepting());
        let info = service.checkout(7, 1, &lcp()).await.unwrap();
        let returned = document(LoanStatus::Returned, "https://lsd.example/a");

        let active = document(LoanStatus::Active, "https://lsd.example/a");
        assert!(!service.update_loan(info.loan_id, &active).await.unwrap());
        assert_eq!(store.loans().await.len(), 1);

        assert!(service.update_loan(info.loan_id, &returned).await.unwrap());
        let after_first = store.pool(1).await.unwrap();
        assert!(!service.update_loan(info.loan_id, &returned).await.unwrap());
        assert_eq!(store.pool(1).await.unwrap(), after_first);
    }

    #[tokio::test]
    async fn test_fulfill_selects_license_document() {
        let store = store_with(1).await;
        let (service, _) = service(store, accepting());
        let info = service.checkout(7, 1, &lcp()).await.unwrap();

        let fulfillment = service.fulfill(7, 1, &lcp()).await.unwrap();
        let href = info.external_identifier.unwrap();
        assert_eq!(
            fulfillment,
            Fulfillment::Fetch {
                url: format!("{}/license", href),
                content_type: Some(crate::models::delivery::LCP_DRM.to_string()),
                expires: Some(t0() + Duration::days(21)),
            }
        );

        let missing = service.fulfill(8, 1, &lcp()).await;
        assert_eq!(missing.unwrap_err().failure(), Some(CirculationFailure::NotCheckedOut));
    }

    #[tokio::test]
    async fn test_fulfill_terminal_loan_is_cannot_fulfill() {
        let store = store_with(1).await;
        let mut api = MockStatusDocumentApi::new();
        api.expect_fetch_or_create().returning(|request| match request {
            StatusRequest::Checkout(_) => Ok(document(LoanStatus::Ready, "https://lsd.example/a")),
            StatusRequest::Existing { .. } => {
                Ok(document(LoanStatus::Expired, "https://lsd.example/a"))
            }
        });
        let (service, _) = service(store.clone(), api);
        service.checkout(7, 1, &lcp()).await.unwrap();

        let result = service.fulfill(7, 1, &lcp()).await;
        assert_eq!(result.unwrap_err().failure(), Some(CirculationFailure::CannotFulfill));
        assert!(store.loans().await.is_empty());
    }

    #[tokio::test]
    async fn test_fulfill_remote_failure_keeps_loan() {
        let store = store_with(1).await;
        let mut api = MockStatusDocumentApi::new();
        api.expect_fetch_or_create().returning(|request| match request {
            StatusRequest::Checkout(_) => Ok(document(LoanStatus::Ready, "https://lsd.example/a")),
            StatusRequest::Existing { url } => {
                Err(AppError::bad_response(url, "unexpected status 'bogus'"))
            }
        });
        let (service, _) = service(store.clone(), api);

        service.checkout(7, 1, &lcp()).await.unwrap();
        let before = store.pool(1).await.unwrap();

        let err = assert_err!(service.fulfill(7, 1, &lcp()).await);
        assert!(err.is_transient());
        assert_eq!(store.loans().await.len(), 1);
        assert_eq!(store.pool(1).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_lapsed_reservation_is_reaped_and_next_hold_promoted() {
        let store = store_with(1).await;
        for (n, patron) in [(1u128, 8), (2, 9)] {
            store
                .insert_hold(Hold {
                    id: Uuid::from_u128(100 + n),
                    patron_id: patron,
                    license_pool_id: 1,
                    start: t0() - Duration::days(10 - n as i64),
                    end: None,
                    position: 1,
                    notify_email: None,
                })
                .await;
        }
        let (service, clock) = service(store.clone(), MockStatusDocumentApi::new());

        let availability = service.reconcile(1).await.unwrap();
        assert_eq!(availability.licenses_reserved, 1);
        let holds = store.holds().await;
        let first = holds.iter().find(|h| h.patron_id == 8).unwrap();
        assert_eq!(first.position, 0);
        assert_eq!(first.end, Some(t0() + Duration::days(3)));

        // Nobody claims the copy within the reservation period
        clock.advance(Duration::days(4));
        assert_eq!(service.reap_expired_holds().await.unwrap(), 1);

        let holds = store.holds().await;
        assert_eq!(holds.len(), 1);
        assert_eq!(holds[0].patron_id, 9);
        assert_eq!(holds[0].position, 0);
        assert_eq!(holds[0].end, Some(t0() + Duration::days(7)));

        // Nothing left to reap
        assert_eq!(service.reap_expired_holds().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_sweeps_unconfirmed_checkouts() {
        let store = store_with(1).await;
        store
            .insert_loan(Loan {
                id: Uuid::from_u128(50),
                patron_id: 7,
                license_pool_id: 1,
                license_id: Some(10),
                start: None,
                end: None,
                external_identifier: None,
                created_at: t0() - Duration::hours(2),
            })
            .await;
        let (service, _) = service(store.clone(), MockStatusDocumentApi::new());

        assert_eq!(service.reap_expired_holds().await.unwrap(), 1);
        assert!(store.loans().await.is_empty());
        assert_eq!(store.pool(1).await.unwrap().licenses_available, 1);
    }

    #[tokio::test]
    async fn test_patron_activity_lists_loans_and_holds() {
        let store = store_with(1).await;
        let (service, _) = service(store.clone(), accepting());
        service.checkout(7, 1, &lcp()).await.unwrap();
        service.checkout(8, 2, &lcp()).await.unwrap();
        service.place_hold(7, 2, None).await.unwrap();

        let activity = service.patron_activity(7, 1).await.unwrap();
        assert_eq!(activity.len(), 2);
        assert!(matches!(&activity[0], PatronActivity::Loan(l) if l.license_pool_id == 1));
        assert!(matches!(&activity[1], PatronActivity::Hold(h) if h.position == 1));

        assert!(service.patron_activity(7, 99).await.unwrap().is_empty());
    }
}
