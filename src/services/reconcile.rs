//! Background reconciliation
//!
//! Periodically reaps lapsed reservations and unconfirmed checkouts so holds
//! move forward even when no patron touches the pool.

use std::{sync::Arc, time::Duration};

use crate::{
    repository::LedgerStore,
    services::{circulation::CirculationService, status_document::StatusDocumentApi},
};

/// Spawn the reconciliation loop. Runs every `interval`, skipping the
/// immediate first tick.
pub fn spawn_reconcile_task<S, D>(
    service: CirculationService<S, D>,
    interval: Duration,
) -> tokio::task::JoinHandle<()>
where
    S: LedgerStore + 'static,
    D: StatusDocumentApi + 'static,
{
    let service = Arc::new(service);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            reconcile_cycle(&service).await;
        }
    })
}

/// Run one pass, logging instead of failing
pub async fn reconcile_cycle<S, D>(service: &CirculationService<S, D>) -> usize
where
    S: LedgerStore,
    D: StatusDocumentApi,
{
    match service.reap_expired_holds().await {
        Ok(0) => {
            tracing::debug!("Reconciliation found nothing to do");
            0
        }
        Ok(count) => {
            tracing::info!("Reconciled {} pools", count);
            count
        }
        Err(e) => {
            tracing::warn!("Reconciliation failed, will retry next cycle: {}", e);
            0
        }
    }
}
