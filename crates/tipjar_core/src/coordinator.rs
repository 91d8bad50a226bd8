use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use serde::{Deserialize, Serialize};
use shared::domain::ProductId;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::{
    catalog::ProductCatalog, entitlements::EntitlementTracker, error::StoreError, PaymentQueue,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseOutcome {
    Purchased,
    Failed,
}

impl PurchaseOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Purchased)
    }
}

/// Resolves once the payment queue reports a purchased or failed transaction
/// for the product.
///
/// There is no timeout. If the queue never reports back the ticket stays
/// pending; dropping it frees the product for another purchase.
#[derive(Debug)]
pub struct PurchaseTicket {
    product_id: ProductId,
    receiver: oneshot::Receiver<PurchaseOutcome>,
    settled: Option<Settled>,
}

/// What [`PurchaseTicket::try_outcome`] has already taken off the channel.
/// The receiver cannot be polled again once it has yielded.
#[derive(Debug, Clone, Copy)]
enum Settled {
    Delivered(PurchaseOutcome),
    Abandoned,
}

impl PurchaseTicket {
    fn new(product_id: ProductId, receiver: oneshot::Receiver<PurchaseOutcome>) -> Self {
        Self {
            product_id,
            receiver,
            settled: None,
        }
    }

    pub fn product_id(&self) -> &ProductId {
        &self.product_id
    }

    /// Non-blocking check, used by callers that poll from a UI loop. Keeps
    /// returning the outcome once it has arrived.
    pub fn try_outcome(&mut self) -> Option<PurchaseOutcome> {
        if self.settled.is_none() {
            self.settled = match self.receiver.try_recv() {
                Ok(outcome) => Some(Settled::Delivered(outcome)),
                Err(oneshot::error::TryRecvError::Closed) => Some(Settled::Abandoned),
                Err(oneshot::error::TryRecvError::Empty) => None,
            };
        }
        match self.settled {
            Some(Settled::Delivered(outcome)) => Some(outcome),
            _ => None,
        }
    }

    pub async fn outcome(self) -> Result<PurchaseOutcome, StoreError> {
        let Self {
            product_id,
            receiver,
            settled,
        } = self;
        match settled {
            Some(Settled::Delivered(outcome)) => Ok(outcome),
            Some(Settled::Abandoned) => Err(StoreError::Abandoned(product_id)),
            None => receiver.await.map_err(|_| StoreError::Abandoned(product_id)),
        }
    }
}

struct PendingPurchase {
    attempt: u64,
    sender: oneshot::Sender<PurchaseOutcome>,
}

/// Submits purchases to the payment queue and hands each outcome back to the
/// caller that asked for it.
pub struct PurchaseCoordinator {
    catalog: Arc<ProductCatalog>,
    entitlements: Arc<EntitlementTracker>,
    queue: Arc<dyn PaymentQueue>,
    pending: Mutex<HashMap<ProductId, PendingPurchase>>,
    next_attempt: AtomicU64,
}

impl PurchaseCoordinator {
    pub fn new(
        catalog: Arc<ProductCatalog>,
        entitlements: Arc<EntitlementTracker>,
        queue: Arc<dyn PaymentQueue>,
    ) -> Self {
        Self {
            catalog,
            entitlements,
            queue,
            pending: Mutex::new(HashMap::new()),
            next_attempt: AtomicU64::new(1),
        }
    }

    /// Starts a purchase of a product from the current catalog.
    ///
    /// Only one live purchase per product is allowed. A second request fails
    /// with [`StoreError::PurchasePending`] unless the first ticket has been
    /// dropped.
    pub async fn purchase(&self, product_id: &ProductId) -> Result<PurchaseTicket, StoreError> {
        let product = self
            .catalog
            .product(product_id)
            .await
            .ok_or_else(|| StoreError::UnknownProduct(product_id.clone()))?;

        let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if let Some(existing) = pending.get(product_id) {
                if !existing.sender.is_closed() {
                    return Err(StoreError::PurchasePending(product_id.clone()));
                }
                debug!(
                    product_id = %product_id,
                    attempt = existing.attempt,
                    "purchase: replacing registration whose ticket was dropped"
                );
            }
            pending.insert(product_id.clone(), PendingPurchase { attempt, sender });
        }

        info!(product_id = %product_id, attempt, "purchase: submitting payment");
        if let Err(err) = self.queue.add_payment(&product).await {
            self.remove_attempt(product_id, attempt).await;
            warn!(
                product_id = %product_id,
                attempt,
                error = %format!("{err:#}"),
                "purchase: payment queue rejected submission"
            );
            return Err(StoreError::Submission {
                product_id: product_id.clone(),
                reason: format!("{err:#}"),
            });
        }

        Ok(PurchaseTicket::new(product_id.clone(), receiver))
    }

    /// Callback form of [`purchase`](Self::purchase). `on_complete` runs at
    /// most once, on a spawned task, and not at all if the outcome never
    /// arrives.
    pub async fn purchase_with<F>(
        &self,
        product_id: &ProductId,
        on_complete: F,
    ) -> Result<(), StoreError>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let ticket = self.purchase(product_id).await?;
        tokio::spawn(async move {
            match ticket.outcome().await {
                Ok(outcome) => on_complete(outcome.is_success()),
                Err(err) => debug!(error = %err, "purchase: callback not invoked"),
            }
        });
        Ok(())
    }

    pub async fn restore_purchases(&self) -> Result<(), StoreError> {
        info!("purchase: requesting restore of completed transactions");
        self.queue
            .restore_completed_transactions()
            .await
            .map_err(|err| StoreError::Restore(format!("{err:#}")))
    }

    /// Whether the presentation layer should offer the product for sale.
    /// Subscriptions the user already holds are not offered again.
    pub async fn offers_purchase(&self, product_id: &ProductId) -> bool {
        match self.catalog.product(product_id).await {
            Some(product) if product.is_subscription() => {
                !self.entitlements.is_entitled(product_id).await
            }
            Some(_) => true,
            None => false,
        }
    }

    pub async fn has_pending(&self, product_id: &ProductId) -> bool {
        self.pending.lock().await.contains_key(product_id)
    }

    pub async fn pending_products(&self) -> Vec<ProductId> {
        let mut products: Vec<ProductId> = self.pending.lock().await.keys().cloned().collect();
        products.sort();
        products
    }

    /// Delivers an outcome to the registration for `product_id`, if any, and
    /// removes it. Returns whether a waiting caller received it.
    pub(crate) async fn resolve(&self, product_id: &ProductId, outcome: PurchaseOutcome) -> bool {
        let Some(pending) = self.pending.lock().await.remove(product_id) else {
            debug!(product_id = %product_id, ?outcome, "purchase: no registration for outcome");
            return false;
        };

        if pending.sender.send(outcome).is_err() {
            debug!(
                product_id = %product_id,
                attempt = pending.attempt,
                "purchase: ticket dropped before outcome"
            );
            return false;
        }
        info!(
            product_id = %product_id,
            attempt = pending.attempt,
            ?outcome,
            "purchase: outcome delivered"
        );
        true
    }

    async fn remove_attempt(&self, product_id: &ProductId, attempt: u64) {
        let mut pending = self.pending.lock().await;
        if pending
            .get(product_id)
            .is_some_and(|existing| existing.attempt == attempt)
        {
            pending.remove(product_id);
        }
    }
}

#[cfg(test)]
#[path = "tests/coordinator_tests.rs"]
mod tests;
