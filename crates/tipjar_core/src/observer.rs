use std::sync::Arc;

use futures::{stream::BoxStream, StreamExt};
use shared::{
    domain::ProductId,
    transaction::{CompletedPurchase, PaymentTransaction, TransactionState},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    catalog::ProductCatalog,
    coordinator::{PurchaseCoordinator, PurchaseOutcome},
    entitlements::EntitlementTracker,
    PaymentQueue, PersistenceGateway, StoreEvent,
};

/// What the observer did with one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionDisposition {
    /// Purchasing or deferred; left on the queue for a later update.
    Pending,
    Completed {
        outcome: PurchaseOutcome,
        caller_notified: bool,
        finished: bool,
    },
    Restored {
        finished: bool,
    },
    Ignored,
}

/// Reconciles payment-queue updates with the catalog, the waiting purchase
/// callers, the entitlement set and the tip ledger.
pub struct TransactionObserver {
    catalog: Arc<ProductCatalog>,
    coordinator: Arc<PurchaseCoordinator>,
    entitlements: Arc<EntitlementTracker>,
    queue: Arc<dyn PaymentQueue>,
    persistence: Arc<dyn PersistenceGateway>,
    events: broadcast::Sender<StoreEvent>,
    finish_restored: bool,
    batch_guard: Mutex<()>,
}

impl TransactionObserver {
    pub fn new(
        catalog: Arc<ProductCatalog>,
        coordinator: Arc<PurchaseCoordinator>,
        entitlements: Arc<EntitlementTracker>,
        queue: Arc<dyn PaymentQueue>,
        persistence: Arc<dyn PersistenceGateway>,
        events: broadcast::Sender<StoreEvent>,
        finish_restored: bool,
    ) -> Self {
        Self {
            catalog,
            coordinator,
            entitlements,
            queue,
            persistence,
            events,
            finish_restored,
            batch_guard: Mutex::new(()),
        }
    }

    /// Consumes batches until the queue closes its update stream.
    pub async fn run(&self, mut updates: BoxStream<'static, Vec<PaymentTransaction>>) {
        info!("transaction: observer started");
        while let Some(batch) = updates.next().await {
            self.handle_transactions(&batch).await;
        }
        info!("transaction: update stream closed, observer stopped");
    }

    /// Handles a batch strictly in delivery order. Concurrent batches are
    /// processed one after another.
    pub async fn handle_transactions(
        &self,
        transactions: &[PaymentTransaction],
    ) -> Vec<TransactionDisposition> {
        let _batch = self.batch_guard.lock().await;
        debug!(count = transactions.len(), "transaction: batch received");

        let mut dispositions = Vec::with_capacity(transactions.len());
        for transaction in transactions {
            dispositions.push(self.handle_transaction(transaction).await);
        }
        dispositions
    }

    async fn handle_transaction(&self, transaction: &PaymentTransaction) -> TransactionDisposition {
        let product_id = &transaction.product_id;
        match transaction.state {
            TransactionState::Purchasing | TransactionState::Deferred => {
                debug!(
                    product_id = %product_id,
                    state = %transaction.state,
                    "transaction: pending"
                );
                let _ = self.events.send(StoreEvent::TransactionPending {
                    product_id: product_id.clone(),
                    state: transaction.state,
                });
                TransactionDisposition::Pending
            }
            TransactionState::Purchased => {
                info!(
                    product_id = %product_id,
                    transaction_id = ?transaction.transaction_id,
                    "transaction: purchased"
                );
                self.grant_subscription(product_id).await;
                self.persist_purchase(transaction).await;
                self.complete(transaction, PurchaseOutcome::Purchased).await
            }
            TransactionState::Failed => {
                info!(product_id = %product_id, "transaction: failed");
                self.complete(transaction, PurchaseOutcome::Failed).await
            }
            TransactionState::Restored => {
                info!(product_id = %product_id, "transaction: restored");
                self.grant_subscription(product_id).await;
                let finished = if self.finish_restored {
                    self.finish(transaction).await
                } else {
                    debug!(
                        product_id = %product_id,
                        "transaction: restored transaction left unfinished"
                    );
                    false
                };
                TransactionDisposition::Restored { finished }
            }
            TransactionState::Unknown => {
                warn!(product_id = %product_id, "transaction: unrecognized state ignored");
                TransactionDisposition::Ignored
            }
        }
    }

    async fn complete(
        &self,
        transaction: &PaymentTransaction,
        outcome: PurchaseOutcome,
    ) -> TransactionDisposition {
        let caller_notified = self
            .coordinator
            .resolve(&transaction.product_id, outcome)
            .await;
        let finished = self.finish(transaction).await;
        let _ = self.events.send(StoreEvent::PurchaseCompleted {
            product_id: transaction.product_id.clone(),
            outcome,
        });
        TransactionDisposition::Completed {
            outcome,
            caller_notified,
            finished,
        }
    }

    async fn grant_subscription(&self, product_id: &ProductId) {
        match self.catalog.product(product_id).await {
            Some(product) if product.is_subscription() => self.entitlements.grant(product_id).await,
            Some(_) => {}
            None => debug!(
                product_id = %product_id,
                "transaction: product not in catalog, entitlement unchanged"
            ),
        }
    }

    async fn persist_purchase(&self, transaction: &PaymentTransaction) {
        let Some(product) = self.catalog.product(&transaction.product_id).await else {
            debug!(
                product_id = %transaction.product_id,
                "transaction: product not in catalog, tip not recorded"
            );
            return;
        };

        let record = match CompletedPurchase::from_transaction(&product, transaction) {
            Ok(record) => record,
            Err(err) => {
                warn!(error = %err, "transaction: tip not recorded");
                return;
            }
        };

        if let Err(err) = self.persistence.persist(record).await {
            warn!(
                product_id = %transaction.product_id,
                error = %format!("{err:#}"),
                "transaction: failed to record tip"
            );
        }
    }

    async fn finish(&self, transaction: &PaymentTransaction) -> bool {
        match self.queue.finish_transaction(transaction).await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    product_id = %transaction.product_id,
                    error = %format!("{err:#}"),
                    "transaction: finish failed"
                );
                false
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/observer_tests.rs"]
mod tests;
