use std::{collections::HashSet, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use shared::{
    domain::{Product, ProductId},
    transaction::{CompletedPurchase, PaymentTransaction, TipSummary, TransactionState},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::warn;

pub mod catalog;
pub mod coordinator;
pub mod entitlements;
pub mod error;
pub mod observer;
pub mod sandbox;
mod tip_persistence;

pub use catalog::ProductCatalog;
pub use coordinator::{PurchaseCoordinator, PurchaseOutcome, PurchaseTicket};
pub use entitlements::EntitlementTracker;
pub use error::StoreError;
pub use observer::{TransactionDisposition, TransactionObserver};
pub use tip_persistence::DurableTipPersistence;

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Platform service that resolves product identifiers into priced products.
#[async_trait]
pub trait ProductLookup: Send + Sync {
    async fn fetch_products(&self, identifiers: &HashSet<ProductId>) -> Result<Vec<Product>>;
}

/// Platform payment queue. Accepts payments and restore requests and reports
/// every transaction change through [`transaction_updates`](Self::transaction_updates).
#[async_trait]
pub trait PaymentQueue: Send + Sync {
    async fn add_payment(&self, product: &Product) -> Result<()>;
    async fn restore_completed_transactions(&self) -> Result<()>;
    /// Marks a transaction as fully processed so it is not redelivered.
    async fn finish_transaction(&self, transaction: &PaymentTransaction) -> Result<()>;
    fn transaction_updates(&self) -> BoxStream<'static, Vec<PaymentTransaction>>;
}

/// Durable record of completed purchases.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn persist(&self, purchase: CompletedPurchase) -> Result<()>;
    async fn tip_summary(&self) -> Result<TipSummary>;

    async fn has_received_tips(&self) -> Result<bool> {
        Ok(!self.tip_summary().await?.is_empty())
    }
}

pub struct MissingProductLookup;

#[async_trait]
impl ProductLookup for MissingProductLookup {
    async fn fetch_products(&self, _identifiers: &HashSet<ProductId>) -> Result<Vec<Product>> {
        Err(anyhow!("product lookup service is unavailable"))
    }
}

pub struct MissingPaymentQueue;

#[async_trait]
impl PaymentQueue for MissingPaymentQueue {
    async fn add_payment(&self, product: &Product) -> Result<()> {
        Err(anyhow!(
            "payment queue is unavailable for product {}",
            product.product_id
        ))
    }

    async fn restore_completed_transactions(&self) -> Result<()> {
        Err(anyhow!("payment queue is unavailable"))
    }

    async fn finish_transaction(&self, _transaction: &PaymentTransaction) -> Result<()> {
        Err(anyhow!("payment queue is unavailable"))
    }

    fn transaction_updates(&self) -> BoxStream<'static, Vec<PaymentTransaction>> {
        stream::empty().boxed()
    }
}

pub struct MissingPersistenceGateway;

#[async_trait]
impl PersistenceGateway for MissingPersistenceGateway {
    async fn persist(&self, purchase: CompletedPurchase) -> Result<()> {
        Err(anyhow!(
            "tip ledger is unavailable; transaction {} not recorded",
            purchase.transaction_id
        ))
    }

    async fn tip_summary(&self) -> Result<TipSummary> {
        Err(anyhow!("tip ledger is unavailable"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    CatalogRefreshed {
        product_count: usize,
    },
    EntitlementsChanged {
        product_id: ProductId,
        newly_granted: bool,
    },
    TransactionPending {
        product_id: ProductId,
        state: TransactionState,
    },
    PurchaseCompleted {
        product_id: ProductId,
        outcome: PurchaseOutcome,
    },
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub product_identifiers: Vec<ProductId>,
    /// Restored transactions are left unfinished unless this is set.
    pub finish_restored_transactions: bool,
    pub event_capacity: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            product_identifiers: Vec::new(),
            finish_restored_transactions: false,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// The in-app purchase service. Built once by the application and shared
/// by handle with whatever needs it.
pub struct StoreManager {
    catalog: Arc<ProductCatalog>,
    coordinator: Arc<PurchaseCoordinator>,
    entitlements: Arc<EntitlementTracker>,
    observer: Arc<TransactionObserver>,
    queue: Arc<dyn PaymentQueue>,
    persistence: Arc<dyn PersistenceGateway>,
    events: broadcast::Sender<StoreEvent>,
}

impl StoreManager {
    pub fn new(settings: StoreSettings) -> Arc<Self> {
        Self::new_with_dependencies(
            settings,
            Arc::new(MissingProductLookup),
            Arc::new(MissingPaymentQueue),
            Arc::new(MissingPersistenceGateway),
        )
    }

    pub fn new_with_dependencies(
        settings: StoreSettings,
        lookup: Arc<dyn ProductLookup>,
        queue: Arc<dyn PaymentQueue>,
        persistence: Arc<dyn PersistenceGateway>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        let catalog = Arc::new(ProductCatalog::new(
            lookup,
            settings.product_identifiers,
            events.clone(),
        ));
        let entitlements = Arc::new(EntitlementTracker::new(events.clone()));
        let coordinator = Arc::new(PurchaseCoordinator::new(
            Arc::clone(&catalog),
            Arc::clone(&entitlements),
            Arc::clone(&queue),
        ));
        let observer = Arc::new(TransactionObserver::new(
            Arc::clone(&catalog),
            Arc::clone(&coordinator),
            Arc::clone(&entitlements),
            Arc::clone(&queue),
            Arc::clone(&persistence),
            events.clone(),
            settings.finish_restored_transactions,
        ));

        Arc::new(Self {
            catalog,
            coordinator,
            entitlements,
            observer,
            queue,
            persistence,
            events,
        })
    }

    /// Starts reconciling the payment queue's updates on a background task.
    /// The task ends when the queue closes its update stream.
    pub fn spawn_observer(&self) -> JoinHandle<()> {
        let updates = self.queue.transaction_updates();
        let observer = Arc::clone(&self.observer);
        tokio::spawn(async move { observer.run(updates).await })
    }

    pub async fn configure(&self, identifiers: impl IntoIterator<Item = ProductId>) {
        self.catalog.configure(identifiers).await;
    }

    pub async fn refresh_products(&self) -> Vec<Product> {
        self.catalog.refresh().await
    }

    pub async fn purchase(&self, product_id: &ProductId) -> Result<PurchaseTicket, StoreError> {
        self.coordinator.purchase(product_id).await
    }

    pub async fn purchase_with<F>(
        &self,
        product_id: &ProductId,
        on_complete: F,
    ) -> Result<(), StoreError>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.coordinator.purchase_with(product_id, on_complete).await
    }

    pub async fn restore_purchases(&self) -> Result<(), StoreError> {
        self.coordinator.restore_purchases().await
    }

    pub async fn is_entitled(&self, product_id: &ProductId) -> bool {
        self.entitlements.is_entitled(product_id).await
    }

    pub async fn tip_summary(&self) -> Result<TipSummary> {
        self.persistence.tip_summary().await
    }

    /// `false` when the ledger cannot be read.
    pub async fn has_received_tips(&self) -> bool {
        match self.persistence.has_received_tips().await {
            Ok(received) => received,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "store: could not read tip ledger");
                false
            }
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn catalog(&self) -> &Arc<ProductCatalog> {
        &self.catalog
    }

    pub fn coordinator(&self) -> &Arc<PurchaseCoordinator> {
        &self.coordinator
    }

    pub fn entitlements(&self) -> &Arc<EntitlementTracker> {
        &self.entitlements
    }

    pub fn observer(&self) -> &Arc<TransactionObserver> {
        &self.observer
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
