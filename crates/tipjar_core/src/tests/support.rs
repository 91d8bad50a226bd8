use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use rust_decimal::Decimal;
use shared::{
    domain::{PeriodUnit, PriceLocale, Product, ProductId, SubscriptionPeriod},
    transaction::{CompletedPurchase, PaymentTransaction, TipSummary, TransactionState},
};
use tokio::sync::broadcast;

use crate::{
    catalog::ProductCatalog, coordinator::PurchaseCoordinator, entitlements::EntitlementTracker,
    observer::TransactionObserver, sandbox::SandboxCatalog, PaymentQueue, PersistenceGateway,
    StoreEvent,
};

pub fn product(id: &str, cents: i64, period: Option<SubscriptionPeriod>) -> Product {
    Product {
        product_id: ProductId::from(id),
        title: id.replace('_', " "),
        price: Decimal::new(cents, 2),
        price_locale: PriceLocale::new("en_US", "USD"),
        subscription_period: period,
    }
}

pub fn tip_small() -> Product {
    product("tip_small", 99, None)
}

pub fn tip_large() -> Product {
    product("tip_large", 299, None)
}

pub fn tip_sub() -> Product {
    product(
        "tip_sub",
        499,
        Some(SubscriptionPeriod::new(PeriodUnit::Month, 1)),
    )
}

pub fn tip_yearly() -> Product {
    product(
        "tip_yearly",
        2999,
        Some(SubscriptionPeriod::new(PeriodUnit::Year, 1)),
    )
}

pub fn all_products() -> Vec<Product> {
    vec![tip_yearly(), tip_sub(), tip_large(), tip_small()]
}

pub fn ids(products: &[Product]) -> Vec<&str> {
    products
        .iter()
        .map(|product| product.product_id.as_str())
        .collect()
}

pub fn purchased(product_id: &str, transaction_id: &str) -> PaymentTransaction {
    PaymentTransaction::new(product_id, TransactionState::Purchased).with_identity(
        transaction_id,
        Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap(),
    )
}

pub fn restored(product_id: &str, transaction_id: &str) -> PaymentTransaction {
    PaymentTransaction::new(product_id, TransactionState::Restored).with_identity(
        transaction_id,
        Utc.with_ymd_and_hms(2024, 6, 2, 10, 0, 0).unwrap(),
    )
}

#[derive(Default)]
pub struct RecordingQueue {
    reject_with: Option<String>,
    fail_finish: bool,
    submissions: StdMutex<Vec<ProductId>>,
    finished: StdMutex<Vec<PaymentTransaction>>,
    restore_requests: StdMutex<u32>,
}

impl RecordingQueue {
    pub fn rejecting(reason: &str) -> Self {
        Self {
            reject_with: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn failing_finish() -> Self {
        Self {
            fail_finish: true,
            ..Self::default()
        }
    }

    pub fn submissions(&self) -> Vec<ProductId> {
        self.submissions.lock().expect("submissions").clone()
    }

    pub fn finished(&self) -> Vec<PaymentTransaction> {
        self.finished.lock().expect("finished").clone()
    }

    pub fn restore_requests(&self) -> u32 {
        *self.restore_requests.lock().expect("restore requests")
    }
}

#[async_trait]
impl PaymentQueue for RecordingQueue {
    async fn add_payment(&self, product: &Product) -> Result<()> {
        if let Some(reason) = &self.reject_with {
            return Err(anyhow!(reason.clone()));
        }
        self.submissions
            .lock()
            .expect("submissions")
            .push(product.product_id.clone());
        Ok(())
    }

    async fn restore_completed_transactions(&self) -> Result<()> {
        *self.restore_requests.lock().expect("restore requests") += 1;
        Ok(())
    }

    async fn finish_transaction(&self, transaction: &PaymentTransaction) -> Result<()> {
        if self.fail_finish {
            return Err(anyhow!("finish rejected"));
        }
        self.finished
            .lock()
            .expect("finished")
            .push(transaction.clone());
        Ok(())
    }

    fn transaction_updates(&self) -> BoxStream<'static, Vec<PaymentTransaction>> {
        stream::empty().boxed()
    }
}

#[derive(Default)]
pub struct RecordingPersistence {
    fail: bool,
    persisted: StdMutex<Vec<CompletedPurchase>>,
}

impl RecordingPersistence {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn persisted(&self) -> Vec<CompletedPurchase> {
        self.persisted.lock().expect("persisted").clone()
    }
}

#[async_trait]
impl PersistenceGateway for RecordingPersistence {
    async fn persist(&self, purchase: CompletedPurchase) -> Result<()> {
        if self.fail {
            return Err(anyhow!("disk full"));
        }
        self.persisted.lock().expect("persisted").push(purchase);
        Ok(())
    }

    async fn tip_summary(&self) -> Result<TipSummary> {
        let persisted = self.persisted.lock().expect("persisted");
        Ok(TipSummary {
            count: persisted.len() as u64,
            totals: Vec::new(),
        })
    }
}

/// The four components wired together around recording collaborators.
pub struct Harness {
    pub catalog: Arc<ProductCatalog>,
    pub coordinator: Arc<PurchaseCoordinator>,
    pub entitlements: Arc<EntitlementTracker>,
    pub observer: TransactionObserver,
    pub queue: Arc<RecordingQueue>,
    pub persistence: Arc<RecordingPersistence>,
    pub events: broadcast::Receiver<StoreEvent>,
}

impl Harness {
    pub async fn new(products: Vec<Product>) -> Self {
        Self::build(
            products,
            RecordingQueue::default(),
            RecordingPersistence::default(),
            false,
        )
        .await
    }

    pub async fn build(
        products: Vec<Product>,
        queue: RecordingQueue,
        persistence: RecordingPersistence,
        finish_restored: bool,
    ) -> Self {
        let (sender, events) = broadcast::channel(64);
        let identifiers: Vec<ProductId> = products
            .iter()
            .map(|product| product.product_id.clone())
            .collect();
        let catalog = Arc::new(ProductCatalog::new(
            Arc::new(SandboxCatalog::new(products)),
            identifiers,
            sender.clone(),
        ));
        catalog.refresh().await;

        let queue = Arc::new(queue);
        let persistence = Arc::new(persistence);
        let entitlements = Arc::new(EntitlementTracker::new(sender.clone()));
        let coordinator = Arc::new(PurchaseCoordinator::new(
            Arc::clone(&catalog),
            Arc::clone(&entitlements),
            queue.clone(),
        ));
        let observer = TransactionObserver::new(
            Arc::clone(&catalog),
            Arc::clone(&coordinator),
            Arc::clone(&entitlements),
            queue.clone(),
            persistence.clone(),
            sender,
            finish_restored,
        );

        let mut harness = Self {
            catalog,
            coordinator,
            entitlements,
            observer,
            queue,
            persistence,
            events,
        };
        harness.drain_events();
        harness
    }

    pub fn drain_events(&mut self) -> Vec<StoreEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }
}
