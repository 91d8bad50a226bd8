//! In-process stand-ins for the platform product-lookup service and payment
//! queue. The command-line app runs against these, and so do the
//! integration tests.
//!
//! [`SandboxPaymentQueue`] emits a `purchasing` batch for every accepted
//! payment followed by a second batch carrying the scripted outcome.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use shared::{
    domain::{Product, ProductId, TransactionId},
    transaction::{PaymentTransaction, TransactionState},
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{PaymentQueue, ProductLookup};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    products: Vec<Product>,
}

pub struct SandboxCatalog {
    products: Vec<Product>,
    fail_with: Option<String>,
    latency: Duration,
    requests: AtomicUsize,
}

impl SandboxCatalog {
    pub fn new(products: Vec<Product>) -> Self {
        Self {
            products,
            fail_with: None,
            latency: Duration::ZERO,
            requests: AtomicUsize::new(0),
        }
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        let mut catalog = Self::new(Vec::new());
        catalog.fail_with = Some(reason.into());
        catalog
    }

    /// Reads a JSON document of the form `{ "products": [ ... ] }`.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read catalog file '{}'", path.display()))?;
        let file: CatalogFile = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse catalog file '{}'", path.display()))?;
        Ok(Self::new(file.products))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProductLookup for SandboxCatalog {
    async fn fetch_products(&self, identifiers: &HashSet<ProductId>) -> Result<Vec<Product>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(reason) = &self.fail_with {
            return Err(anyhow!(reason.clone()));
        }
        Ok(self
            .products
            .iter()
            .filter(|product| identifiers.contains(&product.product_id))
            .cloned()
            .collect())
    }
}

/// Outcome the sandbox queue reports for a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxOutcome {
    Purchase,
    Fail,
    /// Reported as deferred until [`SandboxPaymentQueue::approve_deferred`].
    Defer,
    /// Nothing after `purchasing` is ever reported.
    Drop,
}

pub struct SandboxPaymentQueue {
    sender: mpsc::UnboundedSender<Vec<PaymentTransaction>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Vec<PaymentTransaction>>>>,
    scripted: Mutex<HashMap<ProductId, SandboxOutcome>>,
    default_outcome: SandboxOutcome,
    reject_reason: Mutex<Option<String>>,
    history: Mutex<Vec<ProductId>>,
    submissions: Mutex<Vec<ProductId>>,
    finished: Mutex<Vec<PaymentTransaction>>,
    restore_requests: AtomicUsize,
}

impl Default for SandboxPaymentQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxPaymentQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            scripted: Mutex::new(HashMap::new()),
            default_outcome: SandboxOutcome::Purchase,
            reject_reason: Mutex::new(None),
            history: Mutex::new(Vec::new()),
            submissions: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
            restore_requests: AtomicUsize::new(0),
        }
    }

    pub fn with_default_outcome(mut self, outcome: SandboxOutcome) -> Self {
        self.default_outcome = outcome;
        self
    }

    /// Products reported back by
    /// [`restore_completed_transactions`](PaymentQueue::restore_completed_transactions).
    pub fn with_purchase_history(self, products: impl IntoIterator<Item = ProductId>) -> Self {
        lock(&self.history).extend(products);
        self
    }

    pub fn script(&self, product_id: impl Into<ProductId>, outcome: SandboxOutcome) {
        lock(&self.scripted).insert(product_id.into(), outcome);
    }

    pub fn reject_submissions(&self, reason: impl Into<String>) {
        *lock(&self.reject_reason) = Some(reason.into());
    }

    /// Delivers a batch as if the platform had produced it.
    pub fn deliver(&self, batch: Vec<PaymentTransaction>) {
        if self.sender.send(batch).is_err() {
            warn!("sandbox: transaction batch dropped, no observer attached");
        }
    }

    /// Completes a deferred payment, as when a parent approves an
    /// ask-to-buy request.
    pub fn approve_deferred(&self, product_id: impl Into<ProductId>) {
        let product_id = product_id.into();
        lock(&self.history).push(product_id.clone());
        self.deliver(vec![identified(product_id, TransactionState::Purchased)]);
    }

    pub fn submissions(&self) -> Vec<ProductId> {
        lock(&self.submissions).clone()
    }

    pub fn finished_transactions(&self) -> Vec<PaymentTransaction> {
        lock(&self.finished).clone()
    }

    pub fn restore_request_count(&self) -> usize {
        self.restore_requests.load(Ordering::SeqCst)
    }

    fn outcome_for(&self, product_id: &ProductId) -> SandboxOutcome {
        lock(&self.scripted)
            .get(product_id)
            .copied()
            .unwrap_or(self.default_outcome)
    }
}

fn identified(product_id: ProductId, state: TransactionState) -> PaymentTransaction {
    PaymentTransaction::new(product_id, state)
        .with_identity(TransactionId(Uuid::new_v4().to_string()), Utc::now())
}

#[async_trait]
impl PaymentQueue for SandboxPaymentQueue {
    async fn add_payment(&self, product: &Product) -> Result<()> {
        if let Some(reason) = lock(&self.reject_reason).clone() {
            return Err(anyhow!(reason));
        }

        let product_id = product.product_id.clone();
        lock(&self.submissions).push(product_id.clone());
        self.deliver(vec![PaymentTransaction::new(
            product_id.clone(),
            TransactionState::Purchasing,
        )]);

        let outcome = self.outcome_for(&product_id);
        debug!(product_id = %product_id, ?outcome, "sandbox: payment accepted");
        match outcome {
            SandboxOutcome::Purchase => {
                lock(&self.history).push(product_id.clone());
                self.deliver(vec![identified(product_id, TransactionState::Purchased)]);
            }
            SandboxOutcome::Fail => {
                self.deliver(vec![PaymentTransaction::new(
                    product_id,
                    TransactionState::Failed,
                )]);
            }
            SandboxOutcome::Defer => {
                self.deliver(vec![PaymentTransaction::new(
                    product_id,
                    TransactionState::Deferred,
                )]);
            }
            SandboxOutcome::Drop => {}
        }
        Ok(())
    }

    async fn restore_completed_transactions(&self) -> Result<()> {
        self.restore_requests.fetch_add(1, Ordering::SeqCst);
        let history = lock(&self.history).clone();
        if history.is_empty() {
            debug!("sandbox: nothing to restore");
            return Ok(());
        }
        self.deliver(
            history
                .into_iter()
                .map(|product_id| identified(product_id, TransactionState::Restored))
                .collect(),
        );
        Ok(())
    }

    async fn finish_transaction(&self, transaction: &PaymentTransaction) -> Result<()> {
        lock(&self.finished).push(transaction.clone());
        Ok(())
    }

    /// The update stream can be taken once; later calls get an empty stream.
    fn transaction_updates(&self) -> BoxStream<'static, Vec<PaymentTransaction>> {
        match lock(&self.receiver).take() {
            Some(receiver) => UnboundedReceiverStream::new(receiver).boxed(),
            None => {
                warn!("sandbox: transaction updates already taken");
                stream::empty().boxed()
            }
        }
    }
}
