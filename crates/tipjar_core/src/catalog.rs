use std::{collections::HashSet, sync::Arc};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use shared::domain::{Product, ProductId};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{ProductLookup, StoreEvent};

type InflightRefresh = Shared<BoxFuture<'static, Vec<Product>>>;

#[derive(Default)]
struct CatalogState {
    identifiers: HashSet<ProductId>,
    /// Ordered by subscription period length, then price.
    products: Vec<Product>,
}

/// Holds the product identifiers the app sells and the last set of products
/// the lookup service returned for them.
///
/// At most one lookup request is outstanding at a time: callers that ask for a
/// refresh while one is running await the same request. The request runs on
/// its own task, so it completes and updates the catalog even when every
/// caller stops waiting.
pub struct ProductCatalog {
    lookup: Arc<dyn ProductLookup>,
    state: Arc<RwLock<CatalogState>>,
    inflight: Arc<Mutex<Option<InflightRefresh>>>,
    events: broadcast::Sender<StoreEvent>,
}

impl ProductCatalog {
    pub fn new(
        lookup: Arc<dyn ProductLookup>,
        identifiers: impl IntoIterator<Item = ProductId>,
        events: broadcast::Sender<StoreEvent>,
    ) -> Self {
        Self {
            lookup,
            state: Arc::new(RwLock::new(CatalogState {
                identifiers: identifiers.into_iter().collect(),
                products: Vec::new(),
            })),
            inflight: Arc::new(Mutex::new(None)),
            events,
        }
    }

    /// Replaces the identifiers used by the next refresh. A refresh already
    /// in flight keeps the identifiers it started with.
    pub async fn configure(&self, identifiers: impl IntoIterator<Item = ProductId>) {
        let identifiers: HashSet<ProductId> = identifiers.into_iter().collect();
        debug!(count = identifiers.len(), "catalog: identifiers configured");
        self.state.write().await.identifiers = identifiers;
    }

    pub async fn identifiers(&self) -> HashSet<ProductId> {
        self.state.read().await.identifiers.clone()
    }

    /// Fetches the configured products. Resolves to an empty list when the
    /// lookup fails or finds nothing.
    pub async fn refresh(&self) -> Vec<Product> {
        let refresh = {
            let mut inflight = self.inflight.lock().await;
            match inflight.as_ref() {
                Some(existing) => {
                    debug!("catalog: joining in-flight refresh");
                    existing.clone()
                }
                None => {
                    let identifiers = self.state.read().await.identifiers.clone();
                    let task = tokio::spawn(run_refresh(
                        Arc::clone(&self.lookup),
                        Arc::clone(&self.state),
                        Arc::clone(&self.inflight),
                        self.events.clone(),
                        identifiers,
                    ));
                    let slot = Arc::clone(&self.inflight);
                    let refresh = async move {
                        match task.await {
                            Ok(products) => products,
                            Err(err) => {
                                warn!(error = %err, "catalog: refresh task ended abnormally");
                                slot.lock().await.take();
                                Vec::new()
                            }
                        }
                    }
                    .boxed()
                    .shared();
                    *inflight = Some(refresh.clone());
                    refresh
                }
            }
        };
        refresh.await
    }

    pub async fn is_refreshing(&self) -> bool {
        self.inflight.lock().await.is_some()
    }

    pub async fn product(&self, product_id: &ProductId) -> Option<Product> {
        self.state
            .read()
            .await
            .products
            .iter()
            .find(|product| &product.product_id == product_id)
            .cloned()
    }

    /// All products, shortest subscription period first.
    pub async fn products(&self) -> Vec<Product> {
        self.state.read().await.products.clone()
    }

    pub async fn products_by_price(&self) -> Vec<Product> {
        self.sorted_by_price(|_| true).await
    }

    pub async fn non_subscriptions(&self) -> Vec<Product> {
        self.sorted_by_price(|product| !product.is_subscription()).await
    }

    pub async fn subscriptions(&self) -> Vec<Product> {
        self.sorted_by_price(Product::is_subscription).await
    }

    async fn sorted_by_price(&self, filter: impl Fn(&Product) -> bool) -> Vec<Product> {
        let mut products: Vec<Product> = self
            .state
            .read()
            .await
            .products
            .iter()
            .filter(|product| filter(product))
            .cloned()
            .collect();
        products.sort_by(Product::cmp_by_price);
        products
    }
}

async fn run_refresh(
    lookup: Arc<dyn ProductLookup>,
    state: Arc<RwLock<CatalogState>>,
    inflight: Arc<Mutex<Option<InflightRefresh>>>,
    events: broadcast::Sender<StoreEvent>,
    identifiers: HashSet<ProductId>,
) -> Vec<Product> {
    info!(requested = identifiers.len(), "catalog: requesting products");

    let resolved = match lookup.fetch_products(&identifiers).await {
        Ok(products) => {
            let returned = products.len();
            let mut products: Vec<Product> = products
                .into_iter()
                .filter(|product| identifiers.contains(&product.product_id))
                .collect();
            if products.len() != returned {
                debug!(
                    discarded = returned - products.len(),
                    "catalog: dropped products that were not requested"
                );
            }
            products.sort_by(Product::cmp_by_period);
            state.write().await.products = products.clone();

            if products.is_empty() {
                warn!("catalog: lookup returned no products");
            } else {
                info!(count = products.len(), "catalog: products refreshed");
            }
            products
        }
        Err(err) => {
            warn!(error = %format!("{err:#}"), "catalog: product lookup failed");
            Vec::new()
        }
    };

    inflight.lock().await.take();
    let _ = events.send(StoreEvent::CatalogRefreshed {
        product_count: resolved.len(),
    });
    resolved
}

#[cfg(test)]
#[path = "tests/catalog_tests.rs"]
mod tests;
