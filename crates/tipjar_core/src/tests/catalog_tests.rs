use std::time::Duration;

use super::*;
use crate::{
    sandbox::SandboxCatalog,
    test_support::{all_products, ids, tip_small, tip_sub},
};

fn catalog_over(
    lookup: Arc<dyn ProductLookup>,
    identifiers: &[&str],
) -> (ProductCatalog, broadcast::Receiver<StoreEvent>) {
    let (events, rx) = broadcast::channel(16);
    let catalog = ProductCatalog::new(
        lookup,
        identifiers.iter().map(|id| ProductId::from(*id)),
        events,
    );
    (catalog, rx)
}

#[tokio::test]
async fn concurrent_refreshes_share_one_lookup_request() {
    let lookup =
        Arc::new(SandboxCatalog::new(all_products()).with_latency(Duration::from_millis(20)));
    let (catalog, _rx) = catalog_over(lookup.clone(), &["tip_small", "tip_sub"]);

    let (first, second) = tokio::join!(catalog.refresh(), catalog.refresh());

    assert_eq!(lookup.request_count(), 1);
    assert_eq!(ids(&first), vec!["tip_small", "tip_sub"]);
    assert_eq!(first, second);
    assert!(!catalog.is_refreshing().await);
}

#[tokio::test]
async fn refresh_after_completion_issues_a_new_request() {
    let lookup = Arc::new(SandboxCatalog::new(all_products()));
    let (catalog, _rx) = catalog_over(lookup.clone(), &["tip_small"]);

    catalog.refresh().await;
    catalog.refresh().await;

    assert_eq!(lookup.request_count(), 2);
}

#[tokio::test]
async fn abandoned_refresh_still_completes_and_frees_the_slot() {
    let lookup =
        Arc::new(SandboxCatalog::new(all_products()).with_latency(Duration::from_millis(20)));
    let (catalog, mut rx) = catalog_over(lookup.clone(), &["tip_small"]);

    let gave_up = tokio::time::timeout(Duration::from_millis(1), catalog.refresh()).await;
    assert!(gave_up.is_err());

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("refresh finished in time")
        .expect("catalog event");
    assert!(matches!(event, StoreEvent::CatalogRefreshed { product_count: 1 }));
    assert!(!catalog.is_refreshing().await);
    assert_eq!(ids(&catalog.products().await), vec!["tip_small"]);
    assert_eq!(lookup.request_count(), 1);

    catalog.configure([ProductId::from("tip_sub")]).await;
    let products = catalog.refresh().await;
    assert_eq!(ids(&products), vec!["tip_sub"]);
    assert_eq!(lookup.request_count(), 2);
}

#[tokio::test]
async fn refresh_orders_by_period_length_with_one_offs_first() {
    let lookup = Arc::new(SandboxCatalog::new(all_products()));
    let (catalog, mut rx) = catalog_over(
        lookup,
        &["tip_small", "tip_large", "tip_sub", "tip_yearly"],
    );

    let products = catalog.refresh().await;

    assert_eq!(
        ids(&products),
        vec!["tip_small", "tip_large", "tip_sub", "tip_yearly"]
    );
    for pair in products.windows(2) {
        assert!(pair[0].period_length_in_days() <= pair[1].period_length_in_days());
    }
    assert_eq!(ids(&catalog.products().await), ids(&products));
    assert_eq!(
        rx.recv().await.expect("refresh event"),
        StoreEvent::CatalogRefreshed { product_count: 4 }
    );
}

#[tokio::test]
async fn price_views_split_subscriptions_from_one_offs() {
    let lookup = Arc::new(SandboxCatalog::new(all_products()));
    let (catalog, _rx) = catalog_over(
        lookup,
        &["tip_small", "tip_large", "tip_sub", "tip_yearly"],
    );
    catalog.refresh().await;

    assert_eq!(
        ids(&catalog.non_subscriptions().await),
        vec!["tip_small", "tip_large"]
    );
    assert_eq!(
        ids(&catalog.subscriptions().await),
        vec!["tip_sub", "tip_yearly"]
    );
    assert_eq!(
        ids(&catalog.products_by_price().await),
        vec!["tip_small", "tip_large", "tip_sub", "tip_yearly"]
    );
}

#[tokio::test]
async fn failed_lookup_resolves_empty_and_keeps_previous_products() {
    struct OnlineOnce {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ProductLookup for OnlineOnce {
        async fn fetch_products(
            &self,
            _identifiers: &HashSet<ProductId>,
        ) -> anyhow::Result<Vec<Product>> {
            if self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                Ok(vec![tip_small()])
            } else {
                Err(anyhow::anyhow!("offline"))
            }
        }
    }

    let lookup = Arc::new(OnlineOnce {
        calls: std::sync::atomic::AtomicUsize::new(0),
    });
    let (catalog, mut rx) = catalog_over(lookup, &["tip_small"]);
    assert_eq!(ids(&catalog.refresh().await), vec!["tip_small"]);

    assert!(catalog.refresh().await.is_empty());
    assert!(catalog.product(&ProductId::from("tip_small")).await.is_some());
    assert_eq!(
        rx.recv().await.expect("first refresh"),
        StoreEvent::CatalogRefreshed { product_count: 1 }
    );
    assert_eq!(
        rx.recv().await.expect("second refresh"),
        StoreEvent::CatalogRefreshed { product_count: 0 }
    );
}

#[tokio::test]
async fn unavailable_lookup_resolves_empty() {
    let (catalog, _rx) = catalog_over(Arc::new(SandboxCatalog::failing("offline")), &["tip_small"]);
    assert!(catalog.refresh().await.is_empty());
    assert!(catalog.products().await.is_empty());
}

#[tokio::test]
async fn empty_lookup_result_replaces_the_product_set() {
    let (catalog, _rx) = catalog_over(Arc::new(SandboxCatalog::new(all_products())), &["tip_sub"]);
    assert_eq!(ids(&catalog.refresh().await), vec!["tip_sub"]);

    catalog.configure([ProductId::from("tip_missing")]).await;
    assert!(catalog.refresh().await.is_empty());
    assert!(catalog.products().await.is_empty());
}

#[tokio::test]
async fn unrequested_products_are_discarded() {
    struct Oversharing;

    #[async_trait::async_trait]
    impl ProductLookup for Oversharing {
        async fn fetch_products(
            &self,
            _identifiers: &HashSet<ProductId>,
        ) -> anyhow::Result<Vec<Product>> {
            Ok(vec![tip_small(), tip_sub()])
        }
    }

    let (catalog, _rx) = catalog_over(Arc::new(Oversharing), &["tip_sub"]);
    assert_eq!(ids(&catalog.refresh().await), vec!["tip_sub"]);
}

#[tokio::test]
async fn configure_is_idempotent() {
    let (catalog, _rx) = catalog_over(Arc::new(SandboxCatalog::new(all_products())), &[]);
    let identifiers = [ProductId::from("tip_small"), ProductId::from("tip_sub")];

    catalog.configure(identifiers.clone()).await;
    catalog.configure(identifiers.clone()).await;

    assert_eq!(
        catalog.identifiers().await,
        identifiers.into_iter().collect::<HashSet<_>>()
    );
}
