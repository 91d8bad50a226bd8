use std::collections::HashSet;

use shared::domain::ProductId;
use tokio::sync::{broadcast, RwLock};
use tracing::info;

use crate::StoreEvent;

/// Subscription products the user holds in this session.
///
/// Only grows: expiry and revocation are not tracked locally.
pub struct EntitlementTracker {
    entitled: RwLock<HashSet<ProductId>>,
    events: broadcast::Sender<StoreEvent>,
}

impl EntitlementTracker {
    pub fn new(events: broadcast::Sender<StoreEvent>) -> Self {
        Self {
            entitled: RwLock::new(HashSet::new()),
            events,
        }
    }

    pub async fn is_entitled(&self, product_id: &ProductId) -> bool {
        self.entitled.read().await.contains(product_id)
    }

    pub async fn entitled_products(&self) -> Vec<ProductId> {
        let mut products: Vec<ProductId> = self.entitled.read().await.iter().cloned().collect();
        products.sort();
        products
    }

    /// Records the subscription and notifies subscribers, whether or not it
    /// was already held.
    pub(crate) async fn grant(&self, product_id: &ProductId) {
        let newly_granted = self.entitled.write().await.insert(product_id.clone());
        if newly_granted {
            info!(product_id = %product_id, "entitlement: subscription granted");
        }
        let _ = self.events.send(StoreEvent::EntitlementsChanged {
            product_id: product_id.clone(),
            newly_granted,
        });
    }
}
