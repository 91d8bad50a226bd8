use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::transaction::{CompletedPurchase, TipSummary};
use storage::Storage;
use tracing::{debug, info};

use crate::PersistenceGateway;

/// Tip ledger backed by the sqlite [`Storage`].
pub struct DurableTipPersistence {
    store: Storage,
}

impl DurableTipPersistence {
    pub async fn initialize(database_url: &str) -> Result<Arc<Self>> {
        let store = Storage::new(database_url)
            .await
            .with_context(|| format!("failed to initialize tip ledger at '{database_url}'"))?;
        Ok(Arc::new(Self { store }))
    }

    pub fn storage(&self) -> &Storage {
        &self.store
    }

    pub fn sqlite_url_for_data_dir(base_dir: &Path) -> String {
        format!("sqlite://{}", base_dir.join("tips.sqlite3").display())
    }
}

#[async_trait]
impl PersistenceGateway for DurableTipPersistence {
    async fn persist(&self, purchase: CompletedPurchase) -> Result<()> {
        if self.store.record_tip(&purchase).await? {
            info!(
                product_id = %purchase.product_id,
                transaction_id = %purchase.transaction_id,
                "ledger: tip recorded"
            );
        } else {
            debug!(transaction_id = %purchase.transaction_id, "ledger: redelivered tip ignored");
        }
        Ok(())
    }

    async fn tip_summary(&self) -> Result<TipSummary> {
        self.store.tip_summary().await
    }

    async fn has_received_tips(&self) -> Result<bool> {
        self.store.has_tips().await
    }
}

#[cfg(test)]
#[path = "tests/tip_persistence_tests.rs"]
mod tests;
