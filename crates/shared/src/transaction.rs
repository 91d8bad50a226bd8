use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    domain::{PriceLocale, Product, ProductId, TransactionId},
    error::ModelError,
};

/// State tag reported by the payment queue for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Purchasing,
    Purchased,
    Failed,
    Restored,
    Deferred,
    #[serde(other)]
    Unknown,
}

impl TransactionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Purchasing => "purchasing",
            Self::Purchased => "purchased",
            Self::Failed => "failed",
            Self::Restored => "restored",
            Self::Deferred => "deferred",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event delivered by the payment queue. Date and identifier are absent
/// until the platform has assigned them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub product_id: ProductId,
    pub transaction_id: Option<TransactionId>,
    pub transaction_date: Option<DateTime<Utc>>,
    pub state: TransactionState,
}

impl PaymentTransaction {
    pub fn new(product_id: impl Into<ProductId>, state: TransactionState) -> Self {
        Self {
            product_id: product_id.into(),
            transaction_id: None,
            transaction_date: None,
            state,
        }
    }

    pub fn with_identity(
        mut self,
        transaction_id: impl Into<TransactionId>,
        transaction_date: DateTime<Utc>,
    ) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self.transaction_date = Some(transaction_date);
        self
    }
}

/// A successful purchase, ready to hand to the tip ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPurchase {
    pub price: Decimal,
    pub price_locale: PriceLocale,
    pub product_id: ProductId,
    pub transaction_id: TransactionId,
    pub transaction_date: DateTime<Utc>,
}

impl CompletedPurchase {
    pub fn from_transaction(
        product: &Product,
        transaction: &PaymentTransaction,
    ) -> Result<Self, ModelError> {
        if product.product_id != transaction.product_id {
            return Err(ModelError::ProductMismatch {
                expected: product.product_id.clone(),
                actual: transaction.product_id.clone(),
            });
        }
        let transaction_date = transaction
            .transaction_date
            .ok_or_else(|| ModelError::MissingTransactionDate(transaction.product_id.clone()))?;
        let transaction_id = transaction
            .transaction_id
            .clone()
            .ok_or_else(|| ModelError::MissingTransactionId(transaction.product_id.clone()))?;

        Ok(Self {
            price: product.price,
            price_locale: product.price_locale.clone(),
            product_id: product.product_id.clone(),
            transaction_id,
            transaction_date,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyTotal {
    pub currency_code: String,
    pub amount: Decimal,
}

/// "Tips so far" as shown by the presentation layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipSummary {
    pub count: u64,
    pub totals: Vec<CurrencyTotal>,
}

impl TipSummary {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
