use thiserror::Error;

use crate::domain::ProductId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("transaction for {0} has no transaction date")]
    MissingTransactionDate(ProductId),
    #[error("transaction for {0} has no transaction identifier")]
    MissingTransactionId(ProductId),
    #[error("transaction for {actual} does not match product {expected}")]
    ProductMismatch {
        expected: ProductId,
        actual: ProductId,
    },
}
