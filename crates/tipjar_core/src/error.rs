use shared::domain::ProductId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("product {0} is not in the current catalog")]
    UnknownProduct(ProductId),
    #[error("a purchase of {0} is already awaiting its outcome")]
    PurchasePending(ProductId),
    #[error("payment queue rejected purchase of {product_id}: {reason}")]
    Submission {
        product_id: ProductId,
        reason: String,
    },
    #[error("failed to request restore of completed transactions: {0}")]
    Restore(String),
    #[error("purchase of {0} was dropped before an outcome arrived")]
    Abandoned(ProductId),
}
