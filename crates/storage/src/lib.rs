use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use shared::{
    domain::{PriceLocale, ProductId, TransactionId},
    transaction::{CompletedPurchase, CurrencyTotal, TipSummary},
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use tracing::debug;

const MEMORY_DATABASE_URL: &str = "sqlite::memory:";

/// Durable ledger of completed tips.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTip {
    pub tip_id: i64,
    pub purchase: CompletedPurchase,
    pub recorded_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        // Every connection to an in-memory database gets its own schema.
        let max_connections = if database_url.starts_with(MEMORY_DATABASE_URL) {
            1
        } else {
            5
        };

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid sqlite url '{database_url}'"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open tip ledger at '{database_url}'"))?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Records a tip. Returns `false` when the transaction was already on
    /// file, which happens when the payment queue redelivers it.
    pub async fn record_tip(&self, purchase: &CompletedPurchase) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO tips (
                product_id, transaction_id, transaction_date,
                price, currency_code, locale_identifier, recorded_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(purchase.product_id.as_str())
        .bind(purchase.transaction_id.as_str())
        .bind(purchase.transaction_date)
        .bind(purchase.price.to_string())
        .bind(&purchase.price_locale.currency_code)
        .bind(&purchase.price_locale.locale_identifier)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to record tip {}", purchase.transaction_id))?;

        let inserted = result.rows_affected() > 0;
        if !inserted {
            debug!(transaction_id = %purchase.transaction_id, "tip already recorded");
        }
        Ok(inserted)
    }

    pub async fn list_tips(&self) -> Result<Vec<StoredTip>> {
        let rows = sqlx::query(
            r#"
            SELECT tip_id, product_id, transaction_id, transaction_date,
                   price, currency_code, locale_identifier, recorded_at
            FROM tips
            ORDER BY transaction_date ASC, tip_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list tips")?;

        rows.iter().map(stored_tip_from_row).collect()
    }

    pub async fn tip_summary(&self) -> Result<TipSummary> {
        let rows = sqlx::query("SELECT currency_code, price FROM tips")
            .fetch_all(&self.pool)
            .await
            .context("failed to load tip totals")?;

        let mut totals: BTreeMap<String, Decimal> = BTreeMap::new();
        for row in &rows {
            let currency_code: String = row.try_get("currency_code")?;
            let price = parse_price(row.try_get("price")?)?;
            *totals.entry(currency_code).or_default() += price;
        }

        Ok(TipSummary {
            count: rows.len() as u64,
            totals: totals
                .into_iter()
                .map(|(currency_code, amount)| CurrencyTotal {
                    currency_code,
                    amount,
                })
                .collect(),
        })
    }

    pub async fn has_tips(&self) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tips")
            .fetch_one(&self.pool)
            .await
            .context("failed to count tips")?;
        Ok(count > 0)
    }

    /// Products with at least one recorded transaction, oldest first.
    pub async fn purchased_product_ids(&self) -> Result<Vec<ProductId>> {
        let rows = sqlx::query(
            r#"
            SELECT product_id, MIN(transaction_date) AS first_purchase
            FROM tips
            GROUP BY product_id
            ORDER BY first_purchase ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list purchased products")?;

        rows.iter()
            .map(|row| -> Result<ProductId> { Ok(ProductId(row.try_get("product_id")?)) })
            .collect()
    }
}

fn stored_tip_from_row(row: &SqliteRow) -> Result<StoredTip> {
    Ok(StoredTip {
        tip_id: row.try_get("tip_id")?,
        purchase: CompletedPurchase {
            price: parse_price(row.try_get("price")?)?,
            price_locale: PriceLocale {
                locale_identifier: row.try_get("locale_identifier")?,
                currency_code: row.try_get("currency_code")?,
            },
            product_id: ProductId(row.try_get("product_id")?),
            transaction_id: TransactionId(row.try_get("transaction_id")?),
            transaction_date: row.try_get("transaction_date")?,
        },
        recorded_at: row.try_get("recorded_at")?,
    })
}

fn parse_price(raw: String) -> Result<Decimal> {
    Decimal::from_str(&raw).with_context(|| format!("stored price '{raw}' is not a decimal"))
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with(MEMORY_DATABASE_URL) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
