use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use shared::{domain::ProductId, transaction::TransactionState};
use tipjar_core::{
    sandbox::{SandboxCatalog, SandboxOutcome, SandboxPaymentQueue},
    DurableTipPersistence, PaymentQueue, PurchaseOutcome, StoreEvent, StoreManager,
    StoreSettings, TransactionDisposition,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, normalize_database_url, Settings, DEFAULT_CONFIG_PATH};

#[derive(Parser, Debug)]
#[command(about = "Tip jar store running against the sandbox payment queue")]
struct Args {
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Overrides the configured tip ledger location.
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lists the products the store offers, one-offs first.
    Catalog,
    /// Buys a product.
    Buy {
        product_id: String,
        /// Have the sandbox decline the payment.
        #[arg(long, conflicts_with = "defer")]
        fail: bool,
        /// Have the sandbox defer the payment, then approve it.
        #[arg(long)]
        defer: bool,
    },
    /// Restores previous purchases recorded in the ledger.
    Restore,
    /// Prints the tip ledger.
    Tips,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings(&args.config);
    if let Some(database_url) = args.database_url {
        settings.database_url = database_url;
    }
    let database_url = normalize_database_url(&settings.database_url);
    info!(
        database_url = %database_url,
        catalog = %settings.catalog_path.display(),
        "tipjar: starting"
    );

    let ledger = DurableTipPersistence::initialize(&database_url).await?;
    let result = match args.command {
        Command::Catalog => show_catalog(&settings, ledger.clone()).await,
        Command::Buy {
            product_id,
            fail,
            defer,
        } => {
            let outcome = if fail {
                SandboxOutcome::Fail
            } else if defer {
                SandboxOutcome::Defer
            } else {
                SandboxOutcome::Purchase
            };
            buy(&settings, ledger.clone(), ProductId::from(product_id), outcome).await
        }
        Command::Restore => restore(&settings, ledger.clone()).await,
        Command::Tips => show_tips(&ledger).await,
    };

    ledger.storage().pool().close().await;
    result
}

fn store_settings(settings: &Settings) -> StoreSettings {
    StoreSettings {
        product_identifiers: settings
            .product_identifiers
            .iter()
            .map(|id| ProductId::from(id.as_str()))
            .collect(),
        finish_restored_transactions: settings.finish_restored_transactions,
        ..StoreSettings::default()
    }
}

fn build_store(
    settings: &Settings,
    queue: Arc<SandboxPaymentQueue>,
    ledger: Arc<DurableTipPersistence>,
) -> Result<Arc<StoreManager>> {
    let catalog = SandboxCatalog::from_json_file(&settings.catalog_path)?;
    Ok(StoreManager::new_with_dependencies(
        store_settings(settings),
        Arc::new(catalog),
        queue,
        ledger,
    ))
}

async fn show_catalog(settings: &Settings, ledger: Arc<DurableTipPersistence>) -> Result<()> {
    let store = build_store(settings, Arc::new(SandboxPaymentQueue::new()), ledger)?;
    let products = store.refresh_products().await;
    if products.is_empty() {
        println!("No products available.");
        return Ok(());
    }

    for product in &products {
        let period = product
            .subscription_period
            .map(|period| format!(" every {} {:?}", period.count, period.unit).to_lowercase())
            .unwrap_or_default();
        println!(
            "{:<24} {:>8} {}{}  {}",
            product.product_id.as_str(),
            product.price.to_string(),
            product.price_locale.currency_code,
            period,
            product.title
        );
    }
    Ok(())
}

async fn buy(
    settings: &Settings,
    ledger: Arc<DurableTipPersistence>,
    product_id: ProductId,
    outcome: SandboxOutcome,
) -> Result<()> {
    let queue = Arc::new(SandboxPaymentQueue::new());
    queue.script(product_id.clone(), outcome);
    let store = build_store(settings, queue.clone(), ledger)?;
    let observer = store.spawn_observer();
    let mut events = store.subscribe_events();

    store.refresh_products().await;
    if !store.coordinator().offers_purchase(&product_id).await {
        return Err(anyhow!("product '{product_id}' is not on sale"));
    }

    let ticket = store.purchase(&product_id).await?;
    if outcome == SandboxOutcome::Defer {
        loop {
            if let StoreEvent::TransactionPending {
                state: TransactionState::Deferred,
                ..
            } = events.recv().await?
            {
                break;
            }
        }
        println!("Payment deferred; approving.");
        queue.approve_deferred(product_id.clone());
    }

    let result = ticket.outcome().await?;
    loop {
        if let StoreEvent::PurchaseCompleted { .. } = events.recv().await? {
            break;
        }
    }
    observer.abort();

    match result {
        PurchaseOutcome::Purchased => println!("Thank you! {product_id} purchased."),
        PurchaseOutcome::Failed => println!("Purchase of {product_id} failed."),
    }
    Ok(())
}

async fn restore(settings: &Settings, ledger: Arc<DurableTipPersistence>) -> Result<()> {
    let history = ledger.storage().purchased_product_ids().await?;
    let queue = Arc::new(SandboxPaymentQueue::new().with_purchase_history(history.clone()));
    let mut updates = queue.transaction_updates();
    let store = build_store(settings, queue, ledger)?;
    store.refresh_products().await;

    store.restore_purchases().await?;
    if history.is_empty() {
        println!("Nothing to restore.");
        return Ok(());
    }

    let batch = updates
        .next()
        .await
        .ok_or_else(|| anyhow!("payment queue closed before restoring"))?;
    let dispositions = store.observer().handle_transactions(&batch).await;
    let restored = dispositions
        .iter()
        .filter(|disposition| matches!(disposition, TransactionDisposition::Restored { .. }))
        .count();
    println!("Restored {restored} transaction(s).");

    for product_id in store.entitlements().entitled_products().await {
        println!("Active subscription: {product_id}");
    }
    Ok(())
}

async fn show_tips(ledger: &DurableTipPersistence) -> Result<()> {
    let tips = ledger.storage().list_tips().await?;
    if tips.is_empty() {
        println!("No tips yet.");
        return Ok(());
    }

    for tip in &tips {
        println!(
            "{}  {:<24} {:>8} {}  {}",
            tip.purchase.transaction_date.format("%Y-%m-%d %H:%M"),
            tip.purchase.product_id.as_str(),
            tip.purchase.price.to_string(),
            tip.purchase.price_locale.currency_code,
            tip.purchase.transaction_id
        );
    }

    let summary = ledger.storage().tip_summary().await?;
    for total in &summary.totals {
        println!("Total {}: {}", total.currency_code, total.amount);
    }
    println!("{} tip(s) received.", summary.count);
    Ok(())
}
