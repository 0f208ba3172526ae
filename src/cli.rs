use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use crate::config::Config;
use crate::services::ReconciliationScheduler;
use crate::startup::{self, Services};

#[derive(Parser)]
#[command(name = "fincore")]
#[command(about = "Fincore - ledger, transfer and reconciliation core", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the reconciliation scheduler (default)
    Run,

    /// Reconciliation commands
    #[command(subcommand)]
    Reconcile(ReconcileCommands),

    /// Print the derived wallet balance of a user
    Balance {
        #[arg(value_name = "USER_ID")]
        user_id: String,
    },

    /// Print the ledger entries of one trace
    Trace {
        #[arg(value_name = "TRACE_ID")]
        trace_id: String,
    },

    /// Transfer management commands
    #[command(subcommand)]
    Tx(TxCommands),

    /// Idempotency record commands
    #[command(subcommand)]
    Idempotency(IdempotencyCommands),

    /// Database management commands
    #[command(subcommand)]
    Db(DbCommands),

    /// Configuration validation
    Config,
}

#[derive(Subcommand)]
pub enum ReconcileCommands {
    /// Report imbalanced traces, records needing review and cache drift
    Audit {
        /// Write the report as CSV to stdout
        #[arg(long)]
        csv: bool,
    },

    /// Resolve stale PENDING transfers and business records once
    Sweep,
}

#[derive(Subcommand)]
pub enum TxCommands {
    /// Show a transfer by reference
    Show {
        #[arg(value_name = "REFERENCE")]
        reference: String,
    },

    /// Force-fail a PENDING transfer and refund its wallet
    ForceFail {
        #[arg(value_name = "REFERENCE")]
        reference: String,

        #[arg(long, default_value = "forced by operator")]
        reason: String,
    },
}

#[derive(Subcommand)]
pub enum IdempotencyCommands {
    /// Delete expired idempotency records
    Purge,
}

#[derive(Subcommand)]
pub enum DbCommands {
    /// Run database migrations
    Migrate,
}

pub async fn handle_run(config: &Config, services: &Services) -> anyhow::Result<()> {
    let scheduler =
        ReconciliationScheduler::new(services.reconciler.clone(), &config.reconcile_schedule)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);
    handle.await?;

    Ok(())
}

pub async fn handle_reconcile_audit(services: &Services, csv: bool) -> anyhow::Result<()> {
    let report = services.reconciler.inspect().await?;

    if csv {
        report.write_csv(std::io::stdout())?;
        return Ok(());
    }

    println!("Imbalanced traces: {}", report.imbalances.len());
    for imbalance in &report.imbalances {
        println!(
            "  {} debits={} credits={}",
            imbalance.trace_id, imbalance.total_debits, imbalance.total_credits
        );
    }
    println!("Needs review: {}", report.needs_review.len());
    for record in &report.needs_review {
        println!(
            "  {} {} {} {}",
            record.id,
            record.kind.as_str(),
            record.amount,
            record.failure_reason.as_deref().unwrap_or("")
        );
    }
    println!("Cached balance drift: {}", report.balance_drift.len());
    for drift in &report.balance_drift {
        println!("  {} cached={} derived={}", drift.user_id, drift.cached, drift.derived);
    }

    if report.is_clean() {
        println!("✓ Ledger is balanced");
    }
    Ok(())
}

pub async fn handle_reconcile_sweep(services: &Services) -> anyhow::Result<()> {
    let report = services.reconciler.run(Utc::now()).await?;

    for swept in &report.transfers {
        println!("  {} {:?} amount={}", swept.reference, swept.action, swept.amount);
    }
    println!(
        "✓ Swept {} transfer(s) and {} business record(s), purged {} idempotency record(s)",
        report.transfers.len(),
        report.business_records.len(),
        report.purged_idempotency
    );
    Ok(())
}

pub async fn handle_balance(services: &Services, user_id: &str) -> anyhow::Result<()> {
    let derived = services.ledger.user_wallet_balance(user_id).await?;
    let cached = services.store.cached_balance(user_id).await?;

    println!("User:    {}", user_id);
    println!("Balance: {} {}", derived, services.ledger.base_currency());
    match cached {
        Some(cached) if cached != derived => println!("Cached:  {} (drifted)", cached),
        Some(cached) => println!("Cached:  {}", cached),
        None => println!("Cached:  none"),
    }
    Ok(())
}

pub async fn handle_trace(services: &Services, trace_id: &str) -> anyhow::Result<()> {
    let entries = services.ledger.get_by_trace_id(trace_id).await?;
    if entries.is_empty() {
        anyhow::bail!("No ledger entries for trace {}", trace_id);
    }

    println!(
        "{:<38} {:<28} {:<7} {:<20} {:>12} {:<10}",
        "Entry", "Account", "Type", "Category", "Amount", "Status"
    );
    println!("{}", "-".repeat(120));
    for entry in entries {
        println!(
            "{:<38} {:<28} {:<7} {:<20} {:>12} {:<10}",
            entry.id,
            entry.account,
            entry.entry_type.as_str(),
            entry.category.as_str(),
            entry.amount,
            entry.status.as_str()
        );
    }
    Ok(())
}

pub async fn handle_tx_show(services: &Services, reference: &str) -> anyhow::Result<()> {
    let transfer = services.transfers.get_transfer(reference).await?;
    println!("{}", serde_json::to_string_pretty(&transfer)?);
    Ok(())
}

pub async fn handle_tx_force_fail(
    services: &Services,
    reference: &str,
    reason: &str,
) -> anyhow::Result<()> {
    let transfer = services.transfers.force_fail(reference, reason).await?;
    tracing::info!(reference, "Transfer force-failed by operator");
    println!("✓ Transfer {} is {}", transfer.reference, transfer.status);
    Ok(())
}

pub async fn handle_idempotency_purge(services: &Services) -> anyhow::Result<()> {
    let purged = services.idempotency.purge_expired().await?;
    println!("✓ Purged {} expired idempotency record(s)", purged);
    Ok(())
}

pub async fn handle_db_migrate(config: &Config) -> anyhow::Result<()> {
    let pool = startup::create_pool(config).await?;

    tracing::info!("Running database migrations...");
    startup::run_migrations(&pool).await?;
    println!("✓ Database migrations completed");

    Ok(())
}

pub fn handle_config_validate(config: &Config) -> anyhow::Result<()> {
    tracing::info!("Validating configuration...");

    println!("Configuration:");
    println!("  Database URL: {}", mask_password(&config.database_url));
    println!("  Bank API URL: {}", config.bank_api_url);
    println!("  Base currency: {}", config.base_currency);
    println!("  Provider timeout: {}s", config.provider_timeout.as_secs());
    println!(
        "  Circuit breaker: {} failures, {}s reset",
        config.breaker_failure_threshold,
        config.breaker_reset_timeout.as_secs()
    );
    println!("  Idempotency TTL: {}s", config.idempotency_ttl.as_secs());
    println!("  Stale transfer window: {}s", config.stale_transfer_after.as_secs());
    println!("  Reconcile schedule: {}", config.reconcile_schedule);
    println!(
        "  Biller settlement: {}",
        config
            .biller_settlement_account
            .as_deref()
            .unwrap_or("not set (bill payments disabled)")
    );

    println!("✓ Configuration is valid");
    Ok(())
}

fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.rfind('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            if let Some(slash_pos) = url[..colon_pos].rfind("//") {
                let prefix = &url[..slash_pos + 2];
                let user = &url[slash_pos + 2..colon_pos];
                let suffix = &url[at_pos..];
                return format!("{}{}:****{}", prefix, user, suffix);
            }
        }
    }
    url.to_string()
}
