use anyhow::Result;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, LogFormat};
use crate::ports::Store;
use crate::provider::{BankingProvider, GuardedProvider, HttpBankingClient};
use crate::services::{
    BankTransferStep, BillerGateway, BusinessOperations, IdempotencyStore, LedgerService,
    LogNotifier, Reconciler, TransactionProcessor, TransferService,
};

pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Plain => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

pub async fn create_pool(config: &Config) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let migrator = Migrator::new(Path::new("./migrations")).await?;
    migrator.run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}

pub fn bank_client(config: &Config) -> HttpBankingClient {
    HttpBankingClient::with_timeout(
        config.bank_api_url.clone(),
        config.bank_api_key.clone(),
        config.bank_api_secret.clone(),
        config.provider_timeout,
    )
}

/// Every service wired against one store and one provider.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn Store>,
    pub ledger: LedgerService,
    pub idempotency: IdempotencyStore,
    pub transfers: TransferService,
    pub provider: GuardedProvider,
    pub movement: Arc<BankTransferStep>,
    pub processor: TransactionProcessor,
    pub reconciler: Reconciler,
    biller_settlement_account: Option<String>,
}

impl Services {
    /// `bank` is wrapped in the circuit breaker here; pass the raw client.
    pub fn build(
        config: &Config,
        store: Arc<dyn Store>,
        bank: Arc<dyn BankingProvider>,
    ) -> Self {
        let ledger = LedgerService::new(store.clone(), config.base_currency.clone());
        let idempotency = IdempotencyStore::new(store.clone(), config.idempotency_ttl);
        let transfers = TransferService::new(
            store.clone(),
            ledger.clone(),
            idempotency.clone(),
            Arc::new(LogNotifier),
        );
        let provider = GuardedProvider::new(bank, config.breaker_config());
        let guarded: Arc<dyn BankingProvider> = Arc::new(provider.clone());

        let movement = Arc::new(BankTransferStep::new(transfers.clone(), guarded.clone()));
        let processor =
            TransactionProcessor::new(store.clone(), transfers.clone(), idempotency.clone());
        let reconciler = Reconciler::new(
            store.clone(),
            transfers.clone(),
            idempotency.clone(),
            guarded,
            config.stale_transfer_after,
        );

        tracing::info!(
            base_currency = %config.base_currency,
            breaker_threshold = config.breaker_failure_threshold,
            bill_payments = config.biller_settlement_account.is_some(),
            "Services initialised"
        );

        Self {
            store,
            ledger,
            idempotency,
            transfers,
            provider,
            movement,
            processor,
            reconciler,
            biller_settlement_account: config.biller_settlement_account.clone(),
        }
    }

    /// Loan, savings, bill and transfer operations over these services,
    /// fulfilling bill payments through `biller`.
    pub fn business_operations(&self, biller: Arc<dyn BillerGateway>) -> BusinessOperations {
        BusinessOperations::new(
            self.processor.clone(),
            self.movement.clone(),
            biller,
            self.biller_settlement_account.clone(),
        )
    }
}
