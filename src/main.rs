use clap::Parser;
use std::sync::Arc;

use fincore::adapters::PostgresStore;
use fincore::cli::{
    self, Cli, Commands, DbCommands, IdempotencyCommands, ReconcileCommands, TxCommands,
};
use fincore::config::Config;
use fincore::startup::{self, Services};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    startup::init_tracing(config.log_format);

    match cli.command {
        Some(Commands::Config) => return cli::handle_config_validate(&config),
        Some(Commands::Db(DbCommands::Migrate)) => return cli::handle_db_migrate(&config).await,
        _ => {}
    }

    let pool = startup::create_pool(&config).await?;
    let store = Arc::new(PostgresStore::new(pool.clone()));
    let bank = Arc::new(startup::bank_client(&config));
    let services = Services::build(&config, store, bank);

    match cli.command {
        Some(Commands::Reconcile(ReconcileCommands::Audit { csv })) => {
            cli::handle_reconcile_audit(&services, csv).await
        }
        Some(Commands::Reconcile(ReconcileCommands::Sweep)) => {
            cli::handle_reconcile_sweep(&services).await
        }
        Some(Commands::Balance { user_id }) => cli::handle_balance(&services, &user_id).await,
        Some(Commands::Trace { trace_id }) => cli::handle_trace(&services, &trace_id).await,
        Some(Commands::Tx(TxCommands::Show { reference })) => {
            cli::handle_tx_show(&services, &reference).await
        }
        Some(Commands::Tx(TxCommands::ForceFail { reference, reason })) => {
            cli::handle_tx_force_fail(&services, &reference, &reason).await
        }
        Some(Commands::Idempotency(IdempotencyCommands::Purge)) => {
            cli::handle_idempotency_purge(&services).await
        }
        Some(Commands::Run) | None => {
            startup::run_migrations(&pool).await?;
            tracing::info!(
                schedule = %config.reconcile_schedule,
                "Starting reconciliation scheduler"
            );
            cli::handle_run(&config, &services).await
        }
        Some(Commands::Config) | Some(Commands::Db(_)) => Ok(()),
    }
}
