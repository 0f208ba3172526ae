pub mod idempotency;
pub mod ledger;
pub mod notifier;
pub mod operations;
pub mod reconciliation;
pub mod scheduler;
pub mod transaction_processor;
pub mod transfer;

pub use idempotency::IdempotencyStore;
pub use ledger::{BalanceDrift, LedgerService};
pub use notifier::{LogNotifier, Notifier};
pub use operations::{
    BillPaymentRequest, BillPurchase, BillerGateway, BillerReceipt, BusinessOperations,
    LoanRequest, SavingsRequest, ServiceType, WalletTransferRequest,
};
pub use reconciliation::{ReconciliationReport, Reconciler, SweepAction};
pub use scheduler::ReconciliationScheduler;
pub use transaction_processor::{
    BankTransferStep, Fulfilment, MoneyMovement, MovementResult, NoFulfilment, Operation, Posting,
    TransactionProcessor,
};
pub use transfer::TransferService;
