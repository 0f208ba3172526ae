//! Framework-agnostic domain types.

pub mod account;
pub mod business;
pub mod idempotency;
pub mod ledger;
pub mod transfer;

pub use business::{BusinessKind, BusinessRecord, BusinessStatus, OperationOutcome, OutcomeStatus};
pub use idempotency::IdempotencyRecord;
pub use ledger::{
    DoubleEntry, DoubleEntryOptions, EntryCategory, EntryStatus, EntryType, LedgerEntry, NewEntry,
    TraceImbalance,
};
pub use transfer::{Transfer, TransferReceipt, TransferRequest, TransferStatus, TransferType};

/// A stored enum column held a value this build does not know.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
