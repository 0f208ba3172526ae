//! Storage ports.
//!
//! `Store` is the single strongly-consistent datastore. Every write happens
//! inside a `UnitOfWork`, the atomic local scope; nothing a unit of work does
//! is visible to other readers until `commit`. Dropping a unit of work without
//! committing rolls it back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    BusinessRecord, BusinessStatus, EntryStatus, IdempotencyRecord, LedgerEntry, TraceImbalance,
    Transfer, TransferStatus,
};

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Numeric overflow: {0}")]
    Overflow(String),
}

const UNIQUE_VIOLATION: &str = "23505";

impl From<sqlx::Error> for RepositoryError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("row not found".to_string()),
            sqlx::Error::Database(ref db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                RepositoryError::Conflict(db.message().to_string())
            }
            other => RepositoryError::Database(other),
        }
    }
}

impl From<crate::domain::ParseEnumError> for RepositoryError {
    fn from(e: crate::domain::ParseEnumError) -> Self {
        RepositoryError::Decode(e.to_string())
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Fields written when a transfer leaves PENDING.
#[derive(Debug, Clone)]
pub struct TransferSettlement {
    pub status: TransferStatus,
    pub provider_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Fields written when a business record leaves PENDING.
#[derive(Debug, Clone)]
pub struct BusinessSettlement {
    pub status: BusinessStatus,
    pub reference: Option<String>,
    pub needs_review: bool,
    pub failure_reason: Option<String>,
    pub details: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Open one atomic local scope.
    async fn begin(&self) -> RepositoryResult<Box<dyn UnitOfWork>>;

    /// Entries of one trace in creation order.
    async fn entries_by_trace(&self, trace_id: &str) -> RepositoryResult<Vec<LedgerEntry>>;

    /// sum(CREDIT) - sum(DEBIT) over COMPLETED entries of `account`.
    async fn completed_balance(&self, account: &str) -> RepositoryResult<i64>;

    /// Traces whose COMPLETED debits and credits differ.
    async fn unbalanced_traces(&self) -> RepositoryResult<Vec<TraceImbalance>>;

    async fn transfer_by_reference(&self, reference: &str) -> RepositoryResult<Option<Transfer>>;

    /// Transfers sharing `trace_id`, oldest first.
    async fn transfers_by_trace(&self, trace_id: &str) -> RepositoryResult<Vec<Transfer>>;

    /// PENDING transfers created at or before `created_before`, oldest first.
    async fn stale_transfers(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> RepositoryResult<Vec<Transfer>>;

    async fn business_record(&self, id: Uuid) -> RepositoryResult<Option<BusinessRecord>>;

    /// PENDING business records created at or before `created_before`, oldest first.
    async fn stale_business_records(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> RepositoryResult<Vec<BusinessRecord>>;

    async fn business_records_needing_review(&self) -> RepositoryResult<Vec<BusinessRecord>>;

    /// Live record for `key`; expired records are invisible.
    async fn find_idempotency(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Option<IdempotencyRecord>>;

    /// Delete records whose `expires_at` has passed. Returns the count removed.
    async fn purge_expired_idempotency(&self, now: DateTime<Utc>) -> RepositoryResult<u64>;

    async fn cached_balance(&self, user_id: &str) -> RepositoryResult<Option<i64>>;

    async fn cached_balances(&self) -> RepositoryResult<Vec<(String, i64)>>;
}

#[async_trait]
pub trait UnitOfWork: Send {
    async fn insert_entry(&mut self, entry: &LedgerEntry) -> RepositoryResult<()>;

    async fn entry(&mut self, id: Uuid) -> RepositoryResult<Option<LedgerEntry>>;

    async fn entries_by_trace(&mut self, trace_id: &str) -> RepositoryResult<Vec<LedgerEntry>>;

    /// Move a PENDING entry to `status`. `None` if it is missing or not PENDING.
    async fn settle_entry(
        &mut self,
        id: Uuid,
        status: EntryStatus,
        processed_at: DateTime<Utc>,
    ) -> RepositoryResult<Option<LedgerEntry>>;

    async fn insert_transfer(&mut self, transfer: &Transfer) -> RepositoryResult<()>;

    /// Read and lock the transfer for the rest of the scope.
    async fn transfer_by_reference(
        &mut self,
        reference: &str,
    ) -> RepositoryResult<Option<Transfer>>;

    /// Move a PENDING transfer. `None` if it is missing or not PENDING.
    async fn settle_transfer(
        &mut self,
        reference: &str,
        settlement: &TransferSettlement,
    ) -> RepositoryResult<Option<Transfer>>;

    async fn insert_business_record(&mut self, record: &BusinessRecord) -> RepositoryResult<()>;

    /// Move a PENDING business record. `None` if it is missing or not PENDING.
    async fn settle_business_record(
        &mut self,
        id: Uuid,
        settlement: &BusinessSettlement,
    ) -> RepositoryResult<Option<BusinessRecord>>;

    /// Add `delta` to the advisory wallet counter, creating it at zero.
    async fn adjust_cached_balance(&mut self, user_id: &str, delta: i64) -> RepositoryResult<()>;

    async fn set_cached_balance(&mut self, user_id: &str, balance: i64) -> RepositoryResult<()>;

    async fn find_idempotency(
        &mut self,
        key: &str,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Option<IdempotencyRecord>>;

    /// Insert a record. A live record under the same key is a `Conflict`.
    async fn save_idempotency(&mut self, record: &IdempotencyRecord) -> RepositoryResult<()>;

    async fn commit(self: Box<Self>) -> RepositoryResult<()>;

    async fn rollback(self: Box<Self>) -> RepositoryResult<()>;
}
