//! In-process implementation of the storage ports.
//!
//! A unit of work holds the store lock for its whole lifetime and mutates a
//! private copy of the state, so scopes are serialisable and an uncommitted
//! scope leaves no trace. Used by tests and dry runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::domain::{
    BusinessRecord, BusinessStatus, EntryStatus, EntryType, IdempotencyRecord, LedgerEntry,
    TraceImbalance, Transfer, TransferStatus,
};
use crate::ports::{
    BusinessSettlement, RepositoryError, RepositoryResult, Store, TransferSettlement, UnitOfWork,
};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    /// Append order is creation order.
    entries: Vec<LedgerEntry>,
    transfers: HashMap<String, Transfer>,
    business: HashMap<Uuid, BusinessRecord>,
    idempotency: HashMap<String, IdempotencyRecord>,
    wallet_cache: BTreeMap<String, i64>,
}

impl MemoryState {
    fn completed_balance(&self, account: &str) -> RepositoryResult<i64> {
        self.entries
            .iter()
            .filter(|e| e.account == account && e.status == EntryStatus::Completed)
            .try_fold(0i64, |total, e| {
                let signed = match e.entry_type {
                    EntryType::Credit => Some(e.amount),
                    EntryType::Debit => e.amount.checked_neg(),
                };
                signed
                    .and_then(|amount| total.checked_add(amount))
                    .ok_or_else(|| overflow(format!("balance of {account}")))
            })
    }

    fn entries_by_trace(&self, trace_id: &str) -> Vec<LedgerEntry> {
        self.entries
            .iter()
            .filter(|e| e.trace_id == trace_id)
            .cloned()
            .collect()
    }

    fn live_idempotency(&self, key: &str, now: DateTime<Utc>) -> Option<IdempotencyRecord> {
        self.idempotency
            .get(key)
            .filter(|r| !r.is_expired(now))
            .cloned()
    }
}

/// Postgres rejects the same sums with `bigint out of range`.
fn overflow(what: String) -> RepositoryError {
    RepositoryError::Overflow(format!("{what} does not fit in i64"))
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> RepositoryResult<Box<dyn UnitOfWork>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryUnitOfWork { guard, working }))
    }

    async fn entries_by_trace(&self, trace_id: &str) -> RepositoryResult<Vec<LedgerEntry>> {
        Ok(self.state.lock().await.entries_by_trace(trace_id))
    }

    async fn completed_balance(&self, account: &str) -> RepositoryResult<i64> {
        self.state.lock().await.completed_balance(account)
    }

    async fn unbalanced_traces(&self) -> RepositoryResult<Vec<TraceImbalance>> {
        let state = self.state.lock().await;
        let mut totals: BTreeMap<&str, (i64, i64)> = BTreeMap::new();
        for entry in state
            .entries
            .iter()
            .filter(|e| e.status == EntryStatus::Completed)
        {
            let (debits, credits) = totals.entry(entry.trace_id.as_str()).or_default();
            let side = match entry.entry_type {
                EntryType::Debit => debits,
                EntryType::Credit => credits,
            };
            *side = side
                .checked_add(entry.amount)
                .ok_or_else(|| overflow(format!("totals of trace {}", entry.trace_id)))?;
        }

        Ok(totals
            .into_iter()
            .filter(|(_, (debits, credits))| debits != credits)
            .map(|(trace_id, (total_debits, total_credits))| TraceImbalance {
                trace_id: trace_id.to_string(),
                total_debits,
                total_credits,
            })
            .collect())
    }

    async fn transfer_by_reference(&self, reference: &str) -> RepositoryResult<Option<Transfer>> {
        Ok(self.state.lock().await.transfers.get(reference).cloned())
    }

    async fn transfers_by_trace(&self, trace_id: &str) -> RepositoryResult<Vec<Transfer>> {
        let state = self.state.lock().await;
        let mut transfers: Vec<Transfer> = state
            .transfers
            .values()
            .filter(|t| t.trace_id == trace_id)
            .cloned()
            .collect();
        transfers.sort_by_key(|t| t.created_at);
        Ok(transfers)
    }

    async fn stale_transfers(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> RepositoryResult<Vec<Transfer>> {
        let state = self.state.lock().await;
        let mut stale: Vec<Transfer> = state
            .transfers
            .values()
            .filter(|t| t.status == TransferStatus::Pending && t.created_at <= created_before)
            .cloned()
            .collect();
        stale.sort_by_key(|t| t.created_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }

    async fn business_record(&self, id: Uuid) -> RepositoryResult<Option<BusinessRecord>> {
        Ok(self.state.lock().await.business.get(&id).cloned())
    }

    async fn stale_business_records(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> RepositoryResult<Vec<BusinessRecord>> {
        let state = self.state.lock().await;
        let mut stale: Vec<BusinessRecord> = state
            .business
            .values()
            .filter(|r| r.status == BusinessStatus::Pending && r.created_at <= created_before)
            .cloned()
            .collect();
        stale.sort_by_key(|r| r.created_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }

    async fn business_records_needing_review(&self) -> RepositoryResult<Vec<BusinessRecord>> {
        let state = self.state.lock().await;
        let mut records: Vec<BusinessRecord> = state
            .business
            .values()
            .filter(|r| r.needs_review)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn find_idempotency(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Option<IdempotencyRecord>> {
        Ok(self.state.lock().await.live_idempotency(key, now))
    }

    async fn purge_expired_idempotency(&self, now: DateTime<Utc>) -> RepositoryResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.idempotency.len();
        state.idempotency.retain(|_, r| !r.is_expired(now));
        Ok((before - state.idempotency.len()) as u64)
    }

    async fn cached_balance(&self, user_id: &str) -> RepositoryResult<Option<i64>> {
        Ok(self.state.lock().await.wallet_cache.get(user_id).copied())
    }

    async fn cached_balances(&self) -> RepositoryResult<Vec<(String, i64)>> {
        let state = self.state.lock().await;
        Ok(state
            .wallet_cache
            .iter()
            .map(|(user, balance)| (user.clone(), *balance))
            .collect())
    }
}

struct MemoryUnitOfWork {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn insert_entry(&mut self, entry: &LedgerEntry) -> RepositoryResult<()> {
        if self.working.entries.iter().any(|e| e.id == entry.id) {
            return Err(RepositoryError::Conflict(format!("ledger entry {}", entry.id)));
        }
        self.working.entries.push(entry.clone());
        Ok(())
    }

    async fn entry(&mut self, id: Uuid) -> RepositoryResult<Option<LedgerEntry>> {
        Ok(self.working.entries.iter().find(|e| e.id == id).cloned())
    }

    async fn entries_by_trace(&mut self, trace_id: &str) -> RepositoryResult<Vec<LedgerEntry>> {
        Ok(self.working.entries_by_trace(trace_id))
    }

    async fn settle_entry(
        &mut self,
        id: Uuid,
        status: EntryStatus,
        processed_at: DateTime<Utc>,
    ) -> RepositoryResult<Option<LedgerEntry>> {
        match self
            .working
            .entries
            .iter_mut()
            .find(|e| e.id == id && e.status == EntryStatus::Pending)
        {
            Some(entry) => {
                entry.status = status;
                entry.processed_at = Some(processed_at);
                Ok(Some(entry.clone()))
            }
            None => Ok(None),
        }
    }

    async fn insert_transfer(&mut self, transfer: &Transfer) -> RepositoryResult<()> {
        if self.working.transfers.contains_key(&transfer.reference) {
            return Err(RepositoryError::Conflict(format!(
                "transfer reference {}",
                transfer.reference
            )));
        }
        self.working
            .transfers
            .insert(transfer.reference.clone(), transfer.clone());
        Ok(())
    }

    async fn transfer_by_reference(
        &mut self,
        reference: &str,
    ) -> RepositoryResult<Option<Transfer>> {
        Ok(self.working.transfers.get(reference).cloned())
    }

    async fn settle_transfer(
        &mut self,
        reference: &str,
        settlement: &TransferSettlement,
    ) -> RepositoryResult<Option<Transfer>> {
        match self
            .working
            .transfers
            .get_mut(reference)
            .filter(|t| t.status == TransferStatus::Pending)
        {
            Some(transfer) => {
                transfer.status = settlement.status;
                transfer.updated_at = settlement.at;
                if settlement.provider_ref.is_some() {
                    transfer.provider_ref = settlement.provider_ref.clone();
                }
                if settlement.failure_reason.is_some() {
                    transfer.failure_reason = settlement.failure_reason.clone();
                }
                if settlement.status == TransferStatus::Completed {
                    transfer.completed_at = Some(settlement.at);
                }
                Ok(Some(transfer.clone()))
            }
            None => Ok(None),
        }
    }

    async fn insert_business_record(&mut self, record: &BusinessRecord) -> RepositoryResult<()> {
        if self
            .working
            .business
            .values()
            .any(|r| r.idempotency_key == record.idempotency_key)
        {
            return Err(RepositoryError::Conflict(format!(
                "business record for key {}",
                record.idempotency_key
            )));
        }
        self.working.business.insert(record.id, record.clone());
        Ok(())
    }

    async fn settle_business_record(
        &mut self,
        id: Uuid,
        settlement: &BusinessSettlement,
    ) -> RepositoryResult<Option<BusinessRecord>> {
        match self
            .working
            .business
            .get_mut(&id)
            .filter(|r| r.status == BusinessStatus::Pending)
        {
            Some(record) => {
                record.status = settlement.status;
                record.updated_at = settlement.at;
                record.needs_review = settlement.needs_review;
                if settlement.reference.is_some() {
                    record.reference = settlement.reference.clone();
                }
                if settlement.failure_reason.is_some() {
                    record.failure_reason = settlement.failure_reason.clone();
                }
                if settlement.details.is_some() {
                    record.details = settlement.details.clone();
                }
                Ok(Some(record.clone()))
            }
            None => Ok(None),
        }
    }

    async fn adjust_cached_balance(&mut self, user_id: &str, delta: i64) -> RepositoryResult<()> {
        let cached = self
            .working
            .wallet_cache
            .entry(user_id.to_string())
            .or_insert(0);
        *cached = cached
            .checked_add(delta)
            .ok_or_else(|| overflow(format!("cached balance of {user_id}")))?;
        Ok(())
    }

    async fn set_cached_balance(&mut self, user_id: &str, balance: i64) -> RepositoryResult<()> {
        self.working
            .wallet_cache
            .insert(user_id.to_string(), balance);
        Ok(())
    }

    async fn find_idempotency(
        &mut self,
        key: &str,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Option<IdempotencyRecord>> {
        Ok(self.working.live_idempotency(key, now))
    }

    async fn save_idempotency(&mut self, record: &IdempotencyRecord) -> RepositoryResult<()> {
        if self
            .working
            .live_idempotency(&record.key, record.created_at)
            .is_some()
        {
            return Err(RepositoryError::Conflict(format!(
                "idempotency key {}",
                record.key
            )));
        }
        self.working
            .idempotency
            .insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> RepositoryResult<()> {
        let MemoryUnitOfWork { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> RepositoryResult<()> {
        Ok(())
    }
}
