use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::account;
use crate::domain::{
    DoubleEntry, DoubleEntryOptions, EntryCategory, EntryStatus, EntryType, LedgerEntry, NewEntry,
    TraceImbalance,
};
use crate::error::{AppError, AppResult};
use crate::ports::{Store, UnitOfWork};

/// A wallet whose advisory counter disagrees with its derived balance.
///
/// In-flight transfers show up here transiently: the counter already carries
/// their optimistic decrement while the derived balance ignores PENDING rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceDrift {
    pub user_id: String,
    pub cached: i64,
    pub derived: i64,
}

impl BalanceDrift {
    pub fn difference(&self) -> i64 {
        self.cached - self.derived
    }
}

/// Append-only double-entry bookkeeping.
///
/// Writes go through the caller's unit of work so they commit or vanish
/// together with whatever else that scope does. Balances are always derived
/// from COMPLETED entries.
#[derive(Clone)]
pub struct LedgerService {
    store: Arc<dyn Store>,
    base_currency: String,
}

impl LedgerService {
    pub fn new(store: Arc<dyn Store>, base_currency: impl Into<String>) -> Self {
        Self {
            store,
            base_currency: base_currency.into(),
        }
    }

    pub fn base_currency(&self) -> &str {
        &self.base_currency
    }

    /// Append one entry. Status defaults to PENDING and currency to the base
    /// currency. There is no funds check.
    pub async fn create_entry(
        &self,
        uow: &mut dyn UnitOfWork,
        entry: NewEntry,
    ) -> AppResult<LedgerEntry> {
        validate_entry(&entry.trace_id, &entry.account, entry.amount)?;

        let entry = entry.into_entry(&self.base_currency);
        uow.insert_entry(&entry).await?;

        tracing::debug!(
            trace_id = %entry.trace_id,
            account = %entry.account,
            entry_type = entry.entry_type.as_str(),
            amount = entry.amount,
            status = entry.status.as_str(),
            "Ledger entry appended"
        );
        Ok(entry)
    }

    /// Append a DEBIT on `debit_account` and a CREDIT on `credit_account` for
    /// the same amount and trace, debit first.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_double_entry(
        &self,
        uow: &mut dyn UnitOfWork,
        trace_id: &str,
        debit_account: &str,
        credit_account: &str,
        amount: i64,
        category: EntryCategory,
        options: DoubleEntryOptions,
    ) -> AppResult<DoubleEntry> {
        if debit_account == credit_account {
            return Err(AppError::Validation(format!(
                "debit and credit account are both {debit_account}"
            )));
        }

        let leg = |account: &str, entry_type: EntryType| NewEntry {
            subtype: options.subtype.clone(),
            currency: options.currency.clone(),
            status: options.status,
            related_to: options.related_to.clone(),
            meta: options.meta.clone(),
            ..NewEntry::new(trace_id, account, entry_type, category, amount)
        };

        let debit = self
            .create_entry(uow, leg(debit_account, EntryType::Debit))
            .await?;
        let credit = self
            .create_entry(uow, leg(credit_account, EntryType::Credit))
            .await?;

        Ok(DoubleEntry { debit, credit })
    }

    pub async fn get_by_trace_id(&self, trace_id: &str) -> AppResult<Vec<LedgerEntry>> {
        Ok(self.store.entries_by_trace(trace_id).await?)
    }

    /// One-way status change. Setting the status an entry already has is a
    /// no-op; leaving a terminal status is an `InvalidTransition`.
    pub async fn update_status(
        &self,
        uow: &mut dyn UnitOfWork,
        entry_id: Uuid,
        status: EntryStatus,
    ) -> AppResult<LedgerEntry> {
        let current = uow
            .entry(entry_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("ledger entry {entry_id}")))?;

        if current.status == status {
            return Ok(current);
        }
        if current.status.is_terminal() || !status.is_terminal() {
            return Err(AppError::InvalidTransition(format!(
                "ledger entry {entry_id}: {} -> {}",
                current.status, status
            )));
        }

        uow.settle_entry(entry_id, status, Utc::now())
            .await?
            .ok_or_else(|| {
                AppError::InvalidTransition(format!(
                    "ledger entry {entry_id} left PENDING concurrently"
                ))
            })
    }

    /// sum(CREDIT) - sum(DEBIT) over COMPLETED entries of the user's wallet.
    pub async fn user_wallet_balance(&self, user_id: &str) -> AppResult<i64> {
        Ok(self
            .store
            .completed_balance(&account::wallet(user_id))
            .await?)
    }

    pub async fn find_inconsistencies(&self) -> AppResult<Vec<TraceImbalance>> {
        Ok(self.store.unbalanced_traces().await?)
    }

    /// Overwrite the advisory counter with the derived balance.
    pub async fn refresh_cached_balance(&self, user_id: &str) -> AppResult<i64> {
        let derived = self.user_wallet_balance(user_id).await?;

        let mut uow = self.store.begin().await?;
        uow.set_cached_balance(user_id, derived).await?;
        uow.commit().await?;

        tracing::info!(user_id, balance = derived, "Cached wallet balance refreshed");
        Ok(derived)
    }

    pub async fn cached_balance_drift(&self) -> AppResult<Vec<BalanceDrift>> {
        let mut drift = Vec::new();
        for (user_id, cached) in self.store.cached_balances().await? {
            let derived = self.user_wallet_balance(&user_id).await?;
            if cached != derived {
                drift.push(BalanceDrift {
                    user_id,
                    cached,
                    derived,
                });
            }
        }
        Ok(drift)
    }
}

fn validate_entry(trace_id: &str, account: &str, amount: i64) -> AppResult<()> {
    if trace_id.trim().is_empty() {
        return Err(AppError::Validation("trace id is required".to_string()));
    }
    if account.trim().is_empty() {
        return Err(AppError::Validation("account is required".to_string()));
    }
    if amount <= 0 {
        return Err(AppError::Validation(format!(
            "amount must be positive, got {amount}"
        )));
    }
    Ok(())
}
