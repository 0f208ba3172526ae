//! Transfer lifecycle: PENDING -> COMPLETED | FAILED, exactly once.
//!
//! Initiation reserves intent: it records the transfer and, for a wallet
//! source, a PENDING DEBIT plus an optimistic decrement of the wallet's cached
//! counter. Completion settles that DEBIT and writes its matching CREDIT.
//! Failure marks the DEBIT FAILED and restores the counter. Each step is one
//! local scope; no scope is held across a provider call.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;

use crate::domain::account;
use crate::domain::idempotency::fingerprint;
use crate::domain::transfer::{new_reference, new_trace_id};
use crate::domain::{
    EntryCategory, EntryStatus, EntryType, LedgerEntry, NewEntry, Transfer, TransferReceipt,
    TransferRequest, TransferStatus, TransferType,
};
use crate::error::{AppError, AppResult};
use crate::ports::{Store, TransferSettlement, UnitOfWork};

use super::idempotency::IdempotencyStore;
use super::ledger::LedgerService;
use super::notifier::{notify, Notifier};

/// Result of a settling call made inside a caller's scope.
#[derive(Debug, Clone)]
pub struct Settled {
    pub transfer: Transfer,
    /// `false` when the transfer was already in the requested terminal state.
    pub changed: bool,
}

#[derive(Clone)]
pub struct TransferService {
    store: Arc<dyn Store>,
    ledger: LedgerService,
    idempotency: IdempotencyStore,
    notifier: Arc<dyn Notifier>,
}

impl TransferService {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: LedgerService,
        idempotency: IdempotencyStore,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            ledger,
            idempotency,
            notifier,
        }
    }

    pub fn ledger(&self) -> &LedgerService {
        &self.ledger
    }

    pub async fn get_transfer(&self, reference: &str) -> AppResult<Transfer> {
        self.store
            .transfer_by_reference(reference)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("transfer {reference}")))
    }

    /// Record a PENDING transfer and reserve the source wallet's funds.
    ///
    /// With an idempotency key, a replay of the same request returns the first
    /// receipt and creates nothing.
    pub async fn initiate_transfer(
        &self,
        request: TransferRequest,
        subtype: Option<&str>,
    ) -> AppResult<TransferReceipt> {
        validate_request(&request)?;
        let request_hash = fingerprint(&(&request, subtype))?;

        let mut uow = self.store.begin().await?;

        if let Some(key) = request.idempotency_key.as_deref() {
            if let Some(receipt) = self
                .idempotency
                .replay_in::<TransferReceipt>(uow.as_mut(), key, &request.user_id, &request_hash)
                .await?
            {
                uow.rollback().await?;
                return Ok(receipt);
            }
        }

        let transfer = self.initiate_in(uow.as_mut(), &request, subtype).await?;
        let receipt = TransferReceipt {
            trace_id: transfer.trace_id.clone(),
            reference: transfer.reference.clone(),
            status: transfer.status,
            transfer_id: transfer.id,
        };

        if let Some(key) = request.idempotency_key.as_deref() {
            self.idempotency
                .save(uow.as_mut(), key, &request.user_id, &request_hash, &receipt)
                .await?;
        }

        uow.commit().await?;

        tracing::info!(
            reference = %transfer.reference,
            trace_id = %transfer.trace_id,
            user_id = %transfer.user_id,
            amount = transfer.amount,
            transfer_type = transfer.transfer_type.as_str(),
            "Transfer initiated"
        );
        Ok(receipt)
    }

    /// Initiation inside the caller's scope, without idempotency handling.
    pub async fn initiate_in(
        &self,
        uow: &mut dyn UnitOfWork,
        request: &TransferRequest,
        subtype: Option<&str>,
    ) -> AppResult<Transfer> {
        let now = Utc::now();
        let transfer = Transfer {
            id: uuid::Uuid::new_v4(),
            trace_id: request.trace_id.clone().unwrap_or_else(new_trace_id),
            user_id: request.user_id.clone(),
            from_account: request.from_account.clone(),
            to_account: request.to_account.clone(),
            amount: request.amount,
            currency: request
                .currency
                .clone()
                .unwrap_or_else(|| self.ledger.base_currency().to_string()),
            transfer_type: request.transfer_type,
            category: request.category,
            subtype: subtype.map(str::to_string),
            status: TransferStatus::Pending,
            reference: new_reference(),
            provider_ref: None,
            narration: request.narration.clone(),
            failure_reason: None,
            meta: request.meta.clone(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        uow.insert_transfer(&transfer).await?;

        if let Some(owner) = account::wallet_owner(&transfer.from_account) {
            self.ledger
                .create_entry(
                    uow,
                    transfer_leg(&transfer, &transfer.from_account, EntryType::Debit),
                )
                .await?;
            uow.adjust_cached_balance(owner, -transfer.amount).await?;
        }

        Ok(transfer)
    }

    /// Settle a PENDING transfer as COMPLETED and notify the owner.
    pub async fn complete_transfer(
        &self,
        reference: &str,
        subtype: Option<&str>,
    ) -> AppResult<Transfer> {
        let mut uow = self.store.begin().await?;
        let settled = self.complete_in(uow.as_mut(), reference, subtype, None).await?;
        uow.commit().await?;

        if settled.changed {
            tracing::info!(reference, trace_id = %settled.transfer.trace_id, "Transfer completed");
            notify(self.notifier.as_ref(), &settled.transfer).await;
        }
        Ok(settled.transfer)
    }

    pub async fn complete_in(
        &self,
        uow: &mut dyn UnitOfWork,
        reference: &str,
        subtype: Option<&str>,
        provider_ref: Option<String>,
    ) -> AppResult<Settled> {
        let transfer = self.locked(uow, reference).await?;
        match transfer.status {
            TransferStatus::Completed => {
                return Ok(Settled {
                    transfer,
                    changed: false,
                })
            }
            TransferStatus::Failed => return Err(crossing(&transfer, TransferStatus::Completed)),
            TransferStatus::Pending => {}
        }

        if account::is_wallet(&transfer.from_account) {
            let debit = self.originating_debit(uow, &transfer).await?;
            self.ledger
                .update_status(uow, debit.id, EntryStatus::Completed)
                .await?;

            let credit_account = match transfer.transfer_type {
                TransferType::Intra => transfer.to_account.as_str(),
                TransferType::Inter => account::BANK_SETTLEMENT,
            };
            let mut credit = transfer_leg(&transfer, credit_account, EntryType::Credit)
                .status(EntryStatus::Completed);
            if let Some(subtype) = subtype {
                credit = credit.subtype(subtype);
            }
            self.ledger.create_entry(uow, credit).await?;

            if let Some(owner) = account::wallet_owner(credit_account) {
                uow.adjust_cached_balance(owner, transfer.amount).await?;
            }
        }

        let settlement = TransferSettlement {
            status: TransferStatus::Completed,
            provider_ref,
            failure_reason: None,
            at: Utc::now(),
        };
        let transfer = uow
            .settle_transfer(reference, &settlement)
            .await?
            .ok_or_else(|| crossing(&transfer, TransferStatus::Completed))?;

        Ok(Settled {
            transfer,
            changed: true,
        })
    }

    /// Settle a PENDING transfer as FAILED, releasing the wallet reservation.
    pub async fn fail_transfer(&self, reference: &str) -> AppResult<Transfer> {
        let mut uow = self.store.begin().await?;
        let settled = self
            .fail_in(uow.as_mut(), reference, "failed by request".to_string())
            .await?;
        uow.commit().await?;

        if settled.changed {
            tracing::warn!(reference, trace_id = %settled.transfer.trace_id, "Transfer failed");
            notify(self.notifier.as_ref(), &settled.transfer).await;
        }
        Ok(settled.transfer)
    }

    pub async fn fail_in(
        &self,
        uow: &mut dyn UnitOfWork,
        reference: &str,
        reason: String,
    ) -> AppResult<Settled> {
        let transfer = self.locked(uow, reference).await?;
        match transfer.status {
            TransferStatus::Failed => {
                return Ok(Settled {
                    transfer,
                    changed: false,
                })
            }
            TransferStatus::Completed => return Err(crossing(&transfer, TransferStatus::Failed)),
            TransferStatus::Pending => {}
        }

        if let Some(owner) = account::wallet_owner(&transfer.from_account) {
            let debit = self.originating_debit(uow, &transfer).await?;
            self.ledger
                .update_status(uow, debit.id, EntryStatus::Failed)
                .await?;
            uow.adjust_cached_balance(owner, transfer.amount).await?;
        }

        self.settle_failed(uow, &transfer, reason).await
    }

    /// Fail a transfer that stayed PENDING too long.
    ///
    /// Unlike [`Self::fail_in`] the held DEBIT is settled into
    /// `transfer_suspense` and returned to the wallet by a REFUND pair on the
    /// same trace, so the trace balances and the wallet shows the refund.
    pub async fn force_fail_in(
        &self,
        uow: &mut dyn UnitOfWork,
        reference: &str,
        reason: String,
    ) -> AppResult<Settled> {
        let transfer = self.locked(uow, reference).await?;
        match transfer.status {
            TransferStatus::Failed => {
                return Ok(Settled {
                    transfer,
                    changed: false,
                })
            }
            TransferStatus::Completed => return Err(crossing(&transfer, TransferStatus::Failed)),
            TransferStatus::Pending => {}
        }

        if let Some(owner) = account::wallet_owner(&transfer.from_account) {
            let debit = self.originating_debit(uow, &transfer).await?;
            self.ledger
                .update_status(uow, debit.id, EntryStatus::Completed)
                .await?;
            self.ledger
                .create_entry(
                    uow,
                    transfer_leg(&transfer, account::TRANSFER_SUSPENSE, EntryType::Credit)
                        .status(EntryStatus::Completed),
                )
                .await?;

            let refund = |account: &str, entry_type: EntryType| NewEntry {
                category: EntryCategory::Refund,
                meta: Some(json!({ "reason": reason })),
                ..transfer_leg(&transfer, account, entry_type).status(EntryStatus::Completed)
            };
            self.ledger
                .create_entry(uow, refund(account::TRANSFER_SUSPENSE, EntryType::Debit))
                .await?;
            self.ledger
                .create_entry(uow, refund(&transfer.from_account, EntryType::Credit))
                .await?;

            uow.adjust_cached_balance(owner, transfer.amount).await?;
        }

        self.settle_failed(uow, &transfer, reason).await
    }

    /// Open a scope, force-fail `reference`, commit and notify.
    pub async fn force_fail(&self, reference: &str, reason: &str) -> AppResult<Transfer> {
        let mut uow = self.store.begin().await?;
        let settled = self
            .force_fail_in(uow.as_mut(), reference, reason.to_string())
            .await?;
        uow.commit().await?;

        if settled.changed {
            tracing::warn!(reference, reason, "Transfer force-failed and refunded");
            notify(self.notifier.as_ref(), &settled.transfer).await;
        }
        Ok(settled.transfer)
    }

    pub(crate) async fn notify(&self, transfer: &Transfer) {
        notify(self.notifier.as_ref(), transfer).await;
    }

    async fn settle_failed(
        &self,
        uow: &mut dyn UnitOfWork,
        transfer: &Transfer,
        reason: String,
    ) -> AppResult<Settled> {
        let settlement = TransferSettlement {
            status: TransferStatus::Failed,
            provider_ref: None,
            failure_reason: Some(reason),
            at: Utc::now(),
        };
        let settled = uow
            .settle_transfer(&transfer.reference, &settlement)
            .await?
            .ok_or_else(|| crossing(transfer, TransferStatus::Failed))?;

        Ok(Settled {
            transfer: settled,
            changed: true,
        })
    }

    async fn locked(&self, uow: &mut dyn UnitOfWork, reference: &str) -> AppResult<Transfer> {
        uow.transfer_by_reference(reference)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("transfer {reference}")))
    }

    async fn originating_debit(
        &self,
        uow: &mut dyn UnitOfWork,
        transfer: &Transfer,
    ) -> AppResult<LedgerEntry> {
        uow.entries_by_trace(&transfer.trace_id)
            .await?
            .into_iter()
            .find(|e| {
                e.entry_type == EntryType::Debit
                    && e.status == EntryStatus::Pending
                    && e.account == transfer.from_account
                    && e.related_to.as_deref() == Some(transfer.reference.as_str())
            })
            .ok_or_else(|| {
                AppError::Internal(format!(
                    "pending debit for transfer {} is missing",
                    transfer.reference
                ))
            })
    }
}

fn transfer_leg(transfer: &Transfer, account: &str, entry_type: EntryType) -> NewEntry {
    let mut entry = NewEntry::new(
        transfer.trace_id.clone(),
        account,
        entry_type,
        transfer.category,
        transfer.amount,
    )
    .related_to(transfer.reference.clone());
    entry.currency = Some(transfer.currency.clone());
    if let Some(subtype) = &transfer.subtype {
        entry = entry.subtype(subtype.clone());
    }
    entry
}

fn crossing(transfer: &Transfer, to: TransferStatus) -> AppError {
    AppError::InvalidTransition(format!(
        "transfer {}: {} -> {}",
        transfer.reference, transfer.status, to
    ))
}

fn validate_request(request: &TransferRequest) -> AppResult<()> {
    if request.amount <= 0 {
        return Err(AppError::Validation(format!(
            "amount must be a positive number of minor units, got {}",
            request.amount
        )));
    }
    if request.user_id.trim().is_empty() {
        return Err(AppError::Validation("user id is required".to_string()));
    }
    if request.from_account.trim().is_empty() || request.to_account.trim().is_empty() {
        return Err(AppError::Validation(
            "source and destination accounts are required".to_string(),
        ));
    }
    if request.from_account == request.to_account {
        return Err(AppError::Validation(
            "source and destination accounts must differ".to_string(),
        ));
    }
    if let Some(key) = &request.idempotency_key {
        if key.trim().is_empty() {
            return Err(AppError::Validation("idempotency key is empty".to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use crate::services::idempotency::DEFAULT_TTL;
    use crate::services::notifier::LogNotifier;

    fn service() -> TransferService {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let ledger = LedgerService::new(store.clone(), "NGN");
        let idempotency = IdempotencyStore::new(store.clone(), DEFAULT_TTL);
        TransferService::new(store, ledger, idempotency, Arc::new(LogNotifier))
    }

    #[test]
    fn test_validation_rejects_bad_requests() {
        let request = |to: &str, amount: i64| {
            TransferRequest::new("u1", "user_wallet:u1", to, amount, TransferType::Intra)
        };
        assert!(validate_request(&request("user_wallet:u2", 0)).is_err());
        assert!(validate_request(&request("user_wallet:u1", 10)).is_err());
        assert!(validate_request(&request("user_wallet:u2", 10)).is_ok());
    }

    #[tokio::test]
    async fn test_unknown_reference_is_not_found() {
        let service = service();
        assert!(matches!(
            service.complete_transfer("TRF-MISSING", None).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            service.fail_transfer("TRF-MISSING").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_inter_bank_completion_credits_settlement_account() {
        let service = service();
        let receipt = service
            .initiate_transfer(
                TransferRequest::new(
                    "u1",
                    account::wallet("u1"),
                    account::external("058", "0123456789"),
                    4_000,
                    TransferType::Inter,
                ),
                None,
            )
            .await
            .unwrap();

        service.complete_transfer(&receipt.reference, None).await.unwrap();

        let entries = service.ledger().get_by_trace_id(&receipt.trace_id).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].account, account::BANK_SETTLEMENT);
        assert!(entries.iter().all(|e| e.status == EntryStatus::Completed));
    }

    #[tokio::test]
    async fn test_terminal_states_do_not_cross() {
        let service = service();
        let receipt = service
            .initiate_transfer(
                TransferRequest::new(
                    "u1",
                    account::wallet("u1"),
                    account::wallet("u2"),
                    100,
                    TransferType::Intra,
                ),
                None,
            )
            .await
            .unwrap();

        let failed = service.fail_transfer(&receipt.reference).await.unwrap();
        assert_eq!(failed.status, TransferStatus::Failed);

        let again = service.fail_transfer(&receipt.reference).await.unwrap();
        assert_eq!(again.status, TransferStatus::Failed);

        let crossed = service.complete_transfer(&receipt.reference, None).await;
        assert!(matches!(crossed, Err(AppError::InvalidTransition(_))));
    }
}
