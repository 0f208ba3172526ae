//! Generic orchestrator for money-touching business operations.
//!
//! One operation runs as four short local scopes with the two network steps
//! between them:
//!
//! 1. claim the idempotency key and record the business operation as PENDING
//! 2. [`MoneyMovement`]: initiate the transfer (own scope), then call the bank
//! 3. complete or fail the transfer; a failure also fails the business record
//! 4. [`Fulfilment`], then finalise the record, post the business pair and
//!    cache the outcome
//!
//! A fulfilment failure after money moved is not compensated: the record is
//! FAILED with `needs_review` set and reconciliation lists it.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::domain::account;
use crate::domain::idempotency::fingerprint;
use crate::domain::transfer::new_trace_id;
use crate::domain::{
    BusinessKind, BusinessRecord, BusinessStatus, DoubleEntryOptions, EntryCategory, EntryStatus,
    OperationOutcome, OutcomeStatus, TransferRequest,
};
use crate::error::{AppError, AppResult};
use crate::ports::{BusinessSettlement, Store, UnitOfWork};
use crate::provider::{BankingProvider, ProviderTransferRequest};

use super::idempotency::IdempotencyStore;
use super::transfer::TransferService;

/// Normalised result of the money-movement step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovementResult {
    pub success: bool,
    pub reference: String,
    pub provider_ref: Option<String>,
    pub message: String,
}

/// Moves the money for an operation.
#[async_trait]
pub trait MoneyMovement: Send + Sync {
    /// Initiate the transfer, then move the funds. `Err` means no transfer
    /// was initiated; every failure after initiation is `success == false`.
    async fn execute(
        &self,
        request: &TransferRequest,
        subtype: &str,
    ) -> AppResult<MovementResult>;
}

/// The business side effect that may only happen once money has moved.
#[async_trait]
pub trait Fulfilment: Send + Sync {
    /// Returns data to store on the record and hand back to the caller.
    async fn fulfil(&self, record: &BusinessRecord) -> anyhow::Result<Option<serde_json::Value>>;
}

/// Fulfilment for operations whose only effect is the money movement.
#[derive(Debug, Clone, Default)]
pub struct NoFulfilment;

#[async_trait]
impl Fulfilment for NoFulfilment {
    async fn fulfil(&self, _record: &BusinessRecord) -> anyhow::Result<Option<serde_json::Value>> {
        Ok(None)
    }
}

/// Initiate through [`TransferService`], then call the bank.
#[derive(Clone)]
pub struct BankTransferStep {
    transfers: TransferService,
    provider: Arc<dyn BankingProvider>,
}

impl BankTransferStep {
    pub fn new(transfers: TransferService, provider: Arc<dyn BankingProvider>) -> Self {
        Self {
            transfers,
            provider,
        }
    }
}

#[async_trait]
impl MoneyMovement for BankTransferStep {
    async fn execute(
        &self,
        request: &TransferRequest,
        subtype: &str,
    ) -> AppResult<MovementResult> {
        let receipt = self
            .transfers
            .initiate_transfer(request.clone(), Some(subtype))
            .await?;

        let (destination_bank_code, destination_account) =
            match account::parse_external(&request.to_account) {
                Some((bank, acct)) => (Some(bank.to_string()), acct.to_string()),
                None => (None, request.to_account.clone()),
            };
        let provider_request = ProviderTransferRequest {
            reference: receipt.reference.clone(),
            amount: request.amount,
            currency: request
                .currency
                .clone()
                .unwrap_or_else(|| self.transfers.ledger().base_currency().to_string()),
            source_account: request.from_account.clone(),
            destination_account,
            destination_bank_code,
            narration: request.narration.clone(),
        };

        let result = match self.provider.transfer(&provider_request).await {
            Ok(response) if response.is_success() => MovementResult {
                success: true,
                reference: receipt.reference,
                provider_ref: response.provider_ref(),
                message: response
                    .message
                    .unwrap_or_else(|| "Transaction successful".to_string()),
            },
            Ok(response) => MovementResult {
                success: false,
                reference: receipt.reference,
                provider_ref: None,
                message: response
                    .message
                    .unwrap_or_else(|| format!("Declined with status {}", response.status)),
            },
            Err(e) => {
                tracing::warn!(
                    reference = %receipt.reference,
                    error = %e,
                    "Provider transfer call failed"
                );
                MovementResult {
                    success: false,
                    reference: receipt.reference,
                    provider_ref: None,
                    message: e.to_string(),
                }
            }
        };
        Ok(result)
    }
}

/// The business pair posted once an operation completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Posting {
    pub debit_account: String,
    pub credit_account: String,
    pub category: EntryCategory,
}

/// One business operation as handed to the processor.
#[derive(Debug, Clone, Serialize)]
pub struct Operation {
    pub kind: BusinessKind,
    pub subtype: String,
    pub user_id: String,
    pub amount: i64,
    pub idempotency_key: String,
    /// Money movement; its `trace_id` and `idempotency_key` are set by the processor.
    pub transfer: TransferRequest,
    pub posting: Option<Posting>,
    pub details: Option<serde_json::Value>,
}

#[derive(Clone)]
pub struct TransactionProcessor {
    store: Arc<dyn Store>,
    transfers: TransferService,
    idempotency: IdempotencyStore,
}

impl TransactionProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        transfers: TransferService,
        idempotency: IdempotencyStore,
    ) -> Self {
        Self {
            store,
            transfers,
            idempotency,
        }
    }

    pub fn transfers(&self) -> &TransferService {
        &self.transfers
    }

    pub async fn process(
        &self,
        operation: Operation,
        movement: &dyn MoneyMovement,
        fulfilment: &dyn Fulfilment,
    ) -> AppResult<OperationOutcome> {
        validate(&operation)?;
        let request_hash = fingerprint(&operation)?;

        let mut uow = self.store.begin().await?;
        if let Some(outcome) = self
            .idempotency
            .replay_in::<OperationOutcome>(
                uow.as_mut(),
                &operation.idempotency_key,
                &operation.user_id,
                &request_hash,
            )
            .await?
        {
            uow.rollback().await?;
            return Ok(outcome);
        }

        let record = self.new_record(&operation, request_hash);
        uow.insert_business_record(&record).await?;
        uow.commit().await?;

        tracing::info!(
            business_id = %record.id,
            trace_id = %record.trace_id,
            user_id = %record.user_id,
            kind = record.kind.as_str(),
            subtype = %record.subtype,
            amount = record.amount,
            "Business operation started"
        );

        let mut request = operation.transfer.clone();
        request.trace_id = Some(record.trace_id.clone());
        request.idempotency_key = None;

        let movement = match movement.execute(&request, &record.subtype).await {
            Ok(movement) => movement,
            Err(e) => {
                tracing::warn!(
                    business_id = %record.id,
                    error = %e,
                    "Money movement could not start"
                );
                return self.finish_failed(&record, None, false, e.to_string()).await;
            }
        };

        if !movement.success {
            let mut uow = self.store.begin().await?;
            let settled = self
                .transfers
                .fail_in(uow.as_mut(), &movement.reference, movement.message.clone())
                .await?;
            let outcome = self
                .fail_record_in(
                    uow.as_mut(),
                    &record,
                    Some(movement.reference.clone()),
                    false,
                    movement.message,
                )
                .await?;
            uow.commit().await?;

            tracing::warn!(
                business_id = %record.id,
                reference = %movement.reference,
                message = %outcome.message,
                "Business operation failed: money movement declined"
            );
            if settled.changed {
                self.transfers.notify(&settled.transfer).await;
            }
            return Ok(outcome);
        }

        let mut uow = self.store.begin().await?;
        let settled = self
            .transfers
            .complete_in(
                uow.as_mut(),
                &movement.reference,
                Some(&record.subtype),
                movement.provider_ref.clone(),
            )
            .await?;
        uow.commit().await?;
        if settled.changed {
            self.transfers.notify(&settled.transfer).await;
        }

        let data = match fulfilment.fulfil(&record).await {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(
                    business_id = %record.id,
                    reference = %movement.reference,
                    "Fulfilment failed after money moved, flagged for review: {:#}",
                    e
                );
                return self
                    .finish_failed(&record, Some(movement.reference), true, format!("{e:#}"))
                    .await;
            }
        };

        let mut uow = self.store.begin().await?;
        let outcome = self
            .post_and_complete_in(uow.as_mut(), &operation, &record, &movement, data)
            .await?;
        uow.commit().await?;

        tracing::info!(
            business_id = %record.id,
            reference = %movement.reference,
            "Business operation completed"
        );
        Ok(outcome)
    }

    fn new_record(&self, operation: &Operation, request_hash: String) -> BusinessRecord {
        let now = Utc::now();
        BusinessRecord {
            id: uuid::Uuid::new_v4(),
            kind: operation.kind,
            subtype: operation.subtype.clone(),
            user_id: operation.user_id.clone(),
            trace_id: new_trace_id(),
            amount: operation.amount,
            currency: operation
                .transfer
                .currency
                .clone()
                .unwrap_or_else(|| self.transfers.ledger().base_currency().to_string()),
            status: BusinessStatus::Pending,
            reference: None,
            idempotency_key: operation.idempotency_key.clone(),
            request_hash,
            needs_review: false,
            failure_reason: None,
            details: operation.details.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    async fn post_and_complete_in(
        &self,
        uow: &mut dyn UnitOfWork,
        operation: &Operation,
        record: &BusinessRecord,
        movement: &MovementResult,
        data: Option<serde_json::Value>,
    ) -> AppResult<OperationOutcome> {
        if let Some(posting) = &operation.posting {
            let options = DoubleEntryOptions {
                subtype: Some(record.subtype.clone()),
                currency: Some(record.currency.clone()),
                status: Some(EntryStatus::Completed),
                related_to: Some(movement.reference.clone()),
                meta: None,
            };
            self.transfers
                .ledger()
                .create_double_entry(
                    uow,
                    &record.trace_id,
                    &posting.debit_account,
                    &posting.credit_account,
                    record.amount,
                    posting.category,
                    options,
                )
                .await?;

            if let Some(owner) = account::wallet_owner(&posting.debit_account) {
                uow.adjust_cached_balance(owner, -record.amount).await?;
            }
            if let Some(owner) = account::wallet_owner(&posting.credit_account) {
                uow.adjust_cached_balance(owner, record.amount).await?;
            }
        }

        complete_record_in(
            &self.idempotency,
            uow,
            record,
            movement.reference.clone(),
            movement.message.clone(),
            data,
        )
        .await
    }

    /// Mark the record FAILED and cache the FAILED outcome in the caller's scope.
    pub(crate) async fn fail_record_in(
        &self,
        uow: &mut dyn UnitOfWork,
        record: &BusinessRecord,
        reference: Option<String>,
        needs_review: bool,
        reason: String,
    ) -> AppResult<OperationOutcome> {
        fail_record_in(&self.idempotency, uow, record, reference, needs_review, reason).await
    }

    async fn finish_failed(
        &self,
        record: &BusinessRecord,
        reference: Option<String>,
        needs_review: bool,
        reason: String,
    ) -> AppResult<OperationOutcome> {
        let mut uow = self.store.begin().await?;
        let outcome = self
            .fail_record_in(uow.as_mut(), record, reference, needs_review, reason)
            .await?;
        uow.commit().await?;
        Ok(outcome)
    }
}

/// Mark the record COMPLETED and cache the COMPLETED outcome. Any business
/// pair must already be posted in the same scope.
pub(crate) async fn complete_record_in(
    idempotency: &IdempotencyStore,
    uow: &mut dyn UnitOfWork,
    record: &BusinessRecord,
    reference: String,
    message: String,
    data: Option<serde_json::Value>,
) -> AppResult<OperationOutcome> {
    let settlement = BusinessSettlement {
        status: BusinessStatus::Completed,
        reference: Some(reference.clone()),
        needs_review: false,
        failure_reason: None,
        details: data.clone(),
        at: Utc::now(),
    };
    uow.settle_business_record(record.id, &settlement)
        .await?
        .ok_or_else(|| left_pending(record))?;

    let outcome = OperationOutcome {
        status: OutcomeStatus::Completed,
        message,
        business_id: record.id,
        trace_id: record.trace_id.clone(),
        reference: Some(reference),
        data,
    };
    idempotency
        .save(
            uow,
            &record.idempotency_key,
            &record.user_id,
            &record.request_hash,
            &outcome,
        )
        .await?;
    Ok(outcome)
}

/// Shared by the processor and the stale-record sweep.
pub(crate) async fn fail_record_in(
    idempotency: &IdempotencyStore,
    uow: &mut dyn UnitOfWork,
    record: &BusinessRecord,
    reference: Option<String>,
    needs_review: bool,
    reason: String,
) -> AppResult<OperationOutcome> {
    let settlement = BusinessSettlement {
        status: BusinessStatus::Failed,
        reference: reference.clone(),
        needs_review,
        failure_reason: Some(reason.clone()),
        details: None,
        at: Utc::now(),
    };
    uow.settle_business_record(record.id, &settlement)
        .await?
        .ok_or_else(|| left_pending(record))?;

    let outcome = OperationOutcome {
        status: OutcomeStatus::Failed,
        message: reason,
        business_id: record.id,
        trace_id: record.trace_id.clone(),
        reference,
        data: None,
    };
    idempotency
        .save(
            uow,
            &record.idempotency_key,
            &record.user_id,
            &record.request_hash,
            &outcome,
        )
        .await?;
    Ok(outcome)
}

fn left_pending(record: &BusinessRecord) -> AppError {
    AppError::InvalidTransition(format!(
        "business record {} is no longer PENDING",
        record.id
    ))
}

fn validate(operation: &Operation) -> AppResult<()> {
    if operation.amount <= 0 {
        return Err(AppError::Validation(format!(
            "amount must be a positive number of minor units, got {}",
            operation.amount
        )));
    }
    if operation.transfer.amount != operation.amount {
        return Err(AppError::Validation(format!(
            "transfer amount {} does not match operation amount {}",
            operation.transfer.amount, operation.amount
        )));
    }
    if operation.idempotency_key.trim().is_empty() {
        return Err(AppError::Validation("idempotency key is required".to_string()));
    }
    if operation.user_id.trim().is_empty() {
        return Err(AppError::Validation("user id is required".to_string()));
    }
    if operation.subtype.trim().is_empty() {
        return Err(AppError::Validation("subtype is required".to_string()));
    }
    Ok(())
}
