use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{BusinessRecord, BusinessStatus, TraceImbalance, TransferStatus};
use crate::error::{AppError, AppResult};
use crate::ports::Store;
use crate::provider::{BankingProvider, ProviderTxnStatus};

use super::idempotency::IdempotencyStore;
use super::ledger::{BalanceDrift, LedgerService};
use super::transaction_processor::{complete_record_in, fail_record_in};
use super::transfer::TransferService;

pub const DEFAULT_BATCH_SIZE: i64 = 500;

/// How one stale transfer was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepAction {
    /// The provider confirmed the movement; completed normally.
    Completed,
    /// Force-failed and refunded.
    Refunded,
    /// The provider still reports it in flight; left for the next run.
    Deferred,
    /// Resolution raised an error; left for the next run.
    Errored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweptTransfer {
    pub reference: String,
    pub trace_id: String,
    pub amount: i64,
    pub action: SweepAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweptRecord {
    pub business_id: Uuid,
    pub trace_id: String,
    pub amount: i64,
    pub status: BusinessStatus,
    pub needs_review: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub imbalances: Vec<TraceImbalance>,
    pub transfers: Vec<SweptTransfer>,
    pub business_records: Vec<SweptRecord>,
    pub needs_review: Vec<BusinessRecord>,
    pub balance_drift: Vec<BalanceDrift>,
    pub purged_idempotency: u64,
}

#[derive(Debug, Serialize)]
struct ReportRow<'a> {
    section: &'a str,
    subject: String,
    detail: String,
    amount: i64,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.imbalances.is_empty() && self.needs_review.is_empty()
    }

    /// One CSV row per finding: `section,subject,detail,amount`.
    pub fn write_csv<W: std::io::Write>(&self, writer: W) -> Result<(), csv::Error> {
        let mut wtr = csv::Writer::from_writer(writer);

        for imbalance in &self.imbalances {
            wtr.serialize(ReportRow {
                section: "imbalance",
                subject: imbalance.trace_id.clone(),
                detail: format!(
                    "debits={} credits={}",
                    imbalance.total_debits, imbalance.total_credits
                ),
                amount: imbalance.difference(),
            })?;
        }
        for swept in &self.transfers {
            wtr.serialize(ReportRow {
                section: "stale_transfer",
                subject: swept.reference.clone(),
                detail: format!("{:?}", swept.action).to_lowercase(),
                amount: swept.amount,
            })?;
        }
        for swept in &self.business_records {
            wtr.serialize(ReportRow {
                section: "stale_business_record",
                subject: swept.business_id.to_string(),
                detail: match (swept.status, swept.needs_review) {
                    (BusinessStatus::Completed, _) => "completed".to_string(),
                    (_, true) => "failed, needs review".to_string(),
                    (_, false) => "failed".to_string(),
                },
                amount: swept.amount,
            })?;
        }
        for record in &self.needs_review {
            wtr.serialize(ReportRow {
                section: "needs_review",
                subject: record.id.to_string(),
                detail: record.failure_reason.clone().unwrap_or_default(),
                amount: record.amount,
            })?;
        }
        for drift in &self.balance_drift {
            wtr.serialize(ReportRow {
                section: "balance_drift",
                subject: drift.user_id.clone(),
                detail: format!("cached={} derived={}", drift.cached, drift.derived),
                amount: drift.difference(),
            })?;
        }

        wtr.flush()?;
        Ok(())
    }
}

/// Detects and repairs inconsistent or stuck financial state.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn Store>,
    ledger: LedgerService,
    transfers: TransferService,
    idempotency: IdempotencyStore,
    provider: Arc<dyn BankingProvider>,
    stale_after: Duration,
    batch_size: i64,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        transfers: TransferService,
        idempotency: IdempotencyStore,
        provider: Arc<dyn BankingProvider>,
        stale_after: Duration,
    ) -> Self {
        Self {
            store,
            ledger: transfers.ledger().clone(),
            transfers,
            idempotency,
            provider,
            stale_after,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn cutoff(&self, now: DateTime<Utc>) -> AppResult<DateTime<Utc>> {
        let window = chrono::Duration::from_std(self.stale_after)
            .map_err(|e| AppError::Internal(format!("stale window out of range: {e}")))?;
        Ok(now - window)
    }

    /// Traces whose COMPLETED debits and credits differ. Reported, never healed.
    pub async fn audit(&self) -> AppResult<Vec<TraceImbalance>> {
        let imbalances = self.ledger.find_inconsistencies().await?;
        for imbalance in &imbalances {
            tracing::error!(
                trace_id = %imbalance.trace_id,
                total_debits = imbalance.total_debits,
                total_credits = imbalance.total_credits,
                "Ledger trace out of balance"
            );
        }
        Ok(imbalances)
    }

    /// Resolve PENDING transfers created at or before `now - stale_after`.
    pub async fn sweep_stale_transfers(
        &self,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<SweptTransfer>> {
        let stale = self
            .store
            .stale_transfers(self.cutoff(now)?, self.batch_size)
            .await?;

        let mut swept = Vec::with_capacity(stale.len());
        for transfer in stale {
            let action = match self.resolve_transfer(&transfer.reference).await {
                Ok(action) => action,
                Err(e) => {
                    tracing::error!(
                        reference = %transfer.reference,
                        error = %e,
                        "Failed to resolve stale transfer"
                    );
                    SweepAction::Errored
                }
            };
            swept.push(SweptTransfer {
                reference: transfer.reference,
                trace_id: transfer.trace_id,
                amount: transfer.amount,
                action,
            });
        }
        Ok(swept)
    }

    async fn resolve_transfer(&self, reference: &str) -> AppResult<SweepAction> {
        let reason = match self.provider.query_transaction(reference).await {
            Ok(ProviderTxnStatus::Successful) => {
                self.transfers.complete_transfer(reference, None).await?;
                tracing::info!(reference, "Stale transfer confirmed by provider, completed");
                return Ok(SweepAction::Completed);
            }
            Ok(ProviderTxnStatus::InProgress) => {
                tracing::warn!(reference, "Stale transfer still in progress at provider");
                return Ok(SweepAction::Deferred);
            }
            Ok(ProviderTxnStatus::Failed) => "stale: provider reports failure".to_string(),
            Ok(ProviderTxnStatus::NotFound) => "stale: unknown to provider".to_string(),
            Err(e) => format!("stale: provider status unavailable ({e})"),
        };

        self.transfers.force_fail(reference, &reason).await?;
        Ok(SweepAction::Refunded)
    }

    /// Settle PENDING business records created at or before `now - stale_after`.
    ///
    /// A record whose transfer is still PENDING waits for the transfer sweep.
    /// A record whose transfer COMPLETED is completed when the transfer was the
    /// whole operation, otherwise failed and flagged for review since money
    /// moved without its posting or fulfilment. Anything else is failed.
    pub async fn sweep_stale_business(
        &self,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<SweptRecord>> {
        let stale = self
            .store
            .stale_business_records(self.cutoff(now)?, self.batch_size)
            .await?;

        let mut swept = Vec::new();
        for record in stale {
            match self.resolve_record(&record).await {
                Ok(Some(resolved)) => swept.push(resolved),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        business_id = %record.id,
                        error = %e,
                        "Failed to resolve stale business record"
                    )
                }
            }
        }
        Ok(swept)
    }

    async fn resolve_record(&self, record: &BusinessRecord) -> AppResult<Option<SweptRecord>> {
        let transfers = self.store.transfers_by_trace(&record.trace_id).await?;
        if transfers.iter().any(|t| t.status == TransferStatus::Pending) {
            return Ok(None);
        }
        let completed = transfers
            .iter()
            .find(|t| t.status == TransferStatus::Completed);

        let mut uow = self.store.begin().await?;
        let (status, needs_review) = match completed {
            Some(transfer) if record.kind.settled_by_transfer() => {
                complete_record_in(
                    &self.idempotency,
                    uow.as_mut(),
                    record,
                    transfer.reference.clone(),
                    "Transaction successful".to_string(),
                    None,
                )
                .await?;
                (BusinessStatus::Completed, false)
            }
            _ => {
                let reference = completed
                    .or(transfers.last())
                    .map(|t| t.reference.clone());
                fail_record_in(
                    &self.idempotency,
                    uow.as_mut(),
                    record,
                    reference,
                    completed.is_some(),
                    "stale: no terminal outcome".to_string(),
                )
                .await?;
                (BusinessStatus::Failed, completed.is_some())
            }
        };
        uow.commit().await?;

        tracing::warn!(
            business_id = %record.id,
            status = status.as_str(),
            needs_review,
            "Stale business record settled"
        );
        Ok(Some(SweptRecord {
            business_id: record.id,
            trace_id: record.trace_id.clone(),
            amount: record.amount,
            status,
            needs_review,
        }))
    }

    pub async fn needs_review(&self) -> AppResult<Vec<BusinessRecord>> {
        Ok(self.store.business_records_needing_review().await?)
    }

    /// Read-only counterpart of [`Self::run`]: nothing is swept or purged.
    pub async fn inspect(&self) -> AppResult<ReconciliationReport> {
        let started_at = Utc::now();
        Ok(ReconciliationReport {
            imbalances: self.audit().await?,
            transfers: Vec::new(),
            business_records: Vec::new(),
            needs_review: self.needs_review().await?,
            balance_drift: self.ledger.cached_balance_drift().await?,
            purged_idempotency: 0,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Audit, sweep, purge, then collect what operators should look at.
    pub async fn run(&self, now: DateTime<Utc>) -> AppResult<ReconciliationReport> {
        let started_at = Utc::now();

        let transfers = self.sweep_stale_transfers(now).await?;
        let business_records = self.sweep_stale_business(now).await?;
        let imbalances = self.audit().await?;
        let purged_idempotency = self.idempotency.purge_expired().await?;
        let needs_review = self.needs_review().await?;
        let balance_drift = self.ledger.cached_balance_drift().await?;

        let report = ReconciliationReport {
            started_at,
            finished_at: Utc::now(),
            imbalances,
            transfers,
            business_records,
            needs_review,
            balance_drift,
            purged_idempotency,
        };

        tracing::info!(
            imbalances = report.imbalances.len(),
            stale_transfers = report.transfers.len(),
            stale_business_records = report.business_records.len(),
            needs_review = report.needs_review.len(),
            balance_drift = report.balance_drift.len(),
            purged_idempotency = report.purged_idempotency,
            "Reconciliation run finished"
        );
        Ok(report)
    }
}
