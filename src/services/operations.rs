//! Business operations built on the transaction processor.
//!
//! Operations other than a plain transfer move money out of `platform_pool`,
//! which carries no transfer-level ledger rows; the wallet side is recorded by
//! the business pair posted when the operation completes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::domain::account;
use crate::domain::{
    BusinessKind, BusinessRecord, EntryCategory, OperationOutcome, ParseEnumError,
    TransferRequest, TransferType,
};
use crate::error::{AppError, AppResult};

use super::transaction_processor::{
    Fulfilment, MoneyMovement, NoFulfilment, Operation, Posting, TransactionProcessor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceType {
    Airtime,
    Data,
    Electricity,
    CableTv,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Airtime => "airtime",
            ServiceType::Data => "data",
            ServiceType::Electricity => "electricity",
            ServiceType::CableTv => "cable-tv",
        }
    }

    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            ServiceType::Airtime => &["phone_number", "network"],
            ServiceType::Data => &["phone_number", "network", "plan_code"],
            ServiceType::Electricity => &["meter_number", "disco", "meter_type"],
            ServiceType::CableTv => &["smartcard_number", "provider", "package_code"],
        }
    }

    pub fn validate(&self, fields: &BTreeMap<String, String>) -> AppResult<()> {
        let missing: Vec<&str> = self
            .required_fields()
            .iter()
            .copied()
            .filter(|f| fields.get(*f).map_or(true, |v| v.trim().is_empty()))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(AppError::Validation(format!(
                "{} payment is missing {}",
                self.as_str(),
                missing.join(", ")
            )))
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "airtime" => Ok(ServiceType::Airtime),
            "data" => Ok(ServiceType::Data),
            "electricity" => Ok(ServiceType::Electricity),
            "cable-tv" => Ok(ServiceType::CableTv),
            other => Err(ParseEnumError::new("service type", other)),
        }
    }
}

/// What the biller is asked to deliver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BillPurchase {
    /// Business record id, unique per purchase.
    pub request_id: String,
    pub service: ServiceType,
    pub amount: i64,
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillerReceipt {
    pub biller_reference: String,
    /// Prepaid meter token and the like.
    pub token: Option<String>,
    pub message: Option<String>,
}

#[async_trait]
pub trait BillerGateway: Send + Sync {
    async fn buy_airtime(&self, purchase: &BillPurchase) -> anyhow::Result<BillerReceipt>;

    async fn buy_data(&self, purchase: &BillPurchase) -> anyhow::Result<BillerReceipt>;

    async fn pay_electricity(&self, purchase: &BillPurchase) -> anyhow::Result<BillerReceipt>;

    async fn renew_cable_tv(&self, purchase: &BillPurchase) -> anyhow::Result<BillerReceipt>;
}

struct BillFulfilment<'a> {
    gateway: &'a dyn BillerGateway,
    service: ServiceType,
    fields: BTreeMap<String, String>,
}

#[async_trait]
impl Fulfilment for BillFulfilment<'_> {
    async fn fulfil(&self, record: &BusinessRecord) -> anyhow::Result<Option<serde_json::Value>> {
        let purchase = BillPurchase {
            request_id: record.id.to_string(),
            service: self.service,
            amount: record.amount,
            fields: self.fields.clone(),
        };

        let receipt = match self.service {
            ServiceType::Airtime => self.gateway.buy_airtime(&purchase).await?,
            ServiceType::Data => self.gateway.buy_data(&purchase).await?,
            ServiceType::Electricity => self.gateway.pay_electricity(&purchase).await?,
            ServiceType::CableTv => self.gateway.renew_cable_tv(&purchase).await?,
        };
        Ok(Some(serde_json::to_value(receipt)?))
    }
}

#[derive(Debug, Clone)]
pub struct BillPaymentRequest {
    pub user_id: String,
    pub service: ServiceType,
    pub amount: i64,
    pub fields: BTreeMap<String, String>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone)]
pub struct LoanRequest {
    pub user_id: String,
    pub loan_id: String,
    pub amount: i64,
    pub idempotency_key: String,
}

#[derive(Debug, Clone)]
pub struct SavingsRequest {
    pub user_id: String,
    pub plan_id: String,
    pub amount: i64,
    pub idempotency_key: String,
}

#[derive(Debug, Clone)]
pub struct WalletTransferRequest {
    pub user_id: String,
    pub to_account: String,
    pub transfer_type: TransferType,
    pub amount: i64,
    pub narration: Option<String>,
    pub idempotency_key: String,
}

#[derive(Clone)]
pub struct BusinessOperations {
    processor: TransactionProcessor,
    movement: Arc<dyn MoneyMovement>,
    biller: Arc<dyn BillerGateway>,
    /// `external:<bank>:<account>` that receives bill payments.
    biller_settlement_account: Option<String>,
}

impl BusinessOperations {
    pub fn new(
        processor: TransactionProcessor,
        movement: Arc<dyn MoneyMovement>,
        biller: Arc<dyn BillerGateway>,
        biller_settlement_account: Option<String>,
    ) -> Self {
        Self {
            processor,
            movement,
            biller,
            biller_settlement_account,
        }
    }

    pub async fn pay_bill(&self, request: BillPaymentRequest) -> AppResult<OperationOutcome> {
        request.service.validate(&request.fields)?;
        let settlement_account = self.biller_settlement_account.clone().ok_or_else(|| {
            AppError::Validation(
                "bill payments are disabled: no biller settlement account configured".to_string(),
            )
        })?;

        let operation = Operation {
            kind: BusinessKind::BillPayment,
            subtype: request.service.as_str().to_string(),
            user_id: request.user_id.clone(),
            amount: request.amount,
            idempotency_key: request.idempotency_key,
            transfer: TransferRequest::new(
                request.user_id.clone(),
                account::PLATFORM_POOL,
                settlement_account,
                request.amount,
                TransferType::Inter,
            )
            .with_category(EntryCategory::BillPayment),
            posting: Some(Posting {
                debit_account: account::wallet(&request.user_id),
                credit_account: account::bill_payment(request.service.as_str()),
                category: EntryCategory::BillPayment,
            }),
            details: Some(json!({ "service": request.service, "fields": request.fields })),
        };

        let fulfilment = BillFulfilment {
            gateway: self.biller.as_ref(),
            service: request.service,
            fields: request.fields,
        };
        self.processor
            .process(operation, self.movement.as_ref(), &fulfilment)
            .await
    }

    pub async fn disburse_loan(&self, request: LoanRequest) -> AppResult<OperationOutcome> {
        let operation = Operation {
            kind: BusinessKind::LoanDisbursement,
            subtype: request.loan_id.clone(),
            user_id: request.user_id.clone(),
            amount: request.amount,
            idempotency_key: request.idempotency_key,
            transfer: TransferRequest::new(
                request.user_id.clone(),
                account::PLATFORM_POOL,
                account::wallet(&request.user_id),
                request.amount,
                TransferType::Intra,
            )
            .with_category(EntryCategory::LoanDisbursement),
            posting: Some(Posting {
                debit_account: account::LOAN_DISBURSEMENT.to_string(),
                credit_account: account::wallet(&request.user_id),
                category: EntryCategory::LoanDisbursement,
            }),
            details: Some(json!({ "loan_id": request.loan_id })),
        };
        self.processor
            .process(operation, self.movement.as_ref(), &NoFulfilment)
            .await
    }

    pub async fn repay_loan(&self, request: LoanRequest) -> AppResult<OperationOutcome> {
        let operation = Operation {
            kind: BusinessKind::LoanRepayment,
            subtype: request.loan_id.clone(),
            user_id: request.user_id.clone(),
            amount: request.amount,
            idempotency_key: request.idempotency_key,
            transfer: TransferRequest::new(
                request.user_id.clone(),
                account::PLATFORM_POOL,
                account::LOAN_REPAYMENT,
                request.amount,
                TransferType::Intra,
            )
            .with_category(EntryCategory::LoanRepayment),
            posting: Some(Posting {
                debit_account: account::wallet(&request.user_id),
                credit_account: account::LOAN_REPAYMENT.to_string(),
                category: EntryCategory::LoanRepayment,
            }),
            details: Some(json!({ "loan_id": request.loan_id })),
        };
        self.processor
            .process(operation, self.movement.as_ref(), &NoFulfilment)
            .await
    }

    pub async fn deposit_savings(&self, request: SavingsRequest) -> AppResult<OperationOutcome> {
        let plan = account::savings(&request.plan_id);
        let operation = Operation {
            kind: BusinessKind::SavingsDeposit,
            subtype: request.plan_id.clone(),
            user_id: request.user_id.clone(),
            amount: request.amount,
            idempotency_key: request.idempotency_key,
            transfer: TransferRequest::new(
                request.user_id.clone(),
                account::PLATFORM_POOL,
                plan.clone(),
                request.amount,
                TransferType::Intra,
            )
            .with_category(EntryCategory::SavingsDeposit),
            posting: Some(Posting {
                debit_account: account::wallet(&request.user_id),
                credit_account: plan,
                category: EntryCategory::SavingsDeposit,
            }),
            details: Some(json!({ "plan_id": request.plan_id })),
        };
        self.processor
            .process(operation, self.movement.as_ref(), &NoFulfilment)
            .await
    }

    pub async fn withdraw_savings(&self, request: SavingsRequest) -> AppResult<OperationOutcome> {
        let operation = Operation {
            kind: BusinessKind::SavingsWithdrawal,
            subtype: request.plan_id.clone(),
            user_id: request.user_id.clone(),
            amount: request.amount,
            idempotency_key: request.idempotency_key,
            transfer: TransferRequest::new(
                request.user_id.clone(),
                account::PLATFORM_POOL,
                account::wallet(&request.user_id),
                request.amount,
                TransferType::Intra,
            )
            .with_category(EntryCategory::SavingsWithdrawal),
            posting: Some(Posting {
                debit_account: account::savings(&request.plan_id),
                credit_account: account::wallet(&request.user_id),
                category: EntryCategory::SavingsWithdrawal,
            }),
            details: Some(json!({ "plan_id": request.plan_id })),
        };
        self.processor
            .process(operation, self.movement.as_ref(), &NoFulfilment)
            .await
    }

    /// Wallet to wallet (intra) or wallet to an external bank account (inter).
    /// The transfer's own entries are the ledger record; no business pair.
    pub async fn transfer(&self, request: WalletTransferRequest) -> AppResult<OperationOutcome> {
        match request.transfer_type {
            TransferType::Intra if !account::is_wallet(&request.to_account) => {
                return Err(AppError::Validation(
                    "intra-bank transfers must go to a wallet".to_string(),
                ))
            }
            TransferType::Inter if !account::is_external(&request.to_account) => {
                return Err(AppError::Validation(
                    "inter-bank transfers must go to an external account".to_string(),
                ))
            }
            _ => {}
        }

        let mut transfer = TransferRequest::new(
            request.user_id.clone(),
            account::wallet(&request.user_id),
            request.to_account.clone(),
            request.amount,
            request.transfer_type,
        );
        transfer.narration = request.narration.clone();

        let operation = Operation {
            kind: BusinessKind::Transfer,
            subtype: request.transfer_type.as_str().to_string(),
            user_id: request.user_id,
            amount: request.amount,
            idempotency_key: request.idempotency_key,
            transfer,
            posting: None,
            details: Some(json!({ "to_account": request.to_account })),
        };
        self.processor
            .process(operation, self.movement.as_ref(), &NoFulfilment)
            .await
    }
}
