//! Business record: the root aggregate of one loan, savings or bill operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use super::ParseEnumError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BusinessKind {
    BillPayment,
    LoanDisbursement,
    LoanRepayment,
    SavingsDeposit,
    SavingsWithdrawal,
    Transfer,
}

impl BusinessKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusinessKind::BillPayment => "BILL_PAYMENT",
            BusinessKind::LoanDisbursement => "LOAN_DISBURSEMENT",
            BusinessKind::LoanRepayment => "LOAN_REPAYMENT",
            BusinessKind::SavingsDeposit => "SAVINGS_DEPOSIT",
            BusinessKind::SavingsWithdrawal => "SAVINGS_WITHDRAWAL",
            BusinessKind::Transfer => "TRANSFER",
        }
    }

    /// True when a COMPLETED transfer is the whole operation: no business
    /// pair to post and no fulfilment to run afterwards.
    pub fn settled_by_transfer(&self) -> bool {
        matches!(self, BusinessKind::Transfer)
    }
}

impl FromStr for BusinessKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BILL_PAYMENT" => Ok(BusinessKind::BillPayment),
            "LOAN_DISBURSEMENT" => Ok(BusinessKind::LoanDisbursement),
            "LOAN_REPAYMENT" => Ok(BusinessKind::LoanRepayment),
            "SAVINGS_DEPOSIT" => Ok(BusinessKind::SavingsDeposit),
            "SAVINGS_WITHDRAWAL" => Ok(BusinessKind::SavingsWithdrawal),
            "TRANSFER" => Ok(BusinessKind::Transfer),
            other => Err(ParseEnumError::new("business kind", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BusinessStatus {
    Pending,
    Completed,
    Failed,
}

impl BusinessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusinessStatus::Pending => "PENDING",
            BusinessStatus::Completed => "COMPLETED",
            BusinessStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for BusinessStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(BusinessStatus::Pending),
            "COMPLETED" => Ok(BusinessStatus::Completed),
            "FAILED" => Ok(BusinessStatus::Failed),
            other => Err(ParseEnumError::new("business status", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessRecord {
    pub id: Uuid,
    pub kind: BusinessKind,
    pub subtype: String,
    pub user_id: String,
    pub trace_id: String,
    pub amount: i64,
    pub currency: String,
    pub status: BusinessStatus,
    /// Reference of the transfer that moved the money, once known.
    pub reference: Option<String>,
    pub idempotency_key: String,
    pub request_hash: String,
    /// Money moved but the business side effect did not happen.
    pub needs_review: bool,
    pub failure_reason: Option<String>,
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Terminal status handed to callers. PENDING is never final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeStatus {
    Completed,
    Failed,
}

/// Result of one business operation, cached under its idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub status: OutcomeStatus,
    pub message: String,
    pub business_id: Uuid,
    pub trace_id: String,
    pub reference: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl OperationOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == OutcomeStatus::Completed
    }
}
