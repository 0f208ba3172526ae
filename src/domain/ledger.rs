//! Ledger entry domain entity.
//! One immutable movement into or out of a named account.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::ParseEnumError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    Debit,
    Credit,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Debit => "DEBIT",
            EntryType::Credit => "CREDIT",
        }
    }
}

impl FromStr for EntryType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBIT" => Ok(EntryType::Debit),
            "CREDIT" => Ok(EntryType::Credit),
            other => Err(ParseEnumError::new("entry type", other)),
        }
    }
}

/// Status shared by ledger entries. Only PENDING may be left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    Pending,
    Completed,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "PENDING",
            EntryStatus::Completed => "COMPLETED",
            EntryStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, EntryStatus::Pending)
    }
}

impl FromStr for EntryStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(EntryStatus::Pending),
            "COMPLETED" => Ok(EntryStatus::Completed),
            "FAILED" => Ok(EntryStatus::Failed),
            other => Err(ParseEnumError::new("entry status", other)),
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryCategory {
    Transfer,
    BillPayment,
    LoanDisbursement,
    LoanRepayment,
    SavingsDeposit,
    SavingsWithdrawal,
    Refund,
    Fee,
}

impl EntryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryCategory::Transfer => "TRANSFER",
            EntryCategory::BillPayment => "BILL_PAYMENT",
            EntryCategory::LoanDisbursement => "LOAN_DISBURSEMENT",
            EntryCategory::LoanRepayment => "LOAN_REPAYMENT",
            EntryCategory::SavingsDeposit => "SAVINGS_DEPOSIT",
            EntryCategory::SavingsWithdrawal => "SAVINGS_WITHDRAWAL",
            EntryCategory::Refund => "REFUND",
            EntryCategory::Fee => "FEE",
        }
    }
}

impl FromStr for EntryCategory {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TRANSFER" => Ok(EntryCategory::Transfer),
            "BILL_PAYMENT" => Ok(EntryCategory::BillPayment),
            "LOAN_DISBURSEMENT" => Ok(EntryCategory::LoanDisbursement),
            "LOAN_REPAYMENT" => Ok(EntryCategory::LoanRepayment),
            "SAVINGS_DEPOSIT" => Ok(EntryCategory::SavingsDeposit),
            "SAVINGS_WITHDRAWAL" => Ok(EntryCategory::SavingsWithdrawal),
            "REFUND" => Ok(EntryCategory::Refund),
            "FEE" => Ok(EntryCategory::Fee),
            other => Err(ParseEnumError::new("entry category", other)),
        }
    }
}

/// Domain entity representing a ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub trace_id: String,
    pub account: String,
    pub entry_type: EntryType,
    pub category: EntryCategory,
    pub subtype: Option<String>,
    /// Minor currency units, always > 0.
    pub amount: i64,
    pub currency: String,
    pub status: EntryStatus,
    pub related_to: Option<String>,
    pub meta: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Parameters for appending a single entry.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub trace_id: String,
    pub account: String,
    pub entry_type: EntryType,
    pub category: EntryCategory,
    pub amount: i64,
    pub subtype: Option<String>,
    pub currency: Option<String>,
    pub status: Option<EntryStatus>,
    pub related_to: Option<String>,
    pub meta: Option<serde_json::Value>,
}

impl NewEntry {
    pub fn new(
        trace_id: impl Into<String>,
        account: impl Into<String>,
        entry_type: EntryType,
        category: EntryCategory,
        amount: i64,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            account: account.into(),
            entry_type,
            category,
            amount,
            subtype: None,
            currency: None,
            status: None,
            related_to: None,
            meta: None,
        }
    }

    pub fn subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    pub fn status(mut self, status: EntryStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn related_to(mut self, related_to: impl Into<String>) -> Self {
        self.related_to = Some(related_to.into());
        self
    }

    pub fn meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Materialise the entry, filling PENDING and the base currency where unset.
    pub fn into_entry(self, base_currency: &str) -> LedgerEntry {
        let status = self.status.unwrap_or(EntryStatus::Pending);
        let now = Utc::now();
        LedgerEntry {
            id: Uuid::new_v4(),
            trace_id: self.trace_id,
            account: self.account,
            entry_type: self.entry_type,
            category: self.category,
            subtype: self.subtype,
            amount: self.amount,
            currency: self.currency.unwrap_or_else(|| base_currency.to_string()),
            status,
            related_to: self.related_to,
            meta: self.meta,
            created_at: now,
            processed_at: status.is_terminal().then_some(now),
        }
    }
}

/// Options shared by both legs of a double entry.
#[derive(Debug, Clone, Default)]
pub struct DoubleEntryOptions {
    pub subtype: Option<String>,
    pub currency: Option<String>,
    pub status: Option<EntryStatus>,
    pub related_to: Option<String>,
    pub meta: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoubleEntry {
    pub debit: LedgerEntry,
    pub credit: LedgerEntry,
}

/// A trace whose COMPLETED debits and credits disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceImbalance {
    pub trace_id: String,
    pub total_debits: i64,
    pub total_credits: i64,
}

impl TraceImbalance {
    pub fn difference(&self) -> i64 {
        self.total_debits - self.total_credits
    }
}
