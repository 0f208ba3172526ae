//! Transfer domain entity and its lifecycle.
//!
//! A transfer starts PENDING and moves exactly once to COMPLETED or FAILED.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::ledger::EntryCategory;
use super::ParseEnumError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferType {
    /// Both sides held at the platform's bank.
    Intra,
    /// Destination at another bank.
    Inter,
}

impl TransferType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferType::Intra => "intra",
            TransferType::Inter => "inter",
        }
    }
}

impl FromStr for TransferType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "intra" => Ok(TransferType::Intra),
            "inter" => Ok(TransferType::Inter),
            other => Err(ParseEnumError::new("transfer type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Pending,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "PENDING",
            TransferStatus::Completed => "COMPLETED",
            TransferStatus::Failed => "FAILED",
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferStatus::Pending)
    }

    /// PENDING -> COMPLETED | FAILED is the only legal move.
    pub fn can_transition(from: TransferStatus, to: TransferStatus) -> bool {
        matches!(
            (from, to),
            (TransferStatus::Pending, TransferStatus::Completed)
                | (TransferStatus::Pending, TransferStatus::Failed)
        )
    }
}

impl FromStr for TransferStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TransferStatus::Pending),
            "COMPLETED" => Ok(TransferStatus::Completed),
            "FAILED" => Ok(TransferStatus::Failed),
            other => Err(ParseEnumError::new("transfer status", other)),
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transfer record as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: Uuid,
    pub trace_id: String,
    pub user_id: String,
    pub from_account: String,
    pub to_account: String,
    pub amount: i64,
    pub currency: String,
    pub transfer_type: TransferType,
    pub category: EntryCategory,
    pub subtype: Option<String>,
    pub status: TransferStatus,
    /// Externally visible idempotent handle, also sent to the bank.
    pub reference: String,
    pub provider_ref: Option<String>,
    pub narration: Option<String>,
    pub failure_reason: Option<String>,
    pub meta: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl fmt::Display for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transfer[{}] {} -> {} amount={} {} status={}",
            self.reference,
            self.from_account,
            self.to_account,
            self.amount,
            self.transfer_type.as_str(),
            self.status
        )
    }
}

/// Request to reserve a money movement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub user_id: String,
    pub from_account: String,
    pub to_account: String,
    pub amount: i64,
    pub transfer_type: TransferType,
    pub category: EntryCategory,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub narration: Option<String>,
    /// Joins an existing trace instead of opening a fresh one.
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
}

impl TransferRequest {
    pub fn new(
        user_id: impl Into<String>,
        from_account: impl Into<String>,
        to_account: impl Into<String>,
        amount: i64,
        transfer_type: TransferType,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            from_account: from_account.into(),
            to_account: to_account.into(),
            amount,
            transfer_type,
            category: EntryCategory::Transfer,
            currency: None,
            narration: None,
            trace_id: None,
            idempotency_key: None,
            meta: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_category(mut self, category: EntryCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_narration(mut self, narration: impl Into<String>) -> Self {
        self.narration = Some(narration.into());
        self
    }
}

/// What initiation hands back; also the cached idempotent response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub trace_id: String,
    pub reference: String,
    pub status: TransferStatus,
    pub transfer_id: Uuid,
}

/// Fresh externally visible reference.
pub fn new_reference() -> String {
    format!("TRF{}", Uuid::new_v4().simple()).to_uppercase()
}

pub fn new_trace_id() -> String {
    Uuid::new_v4().to_string()
}
