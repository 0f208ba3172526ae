//! External banking provider.
//!
//! The core depends on three calls only: `transfer`, `account_info` and
//! `query_transaction`. Calls are safe to retry by `reference`. Callers treat
//! an `Err` and a non-"00" response the same way: the movement failed.

pub mod breaker;
pub mod client;
pub mod guarded;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use breaker::{BreakerConfig, BreakerSnapshot, BreakerState, CallError, CircuitBreaker};
pub use client::HttpBankingClient;
pub use guarded::GuardedProvider;

/// Provider status code for a successful call.
pub const SUCCESS_CODE: &str = "00";
/// Provider status code for a movement still in flight.
pub const IN_PROGRESS_CODE: &str = "09";

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Invalid response from provider: {0}")]
    InvalidResponse(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Circuit breaker open: provider calls suspended")]
    CircuitOpen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderTransferRequest {
    pub reference: String,
    pub amount: i64,
    pub currency: String,
    pub source_account: String,
    pub destination_account: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_bank_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub narration: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl ProviderResponse {
    pub fn success(data: Option<serde_json::Value>) -> Self {
        Self {
            status: SUCCESS_CODE.to_string(),
            message: Some("Transaction successful".to_string()),
            data,
        }
    }

    pub fn declined(status: &str, message: &str) -> Self {
        Self {
            status: status.to_string(),
            message: Some(message.to_string()),
            data: None,
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.status == SUCCESS_CODE
    }

    /// The provider's own handle for the movement, when it sent one.
    pub fn provider_ref(&self) -> Option<String> {
        let data = self.data.as_ref()?;
        ["sessionId", "providerRef", "transactionId"]
            .iter()
            .find_map(|field| data.get(*field).and_then(|v| v.as_str()))
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub account_no: String,
    pub account_balance: i64,
    pub account_id: String,
    pub client_id: String,
    pub client: String,
}

/// What the provider says about a past movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderTxnStatus {
    Successful,
    Failed,
    InProgress,
    NotFound,
}

impl ProviderTxnStatus {
    pub fn from_code(code: &str) -> Self {
        match code {
            SUCCESS_CODE => ProviderTxnStatus::Successful,
            IN_PROGRESS_CODE => ProviderTxnStatus::InProgress,
            _ => ProviderTxnStatus::Failed,
        }
    }
}

#[async_trait]
pub trait BankingProvider: Send + Sync {
    async fn transfer(
        &self,
        request: &ProviderTransferRequest,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Details of `account_no`, or of the platform's own account when `None`.
    async fn account_info(&self, account_no: Option<&str>) -> Result<AccountInfo, ProviderError>;

    async fn query_transaction(&self, reference: &str) -> Result<ProviderTxnStatus, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_provider_ref_lookup() {
        let response = ProviderResponse::success(Some(json!({"sessionId": "S-100"})));
        assert!(response.is_success());
        assert_eq!(response.provider_ref(), Some("S-100".to_string()));

        let bare = ProviderResponse::success(None);
        assert_eq!(bare.provider_ref(), None);
    }

    #[test]
    fn test_declined_is_not_success() {
        let response = ProviderResponse::declined("51", "Insufficient funds");
        assert!(!response.is_success());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ProviderTxnStatus::from_code("00"), ProviderTxnStatus::Successful);
        assert_eq!(ProviderTxnStatus::from_code("09"), ProviderTxnStatus::InProgress);
        assert_eq!(ProviderTxnStatus::from_code("96"), ProviderTxnStatus::Failed);
    }
}
