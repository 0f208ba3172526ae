use async_trait::async_trait;
use std::sync::Arc;

use super::{
    AccountInfo, BankingProvider, BreakerConfig, BreakerSnapshot, CallError, CircuitBreaker,
    ProviderError, ProviderResponse, ProviderTransferRequest, ProviderTxnStatus,
};

/// A [`BankingProvider`] whose calls all pass through one circuit breaker.
///
/// Only `Err` results count against the breaker. A declined transfer is an
/// answer from a healthy provider and leaves the failure count alone.
#[derive(Clone)]
pub struct GuardedProvider {
    inner: Arc<dyn BankingProvider>,
    breaker: CircuitBreaker,
}

impl GuardedProvider {
    pub fn new(inner: Arc<dyn BankingProvider>, config: BreakerConfig) -> Self {
        Self {
            inner,
            breaker: CircuitBreaker::new(config),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }
}

fn unwrap_call<T>(result: Result<T, CallError<ProviderError>>) -> Result<T, ProviderError> {
    match result {
        Ok(value) => Ok(value),
        Err(CallError::Open) => Err(ProviderError::CircuitOpen),
        Err(CallError::Inner(e)) => Err(e),
    }
}

#[async_trait]
impl BankingProvider for GuardedProvider {
    async fn transfer(
        &self,
        request: &ProviderTransferRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        let result = unwrap_call(self.breaker.call(self.inner.transfer(request)).await);
        if let Err(ProviderError::CircuitOpen) = &result {
            tracing::warn!(
                reference = %request.reference,
                "Transfer rejected: provider circuit open"
            );
        }
        result
    }

    async fn account_info(&self, account_no: Option<&str>) -> Result<AccountInfo, ProviderError> {
        unwrap_call(self.breaker.call(self.inner.account_info(account_no)).await)
    }

    async fn query_transaction(&self, reference: &str) -> Result<ProviderTxnStatus, ProviderError> {
        unwrap_call(self.breaker.call(self.inner.query_transaction(reference)).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::BreakerState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FlakyProvider {
        calls: AtomicUsize,
        decline: bool,
    }

    #[async_trait]
    impl BankingProvider for FlakyProvider {
        async fn transfer(
            &self,
            _request: &ProviderTransferRequest,
        ) -> Result<ProviderResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.decline {
                Ok(ProviderResponse::declined("51", "Insufficient funds"))
            } else {
                Err(ProviderError::Unavailable("connection reset".to_string()))
            }
        }

        async fn account_info(&self, _: Option<&str>) -> Result<AccountInfo, ProviderError> {
            Err(ProviderError::Unavailable("down".to_string()))
        }

        async fn query_transaction(&self, _: &str) -> Result<ProviderTxnStatus, ProviderError> {
            Ok(ProviderTxnStatus::NotFound)
        }
    }

    fn request() -> ProviderTransferRequest {
        ProviderTransferRequest {
            reference: "TRF-G1".to_string(),
            amount: 100,
            currency: "NGN".to_string(),
            source_account: "0000000001".to_string(),
            destination_account: "0123456789".to_string(),
            destination_bank_code: None,
            narration: None,
        }
    }

    fn guarded(decline: bool) -> (Arc<FlakyProvider>, GuardedProvider) {
        let inner = Arc::new(FlakyProvider {
            calls: AtomicUsize::new(0),
            decline,
        });
        let guarded = GuardedProvider::new(
            inner.clone(),
            BreakerConfig {
                failure_threshold: 2,
                reset_timeout: Duration::from_secs(60),
            },
        );
        (inner, guarded)
    }

    #[tokio::test]
    async fn test_errors_open_circuit() {
        let (inner, provider) = guarded(false);

        for _ in 0..2 {
            let result = provider.transfer(&request()).await;
            assert!(matches!(result, Err(ProviderError::Unavailable(_))));
        }

        let result = provider.transfer(&request()).await;
        assert!(matches!(result, Err(ProviderError::CircuitOpen)));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(provider.breaker_snapshot().state, BreakerState::Open);
    }

    #[tokio::test]
    async fn test_declines_do_not_trip_breaker() {
        let (inner, provider) = guarded(true);

        for _ in 0..5 {
            let response = provider.transfer(&request()).await.unwrap();
            assert!(!response.is_success());
        }

        assert_eq!(inner.calls.load(Ordering::SeqCst), 5);
        assert_eq!(provider.breaker().state(), BreakerState::Closed);
    }
}
