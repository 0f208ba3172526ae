use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, Response, StatusCode};
use sha2::Sha256;
use std::time::Duration;

use super::{
    AccountInfo, BankingProvider, ProviderError, ProviderResponse, ProviderTransferRequest,
    ProviderTxnStatus,
};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Signature";

/// HTTP client for the banking provider's REST API.
///
/// Requests carry the API key as a bearer token and an HMAC-SHA256 signature
/// of the body. No breaker here: wrap it in [`super::GuardedProvider`].
#[derive(Clone)]
pub struct HttpBankingClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl HttpBankingClient {
    pub fn new(base_url: String, api_key: String, api_secret: String) -> Self {
        Self::with_timeout(base_url, api_key, api_secret, Duration::from_secs(20))
    }

    pub fn with_timeout(
        base_url: String,
        api_key: String,
        api_secret: String,
        timeout: Duration,
    ) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            api_secret,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Hex HMAC-SHA256 of `body` under the API secret.
    pub fn sign(&self, body: &[u8]) -> Result<String, ProviderError> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ProviderError::Unavailable(format!("invalid signing secret: {e}")))?;
        mac.update(body);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn get(&self, path: &str) -> Result<Response, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        let signature = self.sign(b"")?;
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .header(SIGNATURE_HEADER, signature)
            .send()
            .await?;
        Ok(response)
    }

    /// Reads the provider envelope. 5xx is a transport-level failure; any
    /// other status with a readable envelope is an answer from the provider.
    async fn envelope(response: Response) -> Result<ProviderResponse, ProviderError> {
        let status = response.status();
        let body = response.text().await?;

        if status.is_server_error() {
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str::<ProviderResponse>(&body).map_err(|e| {
            if status.is_success() {
                ProviderError::InvalidResponse(e.to_string())
            } else {
                ProviderError::Http {
                    status: status.as_u16(),
                    body,
                }
            }
        })
    }
}

#[async_trait]
impl BankingProvider for HttpBankingClient {
    async fn transfer(
        &self,
        request: &ProviderTransferRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        let url = format!("{}/transfers", self.base_url);
        let body = serde_json::to_vec(request)
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        let signature = self.sign(&body)?;

        tracing::debug!(
            reference = %request.reference,
            amount = request.amount,
            "Sending transfer to provider"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await?;

        Self::envelope(response).await
    }

    async fn account_info(&self, account_no: Option<&str>) -> Result<AccountInfo, ProviderError> {
        let path = match account_no {
            Some(no) => format!("/accounts/{no}"),
            None => "/accounts".to_string(),
        };
        let envelope = Self::envelope(self.get(&path).await?).await?;

        if !envelope.is_success() {
            return Err(ProviderError::InvalidResponse(format!(
                "account lookup returned {}: {}",
                envelope.status,
                envelope.message.unwrap_or_default()
            )));
        }

        let data = envelope
            .data
            .ok_or_else(|| ProviderError::InvalidResponse("account lookup without data".into()))?;
        serde_json::from_value(data).map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }

    async fn query_transaction(&self, reference: &str) -> Result<ProviderTxnStatus, ProviderError> {
        let response = self.get(&format!("/transactions/{reference}")).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(ProviderTxnStatus::NotFound);
        }

        let envelope = Self::envelope(response).await?;
        Ok(ProviderTxnStatus::from_code(&envelope.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn client(url: String) -> HttpBankingClient {
        HttpBankingClient::new(url, "test-key".to_string(), "test-secret".to_string())
    }

    fn request() -> ProviderTransferRequest {
        ProviderTransferRequest {
            reference: "TRF0001".to_string(),
            amount: 5_000,
            currency: "NGN".to_string(),
            source_account: "0000000001".to_string(),
            destination_account: "0123456789".to_string(),
            destination_bank_code: Some("058".to_string()),
            narration: None,
        }
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = client("https://bank.example.com/v1/".to_string());
        assert_eq!(client.base_url(), "https://bank.example.com/v1");
    }

    #[test]
    fn test_signature_is_stable_hex() {
        let client = client("https://bank.example.com".to_string());
        let a = client.sign(b"{\"amount\":1}").unwrap();
        let b = client.sign(b"{\"amount\":1}").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, client.sign(b"{\"amount\":2}").unwrap());
    }

    #[tokio::test]
    async fn test_transfer_success_sends_auth_and_signature() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/transfers")
            .match_header("authorization", "Bearer test-key")
            .match_header(SIGNATURE_HEADER, Matcher::Regex("^[0-9a-f]{64}$".into()))
            .match_body(Matcher::PartialJson(json!({"reference": "TRF0001", "amount": 5000})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":"00","message":"ok","data":{"sessionId":"S-1"}}"#)
            .create_async()
            .await;

        let response = client(server.url()).transfer(&request()).await.unwrap();

        mock.assert_async().await;
        assert!(response.is_success());
        assert_eq!(response.provider_ref(), Some("S-1".to_string()));
    }

    #[tokio::test]
    async fn test_transfer_decline_is_ok_response() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/transfers")
            .with_status(400)
            .with_body(r#"{"status":"51","message":"Insufficient funds"}"#)
            .create_async()
            .await;

        let response = client(server.url()).transfer(&request()).await.unwrap();
        assert!(!response.is_success());
        assert_eq!(response.status, "51");
    }

    #[tokio::test]
    async fn test_transfer_server_error_is_err() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/transfers")
            .with_status(503)
            .with_body("upstream unavailable")
            .create_async()
            .await;

        let result = client(server.url()).transfer(&request()).await;
        assert!(matches!(result, Err(ProviderError::Http { status: 503, .. })));
    }

    #[tokio::test]
    async fn test_account_info_parses_data() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/accounts")
            .with_status(200)
            .with_body(
                r#"{"status":"00","data":{"accountNo":"0000000001","accountBalance":900000,
                "accountId":"A1","clientId":"C1","client":"Platform"}}"#,
            )
            .create_async()
            .await;

        let info = client(server.url()).account_info(None).await.unwrap();
        assert_eq!(info.account_no, "0000000001");
        assert_eq!(info.account_balance, 900_000);
    }

    #[tokio::test]
    async fn test_query_transaction_statuses() {
        let mut server = mockito::Server::new_async().await;
        let _found = server
            .mock("GET", "/transactions/TRF-OK")
            .with_status(200)
            .with_body(r#"{"status":"00"}"#)
            .create_async()
            .await;
        let _missing = server
            .mock("GET", "/transactions/TRF-NONE")
            .with_status(404)
            .create_async()
            .await;

        let client = client(server.url());
        assert_eq!(
            client.query_transaction("TRF-OK").await.unwrap(),
            ProviderTxnStatus::Successful
        );
        assert_eq!(
            client.query_transaction("TRF-NONE").await.unwrap(),
            ProviderTxnStatus::NotFound
        );
    }
}
