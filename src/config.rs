use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::domain::account;
use crate::provider::BreakerConfig;
use crate::services::scheduler::DEFAULT_SCHEDULE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Plain,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "plain" | "text" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            other => bail!("LOG_FORMAT must be 'plain' or 'json', got '{}'", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub bank_api_url: String,
    pub bank_api_key: String,
    pub bank_api_secret: String,
    pub base_currency: String,
    pub provider_timeout: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_reset_timeout: Duration,
    pub idempotency_ttl: Duration,
    pub stale_transfer_after: Duration,
    pub reconcile_schedule: String,
    /// `external:<bank>:<account>` that receives bill payments. Bill
    /// payments are rejected while unset.
    pub biller_settlement_account: Option<String>,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok(); // Load .env file if present
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String> {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .with_context(|| format!("{key} must be set"))
        };
        let number = |key: &str, default: u64| -> Result<u64> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .with_context(|| format!("{key} must be a whole number, got '{raw}'")),
                None => Ok(default),
            }
        };

        let bank_api_url = required("BANK_API_URL")?;
        Url::parse(&bank_api_url)
            .with_context(|| format!("BANK_API_URL is not a URL: {bank_api_url}"))?;

        let biller_settlement_account =
            lookup("BILLER_SETTLEMENT_ACCOUNT").filter(|v| !v.trim().is_empty());
        if let Some(settlement) = &biller_settlement_account {
            if account::parse_external(settlement).is_none() {
                bail!(
                    "BILLER_SETTLEMENT_ACCOUNT must look like external:<bank>:<account>, got '{}'",
                    settlement
                );
            }
        }

        let base_currency = lookup("BASE_CURRENCY").unwrap_or_else(|| "NGN".to_string());
        if base_currency.len() != 3 || !base_currency.chars().all(|c| c.is_ascii_uppercase()) {
            bail!("BASE_CURRENCY must be a three-letter ISO code, got '{}'", base_currency);
        }

        let small = |key: &str, default: u32| -> Result<u32> {
            let value = number(key, u64::from(default))?;
            u32::try_from(value).with_context(|| format!("{key} is too large, got {value}"))
        };

        let breaker_failure_threshold = small("BREAKER_FAILURE_THRESHOLD", 5)?;
        if breaker_failure_threshold == 0 {
            bail!("BREAKER_FAILURE_THRESHOLD must be at least 1");
        }

        Ok(Config {
            database_url: required("DATABASE_URL")?,
            database_max_connections: small("DATABASE_MAX_CONNECTIONS", 5)?,
            bank_api_url,
            bank_api_key: required("BANK_API_KEY")?,
            bank_api_secret: required("BANK_API_SECRET")?,
            base_currency,
            provider_timeout: Duration::from_secs(number("PROVIDER_TIMEOUT_SECS", 20)?),
            breaker_failure_threshold,
            breaker_reset_timeout: Duration::from_secs(number("BREAKER_RESET_TIMEOUT_SECS", 30)?),
            idempotency_ttl: Duration::from_secs(number("IDEMPOTENCY_TTL_SECS", 86_400)?),
            stale_transfer_after: Duration::from_secs(number("STALE_TRANSFER_SECS", 86_400)?),
            reconcile_schedule: lookup("RECONCILE_SCHEDULE")
                .unwrap_or_else(|| DEFAULT_SCHEDULE.to_string()),
            biller_settlement_account,
            log_format: lookup("LOG_FORMAT")
                .map(|v| v.parse::<LogFormat>())
                .transpose()?
                .unwrap_or(LogFormat::Plain),
        })
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            reset_timeout: self.breaker_reset_timeout,
        }
    }
}
