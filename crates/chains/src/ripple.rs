use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{ChainError, http};

/// Seconds between the Unix epoch and the XRP Ledger epoch (2000-01-01).
const RIPPLE_EPOCH_OFFSET: i64 = 946_684_800;

/// Read access to an XRP Ledger node.
#[async_trait]
pub trait RippleApi: Send + Sync {
    /// Balance of `account` in drops on the latest validated ledger.
    /// Accounts that do not exist yet report `"0"`.
    async fn balance_drops(&self, account: &str) -> Result<String, ChainError>;

    /// Close time of the latest validated ledger.
    async fn validated_ledger_time(&self) -> Result<DateTime<Utc>, ChainError>;
}

/// JSON-RPC client for rippled.
pub struct RippleClient {
    http: Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    result: Value,
}

impl RippleClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: http::client(),
            url: url.into(),
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let body = json!({ "method": method, "params": [params] });
        tracing::debug!(method, url = %self.url, "rippled request");

        let envelope: RpcEnvelope = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(envelope.result)
    }
}

#[async_trait]
impl RippleApi for RippleClient {
    async fn balance_drops(&self, account: &str) -> Result<String, ChainError> {
        let result = self
            .call(
                "account_info",
                json!({ "account": account, "ledger_index": "validated" }),
            )
            .await?;
        parse_account_info(&result)
    }

    async fn validated_ledger_time(&self) -> Result<DateTime<Utc>, ChainError> {
        let result = self
            .call("ledger", json!({ "ledger_index": "validated" }))
            .await?;
        let close_time = result
            .pointer("/ledger/close_time")
            .and_then(Value::as_i64)
            .ok_or_else(|| ChainError::Decode("ledger response without close_time".into()))?;
        DateTime::from_timestamp(close_time + RIPPLE_EPOCH_OFFSET, 0)
            .ok_or_else(|| ChainError::Decode(format!("close_time out of range: {close_time}")))
    }
}

fn parse_account_info(result: &Value) -> Result<String, ChainError> {
    if let Some(error) = result.get("error").and_then(Value::as_str) {
        return match error {
            "actNotFound" => Ok("0".to_string()),
            other => Err(ChainError::Rpc(other.to_string())),
        };
    }
    result
        .pointer("/account_data/Balance")
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| ChainError::Decode("account_info response without Balance".into()))
}
