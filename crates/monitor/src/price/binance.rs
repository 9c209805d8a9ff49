use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;

use super::{PriceSource, PriceSourceKind};
use crate::error::PriceError;
use crate::rate_limiter::RateLimitHandle;
use crate::units::decimal_from_json;

const QUOTE: &str = "USDT";

/// Spot ticker prices against USDT.
pub struct BinancePriceSource {
    client: Client,
    base_url: String,
    limiter: RateLimitHandle,
}

#[derive(Debug, Deserialize)]
struct Ticker {
    price: serde_json::Value,
}

impl BinancePriceSource {
    pub fn new(base_url: &str, limiter: RateLimitHandle) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            limiter,
        }
    }
}

fn failed(e: impl std::fmt::Display) -> PriceError {
    PriceError::Source {
        name: "binance",
        message: e.to_string(),
    }
}

/// `"xrp"` -> `"XRPUSDT"`. The quote itself cannot be priced this way.
fn ticker_symbol(code: &str) -> Option<String> {
    let code = code.trim().to_uppercase();
    let valid = !code.is_empty() && code != QUOTE && code.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then(|| format!("{code}{QUOTE}"))
}

#[async_trait]
impl PriceSource for BinancePriceSource {
    fn kind(&self) -> PriceSourceKind {
        PriceSourceKind::Binance
    }

    async fn translate_code(&self, code: &str) -> Result<Option<String>, PriceError> {
        Ok(ticker_symbol(code))
    }

    async fn fetch_price(&self, source_id: &str) -> Result<Option<Decimal>, PriceError> {
        let url = format!("{}/api/v3/ticker/price", self.base_url);
        let response = self
            .limiter
            .execute(|| self.client.get(&url).query(&[("symbol", source_id)]).send())
            .await?
            .map_err(failed)?;

        // Unknown symbols come back as 400 with code -1121.
        if response.status() == StatusCode::BAD_REQUEST {
            tracing::debug!(symbol = source_id, "binance has no such ticker");
            return Ok(None);
        }
        let ticker: Ticker = response
            .error_for_status()
            .map_err(failed)?
            .json()
            .await
            .map_err(failed)?;
        Ok(decimal_from_json(&ticker.price))
    }
}
