use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::OnceCell;

use super::{PriceSource, PriceSourceKind};
use crate::error::PriceError;
use crate::rate_limiter::RateLimitHandle;
use crate::units::decimal_from_json;

/// Codes whose symbol is ambiguous on CoinGecko.
const KNOWN_IDS: &[(&str, &str)] = &[
    ("BTC", "bitcoin"),
    ("ETH", "ethereum"),
    ("XRP", "ripple"),
    ("ADA", "cardano"),
    ("ATOM", "cosmos"),
    ("OSMO", "osmosis"),
    ("AKT", "akash-network"),
    ("JUNO", "juno-network"),
    ("TIA", "celestia"),
    ("INJ", "injective-protocol"),
    ("BNB", "binancecoin"),
    ("POL", "polygon-ecosystem-token"),
    ("MATIC", "matic-network"),
    ("AVAX", "avalanche-2"),
    ("ARB", "arbitrum"),
    ("OP", "optimism"),
    ("USDT", "tether"),
    ("USDC", "usd-coin"),
    ("DAI", "dai"),
];

#[derive(Debug, Deserialize)]
struct CoinListing {
    id: String,
    symbol: String,
}

pub struct CoinGeckoPriceSource {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    limiter: RateLimitHandle,
    /// Symbol (uppercase) -> ids, loaded once on the first unknown code.
    listing: OnceCell<HashMap<String, Vec<String>>>,
}

impl CoinGeckoPriceSource {
    pub fn new(base_url: &str, api_key: Option<String>, limiter: RateLimitHandle) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            limiter,
            listing: OnceCell::new(),
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        let request = self.client.get(format!("{}{path}", self.base_url));
        match &self.api_key {
            Some(key) => request.header("x-cg-demo-api-key", key),
            None => request,
        }
    }

    async fn listing(&self) -> Result<&HashMap<String, Vec<String>>, PriceError> {
        self.listing
            .get_or_try_init(|| async {
                let coins: Vec<CoinListing> = self
                    .limiter
                    .execute(|| async {
                        self.get("/coins/list")
                            .send()
                            .await?
                            .error_for_status()?
                            .json()
                            .await
                    })
                    .await?
                    .map_err(failed)?;
                tracing::debug!(coins = coins.len(), "loaded coingecko coin list");
                Ok::<_, PriceError>(index_by_symbol(coins))
            })
            .await
    }
}

fn failed(e: impl std::fmt::Display) -> PriceError {
    PriceError::Source {
        name: "coingecko",
        message: e.to_string(),
    }
}

fn known_id(code: &str) -> Option<&'static str> {
    KNOWN_IDS
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(code))
        .map(|(_, id)| *id)
}

fn index_by_symbol(coins: Vec<CoinListing>) -> HashMap<String, Vec<String>> {
    let mut index: HashMap<String, Vec<String>> = HashMap::new();
    for coin in coins {
        index.entry(coin.symbol.to_uppercase()).or_default().push(coin.id);
    }
    index
}

#[async_trait]
impl PriceSource for CoinGeckoPriceSource {
    fn kind(&self) -> PriceSourceKind {
        PriceSourceKind::CoinGecko
    }

    async fn translate_code(&self, code: &str) -> Result<Option<String>, PriceError> {
        if let Some(id) = known_id(code) {
            return Ok(Some(id.to_string()));
        }
        let listing = self.listing().await?;
        match listing.get(&code.to_uppercase()).map(Vec::as_slice) {
            Some([id]) => Ok(Some(id.clone())),
            Some(ids) => {
                tracing::debug!(code, candidates = ids.len(), "ambiguous coingecko symbol");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn fetch_price(&self, source_id: &str) -> Result<Option<Decimal>, PriceError> {
        let quotes: HashMap<String, HashMap<String, serde_json::Value>> = self
            .limiter
            .execute(|| async {
                self.get("/simple/price")
                    .query(&[("ids", source_id), ("vs_currencies", "usd")])
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await
            })
            .await?
            .map_err(failed)?;

        Ok(quotes
            .get(source_id)
            .and_then(|quote| quote.get("usd"))
            .and_then(decimal_from_json))
    }
}
