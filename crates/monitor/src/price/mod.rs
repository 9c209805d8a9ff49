//! USD price resolution over an ordered list of sources.

mod binance;
mod coingecko;
mod pegged;

pub use binance::BinancePriceSource;
pub use coingecko::CoinGeckoPriceSource;
pub use pegged::PeggedPriceSource;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use coffer_core::{AppError, Settings};
use rust_decimal::Decimal;
use tokio::sync::OnceCell;

use crate::error::PriceError;
use crate::rate_limiter::RateLimiter;

/// Identifies a price source when a caller needs one specifically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PriceSourceKind {
    Pegged,
    Binance,
    CoinGecko,
}

impl PriceSourceKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "pegged" => Some(Self::Pegged),
            "binance" => Some(Self::Binance),
            "coingecko" | "coin-gecko" => Some(Self::CoinGecko),
            _ => None,
        }
    }
}

/// One external price feed.
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn kind(&self) -> PriceSourceKind;

    /// Map an asset code to this source's identifier, `None` if unsupported.
    async fn translate_code(&self, code: &str) -> Result<Option<String>, PriceError>;

    /// USD price of a source-specific id, `None` if the source has no quote.
    async fn fetch_price(&self, source_id: &str) -> Result<Option<Decimal>, PriceError>;
}

pub type PriceSources = Arc<Vec<Arc<dyn PriceSource>>>;

/// Build the configured sources in their fallback order.
pub fn build_price_sources(
    settings: &Settings,
    limiter: &Arc<RateLimiter>,
) -> Result<PriceSources, AppError> {
    let mut sources: Vec<Arc<dyn PriceSource>> = Vec::new();
    for name in &settings.price_sources {
        let kind = PriceSourceKind::parse(name)
            .ok_or_else(|| AppError::Config(format!("unknown price source `{name}`")))?;
        let source: Arc<dyn PriceSource> = match kind {
            PriceSourceKind::Pegged => Arc::new(PeggedPriceSource::from_settings(&settings.pegged_prices)?),
            PriceSourceKind::Binance => Arc::new(BinancePriceSource::new(
                &settings.binance_url,
                limiter.handle("price:binance"),
            )),
            PriceSourceKind::CoinGecko => Arc::new(CoinGeckoPriceSource::new(
                &settings.coingecko_url,
                settings.coingecko_api_key.clone(),
                limiter.handle("price:coingecko"),
            )),
        };
        sources.push(source);
    }
    Ok(Arc::new(sources))
}

/// Resolves prices for one scan cycle.
///
/// The first successful quote for a code is memoized, so every snapshot in a
/// batch is valued at the same price. A new resolver is created per cycle.
pub struct PriceResolver {
    sources: PriceSources,
    cache: Mutex<HashMap<String, Arc<OnceCell<Decimal>>>>,
}

impl PriceResolver {
    pub fn new(sources: PriceSources) -> Self {
        Self {
            sources,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn source(&self, kind: PriceSourceKind) -> Option<&Arc<dyn PriceSource>> {
        self.sources.iter().find(|s| s.kind() == kind)
    }

    /// USD price of `code`. Concurrent lookups of the same code share one fetch.
    pub async fn get_price(&self, code: &str) -> Result<Decimal, PriceError> {
        let key = code.trim().to_uppercase();
        let cell = {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(cache.entry(key.clone()).or_default())
        };
        cell.get_or_try_init(|| self.resolve(&key)).await.copied()
    }

    async fn resolve(&self, code: &str) -> Result<Decimal, PriceError> {
        for source in self.sources.iter() {
            let kind = source.kind();
            let source_id = match source.translate_code(code).await {
                Ok(Some(id)) => id,
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!(?kind, code, error = %e, "price source cannot translate code");
                    continue;
                }
            };

            match source.fetch_price(&source_id).await {
                Ok(Some(price)) if price > Decimal::ZERO => {
                    tracing::debug!(?kind, code, %price, "resolved price");
                    return Ok(price);
                }
                Ok(_) => tracing::debug!(?kind, code, "price source has no usable quote"),
                Err(e) => tracing::warn!(?kind, code, error = %e, "price source failed"),
            }
        }
        Err(PriceError::Unavailable {
            code: code.to_string(),
        })
    }
}
