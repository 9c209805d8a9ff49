use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use coffer_core::AppError;
use rust_decimal::Decimal;

use super::{PriceSource, PriceSourceKind};
use crate::error::PriceError;

/// Fixed prices for stablecoins and other pegged codes.
pub struct PeggedPriceSource {
    prices: HashMap<String, Decimal>,
}

impl PeggedPriceSource {
    pub fn new(prices: HashMap<String, Decimal>) -> Self {
        let prices = prices
            .into_iter()
            .map(|(code, price)| (code.to_uppercase(), price))
            .collect();
        Self { prices }
    }

    pub fn from_settings(pegged: &HashMap<String, String>) -> Result<Self, AppError> {
        let mut prices = HashMap::with_capacity(pegged.len());
        for (code, price) in pegged {
            let price = Decimal::from_str(price.trim())
                .map_err(|e| AppError::Config(format!("invalid pegged price for {code}: {e}")))?;
            if price <= Decimal::ZERO {
                return Err(AppError::Config(format!("pegged price for {code} must be positive")));
            }
            prices.insert(code.clone(), price);
        }
        Ok(Self::new(prices))
    }
}

#[async_trait]
impl PriceSource for PeggedPriceSource {
    fn kind(&self) -> PriceSourceKind {
        PriceSourceKind::Pegged
    }

    async fn translate_code(&self, code: &str) -> Result<Option<String>, PriceError> {
        let code = code.to_uppercase();
        Ok(self.prices.contains_key(&code).then_some(code))
    }

    async fn fetch_price(&self, source_id: &str) -> Result<Option<Decimal>, PriceError> {
        Ok(self.prices.get(source_id).copied())
    }
}
