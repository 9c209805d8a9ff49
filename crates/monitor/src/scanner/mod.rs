//! Pluggable per-chain scanners.
//!
//! A scanner is built for one `(chain, scanner_type)` configuration, brought
//! up once per cycle with [`ChainScanner::initialize`] and then asked for the
//! positions of every target on its chain.

mod cardano;
mod cosmos;
mod endpoints;
mod evm;
mod registry;
mod ripple;

pub use cardano::CardanoScanner;
pub use cosmos::CosmosScanner;
pub use endpoints::{Endpoint, EndpointPool};
pub use evm::{Erc20Scanner, EvmNativeScanner};
pub use registry::{ScannerFactory, ScannerRegistry};
pub use ripple::RippleScanner;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coffer_core::Settings;
use coffer_storage::models::{AssetQuery, AssetState, AssetType, NewAssetSnapshot};
use rust_decimal::Decimal;

use crate::error::{InitFailure, QueryFailure, ScanQueryError, ScannerInitError};
use crate::price::PriceResolver;
use crate::rate_limiter::RateLimiter;
use crate::store::{AssetStore, ScannerConfig};
use crate::units::humanize;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScannerId {
    pub chain: String,
    pub scanner_type: String,
}

impl ScannerId {
    pub fn new(chain: impl Into<String>, scanner_type: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
            scanner_type: scanner_type.into(),
        }
    }

    pub(crate) fn query_error(
        &self,
        target: &AssetQuery,
        cause: impl Into<QueryFailure>,
    ) -> ScanQueryError {
        ScanQueryError {
            scanner: self.clone(),
            address: target.addr.clone(),
            cause: cause.into(),
        }
    }

    pub(crate) fn init_error(&self, cause: impl Into<InitFailure>) -> ScannerInitError {
        ScannerInitError::new(self.clone(), cause)
    }
}

impl fmt::Display for ScannerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.chain, self.scanner_type)
    }
}

/// A held position left out of its batch because it could not be valued.
#[derive(Debug, Clone)]
pub struct OmittedPosition {
    pub scanner: ScannerId,
    pub address: String,
    pub code: String,
    pub quantity: Decimal,
    pub reason: String,
}

impl fmt::Display for OmittedPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {} {} omitted ({})",
            self.scanner, self.address, self.quantity, self.code, self.reason
        )
    }
}

/// What one query of one target produced.
#[derive(Debug, Default)]
pub struct QueryOutput {
    pub snapshots: Vec<NewAssetSnapshot>,
    pub omitted: Vec<OmittedPosition>,
}

impl From<Vec<NewAssetSnapshot>> for QueryOutput {
    fn from(snapshots: Vec<NewAssetSnapshot>) -> Self {
        Self {
            snapshots,
            omitted: Vec::new(),
        }
    }
}

#[async_trait]
pub trait ChainScanner: Send + Sync {
    fn id(&self) -> &ScannerId;

    /// Resolve chain-level reference data. A failure leaves the scanner out
    /// of the cycle.
    async fn initialize(&mut self) -> Result<(), ScannerInitError>;

    /// Positions held by `target`. Zero amounts produce no snapshot; held
    /// positions that cannot be valued come back as omissions.
    async fn query(&self, target: &AssetQuery) -> Result<QueryOutput, ScanQueryError>;
}

/// Everything a scanner factory may hand to the scanner it builds.
#[derive(Clone)]
pub struct ScannerContext {
    pub config: ScannerConfig,
    pub limiter: Arc<RateLimiter>,
    pub prices: Arc<PriceResolver>,
    pub store: Arc<dyn AssetStore>,
    pub settings: Arc<Settings>,
}

impl ScannerContext {
    pub fn id(&self) -> ScannerId {
        ScannerId::new(&self.config.config.chain, &self.config.config.scanner_type)
    }

    pub fn chain(&self) -> &str {
        &self.config.config.chain
    }
}

/// A chain's native token as resolved at initialization.
#[derive(Debug, Clone)]
pub(crate) struct NativeToken {
    pub code: String,
    pub chain: String,
    pub decimals: Option<u32>,
}

impl NativeToken {
    pub(crate) async fn load(store: &dyn AssetStore, chain: &str) -> Result<Self, InitFailure> {
        let info = store.native_asset(chain).await?.ok_or_else(|| {
            InitFailure::MissingReference(format!("no native asset registered for `{chain}`"))
        })?;
        Ok(Self {
            code: info.code,
            chain: chain.to_string(),
            decimals: info.decimals.and_then(|d| u32::try_from(d).ok()),
        })
    }

    pub(crate) fn label(&self) -> String {
        format!("{} Native Token", humanize(&self.chain))
    }

    pub(crate) fn snapshot(
        &self,
        name: String,
        state: AssetState,
        quantity: Decimal,
        price: Decimal,
        captured_at: DateTime<Utc>,
    ) -> NewAssetSnapshot {
        NewAssetSnapshot::valued(
            name,
            &self.code,
            &self.chain,
            AssetType::NativeToken,
            state,
            quantity,
            price,
            captured_at,
        )
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use chrono::TimeZone;

    use super::*;
    use crate::price::PriceSourceKind;
    use crate::price::tests::{FakeSource, resolver, shared};
    use crate::store::MemoryStore;

    pub(crate) fn limiter() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(Default::default(), HashMap::new()))
    }

    pub(crate) fn prices(quotes: &[(&str, Decimal)]) -> Arc<PriceResolver> {
        let quotes: Vec<_> = quotes.iter().map(|(c, p)| (*c, Some(*p))).collect();
        let source = Arc::new(FakeSource::new(PriceSourceKind::Pegged, &quotes));
        Arc::new(resolver(vec![shared(&source)]))
    }

    pub(crate) fn store_with_native(chain: &str, code: &str, decimals: Option<i16>) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.add_asset(chain, code, AssetType::NativeToken, None, decimals);
        store
    }

    pub(crate) fn pool<C>(client: C) -> EndpointPool<C> {
        EndpointPool::new(vec![Endpoint {
            url: "http://node".into(),
            client,
            limiter: limiter().handle("node"),
        }])
        .unwrap()
    }

    pub(crate) fn target(chain: &str, addr: &str) -> AssetQuery {
        AssetQuery {
            id: 1,
            chain: chain.into(),
            addr: addr.into(),
            group_id: None,
        }
    }

    pub(crate) fn block_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap()
    }
}
