use std::sync::Arc;

use async_trait::async_trait;
use coffer_chains::{RippleApi, RippleClient};
use coffer_storage::models::{AssetQuery, AssetState, NewAssetSnapshot};

use super::{ChainScanner, EndpointPool, NativeToken, QueryOutput, ScannerContext, ScannerId};
use crate::error::{InitFailure, QueryFailure, ScanQueryError, ScannerInitError};
use crate::price::PriceResolver;
use crate::store::AssetStore;
use crate::units::parse_units;

/// XRP held on the XRP Ledger.
pub struct RippleScanner {
    id: ScannerId,
    endpoints: EndpointPool<Arc<dyn RippleApi>>,
    prices: Arc<PriceResolver>,
    store: Arc<dyn AssetStore>,
    native: Option<NativeToken>,
}

impl RippleScanner {
    /// Drops per XRP.
    pub const DECIMALS: u32 = 6;

    pub fn new(
        id: ScannerId,
        endpoints: EndpointPool<Arc<dyn RippleApi>>,
        prices: Arc<PriceResolver>,
        store: Arc<dyn AssetStore>,
    ) -> Self {
        Self {
            id,
            endpoints,
            prices,
            store,
            native: None,
        }
    }

    pub fn from_context(ctx: &ScannerContext) -> Result<Self, InitFailure> {
        let endpoints = EndpointPool::connect(ctx, |e| {
            Ok(Arc::new(RippleClient::new(&e.endpoint)) as Arc<dyn RippleApi>)
        })?;
        Ok(Self::new(
            ctx.id(),
            endpoints,
            Arc::clone(&ctx.prices),
            Arc::clone(&ctx.store),
        ))
    }

    async fn positions(&self, target: &AssetQuery) -> Result<Vec<NewAssetSnapshot>, QueryFailure> {
        let native = self.native.as_ref().ok_or(QueryFailure::NotInitialized)?;
        let endpoint = self.endpoints.next();

        let (ledger, price) = tokio::join!(
            async {
                tokio::try_join!(
                    endpoint.call(|c| c.balance_drops(&target.addr)),
                    endpoint.call(|c| c.validated_ledger_time()),
                )
            },
            self.prices.get_price(&native.code),
        );
        let (drops, captured_at) = ledger?;

        let quantity = parse_units(&drops, Self::DECIMALS)?;
        if quantity.is_zero() {
            return Ok(Vec::new());
        }
        Ok(vec![native.snapshot(
            native.label(),
            AssetState::Liquid,
            quantity,
            price?,
            captured_at,
        )])
    }
}

#[async_trait]
impl ChainScanner for RippleScanner {
    fn id(&self) -> &ScannerId {
        &self.id
    }

    async fn initialize(&mut self) -> Result<(), ScannerInitError> {
        let native = NativeToken::load(self.store.as_ref(), &self.id.chain)
            .await
            .map_err(|e| self.id.init_error(e))?;
        tracing::debug!(scanner = %self.id, code = %native.code, "ripple scanner ready");
        self.native = Some(native);
        Ok(())
    }

    async fn query(&self, target: &AssetQuery) -> Result<QueryOutput, ScanQueryError> {
        self.positions(target)
            .await
            .map(QueryOutput::from)
            .map_err(|e| self.id.query_error(target, e))
    }
}
