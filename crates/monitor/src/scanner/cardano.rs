use std::sync::Arc;

use async_trait::async_trait;
use coffer_chains::{BlockfrostApi, BlockfrostClient, stake_address_from_base};
use coffer_storage::models::{AssetQuery, AssetState, NewAssetSnapshot};

use super::{ChainScanner, EndpointPool, NativeToken, QueryOutput, ScannerContext, ScannerId};
use crate::error::{InitFailure, QueryFailure, ScanQueryError, ScannerInitError};
use crate::price::PriceResolver;
use crate::store::AssetStore;
use crate::units::parse_units;

/// ADA controlled by the stake key of a Shelley address, via Blockfrost.
pub struct CardanoScanner {
    id: ScannerId,
    endpoints: EndpointPool<Arc<dyn BlockfrostApi>>,
    prices: Arc<PriceResolver>,
    store: Arc<dyn AssetStore>,
    native: Option<NativeToken>,
}

impl CardanoScanner {
    /// Lovelace per ADA.
    pub const DECIMALS: u32 = 6;

    pub fn new(
        id: ScannerId,
        endpoints: EndpointPool<Arc<dyn BlockfrostApi>>,
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
            let project_id = e.api_key.clone().unwrap_or_default();
            Ok(Arc::new(BlockfrostClient::new(&e.endpoint, project_id)) as Arc<dyn BlockfrostApi>)
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
        let stake_address = stake_address_from_base(&target.addr)?;
        let endpoint = self.endpoints.next();

        let (chain_data, price) = tokio::join!(
            async {
                tokio::try_join!(
                    endpoint.call(|c| c.account(&stake_address)),
                    endpoint.call(|c| c.latest_block_time()),
                )
            },
            self.prices.get_price(&native.code),
        );
        let (account, captured_at) = chain_data?;

        let Some(account) = account else {
            tracing::debug!(scanner = %self.id, %stake_address, "stake address has no history");
            return Ok(Vec::new());
        };
        let quantity = parse_units(&account.controlled_amount, Self::DECIMALS)?;
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
impl ChainScanner for CardanoScanner {
    fn id(&self) -> &ScannerId {
        &self.id
    }

    async fn initialize(&mut self) -> Result<(), ScannerInitError> {
        let native = NativeToken::load(self.store.as_ref(), &self.id.chain)
            .await
            .map_err(|e| self.id.init_error(e))?;
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
