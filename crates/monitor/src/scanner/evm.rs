use std::sync::Arc;

use async_trait::async_trait;
use coffer_chains::{EvmApi, EvmClient};
use coffer_storage::models::{AssetQuery, AssetState, AssetType, NewAssetSnapshot};
use futures::future::{join_all, try_join_all};

use super::{ChainScanner, EndpointPool, NativeToken, OmittedPosition, QueryOutput, ScannerContext, ScannerId};
use crate::error::{InitFailure, QueryFailure, ScanQueryError, ScannerInitError};
use crate::price::PriceResolver;
use crate::store::AssetStore;
use crate::units::parse_units;

/// Decimals of the native coin on every EVM chain we scan.
const NATIVE_DECIMALS: u32 = 18;

fn connect(ctx: &ScannerContext) -> Result<EndpointPool<Arc<dyn EvmApi>>, InitFailure> {
    EndpointPool::connect(ctx, |e| {
        Ok(Arc::new(EvmClient::connect(&e.endpoint)?) as Arc<dyn EvmApi>)
    })
}

/// Native coin balance (ETH, POL, BNB, AVAX, ...).
pub struct EvmNativeScanner {
    id: ScannerId,
    endpoints: EndpointPool<Arc<dyn EvmApi>>,
    prices: Arc<PriceResolver>,
    store: Arc<dyn AssetStore>,
    native: Option<NativeToken>,
}

impl EvmNativeScanner {
    pub fn new(
        id: ScannerId,
        endpoints: EndpointPool<Arc<dyn EvmApi>>,
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
        Ok(Self::new(
            ctx.id(),
            connect(ctx)?,
            Arc::clone(&ctx.prices),
            Arc::clone(&ctx.store),
        ))
    }

    async fn positions(&self, target: &AssetQuery) -> Result<Vec<NewAssetSnapshot>, QueryFailure> {
        let native = self.native.as_ref().ok_or(QueryFailure::NotInitialized)?;
        let endpoint = self.endpoints.next();

        let (chain_data, price) = tokio::join!(
            async {
                tokio::try_join!(
                    endpoint.call(|c| c.native_balance(&target.addr)),
                    endpoint.call(|c| c.latest_block_time()),
                )
            },
            self.prices.get_price(&native.code),
        );
        let (wei, captured_at) = chain_data?;

        let quantity = parse_units(&wei, native.decimals.unwrap_or(NATIVE_DECIMALS))?;
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
impl ChainScanner for EvmNativeScanner {
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

/// A token contract resolved at initialization.
#[derive(Debug, Clone)]
struct Token {
    code: String,
    name: String,
    address: String,
    decimals: u32,
}

/// Balances of every registered secondary token on an EVM chain.
pub struct Erc20Scanner {
    id: ScannerId,
    endpoints: EndpointPool<Arc<dyn EvmApi>>,
    prices: Arc<PriceResolver>,
    store: Arc<dyn AssetStore>,
    tokens: Option<Vec<Token>>,
}

impl Erc20Scanner {
    pub fn new(
        id: ScannerId,
        endpoints: EndpointPool<Arc<dyn EvmApi>>,
        prices: Arc<PriceResolver>,
        store: Arc<dyn AssetStore>,
    ) -> Self {
        Self {
            id,
            endpoints,
            prices,
            store,
            tokens: None,
        }
    }

    pub fn from_context(ctx: &ScannerContext) -> Result<Self, InitFailure> {
        Ok(Self::new(
            ctx.id(),
            connect(ctx)?,
            Arc::clone(&ctx.prices),
            Arc::clone(&ctx.store),
        ))
    }

    async fn resolve_tokens(&self) -> Result<Vec<Token>, InitFailure> {
        let infos = self
            .store
            .assets_of_type(&self.id.chain, AssetType::SecondaryToken)
            .await?;

        let mut tokens = Vec::with_capacity(infos.len());
        for info in infos {
            let Some(address) = info.address.filter(|a| !a.is_empty()) else {
                tracing::debug!(scanner = %self.id, code = %info.code, "secondary token without contract address");
                continue;
            };
            let decimals = match info.decimals.and_then(|d| u32::try_from(d).ok()) {
                Some(decimals) => decimals,
                None => self
                    .endpoints
                    .next()
                    .call(|c| c.token_decimals(&address))
                    .await
                    .map(u32::from)?,
            };
            tokens.push(Token {
                name: info.name.unwrap_or_else(|| info.code.clone()),
                code: info.code,
                address,
                decimals,
            });
        }
        Ok(tokens)
    }

    async fn positions(&self, target: &AssetQuery) -> Result<QueryOutput, QueryFailure> {
        let tokens = self.tokens.as_ref().ok_or(QueryFailure::NotInitialized)?;
        if tokens.is_empty() {
            return Ok(QueryOutput::default());
        }
        let endpoint = self.endpoints.next();
        let owner = target.addr.as_str();

        let (balances, captured_at) = tokio::try_join!(
            try_join_all(
                tokens
                    .iter()
                    .map(|t| endpoint.call(move |c| c.token_balance(&t.address, owner))),
            ),
            endpoint.call(|c| c.latest_block_time()),
        )?;

        let mut held = Vec::new();
        for (token, raw) in tokens.iter().zip(balances) {
            let quantity = parse_units(&raw, token.decimals)?;
            if !quantity.is_zero() {
                held.push((token, quantity));
            }
        }

        let prices = join_all(held.iter().map(|(t, _)| self.prices.get_price(&t.code))).await;
        let mut output = QueryOutput::default();
        for ((token, quantity), price) in held.into_iter().zip(prices) {
            match price {
                Ok(price) => output.snapshots.push(NewAssetSnapshot::valued(
                    &token.name,
                    &token.code,
                    &self.id.chain,
                    AssetType::SecondaryToken,
                    AssetState::Liquid,
                    quantity,
                    price,
                    captured_at,
                )),
                Err(e) => {
                    tracing::warn!(scanner = %self.id, code = %token.code, error = %e, "omitting unpriced token");
                    output.omitted.push(OmittedPosition {
                        scanner: self.id.clone(),
                        address: owner.to_string(),
                        code: token.code.clone(),
                        quantity,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(output)
    }
}

#[async_trait]
impl ChainScanner for Erc20Scanner {
    fn id(&self) -> &ScannerId {
        &self.id
    }

    async fn initialize(&mut self) -> Result<(), ScannerInitError> {
        let tokens = self.resolve_tokens().await.map_err(|e| self.id.init_error(e))?;
        tracing::debug!(scanner = %self.id, tokens = tokens.len(), "erc20 scanner ready");
        self.tokens = Some(tokens);
        Ok(())
    }

    async fn query(&self, target: &AssetQuery) -> Result<QueryOutput, ScanQueryError> {
        self.positions(target)
            .await
            .map_err(|e| self.id.query_error(target, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::testing::*;
    use crate::store::MemoryStore;
    use chrono::{DateTime, Utc};
    use coffer_chains::ChainError;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const USDC: &str = "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48";
    const PEPE: &str = "0x6982508145454Ce325dDbE47a25d4ec3d2311933";
    const DUST: &str = "0x0000000000000000000000000000000000000d05";

    #[derive(Default)]
    struct FakeRpc {
        native_wei: &'static str,
        balances: HashMap<&'static str, &'static str>,
        decimals: HashMap<&'static str, u8>,
        decimals_calls: AtomicUsize,
    }

    #[async_trait]
    impl EvmApi for FakeRpc {
        async fn native_balance(&self, _owner: &str) -> Result<String, ChainError> {
            Ok(self.native_wei.to_string())
        }

        async fn token_balance(&self, token: &str, _owner: &str) -> Result<String, ChainError> {
            self.balances
                .get(token)
                .map(|b| b.to_string())
                .ok_or_else(|| ChainError::Rpc(format!("execution reverted: {token}")))
        }

        async fn token_decimals(&self, token: &str) -> Result<u8, ChainError> {
            self.decimals_calls.fetch_add(1, Ordering::SeqCst);
            self.decimals
                .get(token)
                .copied()
                .ok_or_else(|| ChainError::Rpc("no decimals".into()))
        }

        async fn latest_block_time(&self) -> Result<DateTime<Utc>, ChainError> {
            Ok(block_time())
        }
    }

    #[tokio::test]
    async fn native_balance_uses_eighteen_decimals() {
        let client: Arc<dyn EvmApi> = Arc::new(FakeRpc {
            native_wei: "1500000000000000000",
            ..Default::default()
        });
        let mut scanner = EvmNativeScanner::new(
            ScannerId::new("ethereum", "native"),
            pool(client),
            prices(&[("ETH", dec!(3000))]),
            store_with_native("ethereum", "ETH", None),
        );
        scanner.initialize().await.unwrap();

        let snapshots = scanner.query(&target("ethereum", "0xabc")).await.unwrap().snapshots;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].quantity, dec!(1.5));
        assert_eq!(snapshots[0].usd_value, dec!(4500));
        assert_eq!(snapshots[0].asset_type, AssetType::NativeToken);
    }

    #[tokio::test]
    async fn erc20_values_held_tokens_and_skips_the_rest() {
        let rpc = Arc::new(FakeRpc {
            balances: HashMap::from([(USDC, "2500000"), (PEPE, "1000000000000000000000"), (DUST, "0")]),
            decimals: HashMap::from([(USDC, 6)]),
            ..Default::default()
        });
        let store = Arc::new(MemoryStore::new());
        store.add_asset("ethereum", "USDC", AssetType::SecondaryToken, Some(USDC), None);
        store.add_asset("ethereum", "PEPE", AssetType::SecondaryToken, Some(PEPE), Some(18));
        store.add_asset("ethereum", "DUST", AssetType::SecondaryToken, Some(DUST), Some(18));
        store.add_asset("ethereum", "NOADDR", AssetType::SecondaryToken, None, Some(18));

        let client: Arc<dyn EvmApi> = rpc.clone();
        let mut scanner = Erc20Scanner::new(
            ScannerId::new("ethereum", "erc20"),
            pool(client),
            // PEPE has no quote and is reported as omitted rather than failing the query.
            prices(&[("USDC", dec!(1))]),
            store,
        );
        scanner.initialize().await.unwrap();
        assert_eq!(rpc.decimals_calls.load(Ordering::SeqCst), 1);

        let output = scanner.query(&target("ethereum", "0xabc")).await.unwrap();
        let snapshots = &output.snapshots;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].code, "USDC");
        assert_eq!(snapshots[0].quantity, dec!(2.5));
        assert_eq!(snapshots[0].usd_value, dec!(2.5));
        assert_eq!(snapshots[0].asset_type, AssetType::SecondaryToken);

        assert_eq!(output.omitted.len(), 1);
        assert_eq!(output.omitted[0].code, "PEPE");
        assert_eq!(output.omitted[0].quantity, dec!(1000));
        assert_eq!(output.omitted[0].address, "0xabc");
    }

    #[tokio::test]
    async fn erc20_balance_failure_fails_the_query() {
        let client: Arc<dyn EvmApi> = Arc::new(FakeRpc::default());
        let store = Arc::new(MemoryStore::new());
        store.add_asset("base", "USDC", AssetType::SecondaryToken, Some(USDC), Some(6));
        let mut scanner = Erc20Scanner::new(ScannerId::new("base", "erc20"), pool(client), prices(&[]), store);
        scanner.initialize().await.unwrap();

        let err = scanner.query(&target("base", "0xabc")).await.unwrap_err();
        assert!(matches!(err.cause, QueryFailure::Chain(ChainError::Rpc(_))));
    }
}
