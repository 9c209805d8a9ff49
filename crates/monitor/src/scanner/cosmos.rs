use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use coffer_chains::{AssetList, ChainError, ChainRegistry, ChainRegistryClient, CosmosApi, CosmosClient};
use coffer_storage::models::{AssetQuery, AssetState, NewAssetSnapshot};
use rust_decimal::Decimal;

use super::{ChainScanner, EndpointPool, NativeToken, QueryOutput, ScannerContext, ScannerId};
use crate::error::{InitFailure, QueryFailure, ScanQueryError, ScannerInitError};
use crate::price::{PriceResolver, PriceSourceKind};
use crate::rate_limiter::RateLimitHandle;
use crate::store::AssetStore;
use crate::units::{humanize, parse_units};

/// Limiter key for chain-registry downloads.
const REGISTRY_KEY: &str = "cosmos-registry";

/// Native token of a cosmos-sdk chain: liquid, staked and pending rewards.
pub struct CosmosScanner {
    id: ScannerId,
    endpoints: EndpointPool<Arc<dyn CosmosApi>>,
    registry: Arc<dyn ChainRegistry>,
    registry_limiter: RateLimitHandle,
    prices: Arc<PriceResolver>,
    store: Arc<dyn AssetStore>,
    native: Option<CosmosNative>,
}

#[derive(Debug, Clone)]
struct CosmosNative {
    token: NativeToken,
    denom: String,
    decimals: u32,
}

impl CosmosScanner {
    pub fn new(
        id: ScannerId,
        endpoints: EndpointPool<Arc<dyn CosmosApi>>,
        registry: Arc<dyn ChainRegistry>,
        registry_limiter: RateLimitHandle,
        prices: Arc<PriceResolver>,
        store: Arc<dyn AssetStore>,
    ) -> Self {
        Self {
            id,
            endpoints,
            registry,
            registry_limiter,
            prices,
            store,
            native: None,
        }
    }

    pub fn from_context(ctx: &ScannerContext) -> Result<Self, InitFailure> {
        let endpoints = EndpointPool::connect(ctx, |e| {
            Ok(Arc::new(CosmosClient::new(&e.endpoint)) as Arc<dyn CosmosApi>)
        })?;
        Ok(Self::new(
            ctx.id(),
            endpoints,
            Arc::new(ChainRegistryClient::new(&ctx.settings.cosmos_registry_url)),
            ctx.limiter.handle(REGISTRY_KEY),
            Arc::clone(&ctx.prices),
            Arc::clone(&ctx.store),
        ))
    }

    async fn registry_call<'a, T, F, Fut>(&'a self, op: F) -> Result<T, InitFailure>
    where
        F: FnOnce(&'a dyn ChainRegistry) -> Fut,
        Fut: Future<Output = Result<T, ChainError>>,
    {
        Ok(self.registry_limiter.execute(|| op(self.registry.as_ref())).await??)
    }

    async fn resolve_native(&self) -> Result<CosmosNative, InitFailure> {
        let chain_name = self.id.chain.as_str();
        let token = NativeToken::load(self.store.as_ref(), chain_name).await?;

        let node_chain_id = self.endpoints.next().call(|c| c.chain_id()).await?;
        let (chain, assets) = tokio::try_join!(
            self.registry_call(|r| r.chain(chain_name)),
            self.registry_call(|r| r.asset_list(chain_name)),
        )?;
        if chain.chain_id != node_chain_id {
            return Err(InitFailure::MissingReference(format!(
                "node reports chain id `{node_chain_id}`, registry lists `{}` for `{chain_name}`",
                chain.chain_id
            )));
        }

        let fee_denoms = chain.fee_denoms();
        if fee_denoms.len() > 1 {
            tracing::warn!(chain = chain_name, denoms = ?fee_denoms, "chain has several fee tokens, using the first");
        }
        let denom = match fee_denoms.first() {
            Some(denom) => denom.to_string(),
            None => {
                tracing::debug!(chain = chain_name, "no fee token in registry, looking up denom by coingecko id");
                self.denom_by_coingecko(&assets, &token.code)
                    .await?
                    .ok_or_else(|| InitFailure::MissingReference(format!("native denom of `{chain_name}`")))?
            }
        };

        let decimals = assets
            .decimals_of(&denom)
            .or(token.decimals)
            .ok_or_else(|| InitFailure::MissingReference(format!("decimals of `{denom}` on `{chain_name}`")))?;

        Ok(CosmosNative {
            token,
            denom,
            decimals,
        })
    }

    async fn denom_by_coingecko(&self, assets: &AssetList, code: &str) -> Result<Option<String>, InitFailure> {
        let Some(source) = self.prices.source(PriceSourceKind::CoinGecko) else {
            tracing::debug!("coingecko price source not configured");
            return Ok(None);
        };
        let id = source
            .translate_code(code)
            .await
            .map_err(|e| InitFailure::MissingReference(e.to_string()))?;
        Ok(id.and_then(|id| assets.denom_by_coingecko_id(&id).map(str::to_string)))
    }

    async fn positions(&self, target: &AssetQuery) -> Result<Vec<NewAssetSnapshot>, QueryFailure> {
        let native = self.native.as_ref().ok_or(QueryFailure::NotInitialized)?;
        let endpoint = self.endpoints.next();
        let addr = target.addr.as_str();

        let (chain_data, price) = tokio::join!(
            async {
                tokio::try_join!(
                    endpoint.call(|c| c.latest_block_time()),
                    endpoint.call(|c| c.balance(addr, &native.denom)),
                    endpoint.call(|c| c.staked_balance(addr)),
                    endpoint.call(|c| c.delegation_total_rewards(addr)),
                )
            },
            self.prices.get_price(&native.token.code),
        );
        let (captured_at, balance, staked, rewards) = chain_data?;

        let chain_label = humanize(&native.token.chain);
        let mut positions: Vec<(String, AssetState, Decimal)> = Vec::with_capacity(3);

        let liquid = parse_units(&balance.amount, native.decimals)?;
        if !liquid.is_zero() {
            positions.push((native.token.label(), AssetState::Liquid, liquid));
        }

        if let Some(staked) = staked {
            if staked.denom == native.denom {
                let locked = parse_units(&staked.amount, native.decimals)?;
                if !locked.is_zero() {
                    positions.push((format!("Staked {}", native.token.label()), AssetState::Locked, locked));
                }
            } else {
                tracing::warn!(scanner = %self.id, denom = %staked.denom, "ignoring delegations in a foreign denom");
            }
        }

        if let Some(reward) = rewards.iter().find(|c| c.denom == native.denom) {
            let claimable = parse_units(&reward.amount, native.decimals)?;
            if !claimable.is_zero() {
                positions.push((format!("{chain_label} Staking Reward"), AssetState::Claimable, claimable));
            }
        }

        if positions.is_empty() {
            return Ok(Vec::new());
        }
        let price = price?;
        Ok(positions
            .into_iter()
            .map(|(name, state, quantity)| native.token.snapshot(name, state, quantity, price, captured_at))
            .collect())
    }
}

#[async_trait]
impl ChainScanner for CosmosScanner {
    fn id(&self) -> &ScannerId {
        &self.id
    }

    async fn initialize(&mut self) -> Result<(), ScannerInitError> {
        let native = self.resolve_native().await.map_err(|e| self.id.init_error(e))?;
        tracing::debug!(
            scanner = %self.id,
            denom = %native.denom,
            decimals = native.decimals,
            "cosmos scanner ready"
        );
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::price::tests::{FakeSource, resolver, shared};
    use crate::scanner::testing::*;
    use chrono::{DateTime, Utc};
    use coffer_chains::{Coin, RegistryChain};
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn coin(denom: &str, amount: &str) -> Coin {
        Coin {
            denom: denom.into(),
            amount: amount.into(),
        }
    }

    struct FakeNode {
        chain_id: &'static str,
        balance: &'static str,
        staked: Option<Coin>,
        rewards: Vec<Coin>,
    }

    #[async_trait]
    impl CosmosApi for FakeNode {
        async fn chain_id(&self) -> Result<String, ChainError> {
            Ok(self.chain_id.into())
        }

        async fn latest_block_time(&self) -> Result<DateTime<Utc>, ChainError> {
            Ok(block_time())
        }

        async fn balance(&self, _address: &str, denom: &str) -> Result<Coin, ChainError> {
            Ok(coin(denom, self.balance))
        }

        async fn staked_balance(&self, _address: &str) -> Result<Option<Coin>, ChainError> {
            Ok(self.staked.clone())
        }

        async fn delegation_total_rewards(&self, _address: &str) -> Result<Vec<Coin>, ChainError> {
            Ok(self.rewards.clone())
        }
    }

    struct FakeRegistry {
        fee_denom: Option<&'static str>,
    }

    #[async_trait]
    impl ChainRegistry for FakeRegistry {
        async fn chain(&self, chain_name: &str) -> Result<RegistryChain, ChainError> {
            let fees = self
                .fee_denom
                .map(|denom| json!({ "fee_tokens": [{ "denom": denom }] }));
            serde_json::from_value(json!({
                "chain_name": chain_name,
                "chain_id": "cosmoshub-4",
                "fees": fees,
            }))
            .map_err(|e| ChainError::Decode(e.to_string()))
        }

        async fn asset_list(&self, chain_name: &str) -> Result<AssetList, ChainError> {
            serde_json::from_value(json!({
                "chain_name": chain_name,
                "assets": [{
                    "base": "uatom",
                    "display": "atom",
                    "coingecko_id": "atom",
                    "denom_units": [
                        { "denom": "uatom", "exponent": 0 },
                        { "denom": "atom", "exponent": 6 }
                    ]
                }]
            }))
            .map_err(|e| ChainError::Decode(e.to_string()))
        }
    }

    fn node() -> FakeNode {
        FakeNode {
            chain_id: "cosmoshub-4",
            balance: "2500000",
            staked: Some(coin("uatom", "10000000")),
            rewards: vec![coin("uatom", "123456.789000000000000000")],
        }
    }

    fn scanner(node: FakeNode, registry: FakeRegistry, prices: Arc<PriceResolver>) -> CosmosScanner {
        let client: Arc<dyn CosmosApi> = Arc::new(node);
        CosmosScanner::new(
            ScannerId::new("cosmoshub", "native"),
            pool(client),
            Arc::new(registry),
            limiter().handle(REGISTRY_KEY),
            prices,
            store_with_native("cosmoshub", "ATOM", None),
        )
    }

    #[tokio::test]
    async fn reports_liquid_staked_and_rewards() {
        let mut scanner = scanner(
            node(),
            FakeRegistry { fee_denom: Some("uatom") },
            prices(&[("ATOM", dec!(8))]),
        );
        scanner.initialize().await.unwrap();

        let snapshots = scanner.query(&target("cosmoshub", "cosmos1abc")).await.unwrap().snapshots;

        let summary: Vec<_> = snapshots
            .iter()
            .map(|s| (s.name.as_str(), s.state, s.quantity, s.usd_value))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("Cosmoshub Native Token", AssetState::Liquid, dec!(2.5), dec!(20)),
                ("Staked Cosmoshub Native Token", AssetState::Locked, dec!(10), dec!(80)),
                ("Cosmoshub Staking Reward", AssetState::Claimable, dec!(0.123456789), dec!(0.987654312)),
            ]
        );
        assert!(snapshots.iter().all(|s| s.captured_at == block_time()));
    }

    #[tokio::test]
    async fn finds_denom_through_coingecko_id() {
        let gecko = Arc::new(FakeSource::new(PriceSourceKind::CoinGecko, &[("ATOM", Some(dec!(8)))]));
        let mut scanner = scanner(
            node(),
            FakeRegistry { fee_denom: None },
            Arc::new(resolver(vec![shared(&gecko)])),
        );

        scanner.initialize().await.unwrap();
        let native = scanner.native.as_ref().unwrap();
        assert_eq!(native.denom, "uatom");
        assert_eq!(native.decimals, 6);
    }

    #[tokio::test]
    async fn chain_id_mismatch_fails_initialization() {
        let node = FakeNode {
            chain_id: "theta-testnet-001",
            ..node()
        };
        let mut scanner = scanner(
            node,
            FakeRegistry { fee_denom: Some("uatom") },
            prices(&[("ATOM", dec!(8))]),
        );

        let err = scanner.initialize().await.unwrap_err();
        assert!(matches!(err.cause, InitFailure::MissingReference(_)));
    }

    #[tokio::test]
    async fn empty_account_needs_no_price() {
        let node = FakeNode {
            balance: "0",
            staked: None,
            rewards: Vec::new(),
            ..node()
        };
        let mut scanner = scanner(node, FakeRegistry { fee_denom: Some("uatom") }, prices(&[]));
        scanner.initialize().await.unwrap();

        assert!(scanner.query(&target("cosmoshub", "cosmos1empty")).await.unwrap().snapshots.is_empty());
    }
}
