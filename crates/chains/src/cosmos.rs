use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

use crate::{ChainError, http};

/// An amount of one denom, as returned by the bank and distribution modules.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Coin {
    pub denom: String,
    /// Integer string for bank coins, decimal string for reward `DecCoin`s.
    pub amount: String,
}

/// Read access to a cosmos-sdk node.
#[async_trait]
pub trait CosmosApi: Send + Sync {
    async fn chain_id(&self) -> Result<String, ChainError>;

    async fn latest_block_time(&self) -> Result<DateTime<Utc>, ChainError>;

    /// Liquid balance of `denom` held by `address`, in base units.
    async fn balance(&self, address: &str, denom: &str) -> Result<Coin, ChainError>;

    /// Sum of every delegation of `address`, `None` if it has none.
    async fn staked_balance(&self, address: &str) -> Result<Option<Coin>, ChainError>;

    /// Pending staking rewards across all validators.
    async fn delegation_total_rewards(&self, address: &str) -> Result<Vec<Coin>, ChainError>;
}

/// LCD (REST gateway) client.
pub struct CosmosClient {
    http: Client,
    base_url: String,
}

impl CosmosClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: http::client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ChainError> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!(url = %url, "LCD request");
        http::get_required(&self.http, &url, &[]).await
    }
}

#[derive(Deserialize)]
struct NodeInfoResponse {
    default_node_info: NodeInfo,
}

#[derive(Deserialize)]
struct NodeInfo {
    network: String,
}

#[derive(Deserialize)]
struct LatestBlockResponse {
    block: Block,
}

#[derive(Deserialize)]
struct Block {
    header: BlockHeader,
}

#[derive(Deserialize)]
struct BlockHeader {
    time: DateTime<Utc>,
}

#[derive(Deserialize)]
struct BalanceResponse {
    balance: Coin,
}

#[derive(Deserialize)]
struct DelegationsResponse {
    #[serde(default)]
    delegation_responses: Vec<DelegationResponse>,
}

#[derive(Deserialize)]
struct DelegationResponse {
    balance: Coin,
}

#[derive(Deserialize)]
struct RewardsResponse {
    #[serde(default)]
    total: Vec<Coin>,
}

#[async_trait]
impl CosmosApi for CosmosClient {
    async fn chain_id(&self) -> Result<String, ChainError> {
        let info: NodeInfoResponse = self.get("/cosmos/base/tendermint/v1beta1/node_info").await?;
        Ok(info.default_node_info.network)
    }

    async fn latest_block_time(&self) -> Result<DateTime<Utc>, ChainError> {
        let latest: LatestBlockResponse = self.get("/cosmos/base/tendermint/v1beta1/blocks/latest").await?;
        Ok(latest.block.header.time)
    }

    async fn balance(&self, address: &str, denom: &str) -> Result<Coin, ChainError> {
        let path = format!("/cosmos/bank/v1beta1/balances/{address}/by_denom?denom={denom}");
        let response: BalanceResponse = self.get(&path).await?;
        Ok(response.balance)
    }

    async fn staked_balance(&self, address: &str) -> Result<Option<Coin>, ChainError> {
        let path = format!("/cosmos/staking/v1beta1/delegations/{address}");
        let response: DelegationsResponse = self.get(&path).await?;
        sum_coins(response.delegation_responses.into_iter().map(|d| d.balance))
    }

    async fn delegation_total_rewards(&self, address: &str) -> Result<Vec<Coin>, ChainError> {
        let path = format!("/cosmos/distribution/v1beta1/delegators/{address}/rewards");
        let response: RewardsResponse = self.get(&path).await?;
        Ok(response.total)
    }
}

/// Adds integer coin amounts of a single denom.
fn sum_coins(coins: impl IntoIterator<Item = Coin>) -> Result<Option<Coin>, ChainError> {
    let mut total: Option<(String, u128)> = None;
    for coin in coins {
        let amount: u128 = coin
            .amount
            .parse()
            .map_err(|_| ChainError::Decode(format!("invalid coin amount `{}`", coin.amount)))?;
        total = match total {
            None => Some((coin.denom, amount)),
            Some((denom, sum)) if denom == coin.denom => Some((
                denom,
                sum.checked_add(amount)
                    .ok_or_else(|| ChainError::Decode("delegation sum overflow".into()))?,
            )),
            Some((denom, _)) => {
                return Err(ChainError::Decode(format!(
                    "delegations in mixed denoms `{denom}` and `{}`",
                    coin.denom
                )));
            }
        };
    }
    Ok(total.map(|(denom, sum)| Coin {
        denom,
        amount: sum.to_string(),
    }))
}

// ─── Chain Registry ─────────────────────────────────────────────────────────

/// `chain.json` from the cosmos chain registry (only the fields we read).
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryChain {
    pub chain_name: String,
    pub chain_id: String,
    #[serde(default)]
    pub fees: Option<Fees>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Fees {
    #[serde(default)]
    pub fee_tokens: Vec<FeeToken>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeeToken {
    pub denom: String,
}

impl RegistryChain {
    pub fn fee_denoms(&self) -> Vec<&str> {
        self.fees
            .as_ref()
            .map(|f| f.fee_tokens.iter().map(|t| t.denom.as_str()).collect())
            .unwrap_or_default()
    }
}

/// `assetlist.json` from the cosmos chain registry.
#[derive(Debug, Clone, Deserialize)]
pub struct AssetList {
    pub chain_name: String,
    pub assets: Vec<RegistryAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryAsset {
    pub base: String,
    pub display: String,
    pub denom_units: Vec<DenomUnit>,
    #[serde(default)]
    pub coingecko_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DenomUnit {
    pub denom: String,
    pub exponent: u32,
}

impl AssetList {
    /// Exponent of the display unit of the asset whose base is `denom`.
    pub fn decimals_of(&self, denom: &str) -> Option<u32> {
        let asset = self.assets.iter().find(|a| a.base == denom)?;
        asset
            .denom_units
            .iter()
            .find(|u| u.denom == asset.display)
            .map(|u| u.exponent)
    }

    /// Base denom of the asset listed under a CoinGecko id.
    pub fn denom_by_coingecko_id(&self, coingecko_id: &str) -> Option<&str> {
        self.assets
            .iter()
            .find(|a| a.coingecko_id.as_deref() == Some(coingecko_id))
            .map(|a| a.base.as_str())
    }
}

/// Lookup of static chain metadata.
#[async_trait]
pub trait ChainRegistry: Send + Sync {
    async fn chain(&self, chain_name: &str) -> Result<RegistryChain, ChainError>;
    async fn asset_list(&self, chain_name: &str) -> Result<AssetList, ChainError>;
}

/// Fetches registry files over HTTP, e.g. from the GitHub raw mirror.
pub struct ChainRegistryClient {
    http: Client,
    base_url: String,
}

impl ChainRegistryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: http::client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn file<T: serde::de::DeserializeOwned>(
        &self,
        chain_name: &str,
        file: &str,
    ) -> Result<T, ChainError> {
        let url = format!("{}/{}/{}", self.base_url, chain_name, file);
        http::get_json(&self.http, &url, &[])
            .await?
            .ok_or_else(|| ChainError::Registry(format!("`{chain_name}` has no {file} in the registry")))
    }
}

#[async_trait]
impl ChainRegistry for ChainRegistryClient {
    async fn chain(&self, chain_name: &str) -> Result<RegistryChain, ChainError> {
        self.file(chain_name, "chain.json").await
    }

    async fn asset_list(&self, chain_name: &str) -> Result<AssetList, ChainError> {
        self.file(chain_name, "assetlist.json").await
    }
}
