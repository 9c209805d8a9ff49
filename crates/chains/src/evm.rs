use alloy::{
    consensus::BlockHeader,
    eips::BlockNumberOrTag,
    primitives::Address,
    providers::{DynProvider, Provider, ProviderBuilder},
    sol,
    transports::http::reqwest::Url,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::ChainError;

// ─── ERC-20 Interface ───────────────────────────────────────────────────────
sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address owner) external view returns (uint256);
        function decimals() external view returns (uint8);
    }
}

/// Read access to an EVM JSON-RPC node. Amounts are base-unit integer strings.
#[async_trait]
pub trait EvmApi: Send + Sync {
    async fn native_balance(&self, owner: &str) -> Result<String, ChainError>;

    async fn token_balance(&self, token: &str, owner: &str) -> Result<String, ChainError>;

    async fn token_decimals(&self, token: &str) -> Result<u8, ChainError>;

    async fn latest_block_time(&self) -> Result<DateTime<Utc>, ChainError>;
}

/// HTTP provider wrapper.
pub struct EvmClient {
    provider: DynProvider,
}

impl EvmClient {
    /// Create a client from an RPC URL string.
    pub fn connect(rpc_url: &str) -> Result<Self, ChainError> {
        let url: Url = rpc_url
            .parse()
            .map_err(|e| ChainError::Rpc(format!("invalid RPC URL `{rpc_url}`: {e}")))?;
        let provider = ProviderBuilder::new().connect_http(url).erased();
        Ok(Self { provider })
    }
}

fn address(value: &str) -> Result<Address, ChainError> {
    value
        .parse::<Address>()
        .map_err(|_| ChainError::Address(value.to_string()))
}

fn rpc<E: std::fmt::Display>(e: E) -> ChainError {
    ChainError::Rpc(e.to_string())
}

#[async_trait]
impl EvmApi for EvmClient {
    async fn native_balance(&self, owner: &str) -> Result<String, ChainError> {
        let balance = self.provider.get_balance(address(owner)?).await.map_err(rpc)?;
        Ok(balance.to_string())
    }

    async fn token_balance(&self, token: &str, owner: &str) -> Result<String, ChainError> {
        let contract = IERC20::new(address(token)?, self.provider.clone());
        let balance = contract.balanceOf(address(owner)?).call().await.map_err(rpc)?;
        Ok(balance.to_string())
    }

    async fn token_decimals(&self, token: &str) -> Result<u8, ChainError> {
        let contract = IERC20::new(address(token)?, self.provider.clone());
        contract.decimals().call().await.map_err(rpc)
    }

    async fn latest_block_time(&self) -> Result<DateTime<Utc>, ChainError> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Latest)
            .await
            .map_err(rpc)?
            .ok_or_else(|| ChainError::Rpc("latest block not found".into()))?;
        let timestamp = block.header.timestamp();
        DateTime::from_timestamp(timestamp as i64, 0)
            .ok_or_else(|| ChainError::Decode(format!("block timestamp out of range: {timestamp}")))
    }
}
