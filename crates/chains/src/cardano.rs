use async_trait::async_trait;
use bech32::{Bech32, Hrp};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

use crate::{ChainError, http};

/// Length of a payment or stake credential hash.
const CREDENTIAL_LEN: usize = 28;

/// Account state of a stake address on Blockfrost.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockfrostAccount {
    pub stake_address: String,
    pub active: bool,
    /// Lovelace controlled by the stake key, including rewards.
    pub controlled_amount: String,
    #[serde(default)]
    pub withdrawable_amount: Option<String>,
}

/// Read access to the Blockfrost Cardano API.
#[async_trait]
pub trait BlockfrostApi: Send + Sync {
    /// `None` when the stake address has never been seen on chain.
    async fn account(&self, stake_address: &str) -> Result<Option<BlockfrostAccount>, ChainError>;

    async fn latest_block_time(&self) -> Result<DateTime<Utc>, ChainError>;
}

pub struct BlockfrostClient {
    http: Client,
    base_url: String,
    project_id: String,
}

#[derive(Deserialize)]
struct LatestBlock {
    time: i64,
}

impl BlockfrostClient {
    pub fn new(base_url: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            http: http::client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            project_id: project_id.into(),
        }
    }
}

#[async_trait]
impl BlockfrostApi for BlockfrostClient {
    async fn account(&self, stake_address: &str) -> Result<Option<BlockfrostAccount>, ChainError> {
        let url = format!("{}/accounts/{}", self.base_url, stake_address);
        http::get_json(&self.http, &url, &[("project_id", self.project_id.as_str())]).await
    }

    async fn latest_block_time(&self) -> Result<DateTime<Utc>, ChainError> {
        let url = format!("{}/blocks/latest", self.base_url);
        let block: LatestBlock =
            http::get_required(&self.http, &url, &[("project_id", self.project_id.as_str())]).await?;
        DateTime::from_timestamp(block.time, 0)
            .ok_or_else(|| ChainError::Decode(format!("block time out of range: {}", block.time)))
    }
}

/// Derive the reward (stake) address from a Shelley base address.
///
/// Stake addresses are returned unchanged. Enterprise and pointer
/// addresses carry no stake credential and are rejected.
pub fn stake_address_from_base(address: &str) -> Result<String, ChainError> {
    let invalid = || ChainError::Address(address.to_string());
    let (hrp, data) = bech32::decode(address).map_err(|_| invalid())?;

    if hrp.as_str().starts_with("stake") {
        return Ok(address.to_string());
    }

    let header = *data.first().ok_or_else(invalid)?;
    let address_type = header >> 4;
    let network = header & 0x0f;

    // Types 0..=3 are base addresses: payment credential then stake credential.
    if address_type > 3 || data.len() != 1 + 2 * CREDENTIAL_LEN {
        return Err(invalid());
    }
    let stake_is_script = address_type & 0b10 != 0;
    let stake_header = (if stake_is_script { 0xf0 } else { 0xe0 }) | network;

    let mut payload = Vec::with_capacity(1 + CREDENTIAL_LEN);
    payload.push(stake_header);
    payload.extend_from_slice(&data[1 + CREDENTIAL_LEN..]);

    let stake_hrp = if network == 1 { "stake" } else { "stake_test" };
    let stake_hrp = Hrp::parse(stake_hrp).map_err(|e| ChainError::Decode(e.to_string()))?;
    bech32::encode::<Bech32>(stake_hrp, &payload).map_err(|e| ChainError::Decode(e.to_string()))
}
