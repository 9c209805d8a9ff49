//! Read-only clients for the chains Coffer scans.
//!
//! Each client sits behind an async capability trait so scanners can be
//! exercised against fakes.

pub mod cardano;
pub mod cosmos;
pub mod error;
pub mod evm;
pub mod ripple;

mod http;

pub use cardano::{BlockfrostAccount, BlockfrostApi, BlockfrostClient, stake_address_from_base};
pub use cosmos::{AssetList, ChainRegistry, ChainRegistryClient, Coin, CosmosApi, CosmosClient, RegistryChain};
pub use error::ChainError;
pub use evm::{EvmApi, EvmClient};
pub use ripple::{RippleApi, RippleClient};
