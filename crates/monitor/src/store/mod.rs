//! Persistence boundary of the monitor.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coffer_storage::models::{
    AssetFlow, AssetInfo, AssetQuery, AssetScannerConfig, AssetSnapshot, AssetSnapshotBatch,
    AssetType, BatchValue, FlowTotals, NewAssetSnapshot, ScannerEndpoint,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// An asset group referenced by id or by unique name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupRef {
    Id(i32),
    Name(String),
}

impl fmt::Display for GroupRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupRef::Id(id) => write!(f, "#{id}"),
            GroupRef::Name(name) => write!(f, "`{name}`"),
        }
    }
}

impl From<i32> for GroupRef {
    fn from(id: i32) -> Self {
        GroupRef::Id(id)
    }
}

impl From<&str> for GroupRef {
    fn from(name: &str) -> Self {
        GroupRef::Name(name.to_string())
    }
}

/// An enabled scanner configuration with its enabled endpoints.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub config: AssetScannerConfig,
    pub endpoints: Vec<ScannerEndpoint>,
}

/// A validated flow waiting to be written.
#[derive(Debug, Clone)]
pub struct FlowEntry {
    pub from: Option<GroupRef>,
    pub to: Option<GroupRef>,
    pub usd_value: Decimal,
    pub occurred_at: DateTime<Utc>,
    /// Create named groups that do not exist yet instead of failing.
    pub create_group: bool,
}

#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn enabled_scanner_configs(&self) -> Result<Vec<ScannerConfig>, StoreError>;

    async fn asset_queries(&self) -> Result<Vec<AssetQuery>, StoreError>;

    async fn native_asset(&self, chain: &str) -> Result<Option<AssetInfo>, StoreError>;

    async fn assets_of_type(
        &self,
        chain: &str,
        asset_type: AssetType,
    ) -> Result<Vec<AssetInfo>, StoreError>;

    async fn open_batch(&self, started_at: DateTime<Utc>) -> Result<AssetSnapshotBatch, StoreError>;

    /// Write every snapshot of a batch at once. Returns the number written.
    async fn insert_snapshots(
        &self,
        batch_id: i32,
        snapshots: &[NewAssetSnapshot],
    ) -> Result<u64, StoreError>;

    async fn close_batch(&self, batch_id: i32, finished_at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Resolve both groups and append the flow as one atomic step.
    async fn record_flow(&self, entry: FlowEntry) -> Result<AssetFlow, StoreError>;

    /// Value of every finished batch, newest first. A batch still being
    /// scanned has no snapshots yet and is left out.
    async fn batch_values(&self) -> Result<Vec<BatchValue>, StoreError>;

    async fn flow_totals(&self) -> Result<FlowTotals, StoreError>;

    /// Latest batches, newest first, including one still running.
    async fn recent_batches(&self, limit: i64) -> Result<Vec<BatchValue>, StoreError>;

    async fn batch_snapshots(&self, batch_id: i32) -> Result<Vec<AssetSnapshot>, StoreError>;

    async fn recent_flows(&self, limit: i64) -> Result<Vec<AssetFlow>, StoreError>;
}
