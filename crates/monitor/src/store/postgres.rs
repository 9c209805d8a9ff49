use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coffer_storage::models::{
    AssetFlow, AssetGroup, AssetInfo, AssetQuery, AssetSnapshot, AssetSnapshotBatch, AssetType,
    BatchValue, FlowTotals, NewAssetFlow, NewAssetSnapshot,
};
use coffer_storage::{PgPool, Postgres, repos};
use sqlx::Transaction;

use super::{AssetStore, FlowEntry, GroupRef, ScannerConfig};
use crate::error::StoreError;

/// `AssetStore` over PostgreSQL.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn resolve_group(
    tx: &mut Transaction<'_, Postgres>,
    group: &GroupRef,
    create: bool,
) -> Result<AssetGroup, StoreError> {
    let found = match group {
        GroupRef::Id(id) => repos::get_group_by_id(&mut **tx, *id).await?,
        GroupRef::Name(name) => match repos::get_group_by_name(&mut **tx, name).await? {
            Some(existing) => Some(existing),
            None if create => {
                let created = repos::insert_group(&mut **tx, name).await?;
                tracing::info!(group_id = created.id, name, "created asset group");
                Some(created)
            }
            None => None,
        },
    };
    found.ok_or_else(|| StoreError::GroupNotFound(group.clone()))
}

#[async_trait]
impl AssetStore for PgStore {
    async fn enabled_scanner_configs(&self) -> Result<Vec<ScannerConfig>, StoreError> {
        let configs = repos::get_enabled_scanner_configs(&self.pool).await?;
        let mut endpoints: HashMap<i32, Vec<_>> = HashMap::new();
        for endpoint in repos::get_enabled_endpoints(&self.pool).await? {
            endpoints.entry(endpoint.config_id).or_default().push(endpoint);
        }
        Ok(configs
            .into_iter()
            .map(|config| ScannerConfig {
                endpoints: endpoints.remove(&config.id).unwrap_or_default(),
                config,
            })
            .collect())
    }

    async fn asset_queries(&self) -> Result<Vec<AssetQuery>, StoreError> {
        Ok(repos::get_enabled_asset_queries(&self.pool).await?)
    }

    async fn native_asset(&self, chain: &str) -> Result<Option<AssetInfo>, StoreError> {
        Ok(repos::get_native_asset(&self.pool, chain).await?)
    }

    async fn assets_of_type(
        &self,
        chain: &str,
        asset_type: AssetType,
    ) -> Result<Vec<AssetInfo>, StoreError> {
        Ok(repos::get_assets_of_type(&self.pool, chain, asset_type).await?)
    }

    async fn open_batch(&self, started_at: DateTime<Utc>) -> Result<AssetSnapshotBatch, StoreError> {
        Ok(repos::insert_batch(&self.pool, started_at).await?)
    }

    async fn insert_snapshots(
        &self,
        batch_id: i32,
        snapshots: &[NewAssetSnapshot],
    ) -> Result<u64, StoreError> {
        Ok(repos::insert_snapshots_batch(&self.pool, batch_id, snapshots).await?)
    }

    async fn close_batch(&self, batch_id: i32, finished_at: DateTime<Utc>) -> Result<(), StoreError> {
        repos::finish_batch(&self.pool, batch_id, finished_at)
            .await
            .map_err(|e| match e {
                sqlx::Error::RowNotFound => StoreError::BatchNotFound(batch_id),
                other => StoreError::Database(other),
            })
    }

    async fn record_flow(&self, entry: FlowEntry) -> Result<AssetFlow, StoreError> {
        let mut tx = self.pool.begin().await?;

        let from = match &entry.from {
            Some(group) => Some(resolve_group(&mut tx, group, entry.create_group).await?.id),
            None => None,
        };
        let to = match &entry.to {
            Some(group) => Some(resolve_group(&mut tx, group, entry.create_group).await?.id),
            None => None,
        };
        if let (Some(from), Some(to)) = (from, to) {
            if from == to {
                return Err(StoreError::SameGroup(from));
            }
        }

        let flow = repos::insert_flow(
            &mut *tx,
            &NewAssetFlow {
                from_group_id: from,
                to_group_id: to,
                usd_value: entry.usd_value,
                occurred_at: entry.occurred_at,
            },
        )
        .await?;

        tx.commit().await?;
        Ok(flow)
    }

    async fn batch_values(&self) -> Result<Vec<BatchValue>, StoreError> {
        Ok(repos::get_batch_values(&self.pool, None, true).await?)
    }

    async fn flow_totals(&self) -> Result<FlowTotals, StoreError> {
        Ok(repos::get_flow_totals(&self.pool).await?)
    }

    async fn recent_batches(&self, limit: i64) -> Result<Vec<BatchValue>, StoreError> {
        Ok(repos::get_batch_values(&self.pool, Some(limit), false).await?)
    }

    async fn batch_snapshots(&self, batch_id: i32) -> Result<Vec<AssetSnapshot>, StoreError> {
        Ok(repos::get_batch_snapshots(&self.pool, batch_id).await?)
    }

    async fn recent_flows(&self, limit: i64) -> Result<Vec<AssetFlow>, StoreError> {
        Ok(repos::get_recent_flows(&self.pool, limit).await?)
    }
}
