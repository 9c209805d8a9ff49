use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coffer_storage::models::{
    AssetFlow, AssetGroup, AssetInfo, AssetQuery, AssetScannerConfig, AssetSnapshot, AssetState,
    AssetSnapshotBatch, AssetType, BatchValue, FlowTotals, NewAssetSnapshot, ScannerEndpoint,
};
use rust_decimal::Decimal;

use super::{AssetStore, FlowEntry, GroupRef, ScannerConfig};
use crate::error::StoreError;

/// In-process `AssetStore` for tests and dry runs. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
    reject_snapshots: AtomicBool,
}

#[derive(Default)]
struct Inner {
    configs: Vec<ScannerConfig>,
    queries: Vec<AssetQuery>,
    assets: Vec<AssetInfo>,
    batches: Vec<AssetSnapshotBatch>,
    snapshots: Vec<AssetSnapshot>,
    groups: Vec<AssetGroup>,
    flows: Vec<AssetFlow>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolClosed));
        }
        Ok(())
    }

    /// Make every call fail as if the database were gone.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make snapshot inserts fail while every other call keeps working.
    pub fn set_reject_snapshots(&self, reject: bool) {
        self.reject_snapshots.store(reject, Ordering::SeqCst);
    }

    /// Register an enabled scanner with the given endpoint URLs.
    pub fn add_scanner(&self, chain: &str, scanner_type: &str, endpoints: &[&str]) -> i32 {
        let mut inner = self.lock();
        let config_id = inner.configs.len() as i32 + 1;
        let endpoint_base = inner.configs.iter().map(|c| c.endpoints.len()).sum::<usize>() as i32;
        let endpoints = endpoints
            .iter()
            .enumerate()
            .map(|(i, url)| ScannerEndpoint {
                id: endpoint_base + i as i32 + 1,
                config_id,
                endpoint: url.to_string(),
                api_key: None,
                rate_limiter_key: None,
                is_enabled: true,
            })
            .collect();
        inner.configs.push(ScannerConfig {
            config: AssetScannerConfig {
                id: config_id,
                chain: chain.to_string(),
                scanner_type: scanner_type.to_string(),
                is_enabled: true,
                created_at: Utc::now(),
            },
            endpoints,
        });
        config_id
    }

    pub fn add_query(&self, chain: &str, addr: &str, group_id: Option<i32>) -> i32 {
        let mut inner = self.lock();
        let id = inner.queries.len() as i32 + 1;
        inner.queries.push(AssetQuery {
            id,
            chain: chain.to_string(),
            addr: addr.to_string(),
            group_id,
        });
        id
    }

    pub fn add_asset(
        &self,
        chain: &str,
        code: &str,
        asset_type: AssetType,
        address: Option<&str>,
        decimals: Option<i16>,
    ) -> i32 {
        let mut inner = self.lock();
        let id = inner.assets.len() as i32 + 1;
        inner.assets.push(AssetInfo {
            id,
            chain: chain.to_string(),
            code: code.to_string(),
            name: None,
            asset_type,
            address: address.map(str::to_string),
            decimals,
        });
        id
    }

    pub fn add_group(&self, name: &str) -> AssetGroup {
        let mut inner = self.lock();
        insert_group(&mut inner, name)
    }

    /// Record a finished batch holding a single snapshot worth `usd_value`.
    pub fn seed_batch(&self, started_at: DateTime<Utc>, usd_value: Decimal) -> i32 {
        let mut inner = self.lock();
        let id = inner.batches.len() as i32 + 1;
        inner.batches.push(AssetSnapshotBatch {
            id,
            scan_started_at: started_at,
            scan_finished_at: Some(started_at),
        });
        let snapshot_id = inner.snapshots.len() as i64 + 1;
        inner.snapshots.push(AssetSnapshot {
            id: snapshot_id,
            batch_id: id,
            name: "Seed".into(),
            code: "USD".into(),
            chain: "seed".into(),
            asset_type: AssetType::Others,
            state: AssetState::Liquid,
            quantity: usd_value,
            usd_value,
            usd_value_per_quantity: Decimal::ONE,
            captured_at: started_at,
        });
        id
    }

    pub fn batches(&self) -> Vec<AssetSnapshotBatch> {
        self.lock().batches.clone()
    }

    pub fn snapshots(&self) -> Vec<AssetSnapshot> {
        self.lock().snapshots.clone()
    }

    pub fn flows(&self) -> Vec<AssetFlow> {
        self.lock().flows.clone()
    }

    pub fn groups(&self) -> Vec<AssetGroup> {
        self.lock().groups.clone()
    }
}

fn insert_group(inner: &mut Inner, name: &str) -> AssetGroup {
    if let Some(existing) = inner.groups.iter().find(|g| g.name == name) {
        return existing.clone();
    }
    let group = AssetGroup {
        id: inner.groups.len() as i32 + 1,
        name: name.to_string(),
        created_at: Utc::now(),
    };
    inner.groups.push(group.clone());
    group
}

fn find_group(inner: &Inner, group: &GroupRef) -> Option<i32> {
    inner
        .groups
        .iter()
        .find(|g| match group {
            GroupRef::Id(id) => g.id == *id,
            GroupRef::Name(name) => &g.name == name,
        })
        .map(|g| g.id)
}

fn batch_values(inner: &Inner, finished_only: bool) -> Vec<BatchValue> {
    let mut values: Vec<BatchValue> = inner
        .batches
        .iter()
        .filter(|batch| !finished_only || batch.scan_finished_at.is_some())
        .map(|batch| BatchValue {
            batch_id: batch.id,
            scan_started_at: batch.scan_started_at,
            time_used_sec: batch.scan_finished_at.map(|finished| {
                ((finished - batch.scan_started_at).num_milliseconds() + 500).div_euclid(1000)
            }),
            usd_value: inner
                .snapshots
                .iter()
                .filter(|s| s.batch_id == batch.id)
                .map(|s| s.usd_value)
                .sum(),
        })
        .collect();
    values.sort_by(|a, b| b.scan_started_at.cmp(&a.scan_started_at));
    values
}

#[async_trait]
impl AssetStore for MemoryStore {
    async fn enabled_scanner_configs(&self) -> Result<Vec<ScannerConfig>, StoreError> {
        self.check()?;
        Ok(self.lock().configs.clone())
    }

    async fn asset_queries(&self) -> Result<Vec<AssetQuery>, StoreError> {
        self.check()?;
        Ok(self.lock().queries.clone())
    }

    async fn native_asset(&self, chain: &str) -> Result<Option<AssetInfo>, StoreError> {
        self.check()?;
        Ok(self
            .lock()
            .assets
            .iter()
            .find(|a| a.chain == chain && a.asset_type == AssetType::NativeToken)
            .cloned())
    }

    async fn assets_of_type(
        &self,
        chain: &str,
        asset_type: AssetType,
    ) -> Result<Vec<AssetInfo>, StoreError> {
        self.check()?;
        let mut assets: Vec<AssetInfo> = self
            .lock()
            .assets
            .iter()
            .filter(|a| a.chain == chain && a.asset_type == asset_type)
            .cloned()
            .collect();
        assets.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(assets)
    }

    async fn open_batch(&self, started_at: DateTime<Utc>) -> Result<AssetSnapshotBatch, StoreError> {
        self.check()?;
        let mut inner = self.lock();
        let batch = AssetSnapshotBatch {
            id: inner.batches.len() as i32 + 1,
            scan_started_at: started_at,
            scan_finished_at: None,
        };
        inner.batches.push(batch.clone());
        Ok(batch)
    }

    async fn insert_snapshots(
        &self,
        batch_id: i32,
        snapshots: &[NewAssetSnapshot],
    ) -> Result<u64, StoreError> {
        self.check()?;
        if self.reject_snapshots.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::WorkerCrashed));
        }
        let mut inner = self.lock();
        if !inner.batches.iter().any(|b| b.id == batch_id) {
            return Err(StoreError::BatchNotFound(batch_id));
        }
        for s in snapshots {
            let id = inner.snapshots.len() as i64 + 1;
            inner.snapshots.push(AssetSnapshot {
                id,
                batch_id,
                name: s.name.clone(),
                code: s.code.clone(),
                chain: s.chain.clone(),
                asset_type: s.asset_type,
                state: s.state,
                quantity: s.quantity,
                usd_value: s.usd_value,
                usd_value_per_quantity: s.usd_value_per_quantity,
                captured_at: s.captured_at,
            });
        }
        Ok(snapshots.len() as u64)
    }

    async fn close_batch(&self, batch_id: i32, finished_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.lock();
        let batch = inner
            .batches
            .iter_mut()
            .find(|b| b.id == batch_id)
            .ok_or(StoreError::BatchNotFound(batch_id))?;
        batch.scan_finished_at = Some(finished_at);
        Ok(())
    }

    async fn record_flow(&self, entry: FlowEntry) -> Result<AssetFlow, StoreError> {
        self.check()?;
        let mut inner = self.lock();

        // Resolve both sides before touching anything so a miss leaves no trace.
        let mut to_create = Vec::new();
        let mut resolve = |group: &Option<GroupRef>| -> Result<(), StoreError> {
            match group {
                Some(g) if find_group(&inner, g).is_none() => match g {
                    GroupRef::Name(name) if entry.create_group => {
                        to_create.push(name.clone());
                        Ok(())
                    }
                    _ => Err(StoreError::GroupNotFound(g.clone())),
                },
                _ => Ok(()),
            }
        };
        resolve(&entry.from)?;
        resolve(&entry.to)?;

        let existing = |group: &Option<GroupRef>| group.as_ref().and_then(|g| find_group(&inner, g));
        if let (Some(from), Some(to)) = (existing(&entry.from), existing(&entry.to)) {
            if from == to {
                return Err(StoreError::SameGroup(from));
            }
        }

        for name in &to_create {
            insert_group(&mut inner, name);
        }
        let side = |group: &Option<GroupRef>| group.as_ref().and_then(|g| find_group(&inner, g));
        let flow = AssetFlow {
            id: inner.flows.len() as i64 + 1,
            from_group_id: side(&entry.from),
            to_group_id: side(&entry.to),
            usd_value: entry.usd_value,
            occurred_at: entry.occurred_at,
        };
        inner.flows.push(flow.clone());
        Ok(flow)
    }

    async fn batch_values(&self) -> Result<Vec<BatchValue>, StoreError> {
        self.check()?;
        Ok(batch_values(&self.lock(), true))
    }

    async fn flow_totals(&self) -> Result<FlowTotals, StoreError> {
        self.check()?;
        let inner = self.lock();
        let sum_where = |pick: fn(&AssetFlow) -> bool| -> Decimal {
            inner.flows.iter().filter(|f| pick(f)).map(|f| f.usd_value).sum()
        };
        Ok(FlowTotals {
            total_inflow: sum_where(|f| f.from_group_id.is_none()),
            total_outflow: sum_where(|f| f.to_group_id.is_none()),
        })
    }

    async fn recent_batches(&self, limit: i64) -> Result<Vec<BatchValue>, StoreError> {
        self.check()?;
        let mut values = batch_values(&self.lock(), false);
        values.truncate(limit.max(0) as usize);
        Ok(values)
    }

    async fn batch_snapshots(&self, batch_id: i32) -> Result<Vec<AssetSnapshot>, StoreError> {
        self.check()?;
        let mut snapshots: Vec<AssetSnapshot> = self
            .lock()
            .snapshots
            .iter()
            .filter(|s| s.batch_id == batch_id)
            .cloned()
            .collect();
        snapshots.sort_by(|a, b| b.usd_value.cmp(&a.usd_value).then(a.id.cmp(&b.id)));
        Ok(snapshots)
    }

    async fn recent_flows(&self, limit: i64) -> Result<Vec<AssetFlow>, StoreError> {
        self.check()?;
        let mut flows = self.lock().flows.clone();
        flows.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at).then(b.id.cmp(&a.id)));
        flows.truncate(limit.max(0) as usize);
        Ok(flows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn entry(from: Option<GroupRef>, to: Option<GroupRef>, value: Decimal, create: bool) -> FlowEntry {
        FlowEntry {
            from,
            to,
            usd_value: value,
            occurred_at: Utc::now(),
            create_group: create,
        }
    }

    #[tokio::test]
    async fn missing_group_writes_nothing() {
        let store = MemoryStore::new();
        store.add_group("treasury");

        let err = store
            .record_flow(entry(Some("treasury".into()), Some("ghost".into()), dec!(5), false))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::GroupNotFound(GroupRef::Name(n)) if n == "ghost"));
        assert!(store.flows().is_empty());
        assert_eq!(store.groups().len(), 1);
    }

    #[tokio::test]
    async fn creates_named_groups_on_request() {
        let store = MemoryStore::new();

        let flow = store
            .record_flow(entry(None, Some("fund".into()), dec!(10), true))
            .await
            .unwrap();
        let again = store
            .record_flow(entry(Some("fund".into()), None, dec!(4), true))
            .await
            .unwrap();

        assert_eq!(store.groups().len(), 1);
        assert_eq!(flow.to_group_id, Some(1));
        assert_eq!(again.from_group_id, Some(1));
        assert_eq!(
            store.flow_totals().await.unwrap(),
            FlowTotals {
                total_inflow: dec!(10),
                total_outflow: dec!(4),
            }
        );
    }

    #[tokio::test]
    async fn unknown_ids_are_never_created() {
        let store = MemoryStore::new();
        let err = store
            .record_flow(entry(Some(GroupRef::Id(9)), None, dec!(1), true))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::GroupNotFound(GroupRef::Id(9))));
    }

    #[tokio::test]
    async fn batch_values_skip_batches_still_being_scanned() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.seed_batch(now - Duration::days(2), dec!(100));
        let open = store.open_batch(now).await.unwrap();

        let values = store.batch_values().await.unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].usd_value, dec!(100));
        assert_eq!(values[0].time_used_sec, Some(0));

        let recent = store.recent_batches(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].batch_id, open.id);
        assert_eq!(recent[0].usd_value, Decimal::ZERO);
        assert_eq!(recent[0].time_used_sec, None);

        store.close_batch(open.id, now).await.unwrap();
        let values = store.batch_values().await.unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].batch_id, open.id);
    }

    #[tokio::test]
    async fn same_group_by_id_and_name_is_rejected() {
        let store = MemoryStore::new();
        let group = store.add_group("treasury");

        let err = store
            .record_flow(entry(
                Some(GroupRef::Id(group.id)),
                Some(GroupRef::from("treasury")),
                dec!(1),
                false,
            ))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::SameGroup(id) if id == group.id));
        assert!(store.flows().is_empty());
    }
}
