use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, QueryBuilder};

use crate::models::*;

/// Rows per multi-value INSERT; keeps bind parameters under the PostgreSQL limit.
const SNAPSHOT_CHUNK: usize = 1000;

// ─── Scanner Configuration ──────────────────────────────────────────────────

/// Get every enabled scanner configuration.
pub async fn get_enabled_scanner_configs(
    pool: &PgPool,
) -> Result<Vec<AssetScannerConfig>, sqlx::Error> {
    sqlx::query_as::<_, AssetScannerConfig>(
        "SELECT * FROM asset_scanner_configs WHERE is_enabled ORDER BY chain, scanner_type, id",
    )
    .fetch_all(pool)
    .await
}

/// Get enabled endpoints belonging to enabled configurations.
pub async fn get_enabled_endpoints(pool: &PgPool) -> Result<Vec<ScannerEndpoint>, sqlx::Error> {
    sqlx::query_as::<_, ScannerEndpoint>(
        r#"
        SELECT e.id, e.config_id, e.endpoint, e.api_key, e.rate_limiter_key, e.is_enabled
        FROM asset_scanner_config_endpoints e
        JOIN asset_scanner_configs c ON c.id = e.config_id
        WHERE e.is_enabled AND c.is_enabled
        ORDER BY e.config_id, e.id
        "#,
    )
    .fetch_all(pool)
    .await
}

/// Get every enabled scan target.
pub async fn get_enabled_asset_queries(pool: &PgPool) -> Result<Vec<AssetQuery>, sqlx::Error> {
    sqlx::query_as::<_, AssetQuery>(
        "SELECT id, chain, addr, group_id FROM asset_queries WHERE is_enabled ORDER BY chain, id",
    )
    .fetch_all(pool)
    .await
}

// ─── Asset Info ─────────────────────────────────────────────────────────────

/// Get the native token of a chain.
pub async fn get_native_asset(pool: &PgPool, chain: &str) -> Result<Option<AssetInfo>, sqlx::Error> {
    sqlx::query_as::<_, AssetInfo>(
        "SELECT * FROM asset_infos WHERE chain = $1 AND type = $2 ORDER BY id LIMIT 1",
    )
    .bind(chain)
    .bind(AssetType::NativeToken)
    .fetch_optional(pool)
    .await
}

/// Get all assets of one type on a chain.
pub async fn get_assets_of_type(
    pool: &PgPool,
    chain: &str,
    asset_type: AssetType,
) -> Result<Vec<AssetInfo>, sqlx::Error> {
    sqlx::query_as::<_, AssetInfo>("SELECT * FROM asset_infos WHERE chain = $1 AND type = $2 ORDER BY code")
        .bind(chain)
        .bind(asset_type)
        .fetch_all(pool)
        .await
}

// ─── Batch Queries ──────────────────────────────────────────────────────────

/// Open a new batch.
pub async fn insert_batch<'e, E>(
    executor: E,
    scan_started_at: DateTime<Utc>,
) -> Result<AssetSnapshotBatch, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, AssetSnapshotBatch>(
        "INSERT INTO asset_snapshot_batches (scan_started_at) VALUES ($1) RETURNING *",
    )
    .bind(scan_started_at)
    .fetch_one(executor)
    .await
}

/// Close a batch by stamping its finish time.
pub async fn finish_batch<'e, E>(
    executor: E,
    batch_id: i32,
    scan_finished_at: DateTime<Utc>,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query("UPDATE asset_snapshot_batches SET scan_finished_at = $1 WHERE id = $2")
        .bind(scan_finished_at)
        .bind(batch_id)
        .execute(executor)
        .await?;
    if result.rows_affected() == 0 {
        return Err(sqlx::Error::RowNotFound);
    }
    Ok(())
}

/// Insert a slice of snapshots with one multi-value INSERT per chunk.
pub async fn insert_snapshots_batch(
    pool: &PgPool,
    batch_id: i32,
    snapshots: &[NewAssetSnapshot],
) -> Result<u64, sqlx::Error> {
    if snapshots.is_empty() {
        return Ok(0);
    }

    let mut tx = pool.begin().await?;
    let mut inserted = 0;

    for chunk in snapshots.chunks(SNAPSHOT_CHUNK) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO asset_snapshots (batch_id, name, code, chain, type, state, quantity, usd_value, usd_value_per_quantity, captured_at) ",
        );

        qb.push_values(chunk, |mut b, s| {
            b.push_bind(batch_id)
                .push_bind(&s.name)
                .push_bind(&s.code)
                .push_bind(&s.chain)
                .push_bind(s.asset_type)
                .push_bind(s.state)
                .push_bind(s.quantity)
                .push_bind(s.usd_value)
                .push_bind(s.usd_value_per_quantity)
                .push_bind(s.captured_at);
        });

        inserted += qb.build().execute(&mut *tx).await?.rows_affected();
    }

    tx.commit().await?;
    Ok(inserted)
}

/// Per-batch aggregate values, newest first. `None` returns the full history.
/// With `finished_only`, batches whose scan is still running are left out.
pub async fn get_batch_values(
    pool: &PgPool,
    limit: Option<i64>,
    finished_only: bool,
) -> Result<Vec<BatchValue>, sqlx::Error> {
    sqlx::query_as::<_, BatchValue>(
        r#"
        SELECT
            b.id AS batch_id,
            b.scan_started_at,
            ROUND(EXTRACT(EPOCH FROM b.scan_finished_at) - EXTRACT(EPOCH FROM b.scan_started_at))::BIGINT AS time_used_sec,
            COALESCE(SUM(s.usd_value), 0::NUMERIC) AS usd_value
        FROM asset_snapshot_batches b
        LEFT JOIN asset_snapshots s ON s.batch_id = b.id
        WHERE NOT $2 OR b.scan_finished_at IS NOT NULL
        GROUP BY b.id
        ORDER BY b.scan_started_at DESC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .bind(finished_only)
    .fetch_all(pool)
    .await
}

/// All snapshots written under one batch.
pub async fn get_batch_snapshots(
    pool: &PgPool,
    batch_id: i32,
) -> Result<Vec<AssetSnapshot>, sqlx::Error> {
    sqlx::query_as::<_, AssetSnapshot>(
        "SELECT * FROM asset_snapshots WHERE batch_id = $1 ORDER BY usd_value DESC, id",
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await
}

// ─── Groups ─────────────────────────────────────────────────────────────────

pub async fn get_group_by_id<'e, E>(executor: E, id: i32) -> Result<Option<AssetGroup>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, AssetGroup>("SELECT * FROM asset_groups WHERE id = $1")
        .bind(id)
        .fetch_optional(executor)
        .await
}

pub async fn get_group_by_name<'e, E>(
    executor: E,
    name: &str,
) -> Result<Option<AssetGroup>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, AssetGroup>("SELECT * FROM asset_groups WHERE name = $1")
        .bind(name)
        .fetch_optional(executor)
        .await
}

/// Insert a group; a concurrent insert of the same name returns the existing row.
pub async fn insert_group<'e, E>(executor: E, name: &str) -> Result<AssetGroup, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, AssetGroup>(
        r#"
        INSERT INTO asset_groups (name) VALUES ($1)
        ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
        RETURNING *
        "#,
    )
    .bind(name)
    .fetch_one(executor)
    .await
}

// ─── Flow Ledger ────────────────────────────────────────────────────────────

/// Append one flow row.
pub async fn insert_flow<'e, E>(executor: E, flow: &NewAssetFlow) -> Result<AssetFlow, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, AssetFlow>(
        r#"
        INSERT INTO asset_flows (from_group_id, to_group_id, usd_value, occurred_at)
        VALUES ($1, $2, $3, $4)
        RETURNING *
        "#,
    )
    .bind(flow.from_group_id)
    .bind(flow.to_group_id)
    .bind(flow.usd_value)
    .bind(flow.occurred_at)
    .fetch_one(executor)
    .await
}

/// Cumulative inflow (no source group) and outflow (no destination group).
pub async fn get_flow_totals(pool: &PgPool) -> Result<FlowTotals, sqlx::Error> {
    sqlx::query_as::<_, FlowTotals>(
        r#"
        SELECT
            COALESCE(SUM(usd_value) FILTER (WHERE from_group_id IS NULL), 0::NUMERIC) AS total_inflow,
            COALESCE(SUM(usd_value) FILTER (WHERE to_group_id IS NULL), 0::NUMERIC) AS total_outflow
        FROM asset_flows
        "#,
    )
    .fetch_one(pool)
    .await
}

/// Most recent flows, newest first.
pub async fn get_recent_flows(pool: &PgPool, limit: i64) -> Result<Vec<AssetFlow>, sqlx::Error> {
    sqlx::query_as::<_, AssetFlow>(
        "SELECT * FROM asset_flows ORDER BY occurred_at DESC, id DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}
