use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::postgres::{PgArgumentBuffer, PgTypeInfo, PgValueRef};
use sqlx::{Postgres, encode::IsNull, error::BoxDynError};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("unknown {kind} `{value}`")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

/// Implements string conversion and TEXT column mapping for a unit enum.
macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl sqlx::Type<Postgres> for $name {
            fn type_info() -> PgTypeInfo {
                <str as sqlx::Type<Postgres>>::type_info()
            }

            fn compatible(ty: &PgTypeInfo) -> bool {
                <str as sqlx::Type<Postgres>>::compatible(ty)
            }
        }

        impl<'r> sqlx::Decode<'r, Postgres> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let text = <&str as sqlx::Decode<Postgres>>::decode(value)?;
                Ok(text.parse()?)
            }
        }

        impl<'q> sqlx::Encode<'q, Postgres> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> IsNull {
                <&str as sqlx::Encode<Postgres>>::encode(self.as_str(), buf)
            }
        }
    };
}

/// Category of a tracked asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssetType {
    CexToken,
    NativeToken,
    SecondaryToken,
    Nft,
    Others,
}

text_enum!(AssetType, "asset type", {
    CexToken => "cex-token",
    NativeToken => "native-token",
    SecondaryToken => "secondary-token",
    Nft => "nft",
    Others => "others",
});

/// Liquidity of a captured position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetState {
    Liquid,
    Locked,
    Claimable,
    Unbonding,
}

text_enum!(AssetState, "asset state", {
    Liquid => "LIQUID",
    Locked => "LOCKED",
    Claimable => "CLAIMABLE",
    Unbonding => "UNBONDING",
});

// ─── Reference data ─────────────────────────────────────────────────────────

/// Reference data for an asset, unique per `(chain, code)`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AssetInfo {
    pub id: i32,
    pub chain: String,
    pub code: String,
    pub name: Option<String>,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub asset_type: AssetType,
    /// Contract or mint address for secondary tokens.
    pub address: Option<String>,
    pub decimals: Option<i16>,
}

// ─── Scanner configuration ──────────────────────────────────────────────────

/// Which scanner runs for a chain.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AssetScannerConfig {
    pub id: i32,
    pub chain: String,
    pub scanner_type: String,
    pub is_enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// An external endpoint a scanner talks to.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScannerEndpoint {
    pub id: i32,
    pub config_id: i32,
    pub endpoint: String,
    pub api_key: Option<String>,
    /// Quota bucket shared by every call against this endpoint.
    pub rate_limiter_key: Option<String>,
    pub is_enabled: bool,
}

impl ScannerEndpoint {
    /// The limiter key, falling back to the endpoint URL itself.
    pub fn limiter_key(&self) -> &str {
        self.rate_limiter_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .unwrap_or(&self.endpoint)
    }
}

/// A scan target: one address on one chain owned by a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct AssetQuery {
    pub id: i32,
    pub chain: String,
    pub addr: String,
    pub group_id: Option<i32>,
}

// ─── Batches & snapshots ────────────────────────────────────────────────────

/// One scan cycle.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AssetSnapshotBatch {
    pub id: i32,
    pub scan_started_at: DateTime<Utc>,
    pub scan_finished_at: Option<DateTime<Utc>>,
}

/// A valued position captured during a batch. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AssetSnapshot {
    pub id: i64,
    pub batch_id: i32,
    pub name: String,
    pub code: String,
    pub chain: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub asset_type: AssetType,
    pub state: AssetState,
    pub quantity: Decimal,
    pub usd_value: Decimal,
    pub usd_value_per_quantity: Decimal,
    pub captured_at: DateTime<Utc>,
}

/// Insert-ready snapshot (no `id` or `batch_id`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewAssetSnapshot {
    pub name: String,
    pub code: String,
    pub chain: String,
    pub asset_type: AssetType,
    pub state: AssetState,
    pub quantity: Decimal,
    pub usd_value: Decimal,
    pub usd_value_per_quantity: Decimal,
    pub captured_at: DateTime<Utc>,
}

impl NewAssetSnapshot {
    /// Value `quantity` at `price`; `usd_value` is always derived from the two.
    #[allow(clippy::too_many_arguments)]
    pub fn valued(
        name: impl Into<String>,
        code: impl Into<String>,
        chain: impl Into<String>,
        asset_type: AssetType,
        state: AssetState,
        quantity: Decimal,
        price: Decimal,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
            chain: chain.into(),
            asset_type,
            state,
            quantity,
            usd_value: quantity * price,
            usd_value_per_quantity: price,
            captured_at,
        }
    }
}

/// Batch-level rollup: the sum of every snapshot's value in one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct BatchValue {
    pub batch_id: i32,
    pub scan_started_at: DateTime<Utc>,
    /// Seconds between start and finish, `None` while the batch is open.
    pub time_used_sec: Option<i64>,
    pub usd_value: Decimal,
}

// ─── Groups & flows ─────────────────────────────────────────────────────────

/// A logical owner of addresses whose flows are tracked.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AssetGroup {
    pub id: i32,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// An append-only ledger entry. A null side means outside the tracked universe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct AssetFlow {
    pub id: i64,
    pub from_group_id: Option<i32>,
    pub to_group_id: Option<i32>,
    pub usd_value: Decimal,
    pub occurred_at: DateTime<Utc>,
}

/// Insert-ready flow (no `id`).
#[derive(Debug, Clone)]
pub struct NewAssetFlow {
    pub from_group_id: Option<i32>,
    pub to_group_id: Option<i32>,
    pub usd_value: Decimal,
    pub occurred_at: DateTime<Utc>,
}

/// Cumulative external flows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct FlowTotals {
    pub total_inflow: Decimal,
    pub total_outflow: Decimal,
}

impl FlowTotals {
    pub fn net_inflow(&self) -> Decimal {
        self.total_inflow - self.total_outflow
    }
}
