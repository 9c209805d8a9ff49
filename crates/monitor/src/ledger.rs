//! Append-only record of value moving between asset groups.
//!
//! A flow with no `from` group is an inflow (value entering the tracked
//! boundary), one with no `to` group is an outflow. Flows between two groups
//! are internal and cancel out in the totals.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use coffer_storage::models::AssetFlow;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::info;

use crate::error::LedgerError;
use crate::store::{AssetStore, FlowEntry, GroupRef};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlowOptions {
    /// When the value moved. Defaults to now.
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    /// Create missing groups referenced by name.
    #[serde(default)]
    pub create_group: bool,
}

#[derive(Clone)]
pub struct FlowLedger {
    store: Arc<dyn AssetStore>,
}

impl FlowLedger {
    pub fn new(store: Arc<dyn AssetStore>) -> Self {
        Self { store }
    }

    /// Write one flow. Either the flow and any group it creates are stored,
    /// or nothing is.
    pub async fn record_flow(
        &self,
        from: Option<GroupRef>,
        to: Option<GroupRef>,
        value: Decimal,
        options: FlowOptions,
    ) -> Result<AssetFlow, LedgerError> {
        validate(from.as_ref(), to.as_ref(), value)?;

        let entry = FlowEntry {
            from,
            to,
            usd_value: value,
            occurred_at: options.time.unwrap_or_else(Utc::now),
            create_group: options.create_group,
        };
        let flow = self.store.record_flow(entry).await?;

        info!(
            flow_id = flow.id,
            from = ?flow.from_group_id,
            to = ?flow.to_group_id,
            usd_value = %flow.usd_value,
            "flow recorded"
        );
        Ok(flow)
    }
}

fn validate(from: Option<&GroupRef>, to: Option<&GroupRef>, value: Decimal) -> Result<(), LedgerError> {
    if value <= Decimal::ZERO {
        return Err(LedgerError::InvalidFlow(format!(
            "value must be a positive magnitude, got {value}"
        )));
    }
    match (from, to) {
        (None, None) => Err(LedgerError::InvalidFlow(
            "at least one side of a flow must name a group".into(),
        )),
        // An id and a name for the same group are caught by the store.
        (Some(a), Some(b)) if a == b => Err(LedgerError::InvalidFlow(format!(
            "flow from {a} to itself"
        ))),
        _ => Ok(()),
    }
}
