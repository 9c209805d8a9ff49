//! Portfolio summary over the full batch and flow history.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use coffer_storage::models::{BatchValue, FlowTotals};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::error::StoreError;
use crate::store::AssetStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub total_inflow: Decimal,
    pub total_outflow: Decimal,
    pub net_inflow: Decimal,
    pub last_scanned_at: Option<DateTime<Utc>>,
    pub current_usd_value: Option<Decimal>,
    pub one_day_ago_usd_value: Option<Decimal>,
    pub seven_day_ago_usd_value: Option<Decimal>,
    pub thirty_day_ago_usd_value: Option<Decimal>,
    pub thirty_day_high: Option<Decimal>,
    pub thirty_day_low: Option<Decimal>,
    /// Gain relative to net contributed capital, in percent. `None` while
    /// nothing has been contributed on net.
    pub pnl_percent: Option<Decimal>,
}

impl Summary {
    /// `"low - high"` over the last 30 days.
    pub fn thirty_day_range(&self) -> Option<String> {
        match (self.thirty_day_low, self.thirty_day_high) {
            (Some(low), Some(high)) => Some(format!("{low} - {high}")),
            _ => None,
        }
    }
}

/// Compute the summary at `now` from batch rollups (any order) and flow totals.
pub fn compute(now: DateTime<Utc>, batches: &[BatchValue], flows: FlowTotals) -> Summary {
    let mut batches: Vec<&BatchValue> = batches.iter().collect();
    batches.sort_by(|a, b| b.scan_started_at.cmp(&a.scan_started_at));

    let value_before = |days: i64| {
        let cutoff = now - Duration::days(days);
        batches
            .iter()
            .find(|b| b.scan_started_at < cutoff)
            .map(|b| b.usd_value)
    };

    let window_start = now - Duration::days(30);
    let window = batches
        .iter()
        .filter(|b| b.scan_started_at > window_start)
        .map(|b| b.usd_value);
    let thirty_day_high = window.clone().max();
    let thirty_day_low = window.min();

    let net_inflow = flows.net_inflow();
    let current_usd_value = batches.first().map(|b| b.usd_value);

    Summary {
        total_inflow: flows.total_inflow,
        total_outflow: flows.total_outflow,
        net_inflow,
        last_scanned_at: batches.first().map(|b| b.scan_started_at),
        current_usd_value,
        one_day_ago_usd_value: value_before(1),
        seven_day_ago_usd_value: value_before(7),
        thirty_day_ago_usd_value: value_before(30),
        thirty_day_high,
        thirty_day_low,
        pnl_percent: current_usd_value.and_then(|current| pnl_percent(current, net_inflow)),
    }
}

fn pnl_percent(current: Decimal, net_inflow: Decimal) -> Option<Decimal> {
    let ratio = (current - net_inflow).checked_div(net_inflow)?;
    let percent = ratio.checked_mul(Decimal::ONE_HUNDRED)?;
    Some(percent.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
}

/// Reads history from the store and computes the summary on demand.
#[derive(Clone)]
pub struct SummaryAggregator {
    store: Arc<dyn AssetStore>,
}

impl SummaryAggregator {
    pub fn new(store: Arc<dyn AssetStore>) -> Self {
        Self { store }
    }

    pub async fn summary(&self) -> Result<Summary, StoreError> {
        let (batches, flows) =
            tokio::try_join!(self.store.batch_values(), self.store.flow_totals())?;
        Ok(compute(Utc::now(), &batches, flows))
    }
}
