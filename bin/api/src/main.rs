//! Coffer API Server: serves portfolio summary, batches and the flow ledger.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use coffer_core::{Settings, telemetry};
use coffer_monitor::{
    AssetStore, FlowLedger, FlowOptions, GroupRef, LedgerError, PgStore, Summary,
    SummaryAggregator,
};
use coffer_storage as storage;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};

/// Shared application state.
struct AppState {
    store: Arc<dyn AssetStore>,
    summary: SummaryAggregator,
    ledger: FlowLedger,
}

impl AppState {
    fn new(store: Arc<dyn AssetStore>) -> Self {
        Self {
            summary: SummaryAggregator::new(Arc::clone(&store)),
            ledger: FlowLedger::new(Arc::clone(&store)),
            store,
        }
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    telemetry::init();
    let settings = Settings::from_env()?;

    tracing::info!("Starting Coffer API Server");

    let pool = storage::connect(&settings.database_url).await?;

    sqlx::migrate!("../../migrations").run(&pool).await?;

    tracing::info!("Database ready");

    let state = Arc::new(AppState::new(Arc::new(PgStore::new(pool))));

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.api_port));
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/summary", get(get_summary))
        .route("/api/v1/batches", get(list_batches))
        .route("/api/v1/batches/:id/snapshots", get(get_batch_snapshots))
        .route("/api/v1/flows", get(list_flows).post(record_flow))
        .route("/health", get(health))
        .with_state(state)
}

// ─── Query Params ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PaginationParams {
    limit: Option<i64>,
}

impl PaginationParams {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(50).clamp(1, 500)
    }
}

#[derive(Debug, Deserialize)]
struct RecordFlowRequest {
    from: Option<GroupRef>,
    to: Option<GroupRef>,
    usd_value: Decimal,
    #[serde(flatten)]
    options: FlowOptions,
}

// ─── Response Types ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    data: T,
}

#[derive(Serialize)]
struct SummaryResponse {
    #[serde(flatten)]
    summary: Summary,
    thirty_day_range: Option<String>,
}

type ApiError = (StatusCode, Json<ApiResponse<String>>);

fn json_ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data,
    })
}

fn json_err(status: StatusCode, msg: &str) -> ApiError {
    (
        status,
        Json(ApiResponse {
            success: false,
            data: msg.to_string(),
        }),
    )
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    tracing::error!(error = %e, "request failed");
    json_err(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
}

// ─── Handlers ───────────────────────────────────────────────────────────────

async fn health() -> &'static str {
    "ok"
}

/// GET /api/v1/summary: inflows, current value, history points and PnL.
async fn get_summary(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let summary = state.summary.summary().await.map_err(internal)?;
    Ok(json_ok(SummaryResponse {
        thirty_day_range: summary.thirty_day_range(),
        summary,
    }))
}

/// GET /api/v1/batches: most recent batches with their total value.
async fn list_batches(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PaginationParams>,
) -> Result<impl IntoResponse, ApiError> {
    let batches = state
        .store
        .recent_batches(params.limit())
        .await
        .map_err(internal)?;
    Ok(json_ok(batches))
}

/// GET /api/v1/batches/:id/snapshots: every snapshot of one batch.
async fn get_batch_snapshots(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshots = state.store.batch_snapshots(id).await.map_err(internal)?;
    Ok(json_ok(snapshots))
}

/// GET /api/v1/flows: latest ledger entries.
async fn list_flows(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PaginationParams>,
) -> Result<impl IntoResponse, ApiError> {
    let flows = state
        .store
        .recent_flows(params.limit())
        .await
        .map_err(internal)?;
    Ok(json_ok(flows))
}

/// POST /api/v1/flows: append one flow to the ledger.
async fn record_flow(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RecordFlowRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let flow = state
        .ledger
        .record_flow(request.from, request.to, request.usd_value, request.options)
        .await
        .map_err(|e| match e {
            LedgerError::GroupNotFound(_) => json_err(StatusCode::NOT_FOUND, &e.to_string()),
            LedgerError::InvalidFlow(_) => json_err(StatusCode::BAD_REQUEST, &e.to_string()),
            LedgerError::Store(_) => internal(e),
        })?;
    Ok((StatusCode::CREATED, json_ok(flow)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffer_monitor::MemoryStore;
    use rust_decimal_macros::dec;

    fn state() -> (Arc<MemoryStore>, Arc<AppState>) {
        let store = Arc::new(MemoryStore::new());
        (Arc::clone(&store), Arc::new(AppState::new(store)))
    }

    fn request(body: serde_json::Value) -> Json<RecordFlowRequest> {
        Json(serde_json::from_value(body).unwrap())
    }

    #[tokio::test]
    async fn recording_a_flow_returns_created() {
        let (store, state) = state();

        let response = record_flow(
            State(state),
            request(serde_json::json!({ "to": "fund", "usd_value": "250", "create_group": true })),
        )
        .await
        .map(IntoResponse::into_response)
        .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(store.flows()[0].usd_value, dec!(250));
    }

    #[tokio::test]
    async fn flow_errors_map_to_client_statuses() {
        let (_, state) = state();

        let missing = record_flow(
            State(Arc::clone(&state)),
            request(serde_json::json!({ "to": "ghost", "usd_value": 5 })),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(missing.0, StatusCode::NOT_FOUND);

        let invalid = record_flow(
            State(state),
            request(serde_json::json!({ "from": 1, "to": 1, "usd_value": 5 })),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(invalid.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn summary_serializes_undefined_pnl_as_null() {
        let (_, state) = state();
        let summary = state.summary.summary().await.unwrap();

        let body = serde_json::to_value(SummaryResponse {
            thirty_day_range: summary.thirty_day_range(),
            summary,
        })
        .unwrap();

        assert_eq!(body["pnl_percent"], serde_json::Value::Null);
        assert_eq!(body["thirty_day_range"], serde_json::Value::Null);
        assert_eq!(body["net_inflow"], "0");
    }
}
