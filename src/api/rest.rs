// =============================================================================
// REST API — Axum 0.7
// =============================================================================
//
// The scanner/screener service surface: verbatim SQL over the feature table,
// the structured `/v2/scan` endpoint, per-market refresh, upstream proxies,
// and the screener WebSocket. CORS is permissive — the service sits behind
// an edge that owns real access control.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::api::ideas::IdeasClient;
use crate::error::ApiError;
use crate::scanner::models::{Market, ScanRequest};
use crate::scanner::ScannerEngine;
use crate::screener::quotes::QuoteFetcher;
use crate::screener::{ws as screener_ws, FeatureTable};

// =============================================================================
// Shared state
// =============================================================================

pub struct ApiState {
    pub table: Arc<FeatureTable>,
    pub scanner: Arc<ScannerEngine>,
    pub fetcher: Arc<dyn QuoteFetcher>,
    pub ideas: Arc<IdeasClient>,
}

// =============================================================================
// Router construction
// =============================================================================

/// Build the full router with CORS middleware and shared state.
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/scanner/scan", post(scanner_sql))
        .route("/v2/scan", post(scan))
        .route("/v2/scan/refresh/:market", get(scan_refresh))
        .route("/symbols/:symbol", get(symbol_detail))
        .route("/ideas/global/:feed", get(global_feed))
        .route("/ideas/:symbol/:feed", get(symbol_feed))
        .route("/ws", get(ws_upgrade))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let stats = state.scanner.cache_stats();
    Json(serde_json::json!({
        "status": "ok",
        "symbols": state.scanner.loaded_symbol_count(),
        "cache": stats,
    }))
}

// =============================================================================
// Verbatim SQL over the feature table
// =============================================================================

#[derive(Debug, Deserialize)]
struct ScreenerQuery {
    query: String,
}

/// Execute the posted SQL against the in-memory feature table and answer
/// record-oriented JSON rows.
async fn scanner_sql(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<ScreenerQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let table = state.table.clone();
    let result = tokio::task::spawn_blocking(move || table.query(&body.query))
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("query task failed: {e}")))?;

    let (columns, rows) = result.map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let records: Vec<JsonValue> = rows
        .into_iter()
        .map(|row| JsonValue::Object(columns.iter().cloned().zip(row).collect()))
        .collect();
    Ok(Json(JsonValue::Array(records)))
}

// =============================================================================
// Structured scan
// =============================================================================

async fn scan(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<ScanRequest>,
) -> Result<impl IntoResponse, ApiError> {
    request.validate().map_err(ApiError::BadRequest)?;

    let scanner = state.scanner.clone();
    let response = tokio::task::spawn_blocking(move || scanner.scan(&request))
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("scan task failed: {e}")))?
        .map_err(|e| {
            error!(error = %e, "scan failed");
            ApiError::Internal(e)
        })?;
    Ok(Json(response))
}

async fn scan_refresh(
    State(state): State<Arc<ApiState>>,
    Path(market): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let market: Market = market.parse().map_err(ApiError::BadRequest)?;
    state.scanner.refresh(market).await?;
    info!(market = %market, "scanner refreshed via API");
    Ok("Scanner Refreshed")
}

// =============================================================================
// Upstream proxies
// =============================================================================

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<u32>,
}

fn clamp_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(10).clamp(1, 100)
}

async fn symbol_detail(
    State(state): State<Arc<ApiState>>,
    Path(symbol): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state.ideas.symbol_detail(&symbol).await?;
    Ok(Json(detail))
}

async fn global_feed(
    State(state): State<Arc<ApiState>>,
    Path(feed): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if !matches!(feed.as_str(), "trending" | "suggested" | "popular") {
        return Err(ApiError::BadRequest(format!("unknown feed '{feed}'")));
    }
    let payload = state
        .ideas
        .global_feed(&feed, clamp_limit(query.limit))
        .await?;
    Ok(Json(payload))
}

async fn symbol_feed(
    State(state): State<Arc<ApiState>>,
    Path((symbol, feed)): Path<(String, String)>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if !matches!(feed.as_str(), "trending" | "popular") {
        return Err(ApiError::BadRequest(format!("unknown feed '{feed}'")));
    }
    let payload = state
        .ideas
        .symbol_feed(&symbol, &feed, clamp_limit(query.limit))
        .await?;
    Ok(Json(payload))
}

// =============================================================================
// Screener WebSocket
// =============================================================================

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    let table = state.table.clone();
    let fetcher = state.fetcher.clone();
    ws.on_upgrade(move |socket| screener_ws::handle_socket(socket, table, fetcher))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_clamps_into_range() {
        assert_eq!(clamp_limit(None), 10);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(50)), 50);
        assert_eq!(clamp_limit(Some(1000)), 100);
    }
}
