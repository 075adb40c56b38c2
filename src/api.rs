use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::regime_core::permission::{catalogue, StrategyInfo};
use crate::regime_core::{
    Candle, EngineEvent, EngineOutput, LevelSet, MovingAverageUpdate, PositionUpdate, RiskFlagUpdate, TransitionRecord,
};
use crate::types::AppState;

/// Response for instrument list
#[derive(Serialize)]
pub struct InstrumentsResponse {
    pub instruments: Vec<EngineOutput>,
}

/// Response for records list
#[derive(Serialize)]
pub struct RecordsResponse {
    pub records: Vec<TransitionRecord>,
}

#[derive(Serialize)]
pub struct StrategiesResponse {
    pub strategies: Vec<StrategyInfo>,
}

/// Query params for records endpoint
#[derive(Debug, Deserialize)]
pub struct RecordsQueryParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ClockBody {
    pub timestamp: DateTime<Utc>,
}

fn error_body(status: StatusCode, message: String) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "error": message })))
}

async fn ingest(state: &AppState, symbol: &str, event: EngineEvent) -> (StatusCode, Json<serde_json::Value>) {
    match state.registry.ingest(symbol, event).await {
        Ok(update) => (StatusCode::OK, Json(serde_json::json!(update))),
        Err(e) if e.is_rejection() => error_body(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
        Err(e) => {
            warn!("{}: ingest failed: {}", symbol, e);
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// GET /api/instruments - Current output for every instrument
pub async fn list_instruments(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let instruments = state.registry.snapshots().await;
    Json(InstrumentsResponse { instruments })
}

/// GET /api/instruments/{symbol} - Current output for one instrument
pub async fn get_instrument(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    match state.registry.snapshot(&symbol).await {
        Some(output) => (StatusCode::OK, Json(serde_json::json!(output))),
        None => error_body(StatusCode::NOT_FOUND, format!("unknown instrument {}", symbol)),
    }
}

/// GET /api/instruments/{symbol}/records - Recent transition records
pub async fn get_records(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(params): Query<RecordsQueryParams>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(100);
    let records = state.history.read().await.for_instrument(&symbol, limit);
    Json(RecordsResponse { records })
}

/// GET /api/strategies - Strategy catalogue
pub async fn get_strategies() -> impl IntoResponse {
    Json(StrategiesResponse {
        strategies: catalogue(),
    })
}

/// POST /api/instruments/{symbol}/candles
pub async fn post_candle(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Json(candle): Json<Candle>,
) -> impl IntoResponse {
    ingest(&state, &symbol, EngineEvent::Candle(candle)).await
}

/// POST /api/instruments/{symbol}/levels
pub async fn post_levels(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Json(levels): Json<LevelSet>,
) -> impl IntoResponse {
    ingest(&state, &symbol, EngineEvent::Levels(levels)).await
}

/// POST /api/instruments/{symbol}/moving-averages
pub async fn post_moving_averages(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Json(update): Json<MovingAverageUpdate>,
) -> impl IntoResponse {
    ingest(&state, &symbol, EngineEvent::MovingAverages(update)).await
}

/// POST /api/instruments/{symbol}/risk
pub async fn post_risk(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Json(update): Json<RiskFlagUpdate>,
) -> impl IntoResponse {
    ingest(&state, &symbol, EngineEvent::RiskFlags(update)).await
}

/// POST /api/instruments/{symbol}/position
pub async fn post_position(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Json(update): Json<PositionUpdate>,
) -> impl IntoResponse {
    ingest(&state, &symbol, EngineEvent::Position(update)).await
}

/// POST /api/instruments/{symbol}/clock
pub async fn post_clock(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Json(body): Json<ClockBody>,
) -> impl IntoResponse {
    ingest(&state, &symbol, EngineEvent::Clock(body.timestamp)).await
}
