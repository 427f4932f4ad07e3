//! API route handlers.
//!
//! All endpoints take and return JSON. The engine is shared via `Arc<Engine>`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::engine::ledger::PropRemoval;
use crate::engine::repricer::{LiveEstimate, RepriceReport, TallyUpdate};
use crate::engine::settlement::{SettlementPreview, SettlementReport};
use crate::engine::valuation::{CashOutReceipt, ParlayValuation};
use crate::engine::Engine;
use crate::odds::{complement_odds, LinePrice};
use crate::types::{EngineError, LegSelection, Parlay, Prop, PropOption, Side};

pub type AppState = Arc<Engine>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Engine error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            EngineError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
            EngineError::NotFoundOrInactive(_) => (StatusCode::NOT_FOUND, "not_found_or_inactive"),
            EngineError::InsufficientFunds { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "insufficient_funds"),
            EngineError::TransactionConflict(_) => (StatusCode::CONFLICT, "transaction_conflict"),
            EngineError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        }
        let body = ErrorResponse {
            error: code.to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreatePropRequest {
    pub description: String,
    pub ev: f64,
    pub end_at: DateTime<Utc>,
    pub created_by: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateOptionRequest {
    pub line: f64,
    pub created_by: String,
}

#[derive(Debug, Deserialize)]
pub struct LineQuery {
    pub line: f64,
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct UserRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PlaceParlayRequest {
    pub user_id: String,
    pub coins_wagered: i64,
    pub legs: Vec<LegSelection>,
}

#[derive(Debug, Deserialize)]
pub struct CreditRequest {
    pub amount: i64,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub user_id: String,
    pub balance: i64,
}

#[derive(Debug, Serialize)]
pub struct ResolveResponse {
    pub throttled: bool,
    pub report: Option<SettlementReport>,
}

#[derive(Debug, Deserialize)]
pub struct ComplementQuery {
    pub odds: i32,
    pub side: Side,
    pub ev: f64,
}

#[derive(Debug, Serialize)]
pub struct ComplementResponse {
    pub side: Side,
    pub odds: i32,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /api/props
pub async fn create_prop(
    State(engine): State<AppState>,
    Json(req): Json<CreatePropRequest>,
) -> Result<(StatusCode, Json<Prop>), ApiError> {
    let prop = engine
        .create_prop(&req.description, req.ev, req.end_at, &req.created_by)
        .await?;
    Ok((StatusCode::CREATED, Json(prop)))
}

/// DELETE /api/props/:id?user_id=
pub async fn remove_prop(
    State(engine): State<AppState>,
    Path(prop_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> ApiResult<PropRemoval> {
    Ok(Json(engine.remove_prop(&prop_id, &query.user_id).await?))
}

/// POST /api/props/:id/reprice
pub async fn reprice_prop(State(engine): State<AppState>, Path(prop_id): Path<String>) -> ApiResult<RepriceReport> {
    Ok(Json(engine.reprice_prop(&prop_id).await?))
}

/// GET /api/props/:id/estimate
pub async fn get_estimate(State(engine): State<AppState>, Path(prop_id): Path<String>) -> ApiResult<LiveEstimate> {
    Ok(Json(engine.live_estimate(&prop_id).await?))
}

/// GET /api/props/:id/price?line=
pub async fn price_option(
    State(engine): State<AppState>,
    Path(prop_id): Path<String>,
    Query(query): Query<LineQuery>,
) -> ApiResult<LinePrice> {
    Ok(Json(engine.price_new_option(&prop_id, query.line).await?))
}

/// POST /api/props/:id/options
pub async fn create_option(
    State(engine): State<AppState>,
    Path(prop_id): Path<String>,
    Json(req): Json<CreateOptionRequest>,
) -> Result<(StatusCode, Json<PropOption>), ApiError> {
    let option = engine.create_option(&prop_id, req.line, &req.created_by).await?;
    Ok((StatusCode::CREATED, Json(option)))
}

/// DELETE /api/options/:id?user_id=
pub async fn remove_option(
    State(engine): State<AppState>,
    Path(option_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> Result<StatusCode, ApiError> {
    engine.remove_option(&option_id, &query.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/props/:id/tallies
pub async fn add_tally(
    State(engine): State<AppState>,
    Path(prop_id): Path<String>,
    Json(req): Json<UserRequest>,
) -> Result<(StatusCode, Json<TallyUpdate>), ApiError> {
    let update = engine.add_tally(&prop_id, &req.user_id).await?;
    Ok((StatusCode::CREATED, Json(update)))
}

/// DELETE /api/tallies/:id?user_id=
pub async fn remove_tally(
    State(engine): State<AppState>,
    Path(tally_id): Path<i64>,
    Query(query): Query<UserQuery>,
) -> ApiResult<TallyUpdate> {
    Ok(Json(engine.remove_tally(tally_id, &query.user_id).await?))
}

/// POST /api/parlays
pub async fn place_parlay(
    State(engine): State<AppState>,
    Json(req): Json<PlaceParlayRequest>,
) -> Result<(StatusCode, Json<Parlay>), ApiError> {
    let parlay = engine.place_parlay(&req.user_id, req.coins_wagered, &req.legs).await?;
    Ok((StatusCode::CREATED, Json(parlay)))
}

/// GET /api/parlays/:id
pub async fn get_parlay(State(engine): State<AppState>, Path(parlay_id): Path<String>) -> ApiResult<ParlayValuation> {
    Ok(Json(engine.valuate_parlay(&parlay_id).await?))
}

/// POST /api/parlays/:id/cash-out
pub async fn cash_out(
    State(engine): State<AppState>,
    Path(parlay_id): Path<String>,
    Json(req): Json<UserRequest>,
) -> ApiResult<CashOutReceipt> {
    Ok(Json(engine.cash_out_parlay(&parlay_id, &req.user_id).await?))
}

/// POST /api/users/:id/resolve
pub async fn resolve_user(State(engine): State<AppState>, Path(user_id): Path<String>) -> ApiResult<ResolveResponse> {
    let report = engine.resolve_parlays_throttled(&user_id).await?;
    Ok(Json(ResolveResponse {
        throttled: report.is_none(),
        report,
    }))
}

/// GET /api/users/:id/settlement-preview
pub async fn settlement_preview(
    State(engine): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Vec<SettlementPreview>> {
    Ok(Json(engine.preview_settlement(&user_id).await?))
}

/// GET /api/users/:id/coins
pub async fn get_balance(State(engine): State<AppState>, Path(user_id): Path<String>) -> ApiResult<BalanceResponse> {
    let balance = engine.balance(&user_id).await?;
    Ok(Json(BalanceResponse { user_id, balance }))
}

/// POST /api/users/:id/coins
pub async fn credit_coins(
    State(engine): State<AppState>,
    Path(user_id): Path<String>,
    Json(req): Json<CreditRequest>,
) -> ApiResult<BalanceResponse> {
    let balance = engine.credit_coins(&user_id, req.amount).await?;
    Ok(Json(BalanceResponse { user_id, balance }))
}

/// GET /api/odds/complement?odds=&side=&ev=
pub async fn get_complement(Query(query): Query<ComplementQuery>) -> ApiResult<ComplementResponse> {
    let odds = complement_odds(query.odds, query.side, query.ev)?;
    Ok(Json(ComplementResponse {
        side: query.side.opposite(),
        odds,
    }))
}
