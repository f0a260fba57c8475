// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health is public; trading and account
// endpoints authenticate with a per-account bearer token (`ClientAuth`); the
// admin plane requires the `MERIDIAN_ADMIN_TOKEN` bearer (`AdminBearer`).
//
// Command failures serialize as `{error_code, message, retriable}` with a
// status per error class: 422 for input errors, 409 for policy rejections,
// 404 for unknown resources.
//
// CORS is configured permissively for development; tighten in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::auth::{AdminBearer, ClientAuth};
use crate::app_state::AppState;
use crate::errors::RejectReason;
use crate::monitor::trailing::TrailingConfig;
use crate::order_engine::{Position, Trade};
use crate::pnl_engine::AccountSnapshot;
use crate::runtime_config::SymbolSpec;
use crate::types::{BulkSelector, ExecutionMode, Side};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Client (account token) ──────────────────────────────────
        .route("/api/v1/orders/market", post(place_market_order))
        .route("/api/v1/orders", get(list_orders))
        .route("/api/v1/positions", get(list_positions))
        .route("/api/v1/positions/:id/close", post(close_position))
        .route("/api/v1/positions/:id/modify", post(modify_position))
        .route("/api/v1/positions/:id/trailing", post(set_trailing))
        .route("/api/v1/positions/close-bulk", post(close_bulk))
        .route("/api/v1/account", get(account_snapshot))
        .route("/api/v1/trades", get(list_trades))
        .route("/api/v1/trades/stats", get(trade_stats))
        // ── Admin (admin token) ─────────────────────────────────────
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/admin/symbols/:symbol/enable", post(enable_symbol))
        .route("/api/v1/admin/symbols/:symbol/disable", post(disable_symbol))
        .route("/api/v1/admin/symbols/:symbol", put(replace_symbol))
        .route("/api/v1/admin/execution-mode", post(set_execution_mode))
        .route("/api/v1/admin/kill-switch", post(set_kill_switch))
        .route("/api/v1/admin/funding", post(funding))
        // ── Push channel ────────────────────────────────────────────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Error mapping
// =============================================================================

fn reject_status(reason: &RejectReason) -> StatusCode {
    match reason {
        RejectReason::NotFound => StatusCode::NOT_FOUND,
        RejectReason::AlreadyClosed => StatusCode::CONFLICT,
        RejectReason::InvalidVolume
        | RejectReason::InvalidLevels
        | RejectReason::UnknownSymbol => StatusCode::UNPROCESSABLE_ENTITY,
        RejectReason::SymbolDisabled
        | RejectReason::NoPrice
        | RejectReason::InsufficientMargin
        | RejectReason::RiskLimit(_)
        | RejectReason::CircuitBreaker
        | RejectReason::KillSwitch
        | RejectReason::InsufficientFunds
        | RejectReason::MarginCall => StatusCode::CONFLICT,
    }
}

fn reject_response(reason: RejectReason) -> Response {
    let status = reject_status(&reason);
    (status, Json(reason.to_client_error())).into_response()
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Trading commands (client tier)
// =============================================================================

#[derive(Debug, Deserialize)]
struct MarketOrderRequest {
    symbol: String,
    side: Side,
    volume: f64,
    #[serde(default)]
    sl: Option<f64>,
    #[serde(default)]
    tp: Option<f64>,
    #[serde(default)]
    trailing: Option<TrailingConfig>,
}

#[derive(Serialize)]
struct OrderResponse {
    position: Position,
    account: AccountSnapshot,
}

async fn place_market_order(
    State(state): State<Arc<AppState>>,
    ClientAuth(identity): ClientAuth,
    Json(req): Json<MarketOrderRequest>,
) -> Response {
    let result = state.engine.place_market_order(
        &identity.account_id,
        &req.symbol,
        req.side,
        req.volume,
        req.sl,
        req.tp,
    );

    match result {
        Ok(mut position) => {
            if let Some(trailing) = req.trailing {
                match state.engine.set_trailing(&position.id, Some(trailing)) {
                    Ok(updated) => position = updated,
                    Err(reason) => return reject_response(reason),
                }
            }
            let account = state.pnl.snapshot(&identity.account_id);
            (StatusCode::CREATED, Json(OrderResponse { position, account })).into_response()
        }
        Err(reason) => reject_response(reason),
    }
}

#[derive(Debug, Deserialize)]
struct CloseRequest {
    #[serde(default)]
    volume: Option<f64>,
}

#[derive(Serialize)]
struct CloseResponse {
    trade: Trade,
    account: AccountSnapshot,
}

/// Ownership gate: clients may only touch their own positions; anything else
/// reads as NOT_FOUND.
fn owned_position(
    state: &AppState,
    identity_account: &str,
    position_id: &str,
) -> Result<(), RejectReason> {
    match state.engine.position(position_id) {
        Some(p) if p.account_id == identity_account => Ok(()),
        Some(_) => Err(RejectReason::NotFound),
        None => Ok(()), // let the engine report NotFound / AlreadyClosed
    }
}

async fn close_position(
    State(state): State<Arc<AppState>>,
    ClientAuth(identity): ClientAuth,
    Path(position_id): Path<String>,
    Json(req): Json<CloseRequest>,
) -> Response {
    if let Err(reason) = owned_position(&state, &identity.account_id, &position_id) {
        return reject_response(reason);
    }
    match state.engine.close_position(&position_id, req.volume) {
        Ok(trade) => {
            let account = state.pnl.snapshot(&identity.account_id);
            Json(CloseResponse { trade, account }).into_response()
        }
        Err(reason) => reject_response(reason),
    }
}

#[derive(Debug, Deserialize)]
struct ModifyRequest {
    #[serde(default)]
    sl: Option<f64>,
    #[serde(default)]
    tp: Option<f64>,
}

async fn modify_position(
    State(state): State<Arc<AppState>>,
    ClientAuth(identity): ClientAuth,
    Path(position_id): Path<String>,
    Json(req): Json<ModifyRequest>,
) -> Response {
    if let Err(reason) = owned_position(&state, &identity.account_id, &position_id) {
        return reject_response(reason);
    }
    match state.engine.modify_position(&position_id, req.sl, req.tp) {
        Ok(position) => Json(position).into_response(),
        Err(reason) => reject_response(reason),
    }
}

#[derive(Debug, Deserialize)]
struct TrailingRequest {
    #[serde(default)]
    trailing: Option<TrailingConfig>,
}

async fn set_trailing(
    State(state): State<Arc<AppState>>,
    ClientAuth(identity): ClientAuth,
    Path(position_id): Path<String>,
    Json(req): Json<TrailingRequest>,
) -> Response {
    if let Err(reason) = owned_position(&state, &identity.account_id, &position_id) {
        return reject_response(reason);
    }
    match state.engine.set_trailing(&position_id, req.trailing) {
        Ok(position) => Json(position).into_response(),
        Err(reason) => reject_response(reason),
    }
}

#[derive(Debug, Deserialize)]
struct BulkCloseRequest {
    selector: BulkSelector,
    #[serde(default)]
    symbol: Option<String>,
}

async fn close_bulk(
    State(state): State<Arc<AppState>>,
    ClientAuth(identity): ClientAuth,
    Json(req): Json<BulkCloseRequest>,
) -> Response {
    let trades = state
        .engine
        .close_bulk(&identity.account_id, req.selector, req.symbol.as_deref());
    info!(account = %identity.account_id, closed = trades.len(), "bulk close");
    Json(trades).into_response()
}

// =============================================================================
// Account & journal queries (client tier)
// =============================================================================

async fn list_positions(
    State(state): State<Arc<AppState>>,
    ClientAuth(identity): ClientAuth,
) -> impl IntoResponse {
    Json(state.engine.account_positions(&identity.account_id))
}

async fn list_orders(
    State(state): State<Arc<AppState>>,
    ClientAuth(identity): ClientAuth,
) -> impl IntoResponse {
    Json(state.engine.orders(&identity.account_id, 200))
}

async fn account_snapshot(
    State(state): State<Arc<AppState>>,
    ClientAuth(identity): ClientAuth,
) -> impl IntoResponse {
    Json(state.pnl.snapshot(&identity.account_id))
}

async fn list_trades(
    State(state): State<Arc<AppState>>,
    ClientAuth(identity): ClientAuth,
) -> impl IntoResponse {
    Json(state.engine.trades(&identity.account_id, 200))
}

async fn trade_stats(
    State(state): State<Arc<AppState>>,
    ClientAuth(identity): ClientAuth,
) -> impl IntoResponse {
    Json(state.engine.trade_stats(&identity.account_id))
}

// =============================================================================
// Admin plane
// =============================================================================

async fn full_state(_auth: AdminBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

async fn enable_symbol(
    _auth: AdminBearer,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Response {
    match state.admin.set_symbol_enabled(&symbol, true) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(reason) => reject_response(reason),
    }
}

async fn disable_symbol(
    _auth: AdminBearer,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Response {
    match state.admin.set_symbol_enabled(&symbol, false) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(reason) => reject_response(reason),
    }
}

async fn replace_symbol(
    _auth: AdminBearer,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Json(mut spec): Json<SymbolSpec>,
) -> Response {
    spec.symbol = symbol;
    state.admin.replace_symbol_spec(spec);
    StatusCode::NO_CONTENT.into_response()
}

#[derive(Debug, Deserialize)]
struct ExecutionModeRequest {
    mode: ExecutionMode,
}

async fn set_execution_mode(
    _auth: AdminBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExecutionModeRequest>,
) -> impl IntoResponse {
    state.admin.set_execution_mode(req.mode);
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
struct KillSwitchRequest {
    account_id: String,
    active: bool,
}

async fn set_kill_switch(
    _auth: AdminBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<KillSwitchRequest>,
) -> Response {
    if !state.accounts.contains(&req.account_id) {
        return reject_response(RejectReason::NotFound);
    }
    if req.active {
        state.risk.activate_kill_switch(&req.account_id);
    } else {
        state.risk.deactivate_kill_switch(&req.account_id);
    }
    StatusCode::NO_CONTENT.into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum FundingKind {
    Deposit,
    Withdraw,
    Adjustment,
    Bonus,
}

#[derive(Debug, Deserialize)]
struct FundingRequest {
    account_id: String,
    kind: FundingKind,
    amount: f64,
    #[serde(default)]
    reference: Option<String>,
}

async fn funding(
    _auth: AdminBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<FundingRequest>,
) -> Response {
    if !state.accounts.contains(&req.account_id) {
        return reject_response(RejectReason::NotFound);
    }
    let result = match req.kind {
        FundingKind::Deposit => state
            .ledger
            .deposit(&req.account_id, req.amount, req.reference),
        FundingKind::Withdraw => state
            .ledger
            .withdraw(&req.account_id, req.amount, req.reference),
        FundingKind::Adjustment => state
            .ledger
            .adjustment(&req.account_id, req.amount, req.reference),
        FundingKind::Bonus => state.ledger.bonus(&req.account_id, req.amount, req.reference),
    };
    match result {
        Ok(entry) => (StatusCode::CREATED, Json(entry)).into_response(),
        Err(reason) => reject_response(reason),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_per_error_class() {
        assert_eq!(
            reject_status(&RejectReason::InvalidVolume),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(reject_status(&RejectReason::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(
            reject_status(&RejectReason::AlreadyClosed),
            StatusCode::CONFLICT
        );
        assert_eq!(
            reject_status(&RejectReason::InsufficientMargin),
            StatusCode::CONFLICT
        );
        assert_eq!(
            reject_status(&RejectReason::KillSwitch),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn market_order_request_parses() {
        let req: MarketOrderRequest = serde_json::from_str(
            r#"{"symbol":"EURUSD","side":"BUY","volume":0.1,"sl":1.09,"tp":1.12}"#,
        )
        .unwrap();
        assert_eq!(req.side, Side::Buy);
        assert!(req.trailing.is_none());

        let req: MarketOrderRequest = serde_json::from_str(
            r#"{"symbol":"EURUSD","side":"SELL","volume":0.5,
                "trailing":{"mode":"STEP","distance":0.001,"step_size":0.0005}}"#,
        )
        .unwrap();
        assert!(req.trailing.is_some());
    }

    #[test]
    fn bulk_request_parses_selectors() {
        let req: BulkCloseRequest =
            serde_json::from_str(r#"{"selector":"WINNERS","symbol":"EURUSD"}"#).unwrap();
        assert_eq!(req.selector, BulkSelector::Winners);
        let req: BulkCloseRequest = serde_json::from_str(r#"{"selector":"ALL"}"#).unwrap();
        assert_eq!(req.selector, BulkSelector::All);
        assert!(req.symbol.is_none());
    }

    #[test]
    fn funding_kind_parses() {
        let req: FundingRequest = serde_json::from_str(
            r#"{"account_id":"a1","kind":"DEPOSIT","amount":100.0}"#,
        )
        .unwrap();
        assert!(matches!(req.kind, FundingKind::Deposit));
    }
}
