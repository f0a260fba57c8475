// =============================================================================
// Order Engine — order acceptance, B-Book fills, and the open position book
// =============================================================================
//
// Sole owner of the position book and the only component that writes trading
// entries into the ledger. Everything else reads through value-returning
// snapshots.
//
// Fill model (B-Book): the broker takes the other side; BUY fills at the
// current ask, SELL at the current bid, no slippage. Closing mirrors it: BUY
// closes at bid, SELL at ask.
//
// Pre-trade pipeline, in order — any failure rejects the order:
//   1. symbol known and enabled
//   2. volume within [min_volume, max_position_size] and on the volume step
//   3. a non-stale tick exists
//   4. risk policy passes (caps, kill switch, circuit breaker)
//   5. account not in margin call
//   6. projected margin level stays at or above the margin-call level
//
// Position lifecycle: OPEN -> (SL/TP modified any number of times) -> CLOSED.
// Terminal. Two triggers racing on the same position resolve by first close
// wins; the loser observes ALREADY_CLOSED and no-ops.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::admin::AdminControl;
use crate::errors::RejectReason;
use crate::ledger::Ledger;
use crate::market_data::MarketView;
use crate::monitor::trailing::{TrailingConfig, TrailingStop};
use crate::risk::RiskPolicy;
use crate::types::{BulkSelector, CloseReason, ExecutionMode, OrderStatus, OrderType, Side};

/// Orders retained for the audit trail.
const MAX_ORDER_HISTORY: usize = 1_000;

/// Tolerance for volume-step arithmetic on f64 lots.
const VOLUME_EPS: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// An accepted or rejected order. Market orders fill synchronously, so the
/// audit record is terminal by the time the caller sees it.
#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub volume: f64,
    pub price: Option<f64>,
    pub sl: Option<f64>,
    pub tp: Option<f64>,
    pub status: OrderStatus,
    pub reject_reason: Option<String>,
    pub created_at: i64,
    pub filled_at: Option<i64>,
    pub fill_price: Option<f64>,
}

/// An open position. Exists only while open; closing produces a [`Trade`].
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub open_price: f64,
    /// Last close-side price seen (bid for longs, ask for shorts).
    pub current_price: f64,
    pub sl: Option<f64>,
    pub tp: Option<f64>,
    pub trailing: Option<TrailingStop>,
    pub swap_accrued: f64,
    pub commission: f64,
    pub contract_size: f64,
    /// Collateral locked at open: volume * contract_size * open_price /
    /// leverage * margin_rate. Stable as prices move.
    pub margin: f64,
    pub open_time: i64,
    pub origin_order_id: String,
}

impl Position {
    /// Unrealized P&L at the given book. Derived, never stored.
    pub fn unrealized_pnl(&self, bid: f64, ask: f64) -> f64 {
        let close_price = match self.side {
            Side::Buy => bid,
            Side::Sell => ask,
        };
        self.side.direction() * (close_price - self.open_price) * self.volume * self.contract_size
    }
}

/// Immutable closed-position record.
#[derive(Debug, Clone, Serialize)]
pub struct Trade {
    pub id: String,
    pub position_id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub open_price: f64,
    pub close_price: f64,
    pub realized_pnl: f64,
    pub commission: f64,
    pub swap: f64,
    pub reason: CloseReason,
    pub opened_at: i64,
    pub closed_at: i64,
}

/// Derived account financials at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct AccountMetrics {
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub free_margin: f64,
    /// Percent; infinite when no margin is in use.
    pub margin_level: f64,
    pub unrealized_pnl: f64,
    pub open_positions: usize,
}

/// Aggregate statistics over an account's closed trades.
#[derive(Debug, Clone, Serialize)]
pub struct TradeStats {
    pub total_trades: usize,
    pub win_rate: f64,
    pub total_net_pnl: f64,
    pub profit_factor: f64,
}

// ---------------------------------------------------------------------------
// Events to the push hub
// ---------------------------------------------------------------------------

/// Alert categories forwarded to subscribed clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    MarginCall,
    StopOut,
    CircuitBreaker,
    KillSwitch,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    PositionOpened(Position),
    PositionModified(Position),
    PositionClosed { trade: Trade },
    Alert {
        kind: AlertKind,
        account_id: Option<String>,
        symbol: Option<String>,
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct OrderEngine {
    view: Arc<MarketView>,
    ledger: Arc<Ledger>,
    risk: Arc<RiskPolicy>,
    admin: Arc<AdminControl>,

    positions: RwLock<HashMap<String, Position>>,
    /// symbol -> open position ids, so per-tick evaluation is O(#open on S).
    by_symbol: RwLock<HashMap<String, HashSet<String>>>,
    closed_ids: RwLock<HashSet<String>>,
    trades: RwLock<Vec<Trade>>,
    orders: RwLock<Vec<Order>>,

    /// Accounts currently latched in margin call by the P&L engine.
    margin_call: RwLock<HashSet<String>>,

    events_tx: mpsc::Sender<EngineEvent>,
    pub events_dropped: AtomicU64,

    commission_per_lot: f64,
    lp_stale_ms: i64,
    margin_call_level: f64,
}

impl OrderEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        view: Arc<MarketView>,
        ledger: Arc<Ledger>,
        risk: Arc<RiskPolicy>,
        admin: Arc<AdminControl>,
        events_tx: mpsc::Sender<EngineEvent>,
        commission_per_lot: f64,
        lp_stale_ms: i64,
        margin_call_level: f64,
    ) -> Self {
        Self {
            view,
            ledger,
            risk,
            admin,
            positions: RwLock::new(HashMap::new()),
            by_symbol: RwLock::new(HashMap::new()),
            closed_ids: RwLock::new(HashSet::new()),
            trades: RwLock::new(Vec::new()),
            orders: RwLock::new(Vec::new()),
            margin_call: RwLock::new(HashSet::new()),
            events_tx,
            events_dropped: AtomicU64::new(0),
            commission_per_lot,
            lp_stale_ms,
            margin_call_level,
        }
    }

    fn emit(&self, event: EngineEvent) {
        if self.events_tx.try_send(event).is_err() {
            // Push events are advisory; the book is the source of truth.
            self.events_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn push_order(&self, order: Order) {
        let mut orders = self.orders.write();
        orders.push(order);
        while orders.len() > MAX_ORDER_HISTORY {
            orders.remove(0);
        }
    }

    // -------------------------------------------------------------------------
    // place_market_order
    // -------------------------------------------------------------------------

    pub fn place_market_order(
        &self,
        account_id: &str,
        symbol: &str,
        side: Side,
        volume: f64,
        sl: Option<f64>,
        tp: Option<f64>,
    ) -> Result<Position, RejectReason> {
        let order_id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();

        let result = self.try_fill(account_id, symbol, side, volume, sl, tp, &order_id, now);

        let order = Order {
            id: order_id.clone(),
            account_id: account_id.to_string(),
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            volume,
            price: None,
            sl,
            tp,
            status: if result.is_ok() {
                OrderStatus::Filled
            } else {
                OrderStatus::Rejected
            },
            reject_reason: result.as_ref().err().map(|r| r.code().to_string()),
            created_at: now,
            filled_at: result.as_ref().ok().map(|p| p.open_time),
            fill_price: result.as_ref().ok().map(|p| p.open_price),
        };
        self.push_order(order);

        result
    }

    #[allow(clippy::too_many_arguments)]
    fn try_fill(
        &self,
        account_id: &str,
        symbol: &str,
        side: Side,
        volume: f64,
        sl: Option<f64>,
        tp: Option<f64>,
        order_id: &str,
        now: i64,
    ) -> Result<Position, RejectReason> {
        // 1. Symbol known and enabled.
        let spec = self
            .admin
            .symbol_spec(symbol)
            .ok_or(RejectReason::UnknownSymbol)?;
        if !self.admin.is_symbol_enabled(symbol) {
            return Err(RejectReason::SymbolDisabled);
        }

        // 2. Volume bounds and step.
        let limits = self.risk.limits(account_id);
        if !volume.is_finite()
            || volume < spec.min_volume - VOLUME_EPS
            || volume > limits.max_position_size + VOLUME_EPS
        {
            return Err(RejectReason::InvalidVolume);
        }
        let steps = volume / spec.volume_step;
        if (steps - steps.round()).abs() > 1e-6 {
            return Err(RejectReason::InvalidVolume);
        }

        // 3. Fresh market price.
        let tick = self
            .view
            .latest_within(symbol, self.lp_stale_ms, now)
            .ok_or(RejectReason::NoPrice)?;

        let fill_price = match side {
            Side::Buy => tick.ask,
            Side::Sell => tick.bid,
        };
        let notional = volume * spec.contract_size * fill_price;

        // 4. Risk policy.
        self.risk
            .pre_trade_check(account_id, symbol, notional, now)?;

        // 5. Margin-call latch.
        if self.in_margin_call(account_id) {
            return Err(RejectReason::MarginCall);
        }

        // 6. Margin: the projected level must not start below the call level.
        let new_margin = notional / limits.leverage * spec.margin_rate;
        let metrics = self.account_metrics(account_id);
        let projected_margin = metrics.margin + new_margin;
        if projected_margin > 0.0
            && metrics.equity / projected_margin * 100.0 < self.margin_call_level
        {
            return Err(RejectReason::InsufficientMargin);
        }

        // SL/TP must be on the correct side of the current book.
        validate_levels(side, sl, tp, tick.bid, tick.ask)?;

        if self.admin.execution_mode() == ExecutionMode::ABook {
            warn!(symbol = %symbol, "A-Book routing not wired in this process — filling B-Book");
        }

        // Fill.
        let commission = self.commission_per_lot * volume;
        let position = Position {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            symbol: symbol.to_string(),
            side,
            volume,
            open_price: fill_price,
            current_price: match side {
                Side::Buy => tick.bid,
                Side::Sell => tick.ask,
            },
            sl,
            tp,
            trailing: None,
            swap_accrued: 0.0,
            commission,
            contract_size: spec.contract_size,
            margin: new_margin,
            open_time: now,
            origin_order_id: order_id.to_string(),
        };

        if commission > 0.0 {
            self.ledger
                .record_commission(account_id, commission, &position.id);
        }

        {
            let mut positions = self.positions.write();
            let mut by_symbol = self.by_symbol.write();
            by_symbol
                .entry(symbol.to_string())
                .or_default()
                .insert(position.id.clone());
            positions.insert(position.id.clone(), position.clone());
        }
        self.risk.record_open(account_id, symbol, notional);

        info!(
            id = %position.id,
            account = %account_id,
            symbol = %symbol,
            side = %side,
            volume,
            fill_price,
            margin = new_margin,
            "position opened"
        );
        self.emit(EngineEvent::PositionOpened(position.clone()));

        Ok(position)
    }

    // -------------------------------------------------------------------------
    // close_position
    // -------------------------------------------------------------------------

    /// Close a position (fully, or partially when `volume` is less than the
    /// open volume) at the current market, reason MANUAL.
    pub fn close_position(
        &self,
        position_id: &str,
        volume: Option<f64>,
    ) -> Result<Trade, RejectReason> {
        self.close_position_internal(position_id, volume, CloseReason::Manual)
    }

    /// Narrow interface used by the position monitor and the P&L engine's
    /// stop-out path.
    pub fn close_position_internal(
        &self,
        position_id: &str,
        volume: Option<f64>,
        reason: CloseReason,
    ) -> Result<Trade, RejectReason> {
        let now = Utc::now().timestamp_millis();

        let mut positions = self.positions.write();
        let Some(position) = positions.get(position_id).cloned() else {
            return if self.closed_ids.read().contains(position_id) {
                Err(RejectReason::AlreadyClosed)
            } else {
                Err(RejectReason::NotFound)
            };
        };

        let tick = self
            .view
            .latest_within(&position.symbol, self.lp_stale_ms, now)
            .ok_or(RejectReason::NoPrice)?;
        let close_price = match position.side {
            Side::Buy => tick.bid,
            Side::Sell => tick.ask,
        };

        let close_volume = match volume {
            Some(v) if v > VOLUME_EPS && v < position.volume - VOLUME_EPS => v,
            Some(v) if v <= VOLUME_EPS => return Err(RejectReason::InvalidVolume),
            _ => position.volume,
        };
        let fraction = close_volume / position.volume;
        let full_close = fraction >= 1.0 - 1e-9;

        let realized_pnl = position.side.direction()
            * (close_price - position.open_price)
            * close_volume
            * position.contract_size;
        let trade_commission = position.commission * fraction;
        let trade_swap = position.swap_accrued * fraction;

        let trade = Trade {
            id: Uuid::new_v4().to_string(),
            position_id: position.id.clone(),
            account_id: position.account_id.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            volume: close_volume,
            open_price: position.open_price,
            close_price,
            realized_pnl,
            commission: trade_commission,
            swap: trade_swap,
            reason,
            opened_at: position.open_time,
            closed_at: now,
        };

        // Mutate the book while still holding the write lock so a racing
        // trigger sees either the old volume or the terminal state.
        if full_close {
            positions.remove(position_id);
            if let Some(set) = self.by_symbol.write().get_mut(&position.symbol) {
                set.remove(position_id);
            }
            self.closed_ids.write().insert(position_id.to_string());
        } else if let Some(p) = positions.get_mut(position_id) {
            p.volume -= close_volume;
            p.margin *= 1.0 - fraction;
            p.commission -= trade_commission;
            p.swap_accrued -= trade_swap;
        }
        drop(positions);

        self.ledger
            .record_realized_pnl(&position.account_id, realized_pnl, &trade.id);
        if trade_swap.abs() > VOLUME_EPS {
            self.ledger
                .record_swap(&position.account_id, trade_swap, &trade.id);
        }

        let notional = close_volume * position.contract_size * close_price;
        let kill_tripped =
            self.risk
                .record_close(&position.account_id, &position.symbol, notional, realized_pnl);

        self.trades.write().push(trade.clone());

        info!(
            id = %position.id,
            trade = %trade.id,
            reason = %reason,
            close_price,
            volume = close_volume,
            realized_pnl,
            partial = !full_close,
            "position closed"
        );
        self.emit(EngineEvent::PositionClosed {
            trade: trade.clone(),
        });
        if kill_tripped {
            self.emit(EngineEvent::Alert {
                kind: AlertKind::KillSwitch,
                account_id: Some(position.account_id.clone()),
                symbol: None,
                message: "daily loss limit breached — kill switch activated".to_string(),
            });
        }

        Ok(trade)
    }

    // -------------------------------------------------------------------------
    // modify_position / set_trailing
    // -------------------------------------------------------------------------

    pub fn modify_position(
        &self,
        position_id: &str,
        sl: Option<f64>,
        tp: Option<f64>,
    ) -> Result<Position, RejectReason> {
        let mut positions = self.positions.write();
        let position = positions.get_mut(position_id).ok_or_else(|| {
            if self.closed_ids.read().contains(position_id) {
                RejectReason::AlreadyClosed
            } else {
                RejectReason::NotFound
            }
        })?;

        // Validate against the live book when we have one; fall back to the
        // last marked price when the feed is quiet.
        let (bid, ask) = match self.view.latest(&position.symbol) {
            Some(t) => (t.bid, t.ask),
            None => (position.current_price, position.current_price),
        };
        validate_levels(position.side, sl, tp, bid, ask)?;

        position.sl = sl;
        position.tp = tp;
        if let Some(trailing) = position.trailing.as_mut() {
            if let Some(new_sl) = sl {
                trailing.current_sl = new_sl;
            }
        }

        let snapshot = position.clone();
        drop(positions);

        debug!(id = %position_id, ?sl, ?tp, "position modified");
        self.emit(EngineEvent::PositionModified(snapshot.clone()));
        Ok(snapshot)
    }

    /// Attach or replace the trailing stop of an open position. `None`
    /// removes it.
    pub fn set_trailing(
        &self,
        position_id: &str,
        config: Option<TrailingConfig>,
    ) -> Result<Position, RejectReason> {
        let mut positions = self.positions.write();
        let position = positions.get_mut(position_id).ok_or_else(|| {
            if self.closed_ids.read().contains(position_id) {
                RejectReason::AlreadyClosed
            } else {
                RejectReason::NotFound
            }
        })?;

        position.trailing = match config {
            Some(cfg) => {
                if !(cfg.distance > 0.0) {
                    return Err(RejectReason::InvalidLevels);
                }
                let trail =
                    TrailingStop::new(cfg, position.side, position.open_price, position.sl);
                // Arm the stop immediately; the trail only ever tightens it.
                position.sl = Some(trail.current_sl);
                Some(trail)
            }
            None => None,
        };

        let snapshot = position.clone();
        drop(positions);
        self.emit(EngineEvent::PositionModified(snapshot.clone()));
        Ok(snapshot)
    }

    // -------------------------------------------------------------------------
    // close_bulk
    // -------------------------------------------------------------------------

    /// Close all matching positions of an account. Per-position failures are
    /// logged and skipped; the successfully produced trades are returned.
    pub fn close_bulk(
        &self,
        account_id: &str,
        selector: BulkSelector,
        symbol: Option<&str>,
    ) -> Vec<Trade> {
        let candidates: Vec<Position> = {
            let positions = self.positions.read();
            positions
                .values()
                .filter(|p| p.account_id == account_id)
                .filter(|p| symbol.map_or(true, |s| p.symbol == s))
                .cloned()
                .collect()
        };

        let mut trades = Vec::new();
        for position in candidates {
            if let Some(tick) = self.view.latest(&position.symbol) {
                let pnl = position.unrealized_pnl(tick.bid, tick.ask);
                let wanted = match selector {
                    BulkSelector::All => true,
                    BulkSelector::Winners => pnl > 0.0,
                    BulkSelector::Losers => pnl < 0.0,
                };
                if !wanted {
                    continue;
                }
            } else if selector != BulkSelector::All {
                continue; // no price — cannot classify
            }

            match self.close_position_internal(&position.id, None, CloseReason::BulkClose) {
                Ok(trade) => trades.push(trade),
                Err(reason) => {
                    warn!(id = %position.id, reason = %reason, "bulk close skipped position");
                }
            }
        }
        trades
    }

    // -------------------------------------------------------------------------
    // Mark-to-market and trigger evaluation (driven by the position monitor)
    // -------------------------------------------------------------------------

    /// Update `current_price` and advance trailing stops for every open
    /// position on `symbol`. `atr` is the precomputed ATR for ATR-mode
    /// trailing (None leaves those trails at their last distance).
    pub fn mark_prices(&self, symbol: &str, bid: f64, ask: f64, atr: Option<f64>) {
        let ids: Vec<String> = match self.by_symbol.read().get(symbol) {
            Some(set) => set.iter().cloned().collect(),
            None => return,
        };

        let mut positions = self.positions.write();
        for id in ids {
            let Some(p) = positions.get_mut(&id) else { continue };
            p.current_price = match p.side {
                Side::Buy => bid,
                Side::Sell => ask,
            };
            if let Some(trailing) = p.trailing.as_mut() {
                if let Some(new_sl) = trailing.advance(p.side, bid, ask, atr) {
                    debug!(id = %p.id, new_sl, "trailing stop advanced");
                    p.sl = Some(new_sl);
                }
            }
        }
    }

    /// True when at least one open position on `symbol` runs an ATR trail —
    /// lets the monitor skip the bar aggregation otherwise.
    pub fn needs_atr(&self, symbol: &str) -> bool {
        let ids: Vec<String> = match self.by_symbol.read().get(symbol) {
            Some(set) => set.iter().cloned().collect(),
            None => return false,
        };
        let positions = self.positions.read();
        ids.iter().any(|id| {
            positions
                .get(id)
                .and_then(|p| p.trailing.as_ref())
                .map(|t| t.uses_atr())
                .unwrap_or(false)
        })
    }

    /// Evaluate SL/TP/trailing triggers for every open position on `symbol`
    /// against the given book. Pure read; the monitor performs the closes.
    pub fn check_triggers(&self, symbol: &str, bid: f64, ask: f64) -> Vec<(String, CloseReason)> {
        let ids: Vec<String> = match self.by_symbol.read().get(symbol) {
            Some(set) => set.iter().cloned().collect(),
            None => return Vec::new(),
        };

        let positions = self.positions.read();
        let mut triggers = Vec::new();
        for id in ids {
            let Some(p) = positions.get(&id) else { continue };
            let trigger_price = match p.side {
                Side::Buy => bid,
                Side::Sell => ask,
            };

            let sl_hit = p.sl.map_or(false, |sl| match p.side {
                Side::Buy => trigger_price <= sl,
                Side::Sell => trigger_price >= sl,
            });
            if sl_hit {
                let reason = if p.trailing.as_ref().map(|t| t.owns_level(p.sl)).unwrap_or(false) {
                    CloseReason::TrailingStop
                } else {
                    CloseReason::StopLoss
                };
                triggers.push((id, reason));
                continue;
            }

            let tp_hit = p.tp.map_or(false, |tp| match p.side {
                Side::Buy => trigger_price >= tp,
                Side::Sell => trigger_price <= tp,
            });
            if tp_hit {
                triggers.push((id, CloseReason::TakeProfit));
            }
        }
        triggers
    }

    // -------------------------------------------------------------------------
    // Margin-call latch (owned here, driven by the P&L engine)
    // -------------------------------------------------------------------------

    /// Latch or clear the margin-call flag. Returns true when the flag
    /// actually changed.
    pub fn set_margin_call(&self, account_id: &str, active: bool) -> bool {
        let mut set = self.margin_call.write();
        if active {
            set.insert(account_id.to_string())
        } else {
            set.remove(account_id)
        }
    }

    pub fn in_margin_call(&self, account_id: &str) -> bool {
        self.margin_call.read().contains(account_id)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn position(&self, position_id: &str) -> Option<Position> {
        self.positions.read().get(position_id).cloned()
    }

    pub fn account_positions(&self, account_id: &str) -> Vec<Position> {
        self.positions
            .read()
            .values()
            .filter(|p| p.account_id == account_id)
            .cloned()
            .collect()
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.read().len()
    }

    /// Accounts that currently hold at least one open position.
    pub fn accounts_with_positions(&self) -> HashSet<String> {
        self.positions
            .read()
            .values()
            .map(|p| p.account_id.clone())
            .collect()
    }

    pub fn trades(&self, account_id: &str, limit: usize) -> Vec<Trade> {
        let trades = self.trades.read();
        trades
            .iter()
            .rev()
            .filter(|t| t.account_id == account_id)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn orders(&self, account_id: &str, limit: usize) -> Vec<Order> {
        let orders = self.orders.read();
        orders
            .iter()
            .rev()
            .filter(|o| o.account_id == account_id)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Balance, equity, margin and margin level at current view prices.
    /// Positions on symbols with no tick revalue at their last marked price.
    pub fn account_metrics(&self, account_id: &str) -> AccountMetrics {
        let balance = self.ledger.balance(account_id);
        let positions = self.positions.read();

        let mut unrealized = 0.0;
        let mut margin = 0.0;
        let mut open = 0usize;
        for p in positions.values().filter(|p| p.account_id == account_id) {
            let (bid, ask) = match self.view.latest(&p.symbol) {
                Some(t) => (t.bid, t.ask),
                None => (p.current_price, p.current_price),
            };
            unrealized += p.unrealized_pnl(bid, ask);
            margin += p.margin;
            open += 1;
        }

        let equity = balance + unrealized;
        let margin_level = if margin > 0.0 {
            equity / margin * 100.0
        } else {
            f64::INFINITY
        };

        AccountMetrics {
            balance,
            equity,
            margin,
            free_margin: equity - margin,
            margin_level,
            unrealized_pnl: unrealized,
            open_positions: open,
        }
    }

    /// Win rate / profit factor over the account's closed trades.
    pub fn trade_stats(&self, account_id: &str) -> Option<TradeStats> {
        let trades = self.trades.read();
        let closed: Vec<&Trade> = trades.iter().filter(|t| t.account_id == account_id).collect();
        if closed.is_empty() {
            return None;
        }

        let total_trades = closed.len();
        let wins = closed.iter().filter(|t| t.realized_pnl > 0.0).count();
        let total_net_pnl: f64 = closed.iter().map(|t| t.realized_pnl).sum();
        let gross_profit: f64 = closed
            .iter()
            .map(|t| t.realized_pnl)
            .filter(|&pnl| pnl > 0.0)
            .sum();
        let gross_loss: f64 = closed
            .iter()
            .map(|t| t.realized_pnl)
            .filter(|&pnl| pnl < 0.0)
            .map(f64::abs)
            .sum();
        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        Some(TradeStats {
            total_trades,
            win_rate: wins as f64 / total_trades as f64,
            total_net_pnl,
            profit_factor,
        })
    }
}

// ---------------------------------------------------------------------------
// Level validation
// ---------------------------------------------------------------------------

/// BUY: SL strictly below bid, TP strictly above ask. SELL mirrored.
fn validate_levels(
    side: Side,
    sl: Option<f64>,
    tp: Option<f64>,
    bid: f64,
    ask: f64,
) -> Result<(), RejectReason> {
    match side {
        Side::Buy => {
            if let Some(sl) = sl {
                if sl >= bid {
                    return Err(RejectReason::InvalidLevels);
                }
            }
            if let Some(tp) = tp {
                if tp <= ask {
                    return Err(RejectReason::InvalidLevels);
                }
            }
        }
        Side::Sell => {
            if let Some(sl) = sl {
                if sl <= ask {
                    return Err(RejectReason::InvalidLevels);
                }
            }
            if let Some(tp) = tp {
                if tp >= bid {
                    return Err(RejectReason::InvalidLevels);
                }
            }
        }
    }
    Ok(())
}
