pub mod trailing;

// =============================================================================
// Position Monitor — tick-driven SL/TP/trailing evaluation
// =============================================================================
//
// A market-view handler forwards accepted ticks into a bounded channel; this
// task drains it and, per tick for symbol S, touches only the open positions
// on S via the engine's symbol index. Work per update is bounded — no task is
// ever spawned per tick, and a saturated channel drops the tick (the next one
// re-evaluates against fresher prices anyway).
//
// Trigger semantics: longs trigger on the bid (SL when bid <= SL, TP when
// bid >= TP), shorts on the ask, mirrored. When two triggers race on one
// position the first close wins; the loser observes ALREADY_CLOSED and
// no-ops.
// =============================================================================

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::errors::RejectReason;
use crate::indicators::atr::{calculate_atr, DEFAULT_ATR_PERIOD};
use crate::market_data::TickStore;
use crate::order_engine::OrderEngine;
use crate::types::MarketTick;

/// Ticks buffered between the market-view handler and the monitor task.
const TICK_CHANNEL_CAP: usize = 4_096;

/// Minute bars fed to the ATR when an ATR trail is active.
const ATR_BAR_WINDOW: usize = 64;

pub fn tick_channel() -> (mpsc::Sender<MarketTick>, mpsc::Receiver<MarketTick>) {
    mpsc::channel(TICK_CHANNEL_CAP)
}

pub struct PositionMonitor {
    engine: Arc<OrderEngine>,
    tick_store: Arc<TickStore>,
}

impl PositionMonitor {
    pub fn new(engine: Arc<OrderEngine>, tick_store: Arc<TickStore>) -> Self {
        Self { engine, tick_store }
    }

    /// Run until shutdown, evaluating every tick pushed by the market view.
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<MarketTick>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("position monitor started");
        loop {
            tokio::select! {
                maybe_tick = rx.recv() => {
                    match maybe_tick {
                        Some(tick) => self.handle_tick(&tick),
                        None => {
                            warn!("tick channel closed — position monitor stopping");
                            return;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("position monitor stopped");
                        return;
                    }
                }
            }
        }
    }

    /// One evaluation pass: mark prices (which advances trails), then close
    /// whatever triggered.
    pub fn handle_tick(&self, tick: &MarketTick) {
        // ATR is only aggregated when an ATR-mode trail is live on the symbol.
        let atr = if self.engine.needs_atr(&tick.symbol) {
            let bars = self.tick_store.minute_bars(&tick.symbol, ATR_BAR_WINDOW);
            calculate_atr(&bars, DEFAULT_ATR_PERIOD)
        } else {
            None
        };

        self.engine.mark_prices(&tick.symbol, tick.bid, tick.ask, atr);

        for (position_id, reason) in self.engine.check_triggers(&tick.symbol, tick.bid, tick.ask) {
            match self
                .engine
                .close_position_internal(&position_id, None, reason)
            {
                Ok(trade) => {
                    info!(
                        id = %position_id,
                        trade = %trade.id,
                        reason = %reason,
                        close_price = trade.close_price,
                        pnl = trade.realized_pnl,
                        "monitor closed position"
                    );
                }
                Err(RejectReason::AlreadyClosed) | Err(RejectReason::NotFound) => {
                    // Lost the race against another trigger.
                    debug!(id = %position_id, "trigger lost race — position already closed");
                }
                Err(e) => {
                    warn!(id = %position_id, error = %e, "monitor close failed");
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::AdminControl;
    use crate::ledger::Ledger;
    use crate::market_data::MarketView;
    use crate::monitor::trailing::{TrailingConfig, TrailingMode};
    use crate::order_engine::EngineEvent;
    use crate::risk::RiskPolicy;
    use crate::runtime_config::{AccountLimits, BrokerConfig, VolatilityBreakerConfig};
    use crate::types::{CloseReason, Side};
    use chrono::Utc;

    struct Rig {
        monitor: PositionMonitor,
        engine: Arc<OrderEngine>,
        view: Arc<MarketView>,
        ledger: Arc<Ledger>,
        _rx: mpsc::Receiver<EngineEvent>,
    }

    fn rig() -> Rig {
        let view = Arc::new(MarketView::new());
        let ledger = Arc::new(Ledger::new(None));
        let tick_store = Arc::new(TickStore::new(10_000, None, 1e-6, 250));
        let risk = Arc::new(RiskPolicy::new(
            AccountLimits::default(),
            VolatilityBreakerConfig::default(),
        ));
        let admin = Arc::new(AdminControl::new(&BrokerConfig::default()));
        let (tx, rx) = mpsc::channel(256);
        let engine = Arc::new(OrderEngine::new(
            view.clone(),
            ledger.clone(),
            risk,
            admin,
            tx,
            0.0,
            5_000,
            100.0,
        ));
        let monitor = PositionMonitor::new(engine.clone(), tick_store);
        Rig {
            monitor,
            engine,
            view,
            ledger,
            _rx: rx,
        }
    }

    fn tick(symbol: &str, bid: f64, ask: f64) -> MarketTick {
        MarketTick::new(symbol, bid, ask, Utc::now().timestamp_millis(), "lp-a")
    }

    fn publish(rig: &Rig, symbol: &str, bid: f64, ask: f64) -> MarketTick {
        let t = tick(symbol, bid, ask);
        rig.view.publish(t.clone());
        t
    }

    #[test]
    fn stop_loss_closes_at_bid() {
        let r = rig();
        r.ledger.deposit("a1", 10_000.0, None).unwrap();
        publish(&r, "EURUSD", 1.10000, 1.10010);

        let pos = r
            .engine
            .place_market_order("a1", "EURUSD", Side::Buy, 0.1, Some(1.09900), None)
            .unwrap();

        let t = publish(&r, "EURUSD", 1.09895, 1.09905);
        r.monitor.handle_tick(&t);

        assert!(r.engine.position(&pos.id).is_none());
        let trades = r.engine.trades("a1", 10);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].reason, CloseReason::StopLoss);
        assert!((trades[0].close_price - 1.09895).abs() < 1e-9);
        // (1.09895 - 1.10010) * 0.1 * 100000 = -11.50
        assert!((trades[0].realized_pnl + 11.50).abs() < 1e-6);
    }

    #[test]
    fn take_profit_closes_long_at_bid() {
        let r = rig();
        r.ledger.deposit("a1", 10_000.0, None).unwrap();
        publish(&r, "EURUSD", 1.10000, 1.10010);
        let pos = r
            .engine
            .place_market_order("a1", "EURUSD", Side::Buy, 0.1, None, Some(1.10100))
            .unwrap();

        let t = publish(&r, "EURUSD", 1.10100, 1.10110);
        r.monitor.handle_tick(&t);

        assert!(r.engine.position(&pos.id).is_none());
        let trades = r.engine.trades("a1", 10);
        assert_eq!(trades[0].reason, CloseReason::TakeProfit);
        assert!((trades[0].realized_pnl - 9.0).abs() < 1e-6);
    }

    #[test]
    fn short_triggers_mirror_on_ask() {
        let r = rig();
        r.ledger.deposit("a1", 10_000.0, None).unwrap();
        publish(&r, "EURUSD", 1.10000, 1.10010);
        let pos = r
            .engine
            .place_market_order("a1", "EURUSD", Side::Sell, 0.1, Some(1.10110), None)
            .unwrap();

        // Ask rises through the stop.
        let t = publish(&r, "EURUSD", 1.10105, 1.10115);
        r.monitor.handle_tick(&t);

        assert!(r.engine.position(&pos.id).is_none());
        let trades = r.engine.trades("a1", 10);
        assert_eq!(trades[0].reason, CloseReason::StopLoss);
        assert!((trades[0].close_price - 1.10115).abs() < 1e-9);
    }

    #[test]
    fn second_trigger_noops_after_close() {
        let r = rig();
        r.ledger.deposit("a1", 10_000.0, None).unwrap();
        publish(&r, "EURUSD", 1.10000, 1.10010);
        r.engine
            .place_market_order("a1", "EURUSD", Side::Buy, 0.1, Some(1.09900), None)
            .unwrap();

        let t = publish(&r, "EURUSD", 1.09895, 1.09905);
        r.monitor.handle_tick(&t);
        // Same trigger price again: the position is gone, nothing breaks.
        r.monitor.handle_tick(&t);

        assert_eq!(r.engine.trades("a1", 10).len(), 1);
        assert!(r.ledger.verify("a1"));
    }

    #[test]
    fn trailing_stop_ratchets_then_triggers() {
        let r = rig();
        r.ledger.deposit("a1", 10_000.0, None).unwrap();
        publish(&r, "EURUSD", 1.10000, 1.10010);
        let pos = r
            .engine
            .place_market_order("a1", "EURUSD", Side::Buy, 0.1, None, None)
            .unwrap();
        r.engine
            .set_trailing(
                &pos.id,
                Some(TrailingConfig {
                    mode: TrailingMode::Fixed,
                    distance: 0.0010,
                    step_size: 0.0,
                    multiplier: 1.0,
                }),
            )
            .unwrap();

        // Rally: high-water 1.1030, stop ratchets to 1.1020.
        let t = publish(&r, "EURUSD", 1.10300, 1.10310);
        r.monitor.handle_tick(&t);
        let live = r.engine.position(&pos.id).unwrap();
        assert!((live.sl.unwrap() - 1.10200).abs() < 1e-9);

        // Retrace above the stop: still open.
        let t = publish(&r, "EURUSD", 1.10250, 1.10260);
        r.monitor.handle_tick(&t);
        assert!(r.engine.position(&pos.id).is_some());

        // Retrace through the stop: closed as TRAILING_STOP.
        let t = publish(&r, "EURUSD", 1.10190, 1.10200);
        r.monitor.handle_tick(&t);
        assert!(r.engine.position(&pos.id).is_none());
        let trades = r.engine.trades("a1", 10);
        assert_eq!(trades[0].reason, CloseReason::TrailingStop);
    }

    #[test]
    fn tick_for_other_symbol_is_ignored() {
        let r = rig();
        r.ledger.deposit("a1", 10_000.0, None).unwrap();
        publish(&r, "EURUSD", 1.10000, 1.10010);
        let pos = r
            .engine
            .place_market_order("a1", "EURUSD", Side::Buy, 0.1, Some(1.09900), None)
            .unwrap();

        // GBPUSD collapse must not touch the EURUSD position.
        let t = publish(&r, "GBPUSD", 1.00000, 1.00010);
        r.monitor.handle_tick(&t);
        assert!(r.engine.position(&pos.id).is_some());
    }
}
