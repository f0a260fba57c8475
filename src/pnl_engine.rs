// =============================================================================
// P&L Engine — periodic revaluation, margin call latch, stop-out ladder
// =============================================================================
//
// A fixed-cadence task (default 5 Hz) that revalues every account holding
// open positions or watched by a hub subscriber:
//
//   equity       = balance + sum(unrealized P&L)
//   margin       = sum(position margin, fixed at open)
//   margin_level = equity / margin * 100 (undefined when margin is zero)
//
// Below the margin-call level the account is latched in MARGIN_CALL (the
// pre-trade pipeline refuses new opens) and an alert goes out once per
// episode. Below the stop-out level, positions are closed in ascending-profit
// order until the level recovers or the book is flat.
//
// Discipline: snapshot -> decide -> act. No lock is held across closes; each
// stop-out close re-reads fresh metrics before deciding to continue.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::hub::PushHub;
use crate::market_data::MarketView;
use crate::order_engine::{AlertKind, OrderEngine, Position};
use crate::types::CloseReason;

/// Account state pushed to subscribed clients on `account` frames.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub account_id: String,
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub free_margin: f64,
    /// Percent. `None` when no margin is in use (level is unbounded).
    pub margin_level: Option<f64>,
    pub unrealized_pnl: f64,
    pub margin_call: bool,
    pub positions: Vec<Position>,
    pub ts: i64,
}

pub struct PnlEngine {
    engine: Arc<OrderEngine>,
    view: Arc<MarketView>,
    hub: Arc<PushHub>,
    margin_call_level: f64,
    stop_out_level: f64,
    update_hz: u32,
}

impl PnlEngine {
    pub fn new(
        engine: Arc<OrderEngine>,
        view: Arc<MarketView>,
        hub: Arc<PushHub>,
        margin_call_level: f64,
        stop_out_level: f64,
        update_hz: u32,
    ) -> Self {
        Self {
            engine,
            view,
            hub,
            margin_call_level,
            stop_out_level,
            update_hz,
        }
    }

    /// Periodic revaluation loop. Spawned once at startup.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period_ms = 1_000 / self.update_hz.max(1) as u64;
        let mut ticker = tokio::time::interval(tokio::time::Duration::from_millis(period_ms));
        info!(hz = self.update_hz, "P&L engine started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.evaluate_all(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("P&L engine stopped");
                        return;
                    }
                }
            }
        }
    }

    /// One full pass over every account that matters right now.
    pub fn evaluate_all(&self) {
        let mut accounts: HashSet<String> = self.engine.accounts_with_positions();
        accounts.extend(self.hub.subscribed_accounts());

        for account_id in accounts {
            self.evaluate_account(&account_id);
        }
    }

    /// Revalue one account, maintain the margin-call latch, run the stop-out
    /// ladder if needed, and push the resulting snapshot to subscribers.
    pub fn evaluate_account(&self, account_id: &str) {
        let metrics = self.engine.account_metrics(account_id);

        let below_call =
            metrics.margin > 0.0 && metrics.margin_level < self.margin_call_level;
        if below_call {
            if self.engine.set_margin_call(account_id, true) {
                warn!(
                    account = %account_id,
                    margin_level = metrics.margin_level,
                    threshold = self.margin_call_level,
                    "account entered margin call"
                );
                self.hub.send_alert(
                    AlertKind::MarginCall,
                    Some(account_id),
                    None,
                    &format!(
                        "margin level {:.1}% below {:.0}% — new positions blocked",
                        metrics.margin_level, self.margin_call_level
                    ),
                );
            }
        } else if self.engine.set_margin_call(account_id, false) {
            info!(account = %account_id, "margin call cleared");
        }

        if metrics.margin > 0.0 && metrics.margin_level < self.stop_out_level {
            self.stop_out(account_id);
        }

        self.publish_snapshot(account_id);
    }

    /// Close positions in ascending-profit order (worst first) until the
    /// margin level recovers above the stop-out threshold or nothing is left.
    fn stop_out(&self, account_id: &str) {
        loop {
            let metrics = self.engine.account_metrics(account_id);
            if metrics.margin <= 0.0 || metrics.margin_level >= self.stop_out_level {
                return;
            }

            let mut positions = self.engine.account_positions(account_id);
            if positions.is_empty() {
                return;
            }
            positions.sort_by(|a, b| {
                let pnl_a = self.position_pnl(a);
                let pnl_b = self.position_pnl(b);
                pnl_a.partial_cmp(&pnl_b).unwrap_or(std::cmp::Ordering::Equal)
            });

            let victim = &positions[0];
            match self
                .engine
                .close_position_internal(&victim.id, None, CloseReason::StopOut)
            {
                Ok(trade) => {
                    warn!(
                        account = %account_id,
                        position = %victim.id,
                        pnl = trade.realized_pnl,
                        margin_level = metrics.margin_level,
                        "stop-out close"
                    );
                    self.hub.send_alert(
                        AlertKind::StopOut,
                        Some(account_id),
                        Some(&victim.symbol),
                        &format!(
                            "margin level {:.1}% below {:.0}% — position force-closed",
                            metrics.margin_level, self.stop_out_level
                        ),
                    );
                }
                Err(e) => {
                    // NO_PRICE or a racing close; try again next cycle.
                    debug!(account = %account_id, position = %victim.id, error = %e, "stop-out close failed");
                    return;
                }
            }
        }
    }

    fn position_pnl(&self, position: &Position) -> f64 {
        let (bid, ask) = match self.view.latest(&position.symbol) {
            Some(t) => (t.bid, t.ask),
            None => (position.current_price, position.current_price),
        };
        position.unrealized_pnl(bid, ask)
    }

    /// Build the account snapshot and hand it to the hub.
    pub fn publish_snapshot(&self, account_id: &str) {
        let snapshot = self.snapshot(account_id);
        self.hub.send_account_snapshot(&snapshot);
    }

    pub fn snapshot(&self, account_id: &str) -> AccountSnapshot {
        let metrics = self.engine.account_metrics(account_id);
        AccountSnapshot {
            account_id: account_id.to_string(),
            balance: metrics.balance,
            equity: metrics.equity,
            margin: metrics.margin,
            free_margin: metrics.free_margin,
            margin_level: metrics.margin_level.is_finite().then_some(metrics.margin_level),
            unrealized_pnl: metrics.unrealized_pnl,
            margin_call: self.engine.in_margin_call(account_id),
            positions: self.engine.account_positions(account_id),
            ts: Utc::now().timestamp_millis(),
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
    use crate::risk::RiskPolicy;
    use crate::runtime_config::{AccountLimits, BrokerConfig, VolatilityBreakerConfig};
    use crate::types::{MarketTick, Side};
    use tokio::sync::mpsc;

    struct Rig {
        pnl: PnlEngine,
        engine: Arc<OrderEngine>,
        view: Arc<MarketView>,
        ledger: Arc<Ledger>,
        hub: Arc<PushHub>,
    }

    fn rig() -> Rig {
        let view = Arc::new(MarketView::new());
        let ledger = Arc::new(Ledger::new(None));
        let risk = Arc::new(RiskPolicy::new(
            AccountLimits::default(),
            VolatilityBreakerConfig::default(),
        ));
        let admin = Arc::new(AdminControl::new(&BrokerConfig::default()));
        let (tx, _rx) = mpsc::channel(1024);
        let engine = Arc::new(OrderEngine::new(
            view.clone(),
            ledger.clone(),
            risk,
            admin.clone(),
            tx,
            0.0,
            5_000,
            100.0,
        ));
        let hub = Arc::new(PushHub::new(view.clone(), admin, 1e-6, 5, 1024));
        let pnl = PnlEngine::new(engine.clone(), view.clone(), hub.clone(), 100.0, 50.0, 5);
        Rig {
            pnl,
            engine,
            view,
            ledger,
            hub,
        }
    }

    fn publish(view: &MarketView, symbol: &str, bid: f64, ask: f64) {
        view.publish(MarketTick::new(
            symbol,
            bid,
            ask,
            Utc::now().timestamp_millis(),
            "lp-a",
        ));
    }

    #[test]
    fn snapshot_derivation() {
        let r = rig();
        r.ledger.deposit("a1", 10_000.0, None).unwrap();
        publish(&r.view, "EURUSD", 1.10000, 1.10010);
        r.engine
            .place_market_order("a1", "EURUSD", Side::Buy, 0.1, None, None)
            .unwrap();

        publish(&r.view, "EURUSD", 1.10110, 1.10120);
        let snap = r.pnl.snapshot("a1");
        assert!((snap.balance - 10_000.0).abs() < 1e-6);
        // Unrealized: (1.10110 - 1.10010) * 0.1 * 100000 = +10.
        assert!((snap.unrealized_pnl - 10.0).abs() < 1e-6);
        assert!((snap.equity - 10_010.0).abs() < 1e-6);
        assert!((snap.free_margin - (snap.equity - snap.margin)).abs() < 1e-9);
        assert_eq!(snap.positions.len(), 1);
        assert!(!snap.margin_call);
        let level = snap.margin_level.unwrap();
        assert!((level - snap.equity / snap.margin * 100.0).abs() < 1e-6);
    }

    #[test]
    fn flat_account_has_no_margin_level() {
        let r = rig();
        r.ledger.deposit("a1", 1_000.0, None).unwrap();
        let snap = r.pnl.snapshot("a1");
        assert_eq!(snap.margin_level, None);
        assert!((snap.equity - 1_000.0).abs() < 1e-9);
    }

    #[test]
    fn margin_call_latches_and_clears() {
        let r = rig();
        r.ledger.deposit("a1", 1_000.0, None).unwrap();
        publish(&r.view, "EURUSD", 1.09990, 1.10000);
        r.engine
            .place_market_order("a1", "EURUSD", Side::Buy, 0.8, None, None)
            .unwrap();

        // Small dip: equity 960 on margin 880 -> level ~109%, healthy.
        publish(&r.view, "EURUSD", 1.09950, 1.09960);
        r.pnl.evaluate_account("a1");
        assert!(!r.engine.in_margin_call("a1"));

        // Drop: equity 600, level ~68% — margin call, but no stop-out.
        publish(&r.view, "EURUSD", 1.09500, 1.09510);
        r.pnl.evaluate_account("a1");
        assert!(r.engine.in_margin_call("a1"));
        assert_eq!(r.engine.open_position_count(), 1);

        // Recovery clears the latch.
        publish(&r.view, "EURUSD", 1.10100, 1.10110);
        r.pnl.evaluate_account("a1");
        assert!(!r.engine.in_margin_call("a1"));
    }

    #[test]
    fn stop_out_ladder_scenario() {
        // Balance 1000, 0.8 lot at 1.10000 (margin 880), stop-out at 50%.
        let r = rig();
        r.ledger.deposit("a1", 1_000.0, None).unwrap();
        publish(&r.view, "EURUSD", 1.09990, 1.10000);
        let pos = r
            .engine
            .place_market_order("a1", "EURUSD", Side::Buy, 0.8, None, None)
            .unwrap();

        // bid 1.09300: equity = 1000 + (1.09300-1.10000)*0.8*100000 = 440,
        // margin level 440/880 = 50% — at the stop-out boundary.
        publish(&r.view, "EURUSD", 1.09300, 1.09310);
        let metrics = r.engine.account_metrics("a1");
        assert!((metrics.equity - 440.0).abs() < 1e-6);
        assert!(metrics.margin_level <= 50.0 + 1e-9);

        r.pnl.evaluate_account("a1");
        assert!(r.engine.position(&pos.id).is_none(), "stop-out closed it");

        let trades = r.engine.trades("a1", 10);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].reason, CloseReason::StopOut);
        assert!((trades[0].close_price - 1.09300).abs() < 1e-9);
        assert!((r.ledger.balance("a1") - 440.0).abs() < 1e-6);
        assert!(r.ledger.verify("a1"));
    }

    #[test]
    fn no_stop_out_above_threshold() {
        let r = rig();
        r.ledger.deposit("a1", 1_000.0, None).unwrap();
        publish(&r.view, "EURUSD", 1.09990, 1.10000);
        r.engine
            .place_market_order("a1", "EURUSD", Side::Buy, 0.8, None, None)
            .unwrap();

        // bid 1.09500: equity 600, level ~68% >= 50% — no stop-out.
        publish(&r.view, "EURUSD", 1.09500, 1.09510);
        r.pnl.evaluate_account("a1");
        assert_eq!(r.engine.open_position_count(), 1);
    }

    #[test]
    fn stop_out_closes_worst_position_first() {
        let r = rig();
        r.ledger.deposit("a1", 2_000.0, None).unwrap();
        publish(&r.view, "EURUSD", 1.09990, 1.10000);
        publish(&r.view, "GBPUSD", 1.29990, 1.30000);

        let eur = r
            .engine
            .place_market_order("a1", "EURUSD", Side::Buy, 0.5, None, None)
            .unwrap();
        let gbp = r
            .engine
            .place_market_order("a1", "GBPUSD", Side::Buy, 0.5, None, None)
            .unwrap();

        // GBPUSD falls hard (worst), EURUSD falls a little. Combined equity
        // 450 on margin 1200 (~37%) trips the ladder; shedding GBPUSD alone
        // restores ~82%.
        publish(&r.view, "EURUSD", 1.09900, 1.09910);
        publish(&r.view, "GBPUSD", 1.27000, 1.27010);

        r.pnl.evaluate_account("a1");

        // The ladder closes GBPUSD first; the EURUSD position survives
        // because the level recovers above 50% without it.
        assert!(r.engine.position(&gbp.id).is_none());
        assert!(r.engine.position(&eur.id).is_some());
        let trades = r.engine.trades("a1", 10);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].symbol, "GBPUSD");
        assert_eq!(trades[0].reason, CloseReason::StopOut);
    }

    #[test]
    fn snapshot_delivered_to_subscribed_client() {
        let r = rig();
        r.ledger.deposit("a1", 5_000.0, None).unwrap();
        let (_id, mut rx) = r.hub.register("owner:a1", "a1");

        r.pnl.evaluate_account("a1");
        let frame: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame["type"], "account");
        assert_eq!(frame["account_id"], "a1");
        assert_eq!(frame["balance"], 5_000.0);
    }
}
