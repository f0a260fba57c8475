// =============================================================================
// Market View — canonical latest bid/ask per symbol
// =============================================================================
//
// Single-writer (the aggregator task), many-reader. Readers always get a
// snapshot copy. Update handlers are registered once at startup and invoked
// synchronously on the publishing task, so per-symbol publication order is
// observed identically by every subscriber. Handlers must be non-blocking:
// they increment counters or enqueue into bounded channels, nothing else.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::warn;

use crate::types::MarketTick;

pub type UpdateHandler = Box<dyn Fn(&MarketTick) + Send + Sync>;

pub struct MarketView {
    ticks: RwLock<HashMap<String, MarketTick>>,
    handlers: RwLock<Vec<UpdateHandler>>,
    /// Ticks rejected for violating `ask >= bid > 0`.
    rejected: AtomicU64,
}

impl MarketView {
    pub fn new() -> Self {
        Self {
            ticks: RwLock::new(HashMap::new()),
            handlers: RwLock::new(Vec::new()),
            rejected: AtomicU64::new(0),
        }
    }

    /// Register a synchronous update handler. Registration happens during
    /// startup wiring, before the aggregator begins publishing.
    pub fn on_update(&self, handler: UpdateHandler) {
        self.handlers.write().push(handler);
    }

    /// Accept a tick: validate, store as the symbol's current tick, then
    /// notify subscribers in registration order. Returns false when rejected.
    pub fn publish(&self, tick: MarketTick) -> bool {
        if !(tick.bid > 0.0 && tick.ask >= tick.bid) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(symbol = %tick.symbol, bid = tick.bid, ask = tick.ask, "rejecting crossed or non-positive tick");
            return false;
        }

        self.ticks.write().insert(tick.symbol.clone(), tick.clone());

        let handlers = self.handlers.read();
        for handler in handlers.iter() {
            handler(&tick);
        }
        true
    }

    /// Snapshot copy of the current tick for `symbol`.
    pub fn latest(&self, symbol: &str) -> Option<MarketTick> {
        self.ticks.read().get(symbol).cloned()
    }

    /// Latest tick only if it is younger than `max_age_ms` at `now_ms`.
    pub fn latest_within(&self, symbol: &str, max_age_ms: i64, now_ms: i64) -> Option<MarketTick> {
        self.latest(symbol)
            .filter(|t| now_ms - t.timestamp <= max_age_ms)
    }

    /// Snapshot of every symbol's current tick.
    pub fn all_latest(&self) -> Vec<MarketTick> {
        self.ticks.read().values().cloned().collect()
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

impl Default for MarketView {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn publish_then_latest_returns_copy() {
        let view = MarketView::new();
        assert!(view.publish(MarketTick::new("EURUSD", 1.1, 1.1001, 1_000, "lp-a")));
        let t = view.latest("EURUSD").unwrap();
        assert!((t.bid - 1.1).abs() < 1e-12);
        assert!(view.latest("GBPUSD").is_none());
    }

    #[test]
    fn crossed_tick_rejected() {
        let view = MarketView::new();
        assert!(!view.publish(MarketTick::new("EURUSD", 1.2, 1.1, 0, "lp-a")));
        assert!(!view.publish(MarketTick::new("EURUSD", 0.0, 0.0, 0, "lp-a")));
        assert!(view.latest("EURUSD").is_none());
        assert_eq!(view.rejected_count(), 2);
    }

    #[test]
    fn equal_bid_ask_accepted() {
        // ask == bid is legal (zero spread).
        let view = MarketView::new();
        assert!(view.publish(MarketTick::new("EURUSD", 1.1, 1.1, 0, "lp-a")));
    }

    #[test]
    fn handlers_observe_every_accepted_update_in_order() {
        let view = MarketView::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        view.on_update(Box::new(move |t| seen2.lock().push(t.bid)));

        view.publish(MarketTick::new("EURUSD", 1.1, 1.1001, 1, "lp"));
        view.publish(MarketTick::new("EURUSD", 1.2, 1.1, 2, "lp")); // rejected
        view.publish(MarketTick::new("EURUSD", 1.3, 1.3001, 3, "lp"));

        let got = seen.lock().clone();
        assert_eq!(got, vec![1.1, 1.3]);
    }

    #[test]
    fn multiple_handlers_all_invoked() {
        let view = MarketView::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let c = count.clone();
            view.on_update(Box::new(move |_| {
                c.fetch_add(1, Ordering::Relaxed);
            }));
        }
        view.publish(MarketTick::new("EURUSD", 1.1, 1.1001, 1, "lp"));
        assert_eq!(count.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn staleness_filter() {
        let view = MarketView::new();
        view.publish(MarketTick::new("EURUSD", 1.1, 1.1001, 1_000, "lp"));
        assert!(view.latest_within("EURUSD", 5_000, 4_000).is_some());
        assert!(view.latest_within("EURUSD", 5_000, 7_000).is_none());
    }
}
