// =============================================================================
// LP Aggregator — merges per-LP quote streams into one market tick feed
// =============================================================================
//
// For each symbol the freshest quote from every LP is retained; quotes older
// than the staleness window are excluded from selection. Best bid is the
// maximum bid over fresh quotes, best ask the minimum ask; the tick is
// attributed to the LP that supplied the winning bid. A merged tick is
// re-emitted when either side changes or the heartbeat elapses.
//
// Simulation fallback: when no real LP quote has arrived within the startup
// grace window and a tick archive exists, archived ticks are replayed in
// stored order with a ±2 pip perturbation until the first real quote arrives,
// which ends simulation permanently.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::market_data::market_view::MarketView;
use crate::market_data::tick_store::TickStore;
use crate::types::{MarketTick, Quote};

/// Capacity of the shared LP → aggregator quote channel.
const QUOTE_CHANNEL_CAP: usize = 4_096;

/// Cadence of simulated tick emission per symbol.
const SIM_TICK_INTERVAL_MS: u64 = 200;

pub fn quote_channel() -> (mpsc::Sender<Quote>, mpsc::Receiver<Quote>) {
    mpsc::channel(QUOTE_CHANNEL_CAP)
}

// ---------------------------------------------------------------------------
// Per-symbol aggregation state
// ---------------------------------------------------------------------------

struct SymbolAgg {
    /// Freshest quote per LP id.
    quotes: HashMap<String, Quote>,
    last_emitted: Option<(f64, f64)>,
    last_emit_at: i64,
}

impl SymbolAgg {
    fn new() -> Self {
        Self {
            quotes: HashMap::new(),
            last_emitted: None,
            last_emit_at: 0,
        }
    }
}

/// Best-of-book selection over the fresh quotes of one symbol.
struct Best {
    bid: f64,
    ask: f64,
    lp: String,
}

// ---------------------------------------------------------------------------
// AggregatorCore — synchronous aggregation logic (drives the async task)
// ---------------------------------------------------------------------------

pub struct AggregatorCore {
    state: Mutex<HashMap<String, SymbolAgg>>,
    stale_ms: i64,
    heartbeat_ms: i64,
    pub invalid_quotes: AtomicU64,
}

impl AggregatorCore {
    pub fn new(stale_ms: i64, heartbeat_ms: i64) -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            stale_ms,
            heartbeat_ms,
            invalid_quotes: AtomicU64::new(0),
        }
    }

    /// Ingest one LP quote; returns a merged tick when it should be emitted.
    pub fn apply_quote(&self, quote: Quote, now_ms: i64) -> Option<MarketTick> {
        if !quote.is_valid() {
            self.invalid_quotes.fetch_add(1, Ordering::Relaxed);
            warn!(symbol = %quote.symbol, lp = %quote.lp, bid = quote.bid, ask = quote.ask, "dropping invalid LP quote");
            return None;
        }

        let mut state = self.state.lock();
        let agg = state
            .entry(quote.symbol.clone())
            .or_insert_with(SymbolAgg::new);
        let symbol = quote.symbol.clone();
        agg.quotes.insert(quote.lp.clone(), quote);

        let best = Self::select_best(agg, self.stale_ms, now_ms)?;

        let changed = agg.last_emitted != Some((best.bid, best.ask));
        let heartbeat_due = now_ms - agg.last_emit_at >= self.heartbeat_ms;
        if !changed && !heartbeat_due {
            return None;
        }

        agg.last_emitted = Some((best.bid, best.ask));
        agg.last_emit_at = now_ms;
        Some(MarketTick::new(symbol, best.bid, best.ask, now_ms, best.lp))
    }

    /// Heartbeat pass: re-emit any symbol whose last emission is older than
    /// the heartbeat interval and which still has fresh quotes.
    pub fn heartbeat(&self, now_ms: i64) -> Vec<MarketTick> {
        let mut out = Vec::new();
        let mut state = self.state.lock();
        for (symbol, agg) in state.iter_mut() {
            if now_ms - agg.last_emit_at < self.heartbeat_ms {
                continue;
            }
            if let Some(best) = Self::select_best(agg, self.stale_ms, now_ms) {
                agg.last_emitted = Some((best.bid, best.ask));
                agg.last_emit_at = now_ms;
                out.push(MarketTick::new(
                    symbol.clone(),
                    best.bid,
                    best.ask,
                    now_ms,
                    best.lp,
                ));
            }
        }
        out
    }

    fn select_best(agg: &SymbolAgg, stale_ms: i64, now_ms: i64) -> Option<Best> {
        let mut best: Option<Best> = None;
        let mut best_ask = f64::INFINITY;

        for q in agg.quotes.values() {
            if now_ms - q.timestamp > stale_ms {
                continue;
            }
            best_ask = best_ask.min(q.ask);
            match &best {
                Some(b) if q.bid <= b.bid => {}
                _ => {
                    best = Some(Best {
                        bid: q.bid,
                        ask: 0.0,
                        lp: q.lp.clone(),
                    });
                }
            }
        }

        let mut b = best?;
        b.ask = best_ask;
        // Per-LP quotes are individually uncrossed, but the composite can
        // cross when one LP bids above another's offer. Such books are not
        // publishable.
        if b.ask < b.bid {
            return None;
        }
        Some(b)
    }
}

// ---------------------------------------------------------------------------
// Aggregator task
// ---------------------------------------------------------------------------

pub struct Aggregator {
    core: AggregatorCore,
    view: Arc<MarketView>,
    tick_store: Arc<TickStore>,
    /// (symbol, pip_size) pairs for simulation perturbation.
    sim_symbols: Vec<(String, f64)>,
    simulation_grace_ms: u64,
}

impl Aggregator {
    pub fn new(
        view: Arc<MarketView>,
        tick_store: Arc<TickStore>,
        stale_ms: i64,
        heartbeat_ms: i64,
        simulation_grace_ms: u64,
        sim_symbols: Vec<(String, f64)>,
    ) -> Self {
        Self {
            core: AggregatorCore::new(stale_ms, heartbeat_ms),
            view,
            tick_store,
            sim_symbols,
            simulation_grace_ms,
        }
    }

    /// Run the aggregation loop until shutdown. Consumes the merged LP quote
    /// channel and publishes ticks into the market view.
    pub async fn run(self, mut rx: mpsc::Receiver<Quote>, mut shutdown: watch::Receiver<bool>) {
        info!("aggregator started");

        // ── Startup grace: wait for the first real quote ────────────────
        let first = tokio::select! {
            q = tokio::time::timeout(
                tokio::time::Duration::from_millis(self.simulation_grace_ms),
                rx.recv(),
            ) => q,
            _ = shutdown.changed() => return,
        };

        match first {
            Ok(Some(quote)) => {
                self.ingest(quote);
            }
            Ok(None) => {
                warn!("quote channel closed before first quote");
                return;
            }
            Err(_) => {
                // Grace expired with no live LP.
                if let Some(quote) = self.run_simulation(&mut rx, &mut shutdown).await {
                    self.ingest(quote);
                } else {
                    return; // shutdown during simulation
                }
            }
        }

        // ── Live loop ───────────────────────────────────────────────────
        let mut heartbeat = tokio::time::interval(tokio::time::Duration::from_millis(
            (self.core.heartbeat_ms as u64).max(100),
        ));
        loop {
            tokio::select! {
                maybe_quote = rx.recv() => {
                    match maybe_quote {
                        Some(quote) => self.ingest(quote),
                        None => {
                            warn!("all LP adapters gone — aggregator stopping");
                            return;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    let now = Utc::now().timestamp_millis();
                    for tick in self.core.heartbeat(now) {
                        self.view.publish(tick);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("aggregator stopped");
                        return;
                    }
                }
            }
        }
    }

    fn ingest(&self, quote: Quote) {
        let now = Utc::now().timestamp_millis();
        if let Some(tick) = self.core.apply_quote(quote, now) {
            self.view.publish(tick);
        }
    }

    /// Replay archived ticks with a small random perturbation until a real
    /// quote arrives (returned to the caller) or shutdown. Returns `None` on
    /// shutdown, or immediately when no archive exists.
    async fn run_simulation(
        &self,
        rx: &mut mpsc::Receiver<Quote>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Quote> {
        let mut sources: Vec<(String, f64, Vec<MarketTick>, usize)> = self
            .sim_symbols
            .iter()
            .filter(|(sym, _)| self.tick_store.has_archive(sym))
            .map(|(sym, pip)| {
                let ticks = self.tick_store.query(sym, 0, i64::MAX, usize::MAX);
                (sym.clone(), *pip, ticks, 0usize)
            })
            .collect();

        if sources.is_empty() {
            warn!(
                grace_ms = self.simulation_grace_ms,
                "no LP quotes and no tick archive — waiting for live data"
            );
            // Nothing to replay; block until a real quote or shutdown.
            loop {
                tokio::select! {
                    q = rx.recv() => return q,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { return None; }
                    }
                }
            }
        }

        info!(
            symbols = sources.len(),
            "entering simulation mode — replaying tick archive with perturbation"
        );

        let mut ticker =
            tokio::time::interval(tokio::time::Duration::from_millis(SIM_TICK_INTERVAL_MS));
        loop {
            tokio::select! {
                q = rx.recv() => {
                    match q {
                        Some(quote) => {
                            info!(lp = %quote.lp, "live LP quote received — leaving simulation mode");
                            return Some(quote);
                        }
                        None => return None,
                    }
                }
                _ = ticker.tick() => {
                    let now = Utc::now().timestamp_millis();
                    let mut rng = rand::thread_rng();
                    for (symbol, pip, ticks, idx) in sources.iter_mut() {
                        let template = &ticks[*idx % ticks.len()];
                        *idx += 1;
                        // Perturb the replayed price by up to ±2 pips,
                        // preserving the recorded spread.
                        let noise = rng.gen_range(-2.0..=2.0) * *pip;
                        let bid = (template.bid + noise).max(*pip);
                        let ask = bid + template.spread.max(0.0);
                        let tick = MarketTick::new(symbol.clone(), bid, ask, now, "SIM");
                        debug!(symbol = %symbol, bid, ask, "simulated tick");
                        self.view.publish(tick);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { return None; }
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

    fn quote(lp: &str, symbol: &str, bid: f64, ask: f64, ts: i64) -> Quote {
        Quote {
            symbol: symbol.into(),
            bid,
            ask,
            timestamp: ts,
            lp: lp.into(),
        }
    }

    fn core() -> AggregatorCore {
        AggregatorCore::new(5_000, 1_000)
    }

    #[test]
    fn best_bid_and_ask_selected_across_lps() {
        let c = core();
        // Scenario: LP A (1.10000 / 1.10010), LP B (1.10005 / 1.10015).
        let t1 = c.apply_quote(quote("A", "EURUSD", 1.10000, 1.10010, 1_000), 1_000);
        assert!(t1.is_some());

        let t2 = c
            .apply_quote(quote("B", "EURUSD", 1.10005, 1.10015, 1_100), 1_100)
            .unwrap();
        assert!((t2.bid - 1.10005).abs() < 1e-9, "best bid from B");
        assert!((t2.ask - 1.10010).abs() < 1e-9, "best ask from A");
        assert_eq!(t2.lp, "B");
    }

    #[test]
    fn unchanged_best_not_reemitted_before_heartbeat() {
        let c = core();
        c.apply_quote(quote("A", "EURUSD", 1.1, 1.1001, 1_000), 1_000)
            .unwrap();
        // Same prices from the same LP shortly after: no emission.
        assert!(c
            .apply_quote(quote("A", "EURUSD", 1.1, 1.1001, 1_200), 1_200)
            .is_none());
        // But after the heartbeat interval it re-emits.
        assert!(c
            .apply_quote(quote("A", "EURUSD", 1.1, 1.1001, 2_500), 2_500)
            .is_some());
    }

    #[test]
    fn stale_lp_excluded_from_selection() {
        let c = core();
        c.apply_quote(quote("A", "EURUSD", 1.10050, 1.10060, 1_000), 1_000)
            .unwrap();
        // 6 s later A is stale; B alone defines the book.
        let t = c
            .apply_quote(quote("B", "EURUSD", 1.10000, 1.10010, 7_000), 7_000)
            .unwrap();
        assert!((t.bid - 1.10000).abs() < 1e-9);
        assert!((t.ask - 1.10010).abs() < 1e-9);
        assert_eq!(t.lp, "B");
    }

    #[test]
    fn invalid_quote_dropped_and_counted() {
        let c = core();
        assert!(c
            .apply_quote(quote("A", "EURUSD", 1.2, 1.1, 1_000), 1_000)
            .is_none());
        assert!(c
            .apply_quote(quote("A", "EURUSD", -1.0, 1.0, 1_000), 1_000)
            .is_none());
        assert_eq!(c.invalid_quotes.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn crossed_composite_book_not_published() {
        let c = core();
        c.apply_quote(quote("A", "EURUSD", 1.1000, 1.1001, 1_000), 1_000)
            .unwrap();
        // B bids above A's offer: composite would be crossed.
        assert!(c
            .apply_quote(quote("B", "EURUSD", 1.1002, 1.1003, 1_100), 1_100)
            .is_none());
    }

    #[test]
    fn heartbeat_reemits_fresh_symbols_only() {
        let c = core();
        c.apply_quote(quote("A", "EURUSD", 1.1, 1.1001, 1_000), 1_000)
            .unwrap();
        c.apply_quote(quote("A", "USDJPY", 155.0, 155.01, 1_000), 1_000)
            .unwrap();

        // Before the interval: nothing due.
        assert!(c.heartbeat(1_500).is_empty());

        // After the interval both re-emit.
        let beats = c.heartbeat(2_100);
        assert_eq!(beats.len(), 2);

        // Once every quote is stale, heartbeats stop.
        let beats = c.heartbeat(20_000);
        assert!(beats.is_empty());
    }

    #[test]
    fn lp_comeback_rejoins_selection() {
        let c = core();
        c.apply_quote(quote("A", "EURUSD", 1.10050, 1.10060, 1_000), 1_000)
            .unwrap();
        c.apply_quote(quote("B", "EURUSD", 1.10000, 1.10010, 7_000), 7_000)
            .unwrap();
        // A returns with the strongest bid (inside B's offer).
        let t = c
            .apply_quote(quote("A", "EURUSD", 1.10004, 1.10014, 7_500), 7_500)
            .unwrap();
        assert!((t.bid - 1.10004).abs() < 1e-9);
        assert!((t.ask - 1.10010).abs() < 1e-9);
        assert_eq!(t.lp, "A");
    }
}
