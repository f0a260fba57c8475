// =============================================================================
// Tick Store — bounded per-symbol ring buffers with async batched persistence
// =============================================================================
//
// `store_tick` is O(1) and never blocks the hot path: the ring insert always
// succeeds, and the persistence queue drops its oldest pending write (with a
// counter increment) when saturated. Persistence is an optimization layer —
// downstream correctness never depends on a tick reaching disk.
//
// Persist throttle: a tick whose bid moved less than `persist_epsilon`
// (relative) since the last persisted tick AND arrived within
// `persist_min_interval_ms` of it is kept in memory only. The ring and the
// latest pointer always update (store-before-throttle).
//
// On-disk layout: `<data_dir>/<SYMBOL>/<YYYY-MM-DD>.jsonl`, one record per
// line, partitioned by UTC date. Recovery reads the newest file per symbol and
// discards unparseable trailing records.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::types::MarketTick;

/// Cap on ticks awaiting the background writer before drop-oldest kicks in.
const PENDING_CAP: usize = 8_192;

/// One OHLC bar aggregated from stored mid prices. Feeds the ATR trailing
/// distance calculation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bar {
    /// Unix ms of the minute boundary.
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

// ---------------------------------------------------------------------------
// Per-symbol ring
// ---------------------------------------------------------------------------

struct SymbolRing {
    ticks: VecDeque<MarketTick>,
    last_persisted_bid: f64,
    last_persisted_ts: i64,
}

impl SymbolRing {
    fn new(capacity: usize) -> Self {
        Self {
            ticks: VecDeque::with_capacity(capacity.min(4_096)),
            last_persisted_bid: 0.0,
            last_persisted_ts: 0,
        }
    }
}

/// Operational counters exposed in state snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct TickStoreStats {
    pub dropped_writes: u64,
    pub disk_errors: u64,
    pub persisted: u64,
}

// ---------------------------------------------------------------------------
// TickStore
// ---------------------------------------------------------------------------

pub struct TickStore {
    rings: RwLock<HashMap<String, Arc<Mutex<SymbolRing>>>>,
    capacity: usize,
    pending: Mutex<VecDeque<MarketTick>>,
    data_dir: Option<PathBuf>,
    persist_epsilon: f64,
    persist_min_interval_ms: i64,
    dropped_writes: AtomicU64,
    disk_errors: AtomicU64,
    persisted: AtomicU64,
}

impl TickStore {
    pub fn new(
        capacity: usize,
        data_dir: Option<PathBuf>,
        persist_epsilon: f64,
        persist_min_interval_ms: i64,
    ) -> Self {
        Self {
            rings: RwLock::new(HashMap::new()),
            capacity,
            pending: Mutex::new(VecDeque::new()),
            data_dir,
            persist_epsilon,
            persist_min_interval_ms,
            dropped_writes: AtomicU64::new(0),
            disk_errors: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
        }
    }

    fn ring(&self, symbol: &str) -> Arc<Mutex<SymbolRing>> {
        if let Some(r) = self.rings.read().get(symbol) {
            return r.clone();
        }
        let mut map = self.rings.write();
        map.entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SymbolRing::new(self.capacity))))
            .clone()
    }

    // -------------------------------------------------------------------------
    // Hot path
    // -------------------------------------------------------------------------

    /// Record a tick. Never blocks; the ring always accepts the tick, the
    /// persistence queue may throttle or drop.
    pub fn store_tick(&self, tick: MarketTick) {
        let ring = self.ring(&tick.symbol);

        let persist = {
            let mut r = ring.lock();

            let persist = self.should_persist(&r, &tick);
            if persist {
                r.last_persisted_bid = tick.bid;
                r.last_persisted_ts = tick.timestamp;
            }

            r.ticks.push_back(tick.clone());
            while r.ticks.len() > self.capacity {
                r.ticks.pop_front();
            }
            persist
        };

        if persist && self.data_dir.is_some() {
            let mut pending = self.pending.lock();
            pending.push_back(tick);
            while pending.len() > PENDING_CAP {
                pending.pop_front();
                self.dropped_writes.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Persist unless the bid barely moved AND the minimum interval has not
    /// elapsed since the last persisted tick.
    fn should_persist(&self, r: &SymbolRing, tick: &MarketTick) -> bool {
        if r.last_persisted_bid <= 0.0 {
            return true;
        }
        let rel_change = (tick.bid - r.last_persisted_bid).abs() / r.last_persisted_bid;
        let elapsed = tick.timestamp - r.last_persisted_ts;
        rel_change >= self.persist_epsilon || elapsed >= self.persist_min_interval_ms
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Most recent tick recorded for `symbol`.
    pub fn latest(&self, symbol: &str) -> Option<MarketTick> {
        self.ring(symbol).lock().ticks.back().cloned()
    }

    /// Number of ticks currently held in memory for `symbol`.
    pub fn len(&self, symbol: &str) -> usize {
        self.ring(symbol).lock().ticks.len()
    }

    /// Ticks in `[from_ts, to_ts]`, time order, capped at `limit`. Partial
    /// results when the ring has already truncated the range.
    pub fn query(&self, symbol: &str, from_ts: i64, to_ts: i64, limit: usize) -> Vec<MarketTick> {
        let ring = self.ring(symbol);
        let r = ring.lock();
        r.ticks
            .iter()
            .filter(|t| t.timestamp >= from_ts && t.timestamp <= to_ts)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Aggregate stored ticks into minute OHLC bars of the mid price, oldest
    /// first, at most `max_bars` (the most recent ones).
    pub fn minute_bars(&self, symbol: &str, max_bars: usize) -> Vec<Bar> {
        let ring = self.ring(symbol);
        let r = ring.lock();

        let mut bars: Vec<Bar> = Vec::new();
        for tick in r.ticks.iter() {
            let bucket = (tick.timestamp / 60_000) * 60_000;
            let mid = tick.mid();
            match bars.last_mut() {
                Some(bar) if bar.open_time == bucket => {
                    bar.high = bar.high.max(mid);
                    bar.low = bar.low.min(mid);
                    bar.close = mid;
                }
                _ => bars.push(Bar {
                    open_time: bucket,
                    open: mid,
                    high: mid,
                    low: mid,
                    close: mid,
                }),
            }
        }

        let skip = bars.len().saturating_sub(max_bars);
        bars.split_off(skip)
    }

    pub fn stats(&self) -> TickStoreStats {
        TickStoreStats {
            dropped_writes: self.dropped_writes.load(Ordering::Relaxed),
            disk_errors: self.disk_errors.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
        }
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Drain the pending queue and append to the per-symbol, per-UTC-date
    /// files. Disk errors are logged and metered, never propagated.
    pub fn flush_pending(&self) {
        let batch: Vec<MarketTick> = {
            let mut pending = self.pending.lock();
            pending.drain(..).collect()
        };
        if batch.is_empty() {
            return;
        }
        let Some(dir) = &self.data_dir else { return };

        // Group by (symbol, date) so each file is opened once per flush.
        let mut grouped: HashMap<(String, String), Vec<&MarketTick>> = HashMap::new();
        for tick in &batch {
            let date = Utc
                .timestamp_millis_opt(tick.timestamp)
                .single()
                .unwrap_or_else(Utc::now)
                .format("%Y-%m-%d")
                .to_string();
            grouped
                .entry((tick.symbol.clone(), date))
                .or_default()
                .push(tick);
        }

        for ((symbol, date), ticks) in grouped {
            let sym_dir = dir.join(&symbol);
            if let Err(e) = std::fs::create_dir_all(&sym_dir) {
                self.disk_errors.fetch_add(1, Ordering::Relaxed);
                warn!(symbol = %symbol, error = %e, "tick dir create failed");
                continue;
            }
            let path = sym_dir.join(format!("{date}.jsonl"));
            let result = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .and_then(|mut f| {
                    for tick in &ticks {
                        let line = serde_json::to_string(tick).unwrap_or_default();
                        writeln!(f, "{line}")?;
                    }
                    Ok(())
                });

            match result {
                Ok(()) => {
                    self.persisted.fetch_add(ticks.len() as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    self.disk_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(symbol = %symbol, error = %e, "tick batch write failed");
                }
            }
        }
    }

    /// Background writer task: flush on a fixed cadence, drain once more on
    /// shutdown.
    pub async fn run_writer(
        self: Arc<Self>,
        flush_interval_ms: u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker =
            tokio::time::interval(tokio::time::Duration::from_millis(flush_interval_ms.max(50)));
        info!(flush_interval_ms, "tick store writer started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_pending();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.flush_pending();
                        info!("tick store writer drained and stopped");
                        return;
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Recovery
    // -------------------------------------------------------------------------

    /// Seed ring buffers from the newest archive file per symbol. Unparseable
    /// trailing records (torn writes) are discarded.
    pub fn load_from_disk(&self) -> usize {
        let Some(dir) = &self.data_dir else { return 0 };
        if !dir.exists() {
            return 0;
        }

        let mut symbols_loaded = 0usize;
        let Ok(entries) = std::fs::read_dir(dir) else {
            return 0;
        };

        for dirent in entries.flatten() {
            let sym_dir = dirent.path();
            if !sym_dir.is_dir() {
                continue;
            }
            let Some(symbol) = sym_dir.file_name().and_then(|s| s.to_str()).map(String::from)
            else {
                continue;
            };

            // Date-named files sort lexicographically; newest is max.
            let newest = std::fs::read_dir(&sym_dir)
                .ok()
                .into_iter()
                .flatten()
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("jsonl"))
                .max();

            let Some(path) = newest else { continue };
            let Ok(content) = std::fs::read_to_string(&path) else {
                self.disk_errors.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            let mut loaded = 0usize;
            {
                let ring = self.ring(&symbol);
                let mut r = ring.lock();
                for line in content.lines() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<MarketTick>(line) {
                        Ok(tick) => {
                            r.last_persisted_bid = tick.bid;
                            r.last_persisted_ts = tick.timestamp;
                            r.ticks.push_back(tick);
                            loaded += 1;
                        }
                        Err(_) => {
                            debug!(symbol = %symbol, "discarding truncated trailing tick record");
                            break;
                        }
                    }
                }
                while r.ticks.len() > self.capacity {
                    r.ticks.pop_front();
                }
            }

            if loaded > 0 {
                symbols_loaded += 1;
                info!(symbol = %symbol, ticks = loaded, file = %path.display(), "tick archive recovered");
            }
        }

        symbols_loaded
    }

    /// True when a recovered or live archive exists for `symbol` — the
    /// precondition for the aggregator's simulation fallback.
    pub fn has_archive(&self, symbol: &str) -> bool {
        self.len(symbol) > 0
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn tick(symbol: &str, bid: f64, ts: i64) -> MarketTick {
        MarketTick::new(symbol, bid, bid + 0.0001, ts, "lp-a")
    }

    fn store() -> TickStore {
        TickStore::new(1_000, None, 1e-6, 250)
    }

    #[test]
    fn ring_keeps_most_recent_up_to_capacity() {
        let s = TickStore::new(3, None, 1e-6, 250);
        for i in 0..5 {
            s.store_tick(tick("EURUSD", 1.1 + i as f64 * 0.001, i));
        }
        assert_eq!(s.len("EURUSD"), 3);
        let latest = s.latest("EURUSD").unwrap();
        assert_eq!(latest.timestamp, 4);
    }

    #[test]
    fn query_returns_time_ordered_range() {
        let s = store();
        for i in 0..10 {
            s.store_tick(tick("EURUSD", 1.1 + i as f64 * 0.001, i * 1_000));
        }
        let result = s.query("EURUSD", 2_000, 6_000, 100);
        assert_eq!(result.len(), 5);
        assert!(result.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let limited = s.query("EURUSD", 0, i64::MAX, 3);
        assert_eq!(limited.len(), 3);
    }

    #[test]
    fn persist_throttle_skips_unchanged_bid_within_interval() {
        let dir = tempfile::tempdir().unwrap();
        let s = TickStore::new(1_000, Some(dir.path().to_path_buf()), 1e-6, 250);

        s.store_tick(tick("EURUSD", 1.10000, 1_000)); // first — persisted
        s.store_tick(tick("EURUSD", 1.10000, 1_100)); // unchanged, 100ms — skipped
        s.store_tick(tick("EURUSD", 1.10100, 1_200)); // big move — persisted
        s.store_tick(tick("EURUSD", 1.10100, 1_500)); // unchanged but 300ms — persisted
        s.flush_pending();

        assert_eq!(s.stats().persisted, 3);
        // Ring still holds everything.
        assert_eq!(s.len("EURUSD"), 4);
    }

    #[test]
    fn flush_and_recover_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();

        {
            let s = TickStore::new(1_000, Some(path.clone()), 1e-6, 250);
            // Timestamps a day apart land in two files.
            s.store_tick(tick("EURUSD", 1.10000, 1_700_000_000_000));
            s.store_tick(tick("EURUSD", 1.10100, 1_700_000_001_000));
            s.store_tick(tick("EURUSD", 1.10200, 1_700_086_400_000));
            s.flush_pending();
        }

        let restored = TickStore::new(1_000, Some(path), 1e-6, 250);
        let loaded = restored.load_from_disk();
        assert_eq!(loaded, 1);
        // Only the newest file seeds the ring.
        assert_eq!(restored.len("EURUSD"), 1);
        let latest = restored.latest("EURUSD").unwrap();
        assert!((latest.bid - 1.10200).abs() < 1e-9);
        assert!(restored.has_archive("EURUSD"));
    }

    #[test]
    fn recovery_discards_torn_trailing_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();

        {
            let s = TickStore::new(1_000, Some(path.clone()), 1e-6, 250);
            s.store_tick(tick("EURUSD", 1.10000, 1_700_000_000_000));
            s.store_tick(tick("EURUSD", 1.10100, 1_700_000_001_000));
            s.flush_pending();
        }

        // Corrupt the trailing record.
        let sym_dir = path.join("EURUSD");
        let file = std::fs::read_dir(&sym_dir)
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let mut content = std::fs::read_to_string(&file).unwrap();
        content.push_str("{\"symbol\":\"EURUSD\",\"bid\":1.1");
        std::fs::write(&file, content).unwrap();

        let restored = TickStore::new(1_000, Some(path), 1e-6, 250);
        restored.load_from_disk();
        assert_eq!(restored.len("EURUSD"), 2);
    }

    #[test]
    fn minute_bars_aggregate_mid_prices() {
        let s = store();
        // Two ticks in minute 0, one in minute 1.
        s.store_tick(MarketTick::new("EURUSD", 1.1000, 1.1002, 10_000, "lp"));
        s.store_tick(MarketTick::new("EURUSD", 1.1010, 1.1012, 20_000, "lp"));
        s.store_tick(MarketTick::new("EURUSD", 1.0990, 1.0992, 70_000, "lp"));

        let bars = s.minute_bars("EURUSD", 10);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].open_time, 0);
        assert!((bars[0].open - 1.1001).abs() < 1e-9);
        assert!((bars[0].close - 1.1011).abs() < 1e-9);
        assert!((bars[0].high - 1.1011).abs() < 1e-9);
        assert!((bars[0].low - 1.1001).abs() < 1e-9);
        assert_eq!(bars[1].open_time, 60_000);
    }

    #[test]
    fn store_never_blocks_on_saturated_pending() {
        let dir = tempfile::tempdir().unwrap();
        let s = TickStore::new(100_000, Some(dir.path().to_path_buf()), 0.0, 0);
        // epsilon 0 / interval 0 persists everything; exceed the pending cap.
        for i in 0..(PENDING_CAP as i64 + 100) {
            s.store_tick(tick("EURUSD", 1.1, i));
        }
        assert_eq!(s.stats().dropped_writes, 100);
        assert_eq!(s.len("EURUSD"), PENDING_CAP + 100);
    }
}
