// =============================================================================
// Risk Policy — per-account limits, daily counters, kill switch, circuit breaker
// =============================================================================
//
// Consulted synchronously by the order engine before every fill. Keeps its own
// exposure and position counters, maintained through `record_open` /
// `record_close`, so the pre-trade gate never has to walk the position book.
//
// Daily counters (trade count, realized P&L) reset when the account-local
// date rolls over; each account's limits carry a `utc_offset_minutes` that
// places its midnight. A daily-loss breach auto-activates the account's kill
// switch; the switch stays engaged across the daily reset until an operator
// clears it.
//
// The volatility circuit breaker watches per-symbol prices: a move of at least
// `threshold_pct` within `window_ms` halts the symbol for `cooldown_ms`.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, FixedOffset, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::RejectReason;
use crate::runtime_config::{AccountLimits, VolatilityBreakerConfig};

// ---------------------------------------------------------------------------
// Public snapshot types
// ---------------------------------------------------------------------------

/// Per-account risk snapshot for the state API.
#[derive(Debug, Clone, Serialize)]
pub struct RiskSnapshot {
    pub account_id: String,
    pub daily_pnl: f64,
    pub daily_trades: u32,
    pub exposure: f64,
    pub positions_total: u32,
    pub kill_switch: bool,
    pub current_date: String,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct AccountRisk {
    daily_pnl: f64,
    daily_trades: u32,
    exposure: f64,
    positions_total: u32,
    positions_per_symbol: HashMap<String, u32>,
    killed: bool,
    current_date: String,
}

/// Calendar date at `now` for an account whose midnight sits
/// `utc_offset_minutes` away from UTC. Out-of-range offsets fall back to UTC.
fn local_day(now: DateTime<Utc>, utc_offset_minutes: i32) -> String {
    let offset = FixedOffset::east_opt(utc_offset_minutes.saturating_mul(60))
        .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset is valid"));
    now.with_timezone(&offset).format("%Y-%m-%d").to_string()
}

impl AccountRisk {
    fn new(killed: bool, current_date: String) -> Self {
        Self {
            daily_pnl: 0.0,
            daily_trades: 0,
            exposure: 0.0,
            positions_total: 0,
            positions_per_symbol: HashMap::new(),
            killed,
            current_date,
        }
    }

    fn reset_daily(&mut self, date: &str) {
        self.daily_pnl = 0.0;
        self.daily_trades = 0;
        self.current_date = date.to_string();
        // Exposure and position counts describe live positions and survive
        // the reset; the kill switch requires an operator to clear.
    }
}

struct SymbolBreaker {
    /// (unix ms, price) observations inside the rolling window.
    window: VecDeque<(i64, f64)>,
    halted_until: i64,
}

impl SymbolBreaker {
    fn new() -> Self {
        Self {
            window: VecDeque::new(),
            halted_until: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// RiskPolicy
// ---------------------------------------------------------------------------

pub struct RiskPolicy {
    default_limits: AccountLimits,
    limit_overrides: RwLock<HashMap<String, AccountLimits>>,
    accounts: RwLock<HashMap<String, AccountRisk>>,
    breakers: RwLock<HashMap<String, SymbolBreaker>>,
    breaker_cfg: VolatilityBreakerConfig,
}

impl RiskPolicy {
    pub fn new(default_limits: AccountLimits, breaker_cfg: VolatilityBreakerConfig) -> Self {
        Self {
            default_limits,
            limit_overrides: RwLock::new(HashMap::new()),
            accounts: RwLock::new(HashMap::new()),
            breakers: RwLock::new(HashMap::new()),
            breaker_cfg,
        }
    }

    /// Effective limits for an account (override or default).
    pub fn limits(&self, account_id: &str) -> AccountLimits {
        self.limit_overrides
            .read()
            .get(account_id)
            .cloned()
            .unwrap_or_else(|| self.default_limits.clone())
    }

    pub fn set_limits(&self, account_id: &str, limits: AccountLimits) {
        self.limit_overrides
            .write()
            .insert(account_id.to_string(), limits);
    }

    fn with_account<R>(&self, account_id: &str, f: impl FnOnce(&mut AccountRisk) -> R) -> R {
        let limits = self.limits(account_id);
        let today = local_day(Utc::now(), limits.utc_offset_minutes);
        let mut accounts = self.accounts.write();
        let risk = accounts
            .entry(account_id.to_string())
            .or_insert_with(|| AccountRisk::new(limits.kill_switch_enabled, today.clone()));
        if risk.current_date != today {
            info!(account = %account_id, old = %risk.current_date, new = %today, "account-local date rolled — resetting daily risk counters");
            risk.reset_daily(&today);
        }
        f(risk)
    }

    // -------------------------------------------------------------------------
    // Pre-trade gate
    // -------------------------------------------------------------------------

    /// Check every per-account limit and the symbol circuit breaker. The
    /// caller supplies the notional of the proposed position
    /// (`volume · contract_size · ref_price`).
    pub fn pre_trade_check(
        &self,
        account_id: &str,
        symbol: &str,
        notional: f64,
        now_ms: i64,
    ) -> Result<(), RejectReason> {
        if self.is_symbol_halted(symbol, now_ms) {
            return Err(RejectReason::CircuitBreaker);
        }

        let limits = self.limits(account_id);

        if !limits.allowed_symbols.is_empty()
            && !limits.allowed_symbols.iter().any(|s| s == symbol)
        {
            return Err(RejectReason::RiskLimit(format!(
                "symbol {symbol} not in allowed list"
            )));
        }

        self.with_account(account_id, |risk| {
            if risk.killed {
                return Err(RejectReason::KillSwitch);
            }
            if risk.daily_trades >= limits.max_daily_trades {
                return Err(RejectReason::RiskLimit(format!(
                    "daily trade cap {} reached",
                    limits.max_daily_trades
                )));
            }
            if risk.daily_pnl <= -limits.max_daily_loss {
                return Err(RejectReason::RiskLimit(format!(
                    "daily loss cap {:.2} reached",
                    limits.max_daily_loss
                )));
            }
            if risk.positions_total >= limits.max_positions_total {
                return Err(RejectReason::RiskLimit(format!(
                    "max open positions {} reached",
                    limits.max_positions_total
                )));
            }
            let on_symbol = risk
                .positions_per_symbol
                .get(symbol)
                .copied()
                .unwrap_or(0);
            if on_symbol >= limits.max_positions_per_symbol {
                return Err(RejectReason::RiskLimit(format!(
                    "max positions on {symbol} reached"
                )));
            }
            if risk.exposure + notional > limits.max_total_exposure {
                return Err(RejectReason::RiskLimit(format!(
                    "total exposure cap {:.0} exceeded",
                    limits.max_total_exposure
                )));
            }
            Ok(())
        })
    }

    // -------------------------------------------------------------------------
    // Bookkeeping
    // -------------------------------------------------------------------------

    pub fn record_open(&self, account_id: &str, symbol: &str, notional: f64) {
        self.with_account(account_id, |risk| {
            risk.exposure += notional;
            risk.positions_total += 1;
            *risk
                .positions_per_symbol
                .entry(symbol.to_string())
                .or_insert(0) += 1;
            risk.daily_trades += 1;
            debug!(account = %account_id, symbol = %symbol, exposure = risk.exposure, "risk open recorded");
        });
    }

    /// Record a close. Returns `true` when this close tripped the daily-loss
    /// kill switch, so the caller can emit an alert.
    pub fn record_close(&self, account_id: &str, symbol: &str, notional: f64, pnl: f64) -> bool {
        let max_daily_loss = self.limits(account_id).max_daily_loss;
        self.with_account(account_id, |risk| {
            risk.exposure = (risk.exposure - notional).max(0.0);
            risk.positions_total = risk.positions_total.saturating_sub(1);
            if let Some(count) = risk.positions_per_symbol.get_mut(symbol) {
                *count = count.saturating_sub(1);
            }
            risk.daily_pnl += pnl;

            if !risk.killed && risk.daily_pnl < -max_daily_loss {
                risk.killed = true;
                warn!(
                    account = %account_id,
                    daily_pnl = risk.daily_pnl,
                    max_daily_loss,
                    "daily loss breached — kill switch activated"
                );
                return true;
            }
            false
        })
    }

    // -------------------------------------------------------------------------
    // Kill switch
    // -------------------------------------------------------------------------

    pub fn activate_kill_switch(&self, account_id: &str) {
        self.with_account(account_id, |risk| {
            if !risk.killed {
                risk.killed = true;
                warn!(account = %account_id, "kill switch activated (manual)");
            }
        });
    }

    pub fn deactivate_kill_switch(&self, account_id: &str) {
        self.with_account(account_id, |risk| {
            if risk.killed {
                risk.killed = false;
                info!(account = %account_id, "kill switch deactivated");
            }
        });
    }

    pub fn is_killed(&self, account_id: &str) -> bool {
        self.with_account(account_id, |risk| risk.killed)
    }

    // -------------------------------------------------------------------------
    // Volatility circuit breaker
    // -------------------------------------------------------------------------

    /// Feed a price observation for `symbol`. Returns `true` when this
    /// observation newly halts the symbol.
    pub fn observe_price(&self, symbol: &str, price: f64, now_ms: i64) -> bool {
        if price <= 0.0 {
            return false;
        }
        let mut breakers = self.breakers.write();
        let breaker = breakers
            .entry(symbol.to_string())
            .or_insert_with(SymbolBreaker::new);

        if now_ms < breaker.halted_until {
            return false;
        }

        breaker.window.push_back((now_ms, price));
        while let Some(&(ts, _)) = breaker.window.front() {
            if now_ms - ts > self.breaker_cfg.window_ms {
                breaker.window.pop_front();
            } else {
                break;
            }
        }

        let (mut min, mut max) = (f64::INFINITY, f64::NEG_INFINITY);
        for &(_, p) in &breaker.window {
            min = min.min(p);
            max = max.max(p);
        }
        if min.is_finite() && min > 0.0 {
            let range_pct = (max - min) / min * 100.0;
            if range_pct >= self.breaker_cfg.threshold_pct {
                breaker.halted_until = now_ms + self.breaker_cfg.cooldown_ms;
                breaker.window.clear();
                warn!(
                    symbol = %symbol,
                    range_pct,
                    cooldown_ms = self.breaker_cfg.cooldown_ms,
                    "volatility circuit breaker tripped"
                );
                return true;
            }
        }
        false
    }

    pub fn is_symbol_halted(&self, symbol: &str, now_ms: i64) -> bool {
        self.breakers
            .read()
            .get(symbol)
            .map(|b| now_ms < b.halted_until)
            .unwrap_or(false)
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    pub fn snapshot(&self, account_id: &str) -> RiskSnapshot {
        self.with_account(account_id, |risk| RiskSnapshot {
            account_id: account_id.to_string(),
            daily_pnl: risk.daily_pnl,
            daily_trades: risk.daily_trades,
            exposure: risk.exposure,
            positions_total: risk.positions_total,
            kill_switch: risk.killed,
            current_date: risk.current_date.clone(),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> AccountLimits {
        AccountLimits {
            max_position_size: 1.0,
            max_total_exposure: 500_000.0,
            max_positions_total: 3,
            max_positions_per_symbol: 2,
            max_daily_loss: 100.0,
            max_daily_trades: 5,
            allowed_symbols: Vec::new(),
            leverage: 100.0,
            kill_switch_enabled: false,
            utc_offset_minutes: 0,
        }
    }

    fn breaker_cfg() -> VolatilityBreakerConfig {
        VolatilityBreakerConfig {
            threshold_pct: 1.0,
            window_ms: 10_000,
            cooldown_ms: 60_000,
        }
    }

    fn policy() -> RiskPolicy {
        RiskPolicy::new(limits(), breaker_cfg())
    }

    #[test]
    fn clean_account_passes() {
        let p = policy();
        assert!(p.pre_trade_check("a1", "EURUSD", 110_000.0, 0).is_ok());
    }

    #[test]
    fn kill_switch_blocks() {
        let p = policy();
        p.activate_kill_switch("a1");
        assert_eq!(
            p.pre_trade_check("a1", "EURUSD", 1.0, 0).unwrap_err(),
            RejectReason::KillSwitch
        );
        p.deactivate_kill_switch("a1");
        assert!(p.pre_trade_check("a1", "EURUSD", 1.0, 0).is_ok());
    }

    #[test]
    fn daily_trade_cap_enforced() {
        let p = policy();
        for _ in 0..5 {
            p.record_open("a1", "EURUSD", 0.0);
            p.record_close("a1", "EURUSD", 0.0, 1.0);
        }
        let err = p.pre_trade_check("a1", "EURUSD", 1.0, 0).unwrap_err();
        assert_eq!(err.code(), "RISK_LIMIT");
    }

    #[test]
    fn positions_per_symbol_cap() {
        let p = policy();
        p.record_open("a1", "EURUSD", 1_000.0);
        p.record_open("a1", "EURUSD", 1_000.0);
        let err = p.pre_trade_check("a1", "EURUSD", 1.0, 0).unwrap_err();
        assert_eq!(err.code(), "RISK_LIMIT");
        // Other symbols still fine.
        assert!(p.pre_trade_check("a1", "GBPUSD", 1.0, 0).is_ok());
    }

    #[test]
    fn total_positions_cap() {
        let p = policy();
        p.record_open("a1", "EURUSD", 0.0);
        p.record_open("a1", "GBPUSD", 0.0);
        p.record_open("a1", "USDJPY", 0.0);
        let err = p.pre_trade_check("a1", "XAUUSD", 1.0, 0).unwrap_err();
        assert_eq!(err.code(), "RISK_LIMIT");
    }

    #[test]
    fn exposure_cap_counts_proposed_notional() {
        let p = policy();
        p.record_open("a1", "EURUSD", 400_000.0);
        assert!(p.pre_trade_check("a1", "EURUSD", 90_000.0, 0).is_ok());
        let err = p.pre_trade_check("a1", "EURUSD", 110_000.0, 0).unwrap_err();
        assert_eq!(err.code(), "RISK_LIMIT");
        // Closing releases exposure.
        p.record_close("a1", "EURUSD", 400_000.0, 0.0);
        assert!(p.pre_trade_check("a1", "EURUSD", 110_000.0, 0).is_ok());
    }

    #[test]
    fn daily_loss_breach_activates_kill_switch() {
        let p = policy();
        p.record_open("a1", "EURUSD", 1_000.0);
        let tripped = p.record_close("a1", "EURUSD", 1_000.0, -150.0);
        assert!(tripped);
        assert!(p.is_killed("a1"));
        assert_eq!(
            p.pre_trade_check("a1", "EURUSD", 1.0, 0).unwrap_err(),
            RejectReason::KillSwitch
        );
    }

    #[test]
    fn allowed_symbols_whitelist() {
        let p = policy();
        let mut l = limits();
        l.allowed_symbols = vec!["EURUSD".to_string()];
        p.set_limits("a1", l);
        assert!(p.pre_trade_check("a1", "EURUSD", 1.0, 0).is_ok());
        let err = p.pre_trade_check("a1", "GBPUSD", 1.0, 0).unwrap_err();
        assert_eq!(err.code(), "RISK_LIMIT");
    }

    #[test]
    fn circuit_breaker_trips_and_cools_down() {
        let p = policy();
        assert!(!p.observe_price("EURUSD", 1.1000, 1_000));
        // 1.5% move inside the window trips the 1% threshold.
        assert!(p.observe_price("EURUSD", 1.1165, 2_000));
        assert!(p.is_symbol_halted("EURUSD", 2_001));
        assert_eq!(
            p.pre_trade_check("a1", "EURUSD", 1.0, 2_001).unwrap_err(),
            RejectReason::CircuitBreaker
        );
        // After the cooldown the symbol is tradable again.
        assert!(!p.is_symbol_halted("EURUSD", 62_001));
        assert!(p.pre_trade_check("a1", "EURUSD", 1.0, 62_001).is_ok());
    }

    #[test]
    fn slow_drift_outside_window_does_not_trip() {
        let p = policy();
        assert!(!p.observe_price("EURUSD", 1.1000, 0));
        // Same 1.5% move but 20 s apart: first observation left the window.
        assert!(!p.observe_price("EURUSD", 1.1165, 20_000));
    }

    #[test]
    fn local_day_honors_account_offset() {
        use chrono::TimeZone;
        let late_evening = Utc.with_ymd_and_hms(2026, 7, 31, 23, 30, 0).unwrap();

        // UTC+2 has already crossed midnight; UTC and UTC-5 have not.
        assert_eq!(local_day(late_evening, 120), "2026-08-01");
        assert_eq!(local_day(late_evening, 0), "2026-07-31");
        assert_eq!(local_day(late_evening, -300), "2026-07-31");

        // Just after UTC midnight, a western account is still on yesterday.
        let early_morning = Utc.with_ymd_and_hms(2026, 8, 1, 1, 0, 0).unwrap();
        assert_eq!(local_day(early_morning, -300), "2026-07-31");
        assert_eq!(local_day(early_morning, 0), "2026-08-01");

        // Half-hour offsets land on the right side of midnight too.
        let near_midnight = Utc.with_ymd_and_hms(2026, 8, 1, 23, 45, 0).unwrap();
        assert_eq!(local_day(near_midnight, 30), "2026-08-02");

        // An out-of-range offset falls back to UTC instead of panicking.
        assert_eq!(local_day(early_morning, 100_000), "2026-08-01");
    }

    #[test]
    fn snapshot_reflects_counters() {
        let p = policy();
        p.record_open("a1", "EURUSD", 110_000.0);
        p.record_close("a1", "EURUSD", 110_000.0, -20.0);
        let snap = p.snapshot("a1");
        assert_eq!(snap.daily_trades, 1);
        assert!((snap.daily_pnl + 20.0).abs() < 1e-9);
        assert!(snap.exposure.abs() < 1e-9);
        assert!(!snap.kill_switch);
    }
}
