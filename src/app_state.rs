// =============================================================================
// Central Application State — Meridian Broker Core
// =============================================================================
//
// The explicitly-passed context that replaces any notion of process-global
// mutable state: configuration plus the handles of every subsystem, wired in
// dependency order (market view and ledger are leaves; the order engine owns
// the position book; the hub owns client sessions). All cross-component
// communication happens through these handles or through bounded channels.
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use crate::accounts::AccountStore;
use crate::admin::AdminControl;
use crate::hub::PushHub;
use crate::ledger::Ledger;
use crate::market_data::{MarketView, TickStore};
use crate::order_engine::{EngineEvent, OrderEngine};
use crate::pnl_engine::PnlEngine;
use crate::risk::RiskPolicy;
use crate::runtime_config::BrokerConfig;

/// Capacity of the engine -> hub event channel.
const ENGINE_EVENT_CAP: usize = 4_096;

pub struct AppState {
    pub config: BrokerConfig,
    pub accounts: Arc<AccountStore>,
    pub ledger: Arc<Ledger>,
    pub view: Arc<MarketView>,
    pub tick_store: Arc<TickStore>,
    pub risk: Arc<RiskPolicy>,
    pub admin: Arc<AdminControl>,
    pub engine: Arc<OrderEngine>,
    pub hub: Arc<PushHub>,
    pub pnl: Arc<PnlEngine>,
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Build and wire every subsystem. Returns the state and the engine's
    /// event stream (forwarded to the hub by a pump task).
    ///
    /// Recovery order matters: the ledger replays before accounts are seeded
    /// so a restart does not double-apply initial deposits, and the tick
    /// archive seeds the rings before anything reads them.
    pub fn new(
        config: BrokerConfig,
        auth_secret: &str,
    ) -> Result<(Arc<Self>, mpsc::Receiver<EngineEvent>)> {
        // ── Ledger (replay is fatal on corruption) ──────────────────────
        let ledger = Arc::new(Ledger::new(Some(PathBuf::from(&config.ledger_data_dir))));
        let replayed = ledger
            .load_from_disk()
            .context("ledger replay failed — refusing to start on corrupt state")?;
        if replayed > 0 {
            info!(accounts = replayed, "ledger state restored");
        }

        // ── Accounts ────────────────────────────────────────────────────
        let accounts = Arc::new(AccountStore::new(auth_secret));
        for seed in &config.accounts {
            let (_, token) = accounts.register(seed);
            ledger.open_account(&seed.id);
            if ledger.entries(&seed.id, 1).is_empty() && seed.initial_balance > 0.0 {
                ledger
                    .deposit(&seed.id, seed.initial_balance, Some("initial".to_string()))
                    .ok();
            }
            // Demo convenience: the derived token is the account's API
            // credential; surfacing it in the log is how operators hand it out.
            info!(account = %seed.id, token = %token, "account token issued");
        }

        // ── Market data ─────────────────────────────────────────────────
        let view = Arc::new(MarketView::new());
        let tick_store = Arc::new(TickStore::new(
            config.max_ticks_per_symbol,
            Some(PathBuf::from(&config.tick_data_dir)),
            config.persist_epsilon,
            config.persist_min_interval_ms,
        ));
        let recovered = tick_store.load_from_disk();
        if recovered > 0 {
            info!(symbols = recovered, "tick archive recovered");
        }

        // ── Risk / admin ────────────────────────────────────────────────
        let risk = Arc::new(RiskPolicy::new(
            config.default_limits.clone(),
            config.volatility_breaker.clone(),
        ));
        let admin = Arc::new(AdminControl::new(&config));

        // ── Order engine + hub ──────────────────────────────────────────
        let (events_tx, events_rx) = mpsc::channel(ENGINE_EVENT_CAP);
        let engine = Arc::new(OrderEngine::new(
            view.clone(),
            ledger.clone(),
            risk.clone(),
            admin.clone(),
            events_tx,
            config.commission_per_lot,
            config.lp_stale_ms,
            config.margin_call_level,
        ));
        let hub = Arc::new(PushHub::new(
            view.clone(),
            admin.clone(),
            config.broadcast_epsilon,
            config.hub_heartbeat_secs,
            config.client_outbound_queue,
        ));
        let pnl = Arc::new(PnlEngine::new(
            engine.clone(),
            view.clone(),
            hub.clone(),
            config.margin_call_level,
            config.stop_out_level,
            config.pnl_update_hz,
        ));

        let state = Arc::new(Self {
            config,
            accounts,
            ledger,
            view,
            tick_store,
            risk,
            admin,
            engine,
            hub,
            pnl,
            start_time: std::time::Instant::now(),
        });
        Ok((state, events_rx))
    }

    /// Operational snapshot for the admin `GET /api/v1/state` endpoint.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let accounts = self
            .accounts
            .ids()
            .into_iter()
            .map(|id| {
                let metrics = self.engine.account_metrics(&id);
                AccountStateView {
                    account_id: id.clone(),
                    balance: metrics.balance,
                    equity: metrics.equity,
                    margin: metrics.margin,
                    open_positions: metrics.open_positions,
                    margin_call: self.engine.in_margin_call(&id),
                    risk: self.risk.snapshot(&id),
                }
            })
            .collect();

        StateSnapshot {
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            execution_mode: self.admin.execution_mode().to_string(),
            symbols: self.admin.symbols(),
            market: self.view.all_latest(),
            tick_store: self.tick_store.stats(),
            open_positions: self.engine.open_position_count(),
            accounts,
            hub_clients: self.hub.client_stats(),
        }
    }
}

/// Admin-facing operational snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub server_time: i64,
    pub uptime_secs: u64,
    pub execution_mode: String,
    pub symbols: Vec<crate::runtime_config::SymbolSpec>,
    pub market: Vec<crate::types::MarketTick>,
    pub tick_store: crate::market_data::tick_store::TickStoreStats,
    pub open_positions: usize,
    pub accounts: Vec<AccountStateView>,
    pub hub_clients: Vec<crate::hub::ClientStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountStateView {
    pub account_id: String,
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub open_positions: usize,
    pub margin_call: bool,
    pub risk: crate::risk::RiskSnapshot,
}
