// =============================================================================
// Meridian Broker Core — Main Entry Point
// =============================================================================
//
// Startup order: config, shared state (with ledger + tick-archive recovery),
// market-view subscriber wiring, then the task fleet — one per LP adapter,
// the aggregator, the tick-store writer, the position monitor, the P&L
// engine, the hub event pump, and the API server. Everything observes one
// shutdown signal and drains on Ctrl+C.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod accounts;
mod admin;
mod api;
mod app_state;
mod errors;
mod hub;
mod indicators;
mod ledger;
mod market_data;
mod monitor;
mod order_engine;
mod pnl_engine;
mod risk;
mod runtime_config;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::market_data::{aggregator, lp_stream};
use crate::monitor::{tick_channel, PositionMonitor};
use crate::order_engine::AlertKind;
use crate::runtime_config::BrokerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Meridian Broker Core — starting up");

    let config_path =
        std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "broker_config.json".into());
    let config = BrokerConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        BrokerConfig::default()
    });

    let auth_secret = std::env::var("MERIDIAN_AUTH_SECRET").unwrap_or_else(|_| {
        warn!("MERIDIAN_AUTH_SECRET not set — using an insecure development secret");
        "meridian-dev-secret".to_string()
    });

    info!(
        symbols = config.symbols.len(),
        accounts = config.accounts.len(),
        lps = config.lp_endpoints.len(),
        execution_mode = %config.execution_mode,
        "configuration loaded"
    );

    // ── 2. Build shared state (recovers ledger + tick archive) ───────────
    let (state, engine_events) = AppState::new(config, &auth_secret)?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // ── 3. Market-view subscribers ───────────────────────────────────────
    // Invoked synchronously on the aggregator task, in registration order:
    // storage first, then the wire, then the engines.
    {
        let tick_store = state.tick_store.clone();
        state
            .view
            .on_update(Box::new(move |tick| tick_store.store_tick(tick.clone())));
    }
    {
        let hub = state.hub.clone();
        state.view.on_update(Box::new(move |tick| {
            hub.broadcast_tick(tick);
        }));
    }
    let (monitor_tx, monitor_rx) = tick_channel();
    {
        let tx = monitor_tx.clone();
        state.view.on_update(Box::new(move |tick| {
            if tx.try_send(tick.clone()).is_err() {
                // A saturated monitor re-evaluates against the next tick.
                tracing::trace!(symbol = %tick.symbol, "monitor channel full — tick skipped");
            }
        }));
    }
    {
        let risk = state.risk.clone();
        let hub = state.hub.clone();
        state.view.on_update(Box::new(move |tick| {
            if risk.observe_price(&tick.symbol, tick.mid(), tick.timestamp) {
                hub.send_alert(
                    AlertKind::CircuitBreaker,
                    None,
                    Some(&tick.symbol),
                    "volatility circuit breaker tripped — trading halted",
                );
            }
        }));
    }

    // ── 4. LP adapters + aggregator ──────────────────────────────────────
    let (quote_tx, quote_rx) = aggregator::quote_channel();
    for endpoint in state.config.lp_endpoints.clone() {
        tokio::spawn(lp_stream::run_lp_adapter(
            endpoint,
            quote_tx.clone(),
            shutdown_rx.clone(),
        ));
    }
    if state.config.lp_endpoints.is_empty() {
        warn!("no LP endpoints configured — expecting the simulation fallback");
    }
    // quote_tx stays alive in main so the channel survives adapter restarts
    // (and an empty adapter set, where simulation is the only producer).

    let sim_symbols: Vec<(String, f64)> = state
        .config
        .symbols
        .iter()
        .map(|s| (s.symbol.clone(), s.pip_size))
        .collect();
    tokio::spawn(
        aggregator::Aggregator::new(
            state.view.clone(),
            state.tick_store.clone(),
            state.config.lp_stale_ms,
            state.config.aggregator_heartbeat_ms as i64,
            state.config.simulation_grace_ms,
            sim_symbols,
        )
        .run(quote_rx, shutdown_rx.clone()),
    );

    // ── 5. Background engines ────────────────────────────────────────────
    tokio::spawn(
        state
            .tick_store
            .clone()
            .run_writer(state.config.tick_flush_interval_ms, shutdown_rx.clone()),
    );
    tokio::spawn(
        PositionMonitor::new(state.engine.clone(), state.tick_store.clone())
            .run(monitor_rx, shutdown_rx.clone()),
    );
    tokio::spawn(state.pnl.clone().run(shutdown_rx.clone()));
    tokio::spawn(hub::run_event_pump(
        state.hub.clone(),
        engine_events,
        shutdown_rx.clone(),
    ));

    // ── 6. API server ────────────────────────────────────────────────────
    let bind_addr =
        std::env::var("MERIDIAN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    {
        let app = api::rest::router(state.clone());
        let addr = bind_addr.clone();
        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .expect("failed to bind API server");
            info!(addr = %addr, "API server listening");
            axum::serve(listener, app).await.expect("API server failed");
        });
    }

    info!("all subsystems running — Ctrl+C to stop");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — draining");

    let _ = shutdown_tx.send(true);
    // Give the periodic tasks a beat to observe the signal, then force the
    // last tick batch out.
    tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
    state.tick_store.flush_pending();

    if let Err(e) = state.config.save(&config_path) {
        error!(error = %e, "failed to save broker config on shutdown");
    }

    info!("Meridian Broker Core shut down complete");
    Ok(())
}
