// =============================================================================
// Push Hub — authenticated client sessions with throttled, buffered fan-out
// =============================================================================
//
// Owns all client-session state. Each connection is a pair of pumps around a
// bounded outbound queue: the hub pushes serialized frames with `try_send`,
// the connection's write pump drains them onto the socket. A full queue drops
// the new frame for that client (never disconnects) and bumps the client's
// drop counter. Unregistering closes the queue, which is what terminates the
// write pump.
//
// Per-symbol wire throttle: a tick goes out only when the bid moved at least
// `epsilon` (relative) since the last broadcast for that symbol, or the
// heartbeat interval elapsed. Throttled ticks still reached storage and the
// engines — only the wire is elided. Disabled symbols are never broadcast.
//
// On connect each client is seeded with the latest tick of every enabled
// symbol (cold-start snapshot).
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::admin::AdminControl;
use crate::market_data::MarketView;
use crate::order_engine::{AlertKind, EngineEvent, Position, Trade};
use crate::pnl_engine::AccountSnapshot;
use crate::types::MarketTick;

// ---------------------------------------------------------------------------
// Wire frames
// ---------------------------------------------------------------------------

/// Stage of a position's lifecycle carried on `position` frames.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionEventKind {
    Open,
    Modify,
    Close,
}

/// Outbound client messages. Serialized with a `type` tag matching the wire
/// contract: `tick`, `account`, `position`, `alert`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    Tick {
        symbol: String,
        bid: f64,
        ask: f64,
        spread: f64,
        timestamp: i64,
        lp: String,
    },
    Account(AccountSnapshot),
    Position {
        event: PositionEventKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        position: Option<Position>,
        #[serde(skip_serializing_if = "Option::is_none")]
        trade: Option<Trade>,
    },
    Alert {
        kind: AlertKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        account_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        symbol: Option<String>,
        message: String,
        ts: i64,
    },
}

impl OutboundMessage {
    fn tick(tick: &MarketTick) -> Self {
        Self::Tick {
            symbol: tick.symbol.clone(),
            bid: tick.bid,
            ask: tick.ask,
            spread: tick.spread,
            timestamp: tick.timestamp,
            lp: tick.lp.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Client sessions
// ---------------------------------------------------------------------------

struct ClientConn {
    id: u64,
    user_id: String,
    account_id: String,
    tx: mpsc::Sender<String>,
    dropped: AtomicU64,
}

/// Per-client counters for the operational snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub id: u64,
    pub user_id: String,
    pub account_id: String,
    pub dropped_messages: u64,
}

struct ThrottleState {
    last_broadcast_bid: f64,
    last_emit_ms: i64,
}

// ---------------------------------------------------------------------------
// PushHub
// ---------------------------------------------------------------------------

pub struct PushHub {
    view: Arc<MarketView>,
    admin: Arc<AdminControl>,
    clients: Mutex<HashMap<u64, Arc<ClientConn>>>,
    throttle: Mutex<HashMap<String, ThrottleState>>,
    next_client_id: AtomicU64,
    epsilon: f64,
    heartbeat_ms: i64,
    queue_cap: usize,
}

impl PushHub {
    pub fn new(
        view: Arc<MarketView>,
        admin: Arc<AdminControl>,
        epsilon: f64,
        heartbeat_secs: u64,
        queue_cap: usize,
    ) -> Self {
        Self {
            view,
            admin,
            clients: Mutex::new(HashMap::new()),
            throttle: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            epsilon,
            heartbeat_ms: (heartbeat_secs * 1_000) as i64,
            queue_cap,
        }
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Register an authenticated connection. Returns the client id and the
    /// receiving end of its outbound queue, pre-seeded with the latest tick
    /// of every enabled symbol.
    pub fn register(&self, user_id: &str, account_id: &str) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.queue_cap);
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(ClientConn {
            id,
            user_id: user_id.to_string(),
            account_id: account_id.to_string(),
            tx,
            dropped: AtomicU64::new(0),
        });

        // Cold-start snapshot: one tick per enabled symbol.
        let enabled: HashSet<String> = self.admin.enabled_symbols().into_iter().collect();
        for tick in self.view.all_latest() {
            if !enabled.contains(&tick.symbol) {
                continue;
            }
            Self::push_to(&conn, &serialize(&OutboundMessage::tick(&tick)));
        }

        self.clients.lock().insert(id, conn);
        info!(client = id, user = %user_id, account = %account_id, "hub client registered");
        (id, rx)
    }

    /// Drop the client and close its queue, which ends its write pump.
    pub fn unregister(&self, client_id: u64) {
        if self.clients.lock().remove(&client_id).is_some() {
            info!(client = client_id, "hub client unregistered");
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Accounts with at least one live connection.
    pub fn subscribed_accounts(&self) -> HashSet<String> {
        self.clients
            .lock()
            .values()
            .map(|c| c.account_id.clone())
            .collect()
    }

    pub fn client_stats(&self) -> Vec<ClientStats> {
        self.clients
            .lock()
            .values()
            .map(|c| ClientStats {
                id: c.id,
                user_id: c.user_id.clone(),
                account_id: c.account_id.clone(),
                dropped_messages: c.dropped.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Dropped-message count for one client (boundary-behavior checks).
    pub fn dropped_messages(&self, client_id: u64) -> u64 {
        self.clients
            .lock()
            .get(&client_id)
            .map(|c| c.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -------------------------------------------------------------------------
    // Fan-out
    // -------------------------------------------------------------------------

    fn push_to(conn: &ClientConn, frame: &str) {
        match conn.tx.try_send(frame.to_string()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Backpressure: drop the frame for this client only.
                conn.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Writer is gone; unregister will reap the entry.
                debug!(client = conn.id, "push to closed client queue");
            }
        }
    }

    fn send_all(&self, message: &OutboundMessage) {
        let frame = serialize(message);
        for conn in self.clients.lock().values() {
            Self::push_to(conn, &frame);
        }
    }

    fn send_account(&self, account_id: &str, message: &OutboundMessage) {
        let frame = serialize(message);
        for conn in self.clients.lock().values() {
            if conn.account_id == account_id {
                Self::push_to(conn, &frame);
            }
        }
    }

    /// Broadcast a tick, subject to the disabled-symbol gate and the
    /// per-symbol wire throttle. Returns whether the tick hit the wire.
    /// Called synchronously from the market-view update handler.
    pub fn broadcast_tick(&self, tick: &MarketTick) -> bool {
        if !self.admin.is_symbol_enabled(&tick.symbol) {
            return false;
        }

        {
            let mut throttle = self.throttle.lock();
            let state = throttle
                .entry(tick.symbol.clone())
                .or_insert(ThrottleState {
                    last_broadcast_bid: 0.0,
                    last_emit_ms: 0,
                });

            if state.last_broadcast_bid > 0.0 {
                let rel = (tick.bid - state.last_broadcast_bid).abs() / state.last_broadcast_bid;
                let heartbeat_due = tick.timestamp - state.last_emit_ms >= self.heartbeat_ms;
                if rel < self.epsilon && !heartbeat_due {
                    return false;
                }
            }
            state.last_broadcast_bid = tick.bid;
            state.last_emit_ms = tick.timestamp;
        }

        self.send_all(&OutboundMessage::tick(tick));
        true
    }

    /// Deliver an account snapshot to that account's connections.
    pub fn send_account_snapshot(&self, snapshot: &AccountSnapshot) {
        let account_id = snapshot.account_id.clone();
        self.send_account(&account_id, &OutboundMessage::Account(snapshot.clone()));
    }

    pub fn send_position_event(
        &self,
        kind: PositionEventKind,
        account_id: &str,
        position: Option<Position>,
        trade: Option<Trade>,
    ) {
        self.send_account(
            account_id,
            &OutboundMessage::Position {
                event: kind,
                position,
                trade,
            },
        );
    }

    /// Alerts with an account target go to that account; broker-wide alerts
    /// (circuit breakers) go to everyone.
    pub fn send_alert(
        &self,
        kind: AlertKind,
        account_id: Option<&str>,
        symbol: Option<&str>,
        message: &str,
    ) {
        let alert = OutboundMessage::Alert {
            kind,
            account_id: account_id.map(String::from),
            symbol: symbol.map(String::from),
            message: message.to_string(),
            ts: Utc::now().timestamp_millis(),
        };
        match account_id {
            Some(account) => self.send_account(account, &alert),
            None => self.send_all(&alert),
        }
        warn!(kind = ?kind, account = ?account_id, symbol = ?symbol, message, "alert dispatched");
    }
}

/// Forward engine lifecycle events into hub frames. Spawned once at startup;
/// ends when the engine side closes or shutdown is signalled.
pub async fn run_event_pump(
    hub: Arc<PushHub>,
    mut rx: mpsc::Receiver<EngineEvent>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    info!("hub event pump started");
    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(EngineEvent::PositionOpened(position)) => {
                        let account = position.account_id.clone();
                        hub.send_position_event(
                            PositionEventKind::Open,
                            &account,
                            Some(position),
                            None,
                        );
                    }
                    Some(EngineEvent::PositionModified(position)) => {
                        let account = position.account_id.clone();
                        hub.send_position_event(
                            PositionEventKind::Modify,
                            &account,
                            Some(position),
                            None,
                        );
                    }
                    Some(EngineEvent::PositionClosed { trade }) => {
                        let account = trade.account_id.clone();
                        hub.send_position_event(
                            PositionEventKind::Close,
                            &account,
                            None,
                            Some(trade),
                        );
                    }
                    Some(EngineEvent::Alert { kind, account_id, symbol, message }) => {
                        hub.send_alert(kind, account_id.as_deref(), symbol.as_deref(), &message);
                    }
                    None => {
                        info!("engine event stream ended — event pump stopping");
                        return;
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("hub event pump stopped");
                    return;
                }
            }
        }
    }
}

fn serialize(message: &OutboundMessage) -> String {
    serde_json::to_string(message).unwrap_or_else(|e| {
        warn!(error = %e, "failed to serialize outbound frame");
        String::new()
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_config::BrokerConfig;

    fn hub_with_queue(cap: usize) -> (PushHub, Arc<MarketView>, Arc<AdminControl>) {
        let view = Arc::new(MarketView::new());
        let admin = Arc::new(AdminControl::new(&BrokerConfig::default()));
        let hub = PushHub::new(view.clone(), admin.clone(), 1e-6, 5, cap);
        (hub, view, admin)
    }

    fn tick(symbol: &str, bid: f64, ts: i64) -> MarketTick {
        MarketTick::new(symbol, bid, bid + 0.0001, ts, "lp-a")
    }

    #[test]
    fn broadcast_throttle_scenario() {
        // epsilon 1e-6: 1.10000, 1.10000 (throttled), 1.100002 (emitted).
        let (hub, _view, _admin) = hub_with_queue(64);
        let (_id, mut rx) = hub.register("owner:a1", "a1");

        assert!(hub.broadcast_tick(&tick("EURUSD", 1.10000, 1_000)));
        assert!(!hub.broadcast_tick(&tick("EURUSD", 1.10000, 1_100)));
        assert!(hub.broadcast_tick(&tick("EURUSD", 1.100002, 1_200)));

        let mut frames = 0;
        while rx.try_recv().is_ok() {
            frames += 1;
        }
        assert_eq!(frames, 2);
    }

    #[test]
    fn heartbeat_forces_emission() {
        let (hub, _view, _admin) = hub_with_queue(64);
        assert!(hub.broadcast_tick(&tick("EURUSD", 1.10000, 1_000)));
        // Unchanged bid inside the heartbeat window: suppressed.
        assert!(!hub.broadcast_tick(&tick("EURUSD", 1.10000, 2_000)));
        // Unchanged bid but 5 s later: heartbeat forces the emit.
        assert!(hub.broadcast_tick(&tick("EURUSD", 1.10000, 6_100)));
    }

    #[test]
    fn disabled_symbol_not_broadcast() {
        let (hub, _view, admin) = hub_with_queue(64);
        let (_id, mut rx) = hub.register("owner:a1", "a1");
        admin.set_symbol_enabled("EURUSD", false).unwrap();

        assert!(!hub.broadcast_tick(&tick("EURUSD", 1.10000, 1_000)));
        assert!(rx.try_recv().is_err());
        // Other symbols unaffected.
        assert!(hub.broadcast_tick(&tick("GBPUSD", 1.30000, 1_000)));
    }

    #[test]
    fn replay_on_connect_covers_enabled_symbols() {
        let (hub, view, admin) = hub_with_queue(64);
        view.publish(tick("EURUSD", 1.10000, 1_000));
        view.publish(tick("GBPUSD", 1.30000, 1_000));
        view.publish(tick("USDJPY", 155.00, 1_000));
        admin.set_symbol_enabled("USDJPY", false).unwrap();

        let (_id, mut rx) = hub.register("owner:a1", "a1");
        let mut symbols = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(v["type"], "tick");
            symbols.push(v["symbol"].as_str().unwrap().to_string());
        }
        symbols.sort();
        assert_eq!(symbols, vec!["EURUSD", "GBPUSD"]);
    }

    #[test]
    fn full_queue_drops_and_counts_without_disconnect() {
        let (hub, _view, _admin) = hub_with_queue(2);
        let (id, mut rx) = hub.register("owner:a1", "a1");

        assert!(hub.broadcast_tick(&tick("EURUSD", 1.10000, 1_000)));
        assert!(hub.broadcast_tick(&tick("EURUSD", 1.20000, 1_100)));
        // Queue (cap 2) is full now; the next two frames are dropped.
        assert!(hub.broadcast_tick(&tick("EURUSD", 1.30000, 1_200)));
        assert!(hub.broadcast_tick(&tick("EURUSD", 1.40000, 1_300)));

        assert_eq!(hub.dropped_messages(id), 2);
        assert_eq!(hub.client_count(), 1, "client must not be disconnected");

        // Draining shows the first two frames, in order.
        let f1: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        let f2: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(f1["bid"], 1.10000);
        assert_eq!(f2["bid"], 1.20000);
    }

    #[test]
    fn account_frames_route_by_account() {
        let (hub, _view, _admin) = hub_with_queue(64);
        let (_a, mut rx_a) = hub.register("owner:a1", "a1");
        let (_b, mut rx_b) = hub.register("owner:a2", "a2");

        let snapshot = AccountSnapshot {
            account_id: "a1".to_string(),
            balance: 10_000.0,
            equity: 10_000.0,
            margin: 0.0,
            free_margin: 10_000.0,
            margin_level: None,
            unrealized_pnl: 0.0,
            margin_call: false,
            positions: Vec::new(),
            ts: 0,
        };
        hub.send_account_snapshot(&snapshot);

        let frame: serde_json::Value = serde_json::from_str(&rx_a.try_recv().unwrap()).unwrap();
        assert_eq!(frame["type"], "account");
        assert_eq!(frame["account_id"], "a1");
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn alerts_route_by_target() {
        let (hub, _view, _admin) = hub_with_queue(64);
        let (_a, mut rx_a) = hub.register("owner:a1", "a1");
        let (_b, mut rx_b) = hub.register("owner:a2", "a2");

        hub.send_alert(AlertKind::MarginCall, Some("a1"), None, "margin call");
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());

        hub.send_alert(AlertKind::CircuitBreaker, None, Some("EURUSD"), "halted");
        let frame: serde_json::Value = serde_json::from_str(&rx_a.try_recv().unwrap()).unwrap();
        assert_eq!(frame["type"], "alert");
        assert_eq!(frame["kind"], "CIRCUIT_BREAKER");
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn subscribed_accounts_tracks_registrations() {
        let (hub, _view, _admin) = hub_with_queue(64);
        let (id_a, _rx_a) = hub.register("owner:a1", "a1");
        let (_b, _rx_b) = hub.register("owner:a2", "a2");

        let subs = hub.subscribed_accounts();
        assert!(subs.contains("a1") && subs.contains("a2"));

        hub.unregister(id_a);
        assert!(!hub.subscribed_accounts().contains("a1"));
    }
}
