// =============================================================================
// Shared types used across the Meridian broker core
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of an order or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1.0 for long, -1.0 for short. Multiplies price differences into P&L.
    pub fn direction(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type. Only `Market` reaches the fill path in the B-Book core; the
/// remaining variants exist so pending orders deserialize into a real type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

/// Lifecycle state of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Pending,
    Filled,
    Rejected,
    Canceled,
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    Manual,
    StopLoss,
    TakeProfit,
    TrailingStop,
    StopOut,
    BulkClose,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "MANUAL"),
            Self::StopLoss => write!(f, "STOP_LOSS"),
            Self::TakeProfit => write!(f, "TAKE_PROFIT"),
            Self::TrailingStop => write!(f, "TRAILING_STOP"),
            Self::StopOut => write!(f, "STOP_OUT"),
            Self::BulkClose => write!(f, "BULK_CLOSE"),
        }
    }
}

/// Execution backend. The core fills B-Book against the market view; `ABook`
/// is accepted by the admin plane but LP routing is not wired in this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionMode {
    BBook,
    ABook,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::BBook
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BBook => write!(f, "BBOOK"),
            Self::ABook => write!(f, "ABOOK"),
        }
    }
}

/// Selector for bulk close requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BulkSelector {
    All,
    Winners,
    Losers,
}

// ---------------------------------------------------------------------------
// Market data records
// ---------------------------------------------------------------------------

/// Raw quote emitted by an LP adapter. Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub lp: String,
}

impl Quote {
    /// A quote is usable only when `ask >= bid > 0`.
    pub fn is_valid(&self) -> bool {
        self.bid > 0.0 && self.ask >= self.bid
    }
}

/// Canonical market tick after aggregation: the chosen best bid / best ask,
/// attributed to the LP that supplied the winning bid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketTick {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub spread: f64,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub lp: String,
}

impl MarketTick {
    pub fn new(
        symbol: impl Into<String>,
        bid: f64,
        ask: f64,
        timestamp: i64,
        lp: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            bid,
            ask,
            spread: ask - bid,
            timestamp,
            lp: lp.into(),
        }
    }

    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}
