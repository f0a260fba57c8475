// =============================================================================
// Broker Configuration — runtime settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian broker core. Every tunable lives
// here so the process can be reconfigured without a rebuild.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::ExecutionMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_max_ticks_per_symbol() -> usize {
    100_000
}

fn default_broadcast_epsilon() -> f64 {
    1e-6
}

fn default_client_outbound_queue() -> usize {
    1024
}

fn default_pnl_update_hz() -> u32 {
    5
}

fn default_margin_call_level() -> f64 {
    100.0
}

fn default_stop_out_level() -> f64 {
    50.0
}

fn default_lp_stale_ms() -> i64 {
    5_000
}

fn default_simulation_grace_ms() -> u64 {
    30_000
}

fn default_aggregator_heartbeat_ms() -> u64 {
    1_000
}

fn default_hub_heartbeat_secs() -> u64 {
    5
}

fn default_persist_epsilon() -> f64 {
    1e-6
}

fn default_persist_min_interval_ms() -> i64 {
    250
}

fn default_tick_flush_interval_ms() -> u64 {
    500
}

fn default_tick_data_dir() -> String {
    "data/ticks".to_string()
}

fn default_ledger_data_dir() -> String {
    "data/ledger".to_string()
}

fn default_symbol_specs() -> Vec<SymbolSpec> {
    ["EURUSD", "GBPUSD", "USDJPY", "XAUUSD", "US30"]
        .iter()
        .map(|s| SymbolSpec::with_defaults(s))
        .collect()
}

fn default_accounts() -> Vec<AccountSeed> {
    vec![AccountSeed {
        id: "acc-demo".to_string(),
        name: "Demo Account".to_string(),
        initial_balance: 10_000.0,
    }]
}

fn default_contract_size() -> f64 {
    100_000.0
}

fn default_min_volume() -> f64 {
    0.01
}

fn default_volume_step() -> f64 {
    0.01
}

fn default_margin_rate() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

fn default_leverage() -> f64 {
    100.0
}

fn default_max_position_size() -> f64 {
    10.0
}

fn default_max_total_exposure() -> f64 {
    10_000_000.0
}

fn default_max_positions_total() -> u32 {
    50
}

fn default_max_positions_per_symbol() -> u32 {
    10
}

fn default_max_daily_loss() -> f64 {
    1_000.0
}

fn default_max_daily_trades() -> u32 {
    200
}

fn default_breaker_threshold_pct() -> f64 {
    2.0
}

fn default_breaker_window_ms() -> i64 {
    10_000
}

fn default_breaker_cooldown_ms() -> i64 {
    60_000
}

fn default_poll_ms() -> u64 {
    1_000
}

// =============================================================================
// Symbol specification
// =============================================================================

/// Static contract terms for one tradable symbol. Immutable at runtime except
/// `enabled` and `margin_rate`, which the admin plane may change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub symbol: String,
    pub pip_size: f64,
    pub digits: u32,
    #[serde(default = "default_contract_size")]
    pub contract_size: f64,
    #[serde(default = "default_min_volume")]
    pub min_volume: f64,
    #[serde(default = "default_volume_step")]
    pub volume_step: f64,
    #[serde(default = "default_margin_rate")]
    pub margin_rate: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl SymbolSpec {
    /// Build a spec with pip size and digits inferred from the symbol class.
    pub fn with_defaults(symbol: &str) -> Self {
        let (pip_size, digits) = infer_pip_size(symbol);
        Self {
            symbol: symbol.to_string(),
            pip_size,
            digits,
            contract_size: default_contract_size(),
            min_volume: default_min_volume(),
            volume_step: default_volume_step(),
            margin_rate: default_margin_rate(),
            enabled: true,
        }
    }
}

/// Infer `(pip_size, digits)` from symbol naming conventions:
/// JPY-quoted pairs 0.01, metals 0.1, six-letter FX 0.0001, indices 1.0.
pub fn infer_pip_size(symbol: &str) -> (f64, u32) {
    let upper = symbol.to_uppercase();
    if upper.ends_with("JPY") {
        (0.01, 3)
    } else if upper.starts_with("XAU") || upper.starts_with("XAG") {
        (0.1, 2)
    } else if upper.len() == 6 && upper.chars().all(|c| c.is_ascii_alphabetic()) {
        (0.0001, 5)
    } else {
        (1.0, 1)
    }
}

// =============================================================================
// Per-account limits
// =============================================================================

/// Risk limits applied per account by the pre-trade pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountLimits {
    /// Maximum volume (lots) of a single position.
    #[serde(default = "default_max_position_size")]
    pub max_position_size: f64,

    /// Cap on total notional exposure across all open positions.
    #[serde(default = "default_max_total_exposure")]
    pub max_total_exposure: f64,

    #[serde(default = "default_max_positions_total")]
    pub max_positions_total: u32,

    #[serde(default = "default_max_positions_per_symbol")]
    pub max_positions_per_symbol: u32,

    /// Realized daily loss (account currency) that trips the kill switch.
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: f64,

    #[serde(default = "default_max_daily_trades")]
    pub max_daily_trades: u32,

    /// Empty means every configured symbol is allowed.
    #[serde(default)]
    pub allowed_symbols: Vec<String>,

    #[serde(default = "default_leverage")]
    pub leverage: f64,

    /// When true the account starts with its kill switch engaged.
    #[serde(default)]
    pub kill_switch_enabled: bool,

    /// Offset of the account's local midnight from UTC, in minutes. Daily
    /// risk counters reset when the account-local date rolls over.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl Default for AccountLimits {
    fn default() -> Self {
        Self {
            max_position_size: default_max_position_size(),
            max_total_exposure: default_max_total_exposure(),
            max_positions_total: default_max_positions_total(),
            max_positions_per_symbol: default_max_positions_per_symbol(),
            max_daily_loss: default_max_daily_loss(),
            max_daily_trades: default_max_daily_trades(),
            allowed_symbols: Vec::new(),
            leverage: default_leverage(),
            kill_switch_enabled: false,
            utc_offset_minutes: 0,
        }
    }
}

// =============================================================================
// Volatility circuit breaker
// =============================================================================

/// Per-symbol halt rule: a move of `threshold_pct` within `window_ms` halts
/// trading on that symbol for `cooldown_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolatilityBreakerConfig {
    #[serde(default = "default_breaker_threshold_pct")]
    pub threshold_pct: f64,
    #[serde(default = "default_breaker_window_ms")]
    pub window_ms: i64,
    #[serde(default = "default_breaker_cooldown_ms")]
    pub cooldown_ms: i64,
}

impl Default for VolatilityBreakerConfig {
    fn default() -> Self {
        Self {
            threshold_pct: default_breaker_threshold_pct(),
            window_ms: default_breaker_window_ms(),
            cooldown_ms: default_breaker_cooldown_ms(),
        }
    }
}

// =============================================================================
// LP endpoints
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LpTransport {
    Websocket,
    Rest,
}

/// One configured liquidity provider feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LpEndpoint {
    pub id: String,
    pub transport: LpTransport,
    pub url: String,
    /// Poll cadence for REST transports; ignored for websockets.
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
}

// =============================================================================
// Account seeds
// =============================================================================

/// Account created (with an initial deposit) on first startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSeed {
    pub id: String,
    pub name: String,
    pub initial_balance: f64,
}

// =============================================================================
// BrokerConfig
// =============================================================================

/// Top-level runtime configuration for the broker core.
///
/// Every field has a serde default so that older JSON files missing new fields
/// still deserialize correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    // --- Execution -----------------------------------------------------------
    #[serde(default)]
    pub execution_mode: ExecutionMode,

    // --- Symbols & accounts --------------------------------------------------
    #[serde(default = "default_symbol_specs")]
    pub symbols: Vec<SymbolSpec>,

    #[serde(default = "default_accounts")]
    pub accounts: Vec<AccountSeed>,

    #[serde(default)]
    pub default_limits: AccountLimits,

    // --- Liquidity providers -------------------------------------------------
    #[serde(default)]
    pub lp_endpoints: Vec<LpEndpoint>,

    #[serde(default = "default_lp_stale_ms")]
    pub lp_stale_ms: i64,

    #[serde(default = "default_simulation_grace_ms")]
    pub simulation_grace_ms: u64,

    #[serde(default = "default_aggregator_heartbeat_ms")]
    pub aggregator_heartbeat_ms: u64,

    // --- Tick storage --------------------------------------------------------
    #[serde(default = "default_max_ticks_per_symbol")]
    pub max_ticks_per_symbol: usize,

    #[serde(default = "default_persist_epsilon")]
    pub persist_epsilon: f64,

    #[serde(default = "default_persist_min_interval_ms")]
    pub persist_min_interval_ms: i64,

    #[serde(default = "default_tick_flush_interval_ms")]
    pub tick_flush_interval_ms: u64,

    #[serde(default = "default_tick_data_dir")]
    pub tick_data_dir: String,

    #[serde(default = "default_ledger_data_dir")]
    pub ledger_data_dir: String,

    // --- Push hub ------------------------------------------------------------
    #[serde(default = "default_broadcast_epsilon")]
    pub broadcast_epsilon: f64,

    #[serde(default = "default_client_outbound_queue")]
    pub client_outbound_queue: usize,

    #[serde(default = "default_hub_heartbeat_secs")]
    pub hub_heartbeat_secs: u64,

    // --- P&L / margin --------------------------------------------------------
    #[serde(default = "default_pnl_update_hz")]
    pub pnl_update_hz: u32,

    /// Margin level (%) below which the account enters margin call.
    #[serde(default = "default_margin_call_level")]
    pub margin_call_level: f64,

    /// Margin level (%) below which positions are force-closed.
    #[serde(default = "default_stop_out_level")]
    pub stop_out_level: f64,

    /// Commission charged per lot on open. Zero in the default B-Book setup.
    #[serde(default)]
    pub commission_per_lot: f64,

    // --- Risk ----------------------------------------------------------------
    #[serde(default)]
    pub volatility_breaker: VolatilityBreakerConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::BBook,
            symbols: default_symbol_specs(),
            accounts: default_accounts(),
            default_limits: AccountLimits::default(),
            lp_endpoints: Vec::new(),
            lp_stale_ms: default_lp_stale_ms(),
            simulation_grace_ms: default_simulation_grace_ms(),
            aggregator_heartbeat_ms: default_aggregator_heartbeat_ms(),
            max_ticks_per_symbol: default_max_ticks_per_symbol(),
            persist_epsilon: default_persist_epsilon(),
            persist_min_interval_ms: default_persist_min_interval_ms(),
            tick_flush_interval_ms: default_tick_flush_interval_ms(),
            tick_data_dir: default_tick_data_dir(),
            ledger_data_dir: default_ledger_data_dir(),
            broadcast_epsilon: default_broadcast_epsilon(),
            client_outbound_queue: default_client_outbound_queue(),
            hub_heartbeat_secs: default_hub_heartbeat_secs(),
            pnl_update_hz: default_pnl_update_hz(),
            margin_call_level: default_margin_call_level(),
            stop_out_level: default_stop_out_level(),
            commission_per_lot: 0.0,
            volatility_breaker: VolatilityBreakerConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read broker config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse broker config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = config.symbols.len(),
            accounts = config.accounts.len(),
            lps = config.lp_endpoints.len(),
            "broker config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialize broker config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "broker config saved (atomic)");
        Ok(())
    }

    /// Look up a symbol spec by name.
    pub fn symbol_spec(&self, symbol: &str) -> Option<&SymbolSpec> {
        self.symbols.iter().find(|s| s.symbol == symbol)
    }
}
