// =============================================================================
// Admin Control Plane — runtime toggles over symbols and execution mode
// =============================================================================
//
// Owns the live symbol-spec table, the disabled-symbols set, and the
// execution-mode flag. All mutations are idempotent; readers (order engine,
// push hub) observe changes on their next evaluation cycle. Kill switches and
// funding mutations route through RiskPolicy and Ledger respectively — this
// module only holds broker-wide operational state.
// =============================================================================

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tracing::info;

use crate::errors::RejectReason;
use crate::runtime_config::{BrokerConfig, SymbolSpec};
use crate::types::ExecutionMode;

pub struct AdminControl {
    specs: RwLock<HashMap<String, SymbolSpec>>,
    disabled: RwLock<HashSet<String>>,
    execution_mode: RwLock<ExecutionMode>,
}

impl AdminControl {
    pub fn new(config: &BrokerConfig) -> Self {
        let mut specs = HashMap::new();
        let mut disabled = HashSet::new();
        for spec in &config.symbols {
            if !spec.enabled {
                disabled.insert(spec.symbol.clone());
            }
            specs.insert(spec.symbol.clone(), spec.clone());
        }

        Self {
            specs: RwLock::new(specs),
            disabled: RwLock::new(disabled),
            execution_mode: RwLock::new(config.execution_mode),
        }
    }

    // -------------------------------------------------------------------------
    // Symbol specs
    // -------------------------------------------------------------------------

    pub fn symbol_spec(&self, symbol: &str) -> Option<SymbolSpec> {
        self.specs.read().get(symbol).cloned()
    }

    /// All configured specs with `enabled` reflecting the live disabled set.
    pub fn symbols(&self) -> Vec<SymbolSpec> {
        let disabled = self.disabled.read();
        self.specs
            .read()
            .values()
            .map(|s| {
                let mut s = s.clone();
                s.enabled = !disabled.contains(&s.symbol);
                s
            })
            .collect()
    }

    /// Symbols currently tradable and broadcastable.
    pub fn enabled_symbols(&self) -> Vec<String> {
        let disabled = self.disabled.read();
        self.specs
            .read()
            .keys()
            .filter(|s| !disabled.contains(*s))
            .cloned()
            .collect()
    }

    /// Insert or replace a symbol spec (admin load/replace).
    pub fn replace_symbol_spec(&self, spec: SymbolSpec) {
        info!(symbol = %spec.symbol, "symbol spec replaced");
        if !spec.enabled {
            self.disabled.write().insert(spec.symbol.clone());
        } else {
            self.disabled.write().remove(&spec.symbol);
        }
        self.specs.write().insert(spec.symbol.clone(), spec);
    }

    pub fn set_margin_rate(&self, symbol: &str, margin_rate: f64) -> Result<(), RejectReason> {
        let mut specs = self.specs.write();
        let spec = specs.get_mut(symbol).ok_or(RejectReason::UnknownSymbol)?;
        spec.margin_rate = margin_rate;
        info!(symbol = %symbol, margin_rate, "margin rate updated");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Enable / disable
    // -------------------------------------------------------------------------

    pub fn is_symbol_enabled(&self, symbol: &str) -> bool {
        self.specs.read().contains_key(symbol) && !self.disabled.read().contains(symbol)
    }

    /// Idempotent: enabling an enabled symbol (or disabling a disabled one)
    /// is a no-op.
    pub fn set_symbol_enabled(&self, symbol: &str, enabled: bool) -> Result<(), RejectReason> {
        if !self.specs.read().contains_key(symbol) {
            return Err(RejectReason::UnknownSymbol);
        }
        let mut disabled = self.disabled.write();
        let changed = if enabled {
            disabled.remove(symbol)
        } else {
            disabled.insert(symbol.to_string())
        };
        if changed {
            info!(symbol = %symbol, enabled, "symbol trading toggled");
        }
        Ok(())
    }

    pub fn disabled_symbols(&self) -> HashSet<String> {
        self.disabled.read().clone()
    }

    // -------------------------------------------------------------------------
    // Execution mode
    // -------------------------------------------------------------------------

    pub fn execution_mode(&self) -> ExecutionMode {
        *self.execution_mode.read()
    }

    pub fn set_execution_mode(&self, mode: ExecutionMode) {
        let mut current = self.execution_mode.write();
        if *current != mode {
            info!(mode = %mode, "execution mode changed");
            *current = mode;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn admin() -> AdminControl {
        AdminControl::new(&BrokerConfig::default())
    }

    #[test]
    fn enable_disable_is_idempotent() {
        let a = admin();
        assert!(a.is_symbol_enabled("EURUSD"));

        a.set_symbol_enabled("EURUSD", false).unwrap();
        assert!(!a.is_symbol_enabled("EURUSD"));
        // Disabling again changes nothing.
        a.set_symbol_enabled("EURUSD", false).unwrap();
        assert!(!a.is_symbol_enabled("EURUSD"));

        a.set_symbol_enabled("EURUSD", true).unwrap();
        assert!(a.is_symbol_enabled("EURUSD"));
    }

    #[test]
    fn unknown_symbol_rejected() {
        let a = admin();
        assert_eq!(
            a.set_symbol_enabled("BTCUSD", true).unwrap_err(),
            RejectReason::UnknownSymbol
        );
        assert!(!a.is_symbol_enabled("BTCUSD"));
    }

    #[test]
    fn disabled_set_reflected_in_symbol_list() {
        let a = admin();
        a.set_symbol_enabled("USDJPY", false).unwrap();
        let listed = a
            .symbols()
            .into_iter()
            .find(|s| s.symbol == "USDJPY")
            .unwrap();
        assert!(!listed.enabled);
        assert!(!a.enabled_symbols().contains(&"USDJPY".to_string()));
    }

    #[test]
    fn replace_spec_upserts() {
        let a = admin();
        let mut spec = SymbolSpec::with_defaults("NAS100");
        spec.contract_size = 20.0;
        a.replace_symbol_spec(spec);
        let got = a.symbol_spec("NAS100").unwrap();
        assert!((got.contract_size - 20.0).abs() < f64::EPSILON);
        assert!(a.is_symbol_enabled("NAS100"));
    }

    #[test]
    fn margin_rate_update() {
        let a = admin();
        a.set_margin_rate("EURUSD", 2.0).unwrap();
        assert!((a.symbol_spec("EURUSD").unwrap().margin_rate - 2.0).abs() < f64::EPSILON);
        assert!(a.set_margin_rate("NOPE", 2.0).is_err());
    }

    #[test]
    fn execution_mode_toggle() {
        let a = admin();
        assert_eq!(a.execution_mode(), ExecutionMode::BBook);
        a.set_execution_mode(ExecutionMode::ABook);
        assert_eq!(a.execution_mode(), ExecutionMode::ABook);
        // Idempotent.
        a.set_execution_mode(ExecutionMode::ABook);
        assert_eq!(a.execution_mode(), ExecutionMode::ABook);
    }
}
