// =============================================================================
// Rejection taxonomy — every client-visible failure is one of these
// =============================================================================
//
// Command operations return `Result<T, RejectReason>`; there is no
// exception-style unwinding across components. Internal LP or disk errors are
// logged and metered where they occur and never surface here.
// =============================================================================

use serde::Serialize;

/// Why a command was rejected. Input errors are terminal for the request;
/// policy errors may clear as market or account state changes.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    // --- Input errors --------------------------------------------------------
    InvalidVolume,
    InvalidLevels,
    SymbolDisabled,
    UnknownSymbol,
    NoPrice,
    NotFound,
    AlreadyClosed,

    // --- Policy errors -------------------------------------------------------
    InsufficientMargin,
    RiskLimit(String),
    CircuitBreaker,
    KillSwitch,
    InsufficientFunds,
    MarginCall,
}

impl RejectReason {
    /// Stable machine-readable code for the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidVolume => "INVALID_VOLUME",
            Self::InvalidLevels => "INVALID_LEVELS",
            Self::SymbolDisabled => "SYMBOL_DISABLED",
            Self::UnknownSymbol => "UNKNOWN_SYMBOL",
            Self::NoPrice => "NO_PRICE",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyClosed => "ALREADY_CLOSED",
            Self::InsufficientMargin => "INSUFFICIENT_MARGIN",
            Self::RiskLimit(_) => "RISK_LIMIT",
            Self::CircuitBreaker => "CIRCUIT_BREAKER",
            Self::KillSwitch => "KILL_SWITCH",
            Self::InsufficientFunds => "INSUFFICIENT_FUNDS",
            Self::MarginCall => "MARGIN_CALL",
        }
    }

    /// Whether retrying the same request later may succeed without the client
    /// changing it. Stale prices and tripped breakers clear on their own;
    /// malformed input does not.
    pub fn retriable(&self) -> bool {
        matches!(
            self,
            Self::NoPrice
                | Self::InsufficientMargin
                | Self::RiskLimit(_)
                | Self::CircuitBreaker
                | Self::InsufficientFunds
                | Self::MarginCall
        )
    }

    pub fn message(&self) -> String {
        match self {
            Self::InvalidVolume => "volume outside limits or not on volume step".to_string(),
            Self::InvalidLevels => "stop-loss / take-profit levels invalid for side".to_string(),
            Self::SymbolDisabled => "symbol is disabled for trading".to_string(),
            Self::UnknownSymbol => "symbol is not configured".to_string(),
            Self::NoPrice => "no usable market price for symbol".to_string(),
            Self::NotFound => "position not found".to_string(),
            Self::AlreadyClosed => "position already closed".to_string(),
            Self::InsufficientMargin => "insufficient free margin for requested volume".to_string(),
            Self::RiskLimit(detail) => format!("risk limit breached: {detail}"),
            Self::CircuitBreaker => "symbol halted by volatility circuit breaker".to_string(),
            Self::KillSwitch => "account kill switch is active".to_string(),
            Self::InsufficientFunds => "insufficient balance".to_string(),
            Self::MarginCall => "account is in margin call; new positions refused".to_string(),
        }
    }

    /// Build the client-visible error frame.
    pub fn to_client_error(&self) -> ClientError {
        ClientError {
            error_code: self.code(),
            message: self.message(),
            retriable: self.retriable(),
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Structured failure returned to clients: `{error_code, message, retriable}`.
#[derive(Debug, Clone, Serialize)]
pub struct ClientError {
    pub error_code: &'static str,
    pub message: String,
    pub retriable: bool,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(RejectReason::InvalidVolume.code(), "INVALID_VOLUME");
        assert_eq!(RejectReason::InsufficientMargin.code(), "INSUFFICIENT_MARGIN");
        assert_eq!(
            RejectReason::RiskLimit("max positions".into()).code(),
            "RISK_LIMIT"
        );
        assert_eq!(RejectReason::CircuitBreaker.code(), "CIRCUIT_BREAKER");
    }

    #[test]
    fn input_errors_are_not_retriable() {
        assert!(!RejectReason::InvalidVolume.retriable());
        assert!(!RejectReason::AlreadyClosed.retriable());
        assert!(!RejectReason::UnknownSymbol.retriable());
    }

    #[test]
    fn transient_errors_are_retriable() {
        assert!(RejectReason::NoPrice.retriable());
        assert!(RejectReason::CircuitBreaker.retriable());
        assert!(RejectReason::InsufficientMargin.retriable());
    }

    #[test]
    fn client_error_frame_shape() {
        let err = RejectReason::RiskLimit("daily trade cap".into()).to_client_error();
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["error_code"], "RISK_LIMIT");
        assert_eq!(json["retriable"], true);
        assert!(json["message"].as_str().unwrap().contains("daily trade cap"));
    }
}
